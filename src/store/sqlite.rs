//! SQLite implementation of [`Store`].
//!
//! Embeddings are stored as little-endian `f32` blobs and compared in Rust.

use super::{ChatMessage, ChatSession, ChunkMatch, RequestRecord, Store, StoredChunk};
use crate::channel::{Channel, Video, VideoTranscriptStatus};
use crate::error::{Result, TubechatError};
use crate::queue::{WorkItem, WorkStatus};
use crate::store::cosine_similarity;
use crate::transcript::Transcript;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::de::DeserializeOwned;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, instrument};
use uuid::Uuid;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS channels (
    channel_id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    avatar_url TEXT,
    subscriber_count INTEGER,
    content_types TEXT NOT NULL,
    import_settings TEXT NOT NULL,
    status TEXT NOT NULL,
    progress INTEGER NOT NULL,
    error_message TEXT,
    indexed_videos INTEGER NOT NULL,
    total_videos INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS user_channels (
    user_id TEXT NOT NULL,
    channel_id TEXT NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (user_id, channel_id)
);

CREATE TABLE IF NOT EXISTS videos (
    channel_id TEXT NOT NULL,
    video_id TEXT NOT NULL,
    title TEXT NOT NULL,
    published_at TEXT,
    duration_seconds INTEGER,
    thumbnail_url TEXT,
    content_type TEXT NOT NULL,
    transcript_status TEXT NOT NULL,
    PRIMARY KEY (channel_id, video_id)
);

CREATE TABLE IF NOT EXISTS transcripts (
    id TEXT PRIMARY KEY,
    channel_id TEXT NOT NULL,
    video_id TEXT NOT NULL,
    full_text TEXT NOT NULL,
    segments_json TEXT NOT NULL,
    extraction_status TEXT NOT NULL,
    confidence REAL NOT NULL,
    error_message TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE (channel_id, video_id)
);

CREATE TABLE IF NOT EXISTS chunks (
    id TEXT PRIMARY KEY,
    transcript_id TEXT NOT NULL,
    channel_id TEXT NOT NULL,
    video_id TEXT NOT NULL,
    chunk_index INTEGER NOT NULL,
    text TEXT NOT NULL,
    start_time REAL,
    end_time REAL,
    has_timestamps INTEGER NOT NULL,
    token_count INTEGER NOT NULL,
    embedding BLOB NOT NULL,
    embedding_status TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_chunks_channel ON chunks(channel_id);
CREATE INDEX IF NOT EXISTS idx_chunks_transcript ON chunks(transcript_id);

CREATE TABLE IF NOT EXISTS operation_locks (
    lock_key TEXT PRIMARY KEY,
    owner TEXT NOT NULL,
    expires_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS work_items (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    channel_id TEXT NOT NULL,
    stage TEXT NOT NULL,
    status TEXT NOT NULL,
    error TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_work_items_channel ON work_items(channel_id, status);

CREATE TABLE IF NOT EXISTS chat_sessions (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    channel_id TEXT NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE (user_id, channel_id)
);

CREATE TABLE IF NOT EXISTS chat_messages (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    session_id TEXT NOT NULL,
    role TEXT NOT NULL,
    content TEXT NOT NULL,
    sources_json TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_chat_messages_session ON chat_messages(session_id);

CREATE TABLE IF NOT EXISTS chat_requests (
    idempotency_key TEXT PRIMARY KEY,
    request_hash TEXT NOT NULL,
    response_json TEXT,
    claimed_at INTEGER NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS usage_counters (
    user_id TEXT NOT NULL,
    period TEXT NOT NULL,
    message_count INTEGER NOT NULL,
    PRIMARY KEY (user_id, period)
);
"#;

const CHANNEL_COLUMNS: &str = "channel_id, name, avatar_url, subscriber_count, content_types, \
     import_settings, status, progress, error_message, indexed_videos, total_videos, created_at, updated_at";

const VIDEO_COLUMNS: &str = "channel_id, video_id, title, published_at, duration_seconds, \
     thumbnail_url, content_type, transcript_status";

const TRANSCRIPT_COLUMNS: &str = "id, channel_id, video_id, full_text, segments_json, \
     extraction_status, confidence, error_message, created_at, updated_at";

const CHUNK_COLUMNS: &str = "c.id, c.transcript_id, c.channel_id, c.video_id, c.chunk_index, c.text, \
     c.start_time, c.end_time, c.has_timestamps, c.token_count, c.embedding, c.embedding_status, c.created_at";

const WORK_COLUMNS: &str = "id, channel_id, stage, status, error, created_at, updated_at";

const MESSAGE_COLUMNS: &str = "id, session_id, role, content, sources_json, created_at";

/// SQLite-backed store.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) a database file.
    #[instrument(skip_all)]
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(SCHEMA)?;

        info!("Initialized SQLite store at {:?}", path);

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory store (useful for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| TubechatError::Store(format!("Failed to acquire lock: {}", e)))
    }

    fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
        embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
    }

    fn bytes_to_embedding(bytes: &[u8]) -> Vec<f32> {
        bytes
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect()
    }
}

fn conversion_error<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn parse_column<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let value: String = row.get(idx)?;
    value.parse::<T>().map_err(|e| conversion_error(idx, e))
}

fn parse_json<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let value: String = row.get(idx)?;
    serde_json::from_str(&value).map_err(|e| conversion_error(idx, e))
}

fn parse_time(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let value: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn parse_optional_time(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let value: Option<String> = row.get(idx)?;
    value
        .map(|v| {
            DateTime::parse_from_rfc3339(&v)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| conversion_error(idx, e))
        })
        .transpose()
}

fn channel_from_row(row: &Row<'_>) -> rusqlite::Result<Channel> {
    let subscriber_count: Option<i64> = row.get(3)?;
    let progress: i64 = row.get(7)?;
    let indexed_videos: i64 = row.get(9)?;
    let total_videos: i64 = row.get(10)?;

    Ok(Channel {
        channel_id: row.get(0)?,
        name: row.get(1)?,
        avatar_url: row.get(2)?,
        subscriber_count: subscriber_count.map(|v| v.max(0) as u64),
        content_types: parse_json(row, 4)?,
        import_settings: parse_json(row, 5)?,
        status: parse_column(row, 6)?,
        progress: progress.clamp(0, 100) as u8,
        error_message: row.get(8)?,
        indexed_videos: indexed_videos.max(0) as u32,
        total_videos: total_videos.max(0) as u32,
        created_at: parse_time(row, 11)?,
        updated_at: parse_time(row, 12)?,
    })
}

fn video_from_row(row: &Row<'_>) -> rusqlite::Result<Video> {
    let duration: Option<i64> = row.get(4)?;
    Ok(Video {
        channel_id: row.get(0)?,
        video_id: row.get(1)?,
        title: row.get(2)?,
        published_at: parse_optional_time(row, 3)?,
        duration_seconds: duration.map(|d| d.max(0) as u32),
        thumbnail_url: row.get(5)?,
        content_type: parse_column(row, 6)?,
        transcript_status: parse_column(row, 7)?,
    })
}

fn transcript_from_row(row: &Row<'_>) -> rusqlite::Result<Transcript> {
    let confidence: f64 = row.get(6)?;
    Ok(Transcript {
        id: row.get(0)?,
        channel_id: row.get(1)?,
        video_id: row.get(2)?,
        full_text: row.get(3)?,
        segments: parse_json(row, 4)?,
        extraction_status: parse_column(row, 5)?,
        confidence: confidence as f32,
        error_message: row.get(7)?,
        created_at: parse_time(row, 8)?,
        updated_at: parse_time(row, 9)?,
    })
}

fn chunk_from_row(row: &Row<'_>) -> rusqlite::Result<StoredChunk> {
    let chunk_index: i64 = row.get(4)?;
    let token_count: i64 = row.get(9)?;
    let embedding: Vec<u8> = row.get(10)?;

    Ok(StoredChunk {
        id: parse_column(row, 0)?,
        transcript_id: row.get(1)?,
        channel_id: row.get(2)?,
        video_id: row.get(3)?,
        chunk_index: chunk_index.max(0) as usize,
        text: row.get(5)?,
        start_time: row.get(6)?,
        end_time: row.get(7)?,
        has_timestamps: row.get(8)?,
        token_count: token_count.max(0) as usize,
        embedding: SqliteStore::bytes_to_embedding(&embedding),
        embedding_status: parse_column(row, 11)?,
        created_at: parse_time(row, 12)?,
    })
}

fn work_from_row(row: &Row<'_>) -> rusqlite::Result<WorkItem> {
    Ok(WorkItem {
        id: parse_column(row, 0)?,
        channel_id: row.get(1)?,
        stage: parse_column(row, 2)?,
        status: parse_column(row, 3)?,
        error: row.get(4)?,
        created_at: parse_time(row, 5)?,
        updated_at: parse_time(row, 6)?,
    })
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<ChatMessage> {
    Ok(ChatMessage {
        id: parse_column(row, 0)?,
        session_id: parse_column(row, 1)?,
        role: parse_column(row, 2)?,
        content: row.get(3)?,
        sources: parse_json(row, 4)?,
        created_at: parse_time(row, 5)?,
    })
}

#[async_trait]
impl Store for SqliteStore {
    async fn get_channel(&self, channel_id: &str) -> Result<Option<Channel>> {
        let conn = self.conn()?;
        let channel = conn
            .query_row(
                &format!("SELECT {} FROM channels WHERE channel_id = ?1", CHANNEL_COLUMNS),
                params![channel_id],
                channel_from_row,
            )
            .optional()?;
        Ok(channel)
    }

    #[instrument(skip(self, channel), fields(channel_id = %channel.channel_id))]
    async fn save_channel(&self, channel: &Channel) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO channels
            (channel_id, name, avatar_url, subscriber_count, content_types, import_settings,
             status, progress, error_message, indexed_videos, total_videos, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            ON CONFLICT(channel_id) DO UPDATE SET
                name = excluded.name,
                avatar_url = excluded.avatar_url,
                subscriber_count = excluded.subscriber_count,
                content_types = excluded.content_types,
                import_settings = excluded.import_settings,
                status = excluded.status,
                progress = excluded.progress,
                error_message = excluded.error_message,
                indexed_videos = excluded.indexed_videos,
                total_videos = excluded.total_videos,
                updated_at = excluded.updated_at
            "#,
            params![
                channel.channel_id,
                channel.name,
                channel.avatar_url,
                channel.subscriber_count.map(|v| v as i64),
                serde_json::to_string(&channel.content_types)?,
                serde_json::to_string(&channel.import_settings)?,
                channel.status.as_str(),
                channel.progress as i64,
                channel.error_message,
                channel.indexed_videos as i64,
                channel.total_videos as i64,
                channel.created_at.to_rfc3339(),
                channel.updated_at.to_rfc3339(),
            ],
        )?;

        debug!(status = %channel.status, progress = channel.progress, "Saved channel");
        Ok(())
    }

    async fn link_user_channel(&self, user_id: &str, channel_id: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO user_channels (user_id, channel_id, created_at) VALUES (?1, ?2, ?3)",
            params![user_id, channel_id, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    async fn list_videos(&self, channel_id: &str) -> Result<Vec<Video>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM videos WHERE channel_id = ?1 ORDER BY rowid",
            VIDEO_COLUMNS
        ))?;
        let videos = stmt
            .query_map(params![channel_id], video_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(videos)
    }

    #[instrument(skip(self, videos), fields(count = videos.len()))]
    async fn insert_videos(&self, videos: &[Video]) -> Result<usize> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;

        let mut inserted = 0;
        for video in videos {
            inserted += tx.execute(
                &format!(
                    "INSERT OR IGNORE INTO videos ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    VIDEO_COLUMNS
                ),
                params![
                    video.channel_id,
                    video.video_id,
                    video.title,
                    video.published_at.map(|dt| dt.to_rfc3339()),
                    video.duration_seconds.map(|d| d as i64),
                    video.thumbnail_url,
                    video.content_type.as_str(),
                    video.transcript_status.as_str(),
                ],
            )?;
        }

        tx.commit()?;
        debug!("Inserted {} new videos", inserted);
        Ok(inserted)
    }

    async fn set_video_status(
        &self,
        channel_id: &str,
        video_id: &str,
        status: VideoTranscriptStatus,
    ) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE videos SET transcript_status = ?3 WHERE channel_id = ?1 AND video_id = ?2",
            params![channel_id, video_id, status.as_str()],
        )?;
        Ok(())
    }

    async fn get_transcript(&self, transcript_id: &str) -> Result<Option<Transcript>> {
        let conn = self.conn()?;
        let transcript = conn
            .query_row(
                &format!("SELECT {} FROM transcripts WHERE id = ?1", TRANSCRIPT_COLUMNS),
                params![transcript_id],
                transcript_from_row,
            )
            .optional()?;
        Ok(transcript)
    }

    async fn get_transcript_for_video(
        &self,
        channel_id: &str,
        video_id: &str,
    ) -> Result<Option<Transcript>> {
        let conn = self.conn()?;
        let transcript = conn
            .query_row(
                &format!(
                    "SELECT {} FROM transcripts WHERE channel_id = ?1 AND video_id = ?2",
                    TRANSCRIPT_COLUMNS
                ),
                params![channel_id, video_id],
                transcript_from_row,
            )
            .optional()?;
        Ok(transcript)
    }

    #[instrument(skip(self, transcript), fields(video_id = %transcript.video_id))]
    async fn save_transcript(&self, transcript: &Transcript) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO transcripts
            (id, channel_id, video_id, full_text, segments_json, extraction_status,
             confidence, error_message, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ON CONFLICT(channel_id, video_id) DO UPDATE SET
                full_text = excluded.full_text,
                segments_json = excluded.segments_json,
                extraction_status = excluded.extraction_status,
                confidence = excluded.confidence,
                error_message = excluded.error_message,
                updated_at = excluded.updated_at
            "#,
            params![
                transcript.id,
                transcript.channel_id,
                transcript.video_id,
                transcript.full_text,
                serde_json::to_string(&transcript.segments)?,
                transcript.extraction_status.as_str(),
                transcript.confidence as f64,
                transcript.error_message,
                transcript.created_at.to_rfc3339(),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    async fn transcripts_pending_embedding(&self, channel_id: &str) -> Result<Vec<Transcript>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            r#"
            SELECT {} FROM transcripts t
            WHERE t.channel_id = ?1
              AND t.extraction_status = 'completed'
              AND NOT EXISTS (
                  SELECT 1 FROM chunks c
                  WHERE c.transcript_id = t.id AND c.embedding_status = 'completed'
              )
            ORDER BY t.rowid
            "#,
            TRANSCRIPT_COLUMNS
        ))?;
        let transcripts = stmt
            .query_map(params![channel_id], transcript_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(transcripts)
    }

    #[instrument(skip(self, chunks), fields(count = chunks.len()))]
    async fn replace_chunks(&self, transcript_id: &str, chunks: &[StoredChunk]) -> Result<usize> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;

        let deleted = tx.execute(
            "DELETE FROM chunks WHERE transcript_id = ?1",
            params![transcript_id],
        )?;

        for chunk in chunks {
            tx.execute(
                r#"
                INSERT INTO chunks
                (id, transcript_id, channel_id, video_id, chunk_index, text, start_time, end_time,
                 has_timestamps, token_count, embedding, embedding_status, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                "#,
                params![
                    chunk.id.to_string(),
                    transcript_id,
                    chunk.channel_id,
                    chunk.video_id,
                    chunk.chunk_index as i64,
                    chunk.text,
                    chunk.start_time,
                    chunk.end_time,
                    chunk.has_timestamps,
                    chunk.token_count as i64,
                    Self::embedding_to_bytes(&chunk.embedding),
                    chunk.embedding_status.as_str(),
                    chunk.created_at.to_rfc3339(),
                ],
            )?;
        }

        tx.commit()?;
        debug!("Replaced {} chunks with {}", deleted, chunks.len());
        Ok(chunks.len())
    }

    async fn chunks_for_transcript(&self, transcript_id: &str) -> Result<Vec<StoredChunk>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM chunks c WHERE c.transcript_id = ?1 ORDER BY c.chunk_index",
            CHUNK_COLUMNS
        ))?;
        let chunks = stmt
            .query_map(params![transcript_id], chunk_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(chunks)
    }

    #[instrument(skip(self, query_embedding))]
    async fn search_chunks(
        &self,
        channel_id: &str,
        query_embedding: &[f32],
        limit: usize,
        min_score: f32,
    ) -> Result<Vec<ChunkMatch>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            r#"
            SELECT {}, COALESCE(v.title, c.video_id)
            FROM chunks c
            LEFT JOIN videos v ON v.channel_id = c.channel_id AND v.video_id = c.video_id
            WHERE c.channel_id = ?1 AND c.embedding_status = 'completed'
            "#,
            CHUNK_COLUMNS
        ))?;

        let rows = stmt.query_map(params![channel_id], |row| {
            Ok((chunk_from_row(row)?, row.get::<_, String>(13)?))
        })?;

        let mut results: Vec<ChunkMatch> = rows
            .collect::<rusqlite::Result<Vec<_>>>()?
            .into_iter()
            .map(|(chunk, video_title)| {
                let similarity = cosine_similarity(query_embedding, &chunk.embedding);
                ChunkMatch {
                    chunk,
                    video_title,
                    similarity,
                }
            })
            .filter(|m| m.similarity >= min_score)
            .collect();

        results.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        results.truncate(limit);

        debug!("Found {} matching chunks", results.len());
        Ok(results)
    }

    async fn count_indexed_videos(&self, channel_id: &str) -> Result<u32> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(DISTINCT video_id) FROM chunks WHERE channel_id = ?1 AND embedding_status = 'completed'",
            params![channel_id],
            |row| row.get(0),
        )?;
        Ok(count as u32)
    }

    async fn try_acquire_lock(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let conn = self.conn()?;
        let now = Utc::now().timestamp_millis();
        let expires_at = now + ttl.as_millis() as i64;

        let tx = conn.unchecked_transaction()?;
        // Expired leases and our own lease are replaced.
        tx.execute(
            "DELETE FROM operation_locks WHERE lock_key = ?1 AND (expires_at <= ?2 OR owner = ?3)",
            params![key, now, owner],
        )?;
        let acquired = tx.execute(
            "INSERT OR IGNORE INTO operation_locks (lock_key, owner, expires_at) VALUES (?1, ?2, ?3)",
            params![key, owner, expires_at],
        )? == 1;
        tx.commit()?;

        Ok(acquired)
    }

    async fn release_lock(&self, key: &str, owner: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM operation_locks WHERE lock_key = ?1 AND owner = ?2",
            params![key, owner],
        )?;
        Ok(())
    }

    async fn enqueue_work(&self, item: &WorkItem) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            &format!(
                "INSERT INTO work_items ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                WORK_COLUMNS
            ),
            params![
                item.id.to_string(),
                item.channel_id,
                item.stage.as_str(),
                item.status.as_str(),
                item.error,
                item.created_at.to_rfc3339(),
                item.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    async fn next_pending_work(&self, channel_id: &str) -> Result<Option<WorkItem>> {
        let conn = self.conn()?;
        let item = conn
            .query_row(
                &format!(
                    "SELECT {} FROM work_items WHERE channel_id = ?1 AND status = 'pending' ORDER BY seq LIMIT 1",
                    WORK_COLUMNS
                ),
                params![channel_id],
                work_from_row,
            )
            .optional()?;
        Ok(item)
    }

    async fn update_work(&self, id: Uuid, status: WorkStatus, error: Option<&str>) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE work_items SET status = ?2, error = ?3, updated_at = ?4 WHERE id = ?1",
            params![id.to_string(), status.as_str(), error, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    async fn requeue_running_work(&self, channel_id: &str) -> Result<usize> {
        let conn = self.conn()?;
        let count = conn.execute(
            "UPDATE work_items SET status = 'pending', updated_at = ?2 WHERE channel_id = ?1 AND status = 'running'",
            params![channel_id, Utc::now().to_rfc3339()],
        )?;
        Ok(count)
    }

    async fn list_work(&self, channel_id: &str, limit: usize) -> Result<Vec<WorkItem>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM work_items WHERE channel_id = ?1 ORDER BY seq DESC LIMIT ?2",
            WORK_COLUMNS
        ))?;
        let items = stmt
            .query_map(params![channel_id, limit as i64], work_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(items)
    }

    async fn get_or_create_session(&self, user_id: &str, channel_id: &str) -> Result<ChatSession> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO chat_sessions (id, user_id, channel_id, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                Uuid::new_v4().to_string(),
                user_id,
                channel_id,
                Utc::now().to_rfc3339()
            ],
        )?;

        let session = conn.query_row(
            "SELECT id, user_id, channel_id, created_at FROM chat_sessions WHERE user_id = ?1 AND channel_id = ?2",
            params![user_id, channel_id],
            |row| {
                Ok(ChatSession {
                    id: parse_column(row, 0)?,
                    user_id: row.get(1)?,
                    channel_id: row.get(2)?,
                    created_at: parse_time(row, 3)?,
                })
            },
        )?;
        Ok(session)
    }

    async fn append_message(&self, message: &ChatMessage) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            &format!(
                "INSERT INTO chat_messages ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                MESSAGE_COLUMNS
            ),
            params![
                message.id.to_string(),
                message.session_id.to_string(),
                message.role.as_str(),
                message.content,
                serde_json::to_string(&message.sources)?,
                message.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    async fn recent_messages(&self, session_id: Uuid, limit: usize) -> Result<Vec<ChatMessage>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM chat_messages WHERE session_id = ?1 ORDER BY seq DESC LIMIT ?2",
            MESSAGE_COLUMNS
        ))?;
        let mut messages = stmt
            .query_map(params![session_id.to_string(), limit as i64], message_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        messages.reverse();
        Ok(messages)
    }

    async fn find_request(&self, idempotency_key: &str) -> Result<Option<RequestRecord>> {
        let conn = self.conn()?;
        let record = conn
            .query_row(
                "SELECT idempotency_key, request_hash, response_json, created_at FROM chat_requests WHERE idempotency_key = ?1",
                params![idempotency_key],
                |row| {
                    Ok(RequestRecord {
                        idempotency_key: row.get(0)?,
                        request_hash: row.get(1)?,
                        response_json: row.get(2)?,
                        created_at: parse_time(row, 3)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    async fn claim_request(&self, idempotency_key: &str, request_hash: &str, ttl: Duration) -> Result<bool> {
        let conn = self.conn()?;
        let now = Utc::now();
        let stale_before = now.timestamp_millis() - ttl.as_millis() as i64;

        let tx = conn.unchecked_transaction()?;
        // Claims abandoned by a crashed request are taken over after the TTL.
        tx.execute(
            "DELETE FROM chat_requests WHERE idempotency_key = ?1 AND response_json IS NULL AND claimed_at <= ?2",
            params![idempotency_key, stale_before],
        )?;
        let claimed = tx.execute(
            "INSERT OR IGNORE INTO chat_requests (idempotency_key, request_hash, response_json, claimed_at, created_at) VALUES (?1, ?2, NULL, ?3, ?4)",
            params![idempotency_key, request_hash, now.timestamp_millis(), now.to_rfc3339()],
        )? == 1;
        tx.commit()?;

        Ok(claimed)
    }

    async fn complete_request(&self, idempotency_key: &str, response_json: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE chat_requests SET response_json = ?2 WHERE idempotency_key = ?1",
            params![idempotency_key, response_json],
        )?;
        Ok(())
    }

    async fn release_request(&self, idempotency_key: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM chat_requests WHERE idempotency_key = ?1 AND response_json IS NULL",
            params![idempotency_key],
        )?;
        Ok(())
    }

    async fn message_count(&self, user_id: &str, period: &str) -> Result<u32> {
        let conn = self.conn()?;
        let count: Option<i64> = conn
            .query_row(
                "SELECT message_count FROM usage_counters WHERE user_id = ?1 AND period = ?2",
                params![user_id, period],
                |row| row.get(0),
            )
            .optional()?;
        Ok(count.unwrap_or(0) as u32)
    }

    async fn increment_message_count(&self, user_id: &str, period: &str) -> Result<u32> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO usage_counters (user_id, period, message_count) VALUES (?1, ?2, 1)
            ON CONFLICT(user_id, period) DO UPDATE SET message_count = message_count + 1
            "#,
            params![user_id, period],
        )?;
        let count: i64 = conn.query_row(
            "SELECT message_count FROM usage_counters WHERE user_id = ?1 AND period = ?2",
            params![user_id, period],
            |row| row.get(0),
        )?;
        Ok(count as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelProfile, ChannelStatus, ContentType, ContentTypes, ImportSettings};
    use crate::queue::WorkStage;
    use crate::rag::Role;
    use crate::store::EmbeddingStatus;
    use crate::transcript::{ExtractionStatus, TranscriptSegment};

    fn channel() -> Channel {
        let profile = ChannelProfile {
            channel_id: "UC1".to_string(),
            name: "Ferris Codes".to_string(),
            avatar_url: Some("https://example.com/a.png".to_string()),
            subscriber_count: Some(42),
            uploads_playlist_id: None,
        };
        Channel::new(&profile, ContentTypes::default(), ImportSettings::default())
    }

    fn video(id: &str) -> Video {
        Video {
            channel_id: "UC1".to_string(),
            video_id: id.to_string(),
            title: format!("Title {}", id),
            published_at: Some(Utc::now()),
            duration_seconds: Some(300),
            thumbnail_url: None,
            content_type: ContentType::Video,
            transcript_status: VideoTranscriptStatus::Pending,
        }
    }

    fn stored_chunk(transcript_id: &str, video_id: &str, index: usize, embedding: Vec<f32>) -> StoredChunk {
        StoredChunk {
            id: Uuid::new_v4(),
            transcript_id: transcript_id.to_string(),
            channel_id: "UC1".to_string(),
            video_id: video_id.to_string(),
            chunk_index: index,
            text: format!("chunk {}", index),
            start_time: Some(index as f64 * 10.0),
            end_time: Some(index as f64 * 10.0 + 10.0),
            has_timestamps: true,
            token_count: 2,
            embedding,
            embedding_status: EmbeddingStatus::Completed,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_channel_roundtrip_and_upsert() {
        let store = SqliteStore::in_memory().unwrap();
        let mut ch = channel();
        store.save_channel(&ch).await.unwrap();

        ch.advance(ChannelStatus::Extracting, 20);
        ch.set_counts(1, 3);
        store.save_channel(&ch).await.unwrap();

        let loaded = store.get_channel("UC1").await.unwrap().unwrap();
        assert_eq!(loaded.status, ChannelStatus::Extracting);
        assert_eq!(loaded.progress, 20);
        assert_eq!(loaded.indexed_videos, 1);
        assert_eq!(loaded.subscriber_count, Some(42));
        assert!(store.get_channel("UC2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_insert_videos_ignores_existing() {
        let store = SqliteStore::in_memory().unwrap();
        assert_eq!(store.insert_videos(&[video("a"), video("b")]).await.unwrap(), 2);
        assert_eq!(store.insert_videos(&[video("b"), video("c")]).await.unwrap(), 1);

        let ids: Vec<String> = store
            .list_videos("UC1")
            .await
            .unwrap()
            .into_iter()
            .map(|v| v.video_id)
            .collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_transcript_upsert_keeps_identity() {
        let store = SqliteStore::in_memory().unwrap();
        let first = Transcript::unsuccessful("UC1", "a", ExtractionStatus::Failed, "boom".to_string());
        store.save_transcript(&first).await.unwrap();

        let second = Transcript::completed("UC1", "a", vec![TranscriptSegment::new("hi", 0.0, 1.0)], 1.0);
        store.save_transcript(&second).await.unwrap();

        let loaded = store.get_transcript_for_video("UC1", "a").await.unwrap().unwrap();
        assert_eq!(loaded.id, first.id);
        assert_eq!(loaded.extraction_status, ExtractionStatus::Completed);
        assert_eq!(loaded.segments.len(), 1);
        assert!(store.get_transcript(&first.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_pending_embedding_excludes_embedded_transcripts() {
        let store = SqliteStore::in_memory().unwrap();
        let seg = vec![TranscriptSegment::new("hi", 0.0, 1.0)];
        let done = Transcript::completed("UC1", "a", seg.clone(), 1.0);
        let todo = Transcript::completed("UC1", "b", seg, 1.0);
        let missing = Transcript::unsuccessful("UC1", "c", ExtractionStatus::NoCaptions, "none".to_string());
        for t in [&done, &todo, &missing] {
            store.save_transcript(t).await.unwrap();
        }
        store
            .replace_chunks(&done.id, &[stored_chunk(&done.id, "a", 0, vec![1.0, 0.0])])
            .await
            .unwrap();

        let pending = store.transcripts_pending_embedding("UC1").await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, todo.id);
    }

    #[tokio::test]
    async fn test_replace_chunks_and_search() {
        let store = SqliteStore::in_memory().unwrap();
        store.insert_videos(&[video("a"), video("b")]).await.unwrap();

        store
            .replace_chunks("t1", &[stored_chunk("t1", "a", 0, vec![0.0, 1.0])])
            .await
            .unwrap();
        store
            .replace_chunks(
                "t1",
                &[
                    stored_chunk("t1", "a", 0, vec![1.0, 0.0]),
                    stored_chunk("t1", "a", 1, vec![0.6, 0.8]),
                ],
            )
            .await
            .unwrap();
        store
            .replace_chunks("t2", &[stored_chunk("t2", "b", 0, vec![0.0, 1.0])])
            .await
            .unwrap();

        assert_eq!(store.chunks_for_transcript("t1").await.unwrap().len(), 2);
        assert_eq!(store.count_indexed_videos("UC1").await.unwrap(), 2);

        let results = store.search_chunks("UC1", &[1.0, 0.0], 10, 0.5).await.unwrap();
        assert_eq!(results.len(), 2);
        assert!((results[0].similarity - 1.0).abs() < 1e-6);
        assert_eq!(results[0].video_title, "Title a");
        assert!(results[0].similarity >= results[1].similarity);

        let limited = store.search_chunks("UC1", &[1.0, 0.0], 1, 0.0).await.unwrap();
        assert_eq!(limited.len(), 1);
        assert!(store.search_chunks("UC9", &[1.0, 0.0], 10, 0.0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_lock_lease() {
        let store = SqliteStore::in_memory().unwrap();
        let ttl = Duration::from_secs(60);

        assert!(store.try_acquire_lock("ingest:UC1", "owner-a", ttl).await.unwrap());
        assert!(!store.try_acquire_lock("ingest:UC1", "owner-b", ttl).await.unwrap());
        // Re-entrant for the same owner.
        assert!(store.try_acquire_lock("ingest:UC1", "owner-a", ttl).await.unwrap());

        // Releasing with the wrong owner is a no-op.
        store.release_lock("ingest:UC1", "owner-b").await.unwrap();
        assert!(!store.try_acquire_lock("ingest:UC1", "owner-b", ttl).await.unwrap());

        store.release_lock("ingest:UC1", "owner-a").await.unwrap();
        assert!(store.try_acquire_lock("ingest:UC1", "owner-b", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_lock_can_be_taken() {
        let store = SqliteStore::in_memory().unwrap();
        assert!(store.try_acquire_lock("k", "a", Duration::ZERO).await.unwrap());
        assert!(store.try_acquire_lock("k", "b", Duration::from_secs(60)).await.unwrap());
    }

    #[tokio::test]
    async fn test_work_queue_lifecycle() {
        let store = SqliteStore::in_memory().unwrap();
        let item = WorkItem::new("UC1", WorkStage::Extract);
        store.enqueue_work(&item).await.unwrap();

        store.update_work(item.id, WorkStatus::Running, None).await.unwrap();
        assert!(store.next_pending_work("UC1").await.unwrap().is_none());

        assert_eq!(store.requeue_running_work("UC1").await.unwrap(), 1);
        let next = store.next_pending_work("UC1").await.unwrap().unwrap();
        assert_eq!(next.id, item.id);

        store
            .update_work(item.id, WorkStatus::Failed, Some("captions API down"))
            .await
            .unwrap();
        let listed = store.list_work("UC1", 5).await.unwrap();
        assert_eq!(listed[0].status, WorkStatus::Failed);
        assert_eq!(listed[0].error.as_deref(), Some("captions API down"));
    }

    #[tokio::test]
    async fn test_sessions_and_messages() {
        let store = SqliteStore::in_memory().unwrap();
        let session = store.get_or_create_session("user-1", "UC1").await.unwrap();
        let again = store.get_or_create_session("user-1", "UC1").await.unwrap();
        assert_eq!(session.id, again.id);

        for i in 0..5 {
            let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
            let message = ChatMessage::new(session.id, role, format!("message {}", i), Vec::new());
            store.append_message(&message).await.unwrap();
        }

        let recent = store.recent_messages(session.id, 3).await.unwrap();
        let contents: Vec<&str> = recent.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["message 2", "message 3", "message 4"]);
    }

    #[tokio::test]
    async fn test_usage_counters_and_requests() {
        let store = SqliteStore::in_memory().unwrap();
        assert_eq!(store.message_count("user-1", "2026-10").await.unwrap(), 0);
        assert_eq!(store.increment_message_count("user-1", "2026-10").await.unwrap(), 1);
        assert_eq!(store.increment_message_count("user-1", "2026-10").await.unwrap(), 2);
        assert_eq!(store.message_count("user-1", "2026-11").await.unwrap(), 0);

        let ttl = Duration::from_secs(60);
        assert!(store.claim_request("key-1", "abc", ttl).await.unwrap());
        assert!(!store.claim_request("key-1", "abc", ttl).await.unwrap());
        let pending = store.find_request("key-1").await.unwrap().unwrap();
        assert_eq!(pending.request_hash, "abc");
        assert!(pending.response_json.is_none());

        store.complete_request("key-1", "{}").await.unwrap();
        // Answered keys are never released or taken over.
        store.release_request("key-1").await.unwrap();
        assert!(!store.claim_request("key-1", "abc", Duration::ZERO).await.unwrap());
        let answered = store.find_request("key-1").await.unwrap().unwrap();
        assert_eq!(answered.response_json.as_deref(), Some("{}"));
        assert!(store.find_request("key-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_request_claims_release_and_expire() {
        let store = SqliteStore::in_memory().unwrap();
        let ttl = Duration::from_secs(60);

        assert!(store.claim_request("key-1", "abc", ttl).await.unwrap());
        store.release_request("key-1").await.unwrap();
        assert!(store.find_request("key-1").await.unwrap().is_none());

        assert!(store.claim_request("key-1", "abc", ttl).await.unwrap());
        assert!(store.claim_request("key-1", "abc", Duration::ZERO).await.unwrap());
    }
}
