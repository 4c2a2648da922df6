//! Chat boundary: identity, abuse controls, history and persistence around
//! the RAG engine.

use crate::config::LimitSettings;
use crate::error::{Result, TubechatError};
use crate::guard::{request_hash, RateLimiter};
use crate::rag::{AnswerEvent, AnswerRequest, ChatAnswer, HistoryMessage, RagEngine, Role};
use crate::store::{ChatMessage, ChatSession, Store};
use chrono::Utc;
use futures::future;
use futures::stream::{self, BoxStream, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};

/// Assistant message returned when answering fails.
pub const FAILURE_MESSAGE: &str =
    "Sorry, something went wrong while I was looking through the videos. Please try again in a moment.";

/// Chat request as received from a client.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatRequest {
    pub query: String,
    pub channel_id: String,
    #[serde(default)]
    pub creator_name: Option<String>,
    /// Prior turns, oldest first. Loaded from the caller's session when absent.
    #[serde(default)]
    pub conversation_history: Option<Vec<HistoryMessage>>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub public_mode: bool,
    #[serde(default)]
    pub client_identifier: Option<String>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub stream: bool,
}

/// Who is asking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    Authenticated(String),
    Anonymous(String),
}

impl Identity {
    /// Rate limiting key.
    pub fn key(&self) -> String {
        match self {
            Identity::Authenticated(id) => format!("user:{}", id),
            Identity::Anonymous(id) => format!("anon:{}", id),
        }
    }

    pub fn user_id(&self) -> Option<&str> {
        match self {
            Identity::Authenticated(id) => Some(id),
            Identity::Anonymous(_) => None,
        }
    }
}

impl ChatRequest {
    /// `user_id` wins; otherwise `public_mode` with a client identifier.
    pub fn identity(&self) -> Result<Identity> {
        if let Some(user_id) = self.user_id.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            return Ok(Identity::Authenticated(user_id.to_string()));
        }
        match self.client_identifier.as_deref().map(str::trim) {
            Some(client) if self.public_mode && !client.is_empty() => {
                Ok(Identity::Anonymous(client.to_string()))
            }
            _ => Err(TubechatError::InvalidInput(
                "user_id or public_mode with client_identifier is required".to_string(),
            )),
        }
    }
}

/// Stream of chat events. Always ends with exactly one [`AnswerEvent::Final`].
pub type ChatStream = BoxStream<'static, AnswerEvent>;

/// Month a message is counted against, as `YYYY-MM`.
pub fn usage_period() -> String {
    Utc::now().format("%Y-%m").to_string()
}

pub struct ChatService {
    store: Arc<dyn Store>,
    engine: Arc<RagEngine>,
    limiter: RateLimiter,
    limits: LimitSettings,
    history_window: usize,
}

/// Work left to do once an answer exists.
struct Recorder {
    store: Arc<dyn Store>,
    identity: Identity,
    session: Option<ChatSession>,
    question: String,
    /// Idempotency key claimed for this request.
    claimed_key: Option<String>,
}

impl Recorder {
    /// Persist the turn, count usage and remember the response for replays.
    async fn record(&self, answer: &ChatAnswer) -> Result<()> {
        if let Some(session) = &self.session {
            let user = ChatMessage::new(session.id, Role::User, self.question.clone(), Vec::new());
            self.store.append_message(&user).await?;
            let assistant = ChatMessage::new(
                session.id,
                Role::Assistant,
                answer.answer.clone(),
                answer.citations.clone(),
            );
            self.store.append_message(&assistant).await?;
        }

        if let Some(user_id) = self.identity.user_id() {
            self.store.increment_message_count(user_id, &usage_period()).await?;
        }

        if let Some(key) = &self.claimed_key {
            let response_json = serde_json::to_string(answer)?;
            self.store.complete_request(key, &response_json).await?;
        }
        Ok(())
    }

    /// Give up the idempotency claim of a request that produced no answer.
    async fn release(&self) {
        if let Some(key) = &self.claimed_key {
            if let Err(e) = self.store.release_request(key).await {
                warn!(idempotency_key = %key, "Failed to release request claim: {}", e);
            }
        }
    }
}

enum Prepared {
    Replay(ChatAnswer),
    Fresh(AnswerRequest, Recorder),
}

impl ChatService {
    pub fn new(
        store: Arc<dyn Store>,
        engine: Arc<RagEngine>,
        limits: LimitSettings,
        history_window: usize,
    ) -> Self {
        Self {
            store,
            engine,
            limiter: RateLimiter::per_minute(),
            limits,
            history_window,
        }
    }

    /// Answer one chat request.
    #[instrument(skip(self, request), fields(channel_id = %request.channel_id))]
    pub async fn respond(&self, request: &ChatRequest) -> Result<ChatAnswer> {
        let (answer_request, recorder) = match self.prepare(request).await? {
            Prepared::Replay(answer) => return Ok(answer),
            Prepared::Fresh(answer_request, recorder) => (answer_request, recorder),
        };

        let answer = match self.engine.answer(&answer_request).await {
            Ok(answer) => answer,
            Err(e) => {
                recorder.release().await;
                return Ok(Self::failure(&answer_request.channel_id, &e));
            }
        };

        recorder.record(&answer).await?;
        Ok(answer)
    }

    /// Answer one chat request as a stream of deltas and a final answer.
    #[instrument(skip(self, request), fields(channel_id = %request.channel_id))]
    pub async fn respond_stream(&self, request: &ChatRequest) -> Result<ChatStream> {
        let (answer_request, recorder) = match self.prepare(request).await? {
            Prepared::Replay(answer) => return Ok(stream::once(future::ready(AnswerEvent::Final(answer))).boxed()),
            Prepared::Fresh(answer_request, recorder) => (answer_request, recorder),
        };

        let channel_id = answer_request.channel_id.clone();
        let events = match self.engine.answer_stream(&answer_request).await {
            Ok(events) => events,
            Err(e) => {
                recorder.release().await;
                let failure = Self::failure(&channel_id, &e);
                return Ok(stream::once(future::ready(AnswerEvent::Final(failure))).boxed());
            }
        };

        let recorder = Arc::new(recorder);
        let stream = events
            .then(move |event| {
                let recorder = recorder.clone();
                let channel_id = channel_id.clone();
                async move {
                    match event {
                        Ok(AnswerEvent::Final(answer)) => {
                            if let Err(e) = recorder.record(&answer).await {
                                warn!(channel_id = %channel_id, "Failed to record chat turn: {}", e);
                            }
                            AnswerEvent::Final(answer)
                        }
                        Ok(delta) => delta,
                        Err(e) => {
                            recorder.release().await;
                            AnswerEvent::Final(Self::failure(&channel_id, &e))
                        }
                    }
                }
            })
            .scan(false, |finished, event| {
                if *finished {
                    return future::ready(None);
                }
                *finished = matches!(event, AnswerEvent::Final(_));
                future::ready(Some(event))
            });

        Ok(stream.boxed())
    }

    /// Run every check that precedes answering, in order: identity, rate
    /// limit, deduplication, channel, quota, history. An idempotency key is
    /// claimed last, so a concurrent retry of the same key sees it taken.
    async fn prepare(&self, request: &ChatRequest) -> Result<Prepared> {
        let identity = request.identity()?;
        let question = request.query.trim();
        if question.is_empty() {
            return Err(TubechatError::InvalidInput("query must not be empty".to_string()));
        }
        if request.channel_id.trim().is_empty() {
            return Err(TubechatError::InvalidInput("channel_id is required".to_string()));
        }

        let limit = match identity {
            Identity::Authenticated(_) => self.limits.authenticated_requests_per_minute,
            Identity::Anonymous(_) => self.limits.anonymous_requests_per_minute,
        };
        self.limiter.check(&identity.key(), limit)?;

        let hash = request_hash(
            &request.channel_id,
            question,
            request.conversation_history.as_deref().unwrap_or_default(),
        );
        let idempotency_key = request
            .idempotency_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty());
        if let Some(key) = idempotency_key {
            if let Some(replay) = self.stored_response(key, &hash).await? {
                return Ok(replay);
            }
        }

        let channel = self
            .store
            .get_channel(&request.channel_id)
            .await?
            .ok_or_else(|| TubechatError::ChannelNotFound(request.channel_id.clone()))?;

        if let (Some(user_id), Some(quota)) = (identity.user_id(), self.limits.monthly_message_quota) {
            let used = self.store.message_count(user_id, &usage_period()).await?;
            if used >= quota {
                return Err(TubechatError::QuotaExceeded(format!(
                    "monthly limit of {} messages reached",
                    quota
                )));
            }
        }

        let session = match identity.user_id() {
            Some(user_id) => Some(self.store.get_or_create_session(user_id, &channel.channel_id).await?),
            None => None,
        };

        let history = match (&request.conversation_history, &session) {
            (Some(history), _) => history.clone(),
            (None, Some(session)) => self
                .store
                .recent_messages(session.id, self.history_window)
                .await?
                .into_iter()
                .map(|m| HistoryMessage {
                    role: m.role,
                    content: m.content,
                })
                .collect(),
            (None, None) => Vec::new(),
        };

        let answer_request = AnswerRequest {
            channel_id: channel.channel_id.clone(),
            creator_name: request
                .creator_name
                .clone()
                .filter(|n| !n.trim().is_empty())
                .unwrap_or_else(|| channel.name.clone()),
            question: question.to_string(),
            history,
            debug: request.debug,
        };

        if let Some(key) = idempotency_key {
            let ttl = Duration::from_secs(self.limits.lock_ttl_secs);
            if !self.store.claim_request(key, &hash, ttl).await? {
                return match self.stored_response(key, &hash).await? {
                    Some(replay) => Ok(replay),
                    None => Err(TubechatError::OperationInProgress {
                        key: format!("chat:{}", key),
                    }),
                };
            }
        }

        let recorder = Recorder {
            store: self.store.clone(),
            identity,
            session,
            question: question.to_string(),
            claimed_key: idempotency_key.map(str::to_string),
        };

        Ok(Prepared::Fresh(answer_request, recorder))
    }

    /// Replay or reject a request whose key is already known. Fails with
    /// `OperationInProgress` while the first request is still answering.
    async fn stored_response(&self, key: &str, hash: &str) -> Result<Option<Prepared>> {
        let Some(record) = self.store.find_request(key).await? else {
            return Ok(None);
        };
        if record.request_hash != hash {
            return Err(TubechatError::IdempotencyConflict(key.to_string()));
        }
        match record.response_json {
            Some(json) => {
                info!(idempotency_key = key, "Replaying stored chat response");
                Ok(Some(Prepared::Replay(serde_json::from_str(&json)?)))
            }
            None => Err(TubechatError::OperationInProgress {
                key: format!("chat:{}", key),
            }),
        }
    }

    fn failure(channel_id: &str, err: &TubechatError) -> ChatAnswer {
        error!(service = "chat", stage = "answer", channel_id, "Answering failed: {}", err);
        ChatAnswer::failure(FAILURE_MESSAGE.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{Channel, ChannelProfile, ContentTypes, ImportSettings};
    use crate::config::RetrievalSettings;
    use crate::embedding::Embedder;
    use crate::rag::{AnswerGenerator, Confidence, GenerationRequest};
    use crate::store::{EmbeddingStatus, SqliteStore, StoredChunk};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
    use uuid::Uuid;

    /// Questions mentioning "pizza" point away from every stored chunk.
    struct KeywordEmbedder;

    #[async_trait]
    impl Embedder for KeywordEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            if text.to_lowercase().contains("pizza") {
                Ok(vec![0.0, 1.0])
            } else {
                Ok(vec![1.0, 0.0])
            }
        }

        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            let mut out = Vec::new();
            for text in texts {
                out.push(self.embed(text).await?);
            }
            Ok(out)
        }

        fn dimensions(&self) -> usize {
            2
        }
    }

    struct StubGenerator {
        calls: AtomicUsize,
        fail: AtomicBool,
        delay_ms: AtomicU64,
        history_seen: std::sync::Mutex<Vec<usize>>,
    }

    impl StubGenerator {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail: AtomicBool::new(false),
                delay_ms: AtomicU64::new(0),
                history_seen: std::sync::Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl AnswerGenerator for StubGenerator {
        async fn generate(&self, request: &GenerationRequest) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.history_seen.lock().unwrap().push(request.history.len());
            let delay = self.delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(TubechatError::OpenAI("Chat API error: 500".to_string()));
            }
            Ok(format!("Borrowing is explained in [1]. ({})", request.question))
        }
    }

    struct Fixture {
        store: Arc<SqliteStore>,
        generator: Arc<StubGenerator>,
        service: ChatService,
    }

    async fn fixture(limits: LimitSettings) -> Fixture {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let profile = ChannelProfile {
            channel_id: "UC1".to_string(),
            name: "Ferris Codes".to_string(),
            avatar_url: None,
            subscriber_count: None,
            uploads_playlist_id: None,
        };
        store
            .save_channel(&Channel::new(&profile, ContentTypes::default(), ImportSettings::default()))
            .await
            .unwrap();
        store
            .replace_chunks(
                "t1",
                &[StoredChunk {
                    id: Uuid::new_v4(),
                    transcript_id: "t1".to_string(),
                    channel_id: "UC1".to_string(),
                    video_id: "vid1".to_string(),
                    chunk_index: 0,
                    text: "the borrow checker tracks lifetimes".to_string(),
                    start_time: Some(30.0),
                    end_time: Some(60.0),
                    has_timestamps: true,
                    token_count: 9,
                    embedding: vec![1.0, 0.0],
                    embedding_status: EmbeddingStatus::Completed,
                    created_at: Utc::now(),
                }],
            )
            .await
            .unwrap();

        let generator = Arc::new(StubGenerator::new());
        let engine = Arc::new(RagEngine::new(
            store.clone(),
            Arc::new(KeywordEmbedder),
            generator.clone(),
            RetrievalSettings::default(),
        ));
        let service = ChatService::new(store.clone(), engine, limits, 10);
        Fixture {
            store,
            generator,
            service,
        }
    }

    fn ask(query: &str) -> ChatRequest {
        ChatRequest {
            query: query.to_string(),
            channel_id: "UC1".to_string(),
            user_id: Some("user-1".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_identity_rules() {
        assert!(matches!(ChatRequest::default().identity(), Err(TubechatError::InvalidInput(_))));

        let anonymous = ChatRequest {
            public_mode: true,
            client_identifier: Some("browser-1".to_string()),
            ..Default::default()
        };
        assert_eq!(anonymous.identity().unwrap(), Identity::Anonymous("browser-1".to_string()));

        let without_mode = ChatRequest {
            client_identifier: Some("browser-1".to_string()),
            ..Default::default()
        };
        assert!(without_mode.identity().is_err());
    }

    #[tokio::test]
    async fn test_answer_is_persisted_and_counted() {
        let f = fixture(LimitSettings::default()).await;
        let answer = f.service.respond(&ask("How does the borrow checker work?")).await.unwrap();

        assert!(!answer.is_refusal);
        assert_eq!(answer.confidence, Confidence::High);
        assert_eq!(answer.citations.len(), 1);

        let session = f.store.get_or_create_session("user-1", "UC1").await.unwrap();
        let messages = f.store.recent_messages(session.id, 10).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[1].sources.len(), 1);
        assert_eq!(f.store.message_count("user-1", &usage_period()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_history_falls_back_to_session() {
        let f = fixture(LimitSettings::default()).await;
        f.service.respond(&ask("What is a lifetime?")).await.unwrap();
        f.service.respond(&ask("And borrowing?")).await.unwrap();

        let mut explicit = ask("Explicit history?");
        explicit.conversation_history = Some(Vec::new());
        f.service.respond(&explicit).await.unwrap();

        assert_eq!(*f.generator.history_seen.lock().unwrap(), vec![0, 2, 0]);
    }

    #[tokio::test]
    async fn test_off_topic_question_is_refused_without_generation() {
        let f = fixture(LimitSettings::default()).await;
        let answer = f
            .service
            .respond(&ask("What is your favorite pizza topping?"))
            .await
            .unwrap();
        assert!(answer.is_refusal);
        assert!(answer.citations.is_empty());
        assert_eq!(f.generator.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_idempotent_replay_and_conflict() {
        let f = fixture(LimitSettings::default()).await;
        let mut request = ask("How does the borrow checker work?");
        request.idempotency_key = Some("req-1".to_string());

        let first = f.service.respond(&request).await.unwrap();
        let replay = f.service.respond(&request).await.unwrap();
        assert_eq!(first, replay);
        assert_eq!(f.generator.calls.load(Ordering::SeqCst), 1);
        assert_eq!(f.store.message_count("user-1", &usage_period()).await.unwrap(), 1);

        request.query = "Something else entirely?".to_string();
        let err = f.service.respond(&request).await.unwrap_err();
        assert!(matches!(err, TubechatError::IdempotencyConflict(_)));
    }

    #[tokio::test]
    async fn test_concurrent_retries_answer_once() {
        let f = fixture(LimitSettings::default()).await;
        f.generator.delay_ms.store(50, Ordering::SeqCst);
        let mut request = ask("How does the borrow checker work?");
        request.idempotency_key = Some("retry-1".to_string());

        let (a, b) = tokio::join!(f.service.respond(&request), f.service.respond(&request));
        let (answer, rejected) = match (a, b) {
            (Ok(answer), Err(e)) | (Err(e), Ok(answer)) => (answer, e),
            other => panic!("expected one answer and one rejection, got {:?}", other),
        };
        assert!(matches!(rejected, TubechatError::OperationInProgress { .. }));
        assert_eq!(f.generator.calls.load(Ordering::SeqCst), 1);

        let session = f.store.get_or_create_session("user-1", "UC1").await.unwrap();
        assert_eq!(f.store.recent_messages(session.id, 10).await.unwrap().len(), 2);
        assert_eq!(f.store.message_count("user-1", &usage_period()).await.unwrap(), 1);

        let replay = f.service.respond(&request).await.unwrap();
        assert_eq!(replay, answer);
        assert_eq!(f.generator.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_answer_releases_idempotency_key() {
        let f = fixture(LimitSettings::default()).await;
        let mut request = ask("How does the borrow checker work?");
        request.idempotency_key = Some("retry-2".to_string());

        f.generator.fail.store(true, Ordering::SeqCst);
        let failed = f.service.respond(&request).await.unwrap();
        assert_eq!(failed.answer, FAILURE_MESSAGE);
        assert!(f.store.find_request("retry-2").await.unwrap().is_none());

        f.generator.fail.store(false, Ordering::SeqCst);
        let answer = f.service.respond(&request).await.unwrap();
        assert!(!answer.is_refusal);
        assert_eq!(f.generator.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_rate_limit_and_quota() {
        let limits = LimitSettings {
            authenticated_requests_per_minute: 2,
            monthly_message_quota: Some(1),
            ..LimitSettings::default()
        };
        let f = fixture(limits).await;

        f.service.respond(&ask("What is a lifetime?")).await.unwrap();
        let err = f.service.respond(&ask("What is a trait?")).await.unwrap_err();
        assert!(matches!(err, TubechatError::QuotaExceeded(_)));
        let err = f.service.respond(&ask("What is a crate?")).await.unwrap_err();
        assert!(matches!(err, TubechatError::RateLimited { .. }));
    }

    #[tokio::test]
    async fn test_provider_failure_becomes_assistant_message() {
        let f = fixture(LimitSettings::default()).await;
        f.generator.fail.store(true, Ordering::SeqCst);

        let answer = f.service.respond(&ask("How does the borrow checker work?")).await.unwrap();
        assert_eq!(answer.answer, FAILURE_MESSAGE);
        assert!(!answer.is_refusal);
        assert!(answer.citations.is_empty());
        assert_eq!(f.store.message_count("user-1", &usage_period()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_stream_ends_with_final_and_records() {
        let f = fixture(LimitSettings::default()).await;
        let events: Vec<AnswerEvent> = f
            .service
            .respond_stream(&ask("How does the borrow checker work?"))
            .await
            .unwrap()
            .collect()
            .await;

        assert!(events.len() >= 2);
        assert!(matches!(events[0], AnswerEvent::Delta(_)));
        match events.last() {
            Some(AnswerEvent::Final(answer)) => assert_eq!(answer.citations.len(), 1),
            other => panic!("expected final event, got {:?}", other),
        }
        assert_eq!(f.store.message_count("user-1", &usage_period()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_unknown_channel_and_empty_query() {
        let f = fixture(LimitSettings::default()).await;
        let mut request = ask("hello?");
        request.channel_id = "UC9".to_string();
        assert!(matches!(
            f.service.respond(&request).await,
            Err(TubechatError::ChannelNotFound(_))
        ));
        assert!(matches!(
            f.service.respond(&ask("   ")).await,
            Err(TubechatError::InvalidInput(_))
        ));
    }
}
