//! Pipeline orchestrator for tubechat.
//!
//! Wires the stages to their providers and runs ingestion: resolve a channel
//! under its operation lock, then drain the channel's work queue.

use crate::channel::{
    Channel, ChannelLister, ChannelProfile, ChannelResolver, ResolveOutcome, ResolveRequest,
    YoutubeDataApi,
};
use crate::chat::ChatService;
use crate::config::{Prompts, Settings};
use crate::embedding::{ChunkIndexer, Embedder, IndexReport, IndexTarget, OpenAIEmbedder};
use crate::error::{Result, TubechatError};
use crate::guard::OperationLock;
use crate::queue::{WorkItem, WorkStage, WorkStatus};
use crate::rag::{AnswerGenerator, OpenAIAnswerGenerator, RagEngine};
use crate::store::{SqliteStore, Store};
use crate::transcript::{CaptionsProvider, ExtractionReport, HttpCaptionsProvider, TranscriptExtractor};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

/// Recent work items returned with a status report.
const STATUS_WORK_LIMIT: usize = 20;

/// External collaborators of the pipeline.
pub struct Components {
    pub store: Arc<dyn Store>,
    pub lister: Arc<dyn ChannelLister>,
    pub captions: Arc<dyn CaptionsProvider>,
    pub embedder: Arc<dyn Embedder>,
    pub generator: Arc<dyn AnswerGenerator>,
}

/// Result of a full ingestion.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestReport {
    pub resolve: ResolveOutcome,
    /// Work items run by this ingestion, in order.
    pub work: Vec<WorkItem>,
    pub channel: Channel,
}

/// Channel record plus its recent work, for polling.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub channel: Channel,
    pub work: Vec<WorkItem>,
}

/// The main orchestrator for the tubechat pipeline.
pub struct Orchestrator {
    settings: Settings,
    store: Arc<dyn Store>,
    resolver: ChannelResolver,
    extractor: TranscriptExtractor,
    indexer: ChunkIndexer,
    engine: Arc<RagEngine>,
    lock: OperationLock,
}

impl Orchestrator {
    /// Create an orchestrator with the configured providers.
    pub fn new(settings: Settings) -> Result<Self> {
        let prompts = Prompts::load(
            settings.prompts.custom_dir.as_deref(),
            Some(&settings.prompts.variables),
        )?;

        let youtube_key = settings.youtube_api_key().unwrap_or_else(|| {
            warn!("No YouTube API key configured; channel resolution will fail");
            String::new()
        });
        let lister = Arc::new(YoutubeDataApi::new(
            &settings.youtube.api_base_url,
            &youtube_key,
            Duration::from_secs(settings.youtube.timeout_secs),
        )?);

        let captions = Arc::new(HttpCaptionsProvider::new(
            &settings.captions.api_base_url,
            settings.captions_api_key(),
            Duration::from_secs(settings.captions.timeout_secs),
        )?);

        let embedder = Arc::new(OpenAIEmbedder::new(&settings.embedding)?);
        let generator = Arc::new(OpenAIAnswerGenerator::new(&settings.retrieval.model, prompts)?);
        let store = Arc::new(SqliteStore::new(&settings.sqlite_path())?);

        Ok(Self::with_components(
            settings,
            Components {
                store,
                lister,
                captions,
                embedder,
                generator,
            },
        ))
    }

    /// Create an orchestrator with custom components.
    pub fn with_components(settings: Settings, components: Components) -> Self {
        let Components {
            store,
            lister,
            captions,
            embedder,
            generator,
        } = components;

        let resolver = ChannelResolver::new(
            store.clone(),
            lister,
            &settings.limits,
            settings.youtube.listing_ceiling,
        );
        let extractor = TranscriptExtractor::new(
            store.clone(),
            captions,
            Duration::from_millis(settings.captions.request_delay_ms),
        );
        let indexer = ChunkIndexer::new(
            store.clone(),
            embedder.clone(),
            &settings.chunking,
            &settings.embedding,
        );
        let engine = Arc::new(RagEngine::new(
            store.clone(),
            embedder,
            generator,
            settings.retrieval.clone(),
        ));
        let lock = OperationLock::new(store.clone(), Duration::from_secs(settings.limits.lock_ttl_secs));

        Self {
            settings,
            store,
            resolver,
            extractor,
            indexer,
            engine,
            lock,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn store(&self) -> Arc<dyn Store> {
        self.store.clone()
    }

    pub fn engine(&self) -> Arc<RagEngine> {
        self.engine.clone()
    }

    /// Build the chat service sharing this orchestrator's store and engine.
    pub fn chat_service(&self) -> ChatService {
        ChatService::new(
            self.store.clone(),
            self.engine.clone(),
            self.settings.limits.clone(),
            self.settings.retrieval.history_window,
        )
    }

    /// Resolve a channel and record its videos, without running later stages.
    #[instrument(skip_all, fields(stage = "resolve"))]
    pub async fn resolve(&self, request: &ResolveRequest) -> Result<ResolveOutcome> {
        let profile = self.resolver.lookup(request).await?;
        self.with_channel_lock(&profile.channel_id, self.resolver.apply(&profile, request))
            .await
    }

    /// Run transcript extraction for a channel.
    pub async fn extract(&self, channel_id: &str) -> Result<ExtractionReport> {
        self.with_channel_lock(channel_id, self.extractor.run(channel_id)).await
    }

    /// Run chunking and embedding. Channel-wide runs hold the channel lock.
    pub async fn index(&self, target: &IndexTarget) -> Result<IndexReport> {
        match target {
            IndexTarget::Channel(channel_id) => {
                self.with_channel_lock(channel_id, self.indexer.run(target)).await
            }
            IndexTarget::Transcripts(_) => self.indexer.run(target).await,
        }
    }

    /// Resolve a channel, then run every stage its work queue holds.
    #[instrument(skip_all, fields(stage = "ingest"))]
    pub async fn ingest(&self, request: &ResolveRequest) -> Result<IngestReport> {
        let profile = self.resolver.lookup(request).await?;
        self.ingest_profile(&profile, request).await
    }

    /// Start an ingestion in the background.
    ///
    /// The lookup runs before spawning so the caller knows which channel to
    /// poll even if it stops waiting for the returned handle.
    pub async fn start_ingest(
        self: &Arc<Self>,
        request: ResolveRequest,
    ) -> Result<(ChannelProfile, JoinHandle<Result<IngestReport>>)> {
        let profile = self.resolver.lookup(&request).await?;
        let orchestrator = Arc::clone(self);
        let task_profile = profile.clone();
        let handle = tokio::spawn(async move {
            let result = orchestrator.ingest_profile(&task_profile, &request).await;
            if let Err(e) = &result {
                error!(
                    service = "ingest",
                    stage = "pipeline",
                    channel_id = %task_profile.channel_id,
                    "Ingestion failed: {}",
                    e
                );
            }
            result
        });
        Ok((profile, handle))
    }

    async fn ingest_profile(&self, profile: &ChannelProfile, request: &ResolveRequest) -> Result<IngestReport> {
        let channel_id = profile.channel_id.as_str();
        self.with_channel_lock(channel_id, async {
            let resolve = self.resolver.apply(profile, request).await?;
            let work = self.drain_unlocked(channel_id).await?;
            let channel = self
                .store
                .get_channel(channel_id)
                .await?
                .ok_or_else(|| TubechatError::ChannelNotFound(channel_id.to_string()))?;
            Ok(IngestReport {
                resolve,
                work,
                channel,
            })
        })
        .await
    }

    /// Run a channel's pending work items in order.
    pub async fn drain(&self, channel_id: &str) -> Result<Vec<WorkItem>> {
        self.with_channel_lock(channel_id, self.drain_unlocked(channel_id))
            .await
    }

    /// Items left `running` by a dead invocation are retried first. Each item
    /// ends `done` or `failed`; a failure does not stop later items.
    async fn drain_unlocked(&self, channel_id: &str) -> Result<Vec<WorkItem>> {
        let requeued = self.store.requeue_running_work(channel_id).await?;
        if requeued > 0 {
            info!(channel_id, requeued, "Requeued interrupted work");
        }

        let mut ran = Vec::new();
        while let Some(mut item) = self.store.next_pending_work(channel_id).await? {
            self.store.update_work(item.id, WorkStatus::Running, None).await?;
            info!(channel_id, stage = %item.stage, work_id = %item.id, "Running work item");

            let outcome = match item.stage {
                WorkStage::Extract => self.extractor.run(channel_id).await.map(|_| ()),
                WorkStage::Embed => self
                    .indexer
                    .run(&IndexTarget::Channel(channel_id.to_string()))
                    .await
                    .map(|_| ()),
            };

            match outcome {
                Ok(()) => {
                    item.status = WorkStatus::Done;
                    item.error = None;
                }
                Err(e) => {
                    error!(
                        service = "pipeline",
                        stage = %item.stage,
                        channel_id,
                        work_id = %item.id,
                        "Work item failed: {}",
                        e
                    );
                    item.status = WorkStatus::Failed;
                    item.error = Some(e.to_string());
                }
            }

            self.store
                .update_work(item.id, item.status, item.error.as_deref())
                .await?;
            ran.push(item);
        }

        Ok(ran)
    }

    /// Channel record and recent work items.
    pub async fn status(&self, channel_id: &str) -> Result<StatusReport> {
        let channel = self
            .store
            .get_channel(channel_id)
            .await?
            .ok_or_else(|| TubechatError::ChannelNotFound(channel_id.to_string()))?;
        let work = self.store.list_work(channel_id, STATUS_WORK_LIMIT).await?;
        Ok(StatusReport { channel, work })
    }

    async fn with_channel_lock<T, F>(&self, channel_id: &str, operation: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        let lease = self.lock.acquire(&OperationLock::channel_key(channel_id)).await?;
        let result = operation.await;
        self.lock.release(lease).await;
        result
    }
}
