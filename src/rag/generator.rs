//! Answer generation from retrieved excerpts.

use super::{Confidence, HistoryMessage, Role};
use crate::config::Prompts;
use crate::error::{Result, TubechatError};
use crate::openai::create_client;
use async_openai::types::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequest, CreateChatCompletionRequestArgs,
};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::HashMap;
use tracing::{debug, instrument};

/// Stream of answer text deltas.
pub type TextStream = BoxStream<'static, Result<String>>;

/// Everything the model needs to answer one question.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub creator_name: String,
    pub question: String,
    /// Numbered excerpts, as produced by `format_context_for_prompt`.
    pub context: String,
    pub confidence: Confidence,
    /// Recent turns, oldest first.
    pub history: Vec<HistoryMessage>,
}

/// LLM that writes an answer from excerpts.
#[async_trait]
pub trait AnswerGenerator: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<String>;

    /// Stream the answer. Defaults to a single delta holding the full answer.
    async fn generate_stream(&self, request: &GenerationRequest) -> Result<TextStream> {
        let answer = self.generate(request).await?;
        Ok(stream::once(async move { Ok(answer) }).boxed())
    }
}

/// OpenAI chat-completions answer generator.
pub struct OpenAIAnswerGenerator {
    client: async_openai::Client<async_openai::config::OpenAIConfig>,
    model: String,
    prompts: Prompts,
}

impl OpenAIAnswerGenerator {
    pub fn new(model: &str, prompts: Prompts) -> Result<Self> {
        Ok(Self {
            client: create_client()?,
            model: model.to_string(),
            prompts,
        })
    }

    fn build_messages(&self, request: &GenerationRequest) -> Result<Vec<ChatCompletionRequestMessage>> {
        let mut vars = HashMap::new();
        vars.insert("creator_name".to_string(), request.creator_name.clone());
        vars.insert("question".to_string(), request.question.clone());
        vars.insert("confidence".to_string(), request.confidence.to_string());
        vars.insert("context".to_string(), request.context.clone());

        let system = self.prompts.render_with_custom(&self.prompts.rag.system, &vars);
        let user = self.prompts.render_with_custom(&self.prompts.rag.user, &vars);

        let mut messages: Vec<ChatCompletionRequestMessage> = vec![
            ChatCompletionRequestSystemMessageArgs::default()
                .content(system)
                .build()
                .map_err(|e| TubechatError::Rag(e.to_string()))?
                .into(),
        ];

        for turn in &request.history {
            let message: ChatCompletionRequestMessage = match turn.role {
                Role::User => ChatCompletionRequestUserMessageArgs::default()
                    .content(turn.content.clone())
                    .build()
                    .map_err(|e| TubechatError::Rag(e.to_string()))?
                    .into(),
                Role::Assistant => ChatCompletionRequestAssistantMessageArgs::default()
                    .content(turn.content.clone())
                    .build()
                    .map_err(|e| TubechatError::Rag(e.to_string()))?
                    .into(),
            };
            messages.push(message);
        }

        messages.push(
            ChatCompletionRequestUserMessageArgs::default()
                .content(user)
                .build()
                .map_err(|e| TubechatError::Rag(e.to_string()))?
                .into(),
        );

        Ok(messages)
    }

    fn build_request(&self, request: &GenerationRequest, stream: bool) -> Result<CreateChatCompletionRequest> {
        CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(self.build_messages(request)?)
            .temperature(0.3)
            .stream(stream)
            .build()
            .map_err(|e| TubechatError::Rag(e.to_string()))
    }
}

#[async_trait]
impl AnswerGenerator for OpenAIAnswerGenerator {
    #[instrument(skip(self, request), fields(history = request.history.len()))]
    async fn generate(&self, request: &GenerationRequest) -> Result<String> {
        let chat_request = self.build_request(request, false)?;

        let response = self.client.chat().create(chat_request).await.map_err(|e| {
            TubechatError::OpenAI(format!("Failed to generate response: {}", e))
        })?;

        let answer = response
            .choices
            .first()
            .and_then(|c| c.message.content.as_ref())
            .ok_or_else(|| TubechatError::Rag("Empty response from LLM".to_string()))?
            .clone();

        debug!("Generated answer of {} chars", answer.len());
        Ok(answer)
    }

    #[instrument(skip(self, request), fields(history = request.history.len()))]
    async fn generate_stream(&self, request: &GenerationRequest) -> Result<TextStream> {
        let chat_request = self.build_request(request, true)?;

        let stream = self
            .client
            .chat()
            .create_stream(chat_request)
            .await
            .map_err(|e| TubechatError::OpenAI(format!("Failed to start stream: {}", e)))?;

        Ok(stream
            .filter_map(|chunk| async move {
                match chunk {
                    Ok(response) => response
                        .choices
                        .into_iter()
                        .next()
                        .and_then(|c| c.delta.content)
                        .filter(|delta| !delta.is_empty())
                        .map(Ok),
                    Err(e) => Some(Err(TubechatError::OpenAI(format!("Stream error: {}", e)))),
                }
            })
            .boxed())
    }
}
