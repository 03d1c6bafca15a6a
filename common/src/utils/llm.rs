use std::sync::Arc;

use async_openai::{
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestSystemMessage, ChatCompletionRequestUserMessage,
        CreateChatCompletionRequestArgs,
    },
    Client,
};
use async_trait::async_trait;

use crate::error::AppError;

/// Text-to-text provider used for answers, briefs and document summaries.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn complete(&self, system_prompt: &str, user_message: &str) -> Result<String, AppError>;

    fn model_name(&self) -> &str;
}

pub struct OpenAiLanguageModel {
    client: Arc<Client<OpenAIConfig>>,
    model: String,
}

impl OpenAiLanguageModel {
    pub fn new(client: Arc<Client<OpenAIConfig>>, model: String) -> Self {
        Self { client, model }
    }
}

#[async_trait]
impl LanguageModel for OpenAiLanguageModel {
    async fn complete(&self, system_prompt: &str, user_message: &str) -> Result<String, AppError> {
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .temperature(0.0)
            .messages([
                ChatCompletionRequestSystemMessage::from(system_prompt).into(),
                ChatCompletionRequestUserMessage::from(user_message).into(),
            ])
            .build()?;

        let response = self.client.chat().create(request).await?;

        response
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .ok_or_else(|| AppError::LLMParsing("No content found in LLM response".into()))
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
