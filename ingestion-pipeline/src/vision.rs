use std::sync::Arc;

use async_openai::types::{
    ChatCompletionRequestMessageContentPartImageArgs,
    ChatCompletionRequestMessageContentPartTextArgs, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequestArgs, ImageDetail, ImageUrlArgs,
};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};

use common::{
    error::AppError,
    storage::{db::SurrealDbClient, types::system_settings::SystemSettings},
};

/// Image description capability. The returned prose is fed through the
/// normal chunk/extract/upsert loop.
#[async_trait]
pub trait VisionExtractor: Send + Sync {
    async fn describe(&self, image_bytes: &[u8], content_type: &str) -> Result<String, AppError>;
}

pub struct OpenAiVision {
    client: Arc<async_openai::Client<async_openai::config::OpenAIConfig>>,
    db: Arc<SurrealDbClient>,
}

impl OpenAiVision {
    pub fn new(
        client: Arc<async_openai::Client<async_openai::config::OpenAIConfig>>,
        db: Arc<SurrealDbClient>,
    ) -> Self {
        Self { client, db }
    }
}

#[async_trait]
impl VisionExtractor for OpenAiVision {
    async fn describe(&self, image_bytes: &[u8], content_type: &str) -> Result<String, AppError> {
        let settings = SystemSettings::get_current(&self.db).await?;

        let base64_image = STANDARD.encode(image_bytes);
        let image_url = format!("data:{content_type};base64,{base64_image}");

        let request = CreateChatCompletionRequestArgs::default()
            .model(settings.vision_model)
            .messages([ChatCompletionRequestUserMessageArgs::default()
                .content(vec![
                    ChatCompletionRequestMessageContentPartTextArgs::default()
                        .text(settings.vision_prompt)
                        .build()?
                        .into(),
                    ChatCompletionRequestMessageContentPartImageArgs::default()
                        .image_url(
                            ImageUrlArgs::default()
                                .url(image_url)
                                .detail(ImageDetail::High)
                                .build()?,
                        )
                        .build()?
                        .into(),
                ])
                .build()?
                .into()])
            .build()?;

        let response = self.client.chat().create(request).await?;

        let description = response
            .choices
            .first()
            .and_then(|c| c.message.content.as_ref())
            .cloned()
            .ok_or_else(|| AppError::Extraction("No description in vision response".into()))?;

        Ok(description)
    }
}
