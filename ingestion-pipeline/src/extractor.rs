use std::sync::Arc;

use async_openai::types::{
    ChatCompletionRequestSystemMessage, ChatCompletionRequestUserMessage,
    CreateChatCompletionRequest, CreateChatCompletionRequestArgs, ResponseFormat,
    ResponseFormatJsonSchema,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use common::{
    error::AppError,
    storage::{db::SurrealDbClient, types::job::TokenCost, types::system_settings::SystemSettings},
};

/// A proto-concept as extracted from one chunk. Ids are assigned later by
/// the matcher; the extractor never invents them.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ExtractedConcept {
    pub label: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub search_terms: Vec<String>,
    #[serde(default)]
    pub evidence_quotes: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ExtractedRelationship {
    pub from_label: String,
    pub to_label: String,
    pub rel_type: String,
    pub confidence: f32,
    #[serde(default)]
    pub category: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct Extraction {
    pub concepts: Vec<ExtractedConcept>,
    pub relationships: Vec<ExtractedRelationship>,
    #[serde(skip)]
    pub usage: Option<TokenCost>,
}

/// Graph context primed before each chunk: concepts from recent chunks of
/// the same document, their one-hop relationship cluster, and the active
/// relationship vocabulary.
#[derive(Debug, Serialize, Clone, Default)]
pub struct ExtractionContext {
    pub recent_concepts: Vec<ContextConcept>,
    pub neighbor_relationships: Vec<ContextEdge>,
    pub vocabulary: Vec<String>,
}

#[derive(Debug, Serialize, Clone)]
pub struct ContextConcept {
    pub label: String,
    pub description: Option<String>,
    pub search_terms: Vec<String>,
}

#[derive(Debug, Serialize, Clone)]
pub struct ContextEdge {
    pub from_label: String,
    pub to_label: String,
    pub rel_type: String,
}

/// Concept/relationship extraction capability.
#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(
        &self,
        text: &str,
        context: &ExtractionContext,
    ) -> Result<Extraction, AppError>;
}

pub fn get_extraction_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "properties": {
            "concepts": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "label": { "type": "string" },
                        "description": { "type": ["string", "null"] },
                        "search_terms": {
                            "type": "array",
                            "items": { "type": "string" }
                        },
                        "evidence_quotes": {
                            "type": "array",
                            "items": { "type": "string" }
                        }
                    },
                    "required": ["label", "description", "search_terms", "evidence_quotes"],
                    "additionalProperties": false
                }
            },
            "relationships": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "from_label": { "type": "string" },
                        "to_label": { "type": "string" },
                        "rel_type": { "type": "string" },
                        "confidence": { "type": "number" },
                        "category": { "type": ["string", "null"] }
                    },
                    "required": ["from_label", "to_label", "rel_type", "confidence", "category"],
                    "additionalProperties": false
                }
            }
        },
        "required": ["concepts", "relationships"],
        "additionalProperties": false
    })
}

// Rough blended rates used for the per-job cost breakdown.
const PROMPT_TOKEN_USD: f64 = 0.15 / 1_000_000.0;
const COMPLETION_TOKEN_USD: f64 = 0.6 / 1_000_000.0;

/// Extractor backed by the OpenAI chat endpoint with a strict JSON
/// schema response format.
pub struct OpenAiExtractor {
    client: Arc<async_openai::Client<async_openai::config::OpenAIConfig>>,
    db: Arc<SurrealDbClient>,
}

impl OpenAiExtractor {
    pub fn new(
        client: Arc<async_openai::Client<async_openai::config::OpenAIConfig>>,
        db: Arc<SurrealDbClient>,
    ) -> Self {
        Self { client, db }
    }

    async fn prepare_request(
        &self,
        text: &str,
        context: &ExtractionContext,
    ) -> Result<CreateChatCompletionRequest, AppError> {
        let settings = SystemSettings::get_current(&self.db).await?;

        let context_json = serde_json::to_string_pretty(context)
            .map_err(|e| AppError::Extraction(format!("Failed to serialize context: {e}")))?;
        let user_message = format!(
            "Graph context (concepts already known near this passage, and the allowed relationship vocabulary):\n{context_json}\n\nPassage:\n{text}"
        );

        let response_format = ResponseFormat::JsonSchema {
            json_schema: ResponseFormatJsonSchema {
                description: Some("Concepts and relationships extracted from the passage".into()),
                name: "chunk_extraction".into(),
                schema: Some(get_extraction_schema()),
                strict: Some(true),
            },
        };

        let request = CreateChatCompletionRequestArgs::default()
            .model(&settings.processing_model)
            .messages([
                ChatCompletionRequestSystemMessage::from(settings.extraction_system_prompt.as_str())
                    .into(),
                ChatCompletionRequestUserMessage::from(user_message).into(),
            ])
            .response_format(response_format)
            .build()?;

        Ok(request)
    }
}

#[async_trait]
impl Extractor for OpenAiExtractor {
    async fn extract(
        &self,
        text: &str,
        context: &ExtractionContext,
    ) -> Result<Extraction, AppError> {
        let request = self.prepare_request(text, context).await?;
        let response = self.client.chat().create(request).await?;

        let usage = response.usage.as_ref().map(|u| TokenCost {
            prompt_tokens: u64::from(u.prompt_tokens),
            completion_tokens: u64::from(u.completion_tokens),
            total_tokens: u64::from(u.total_tokens),
            estimated_usd: f64::from(u.prompt_tokens) * PROMPT_TOKEN_USD
                + f64::from(u.completion_tokens) * COMPLETION_TOKEN_USD,
        });

        let content = response
            .choices
            .first()
            .and_then(|choice| choice.message.content.as_ref())
            .ok_or(AppError::Extraction(
                "No content found in extraction response".into(),
            ))?;

        let mut extraction = serde_json::from_str::<Extraction>(content).map_err(|e| {
            AppError::Extraction(format!("Failed to parse extraction response: {e}"))
        })?;
        extraction.usage = usage;

        Ok(extraction)
    }
}
