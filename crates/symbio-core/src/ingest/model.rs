use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::extractor::{ExtractionError, ExtractionStrategy, Extractor};
use super::units;
use super::validation::FactCandidate;
use crate::fact::{EmissionEvent, ExchangeEvent, FactData, Measurement, WasteEvent};

/// Sampling settings for model calls.
///
/// Only the deterministic configuration can be built: temperature zero and
/// a fixed seed, so the same text always yields the same candidates.
#[derive(Debug, Clone, Serialize)]
pub struct DecodingConfig {
    temperature: f32,
    seed: u64,
    max_tokens: u32,
}

impl DecodingConfig {
    #[must_use]
    pub const fn deterministic() -> Self {
        Self {
            temperature: 0.0,
            seed: 7,
            max_tokens: 2048,
        }
    }

    #[must_use]
    pub const fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    #[must_use]
    pub const fn temperature(&self) -> f32 {
        self.temperature
    }

    #[must_use]
    pub const fn seed(&self) -> u64 {
        self.seed
    }

    #[must_use]
    pub const fn max_tokens(&self) -> u32 {
        self.max_tokens
    }
}

impl Default for DecodingConfig {
    fn default() -> Self {
        Self::deterministic()
    }
}

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub system: String,
    pub prompt: String,
    pub decoding: DecodingConfig,
}

/// A text completion backend.
#[async_trait::async_trait]
pub trait CompletionModel: Send + Sync {
    fn name(&self) -> &str;

    async fn complete(&self, request: &CompletionRequest) -> Result<String, ExtractionError>;
}

const SYSTEM_PROMPT: &str = "You extract industrial waste, emission and material exchange facts. \
Reply with a JSON array only. Every object must carry \"source_quote\": an exact, contiguous \
copy of the sentence in the input that states the fact. Never infer numbers, units, years or \
names that are not written in the input. If nothing qualifies, reply with [].";

const SCHEMA_HINT: &str = r#"Each object: {"kind": "waste_event" | "emission_event" | "exchange_event", "material": string, "substance": string, "quantity": number, "unit": string, "company": string, "target_company": string, "location": string, "year": number, "scope": string, "eco_park": string, "source_quote": string, "confidence": number}. Omit unknown fields."#;

/// One fact as the model reports it, before unit conversion.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ModelFact {
    pub kind: Option<String>,
    pub material: Option<String>,
    pub substance: Option<String>,
    pub quantity: Option<f64>,
    pub unit: Option<String>,
    pub company: Option<String>,
    pub target_company: Option<String>,
    pub location: Option<String>,
    pub year: Option<i32>,
    pub scope: Option<String>,
    pub eco_park: Option<String>,
    pub source_quote: Option<String>,
    pub confidence: Option<f64>,
}

impl ModelFact {
    fn into_candidate(self) -> FactCandidate {
        let quantity = match (self.quantity, self.unit.as_deref()) {
            (Some(value), Some(unit)) => match units::to_tons(value, unit) {
                Ok(tons) => Some(Measurement::new(tons, value, unit.trim())),
                Err(e) => {
                    debug!(error = %e, "dropping quantity with unknown unit");
                    None
                }
            },
            _ => None,
        };

        let kind = self.kind.as_deref().unwrap_or("waste_event").to_lowercase();
        let data = if kind.starts_with("emission") {
            FactData::EmissionEvent(EmissionEvent {
                substance: self.substance.or(self.material).unwrap_or_default(),
                quantity,
                company: self.company,
                location: self.location,
                year: self.year,
                scope: self.scope,
            })
        } else if kind.starts_with("exchange") {
            FactData::ExchangeEvent(ExchangeEvent {
                material: self.material.unwrap_or_default(),
                source_company: self.company,
                target_company: self.target_company,
                volume: quantity,
                eco_park: self.eco_park,
                year: self.year,
            })
        } else {
            FactData::WasteEvent(WasteEvent {
                material: self.material.unwrap_or_default(),
                category: None,
                quantity,
                company: self.company,
                location: self.location,
                year: self.year,
                treatment: None,
            })
        };

        FactCandidate::quoted(data, self.source_quote, self.confidence.unwrap_or(0.5))
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ModelReply {
    List(Vec<ModelFact>),
    Wrapped { facts: Vec<ModelFact> },
    Single(ModelFact),
}

impl ModelReply {
    fn into_facts(self) -> Vec<ModelFact> {
        match self {
            Self::List(facts) | Self::Wrapped { facts } => facts,
            Self::Single(fact) => vec![fact],
        }
    }
}

/// Parses a model reply: raw JSON, a fenced ```json block, or the
/// outermost bracketed span.
///
/// # Errors
///
/// Returns [`ExtractionError::InvalidResponse`] when no JSON can be found.
pub fn parse_reply(reply: &str) -> Result<Vec<ModelFact>, ExtractionError> {
    let trimmed = reply.trim();

    let fenced = trimmed.find("```").and_then(|open| {
        let body = &trimmed[open + 3..];
        let body = body.strip_prefix("json").unwrap_or(body);
        body.find("```").map(|close| &body[..close])
    });

    let spans = |open: char, close: char| {
        let start = trimmed.find(open)?;
        let end = trimmed.rfind(close)?;
        (end > start).then(|| &trimmed[start..=end])
    };

    let attempts = [Some(trimmed), fenced, spans('[', ']'), spans('{', '}')];
    for attempt in attempts.into_iter().flatten() {
        if let Ok(reply) = serde_json::from_str::<ModelReply>(attempt.trim()) {
            return Ok(reply.into_facts());
        }
    }

    Err(ExtractionError::InvalidResponse(
        trimmed.chars().take(200).collect(),
    ))
}

/// Extracts candidates by prompting a [`CompletionModel`].
pub struct ModelAssistedExtractor {
    model: Arc<dyn CompletionModel>,
    decoding: DecodingConfig,
    max_input_chars: usize,
}

impl ModelAssistedExtractor {
    #[must_use]
    pub fn new(model: Arc<dyn CompletionModel>) -> Self {
        Self {
            model,
            decoding: DecodingConfig::deterministic(),
            max_input_chars: 4000,
        }
    }

    #[must_use]
    pub const fn with_max_input_chars(mut self, max_input_chars: usize) -> Self {
        self.max_input_chars = max_input_chars;
        self
    }

    #[must_use]
    pub const fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.decoding = self.decoding.with_max_tokens(max_tokens);
        self
    }

    fn request(&self, text: &str) -> CompletionRequest {
        let excerpt: String = text.chars().take(self.max_input_chars).collect();
        CompletionRequest {
            system: SYSTEM_PROMPT.to_string(),
            prompt: format!("{SCHEMA_HINT}\n\nInput:\n{excerpt}"),
            decoding: self.decoding.clone(),
        }
    }
}

#[async_trait::async_trait]
impl Extractor for ModelAssistedExtractor {
    fn strategy(&self) -> ExtractionStrategy {
        ExtractionStrategy::ModelAssisted
    }

    async fn candidates(&self, text: &str) -> Result<Vec<FactCandidate>, ExtractionError> {
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }

        let reply = self.model.complete(&self.request(text)).await?;
        let facts = parse_reply(&reply)?;
        debug!(model = self.model.name(), count = facts.len(), "model candidates");

        Ok(facts.into_iter().map(ModelFact::into_candidate).collect())
    }
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    seed: u64,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Deserialize)]
struct ChatReply {
    content: Option<String>,
}

/// Client for any endpoint speaking the OpenAI chat-completions protocol.
pub struct ChatCompletionsModel {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
}

impl ChatCompletionsModel {
    /// # Errors
    ///
    /// Fails if the HTTP client cannot be built.
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ExtractionError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            api_key,
        })
    }
}

#[async_trait::async_trait]
impl CompletionModel for ChatCompletionsModel {
    fn name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String, ExtractionError> {
        let body = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &request.system,
                },
                ChatMessage {
                    role: "user",
                    content: &request.prompt,
                },
            ],
            temperature: request.decoding.temperature(),
            seed: request.decoding.seed(),
            max_tokens: request.decoding.max_tokens(),
        };

        let mut builder = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await?;
        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(ExtractionError::RateLimited);
        }
        if !status.is_success() {
            warn!(status = %status, model = %self.model, "completion request failed");
            return Err(ExtractionError::ModelUnavailable(format!("HTTP {status}")));
        }

        let reply: ChatResponse = response.json().await?;
        reply
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| ExtractionError::InvalidResponse("empty completion".into()))
    }
}
