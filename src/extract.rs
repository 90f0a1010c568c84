//! Extraction client: raw post text in, structured [`Listing`] out.
//!
//! The response schema is declared statically in [`listing_schema`]; it is the
//! contract with the model and must stay in sync with
//! [`ExtractedListing`](crate::model::ExtractedListing).
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use serde_json::{json, Value};
use std::fmt;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::OpenAi as OpenAiConfig;
use crate::model::{ExtractedListing, Listing};

const OPENAI_API_BASE: &str = "https://api.openai.com/";

const SYSTEM_PROMPT: &str = r#"You extract fragrance sale data from a single marketplace post and return JSON that matches the provided schema. Follow these rules exactly.

Goal: put every fragrance offered for sale into the "perfumes" array.

Brand names. Expand common abbreviations everywhere they appear:
- TF, T Ford -> Tom Ford
- MFK -> Maison Francis Kurkdjian
- PdM -> Parfums de Marly
- BDC -> Bleu de Chanel
- ADG -> Armani Acqua di Gio
- YSL -> Yves Saint Laurent
Write the full brand and perfume name, correcting obvious typos.

Prices. Each entry in "prices" is "$" followed by digits only, for example "$150". Drop words such as "shipped", "OBO" or "firm". For a range like "$120-130" use the lower value. Skip items marked sold or struck through.

Sizes. Full bottles and decants use "<N>ml", for example "10ml" or "100ml". Partial bottles use "<remaining>/<full>ml", for example "80/100ml". Always include "ml". Markers such as BNIB do not change the size.

Prices kept elsewhere. If the post points to a spreadsheet or external link instead of listing a price, keep the name and sizes and use the exact string "See Spreadsheet" as the price.

Omit any fragrance that has neither a size nor a price.

Respond with the JSON object only."#;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("failed to reach extraction service: {0}")]
    Http(#[from] reqwest::Error),
    #[error("extraction service error {status}: {body}")]
    Api { status: StatusCode, body: String },
    #[error("extraction service returned no content")]
    EmptyResponse,
    #[error("extraction refused: {0}")]
    Refused(String),
    #[error("malformed extraction output: {0}")]
    Malformed(#[from] serde_json::Error),
}

#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(&self, raw_text: &str) -> Result<Listing, ExtractError>;
}

/// JSON schema for the `fragrance_listing` response format.
pub fn listing_schema() -> Value {
    json!({
        "type": "object",
        "additionalProperties": false,
        "required": ["perfumes"],
        "properties": {
            "perfumes": {
                "type": "array",
                "description": "Every perfume offered for sale in the post.",
                "items": {
                    "type": "object",
                    "additionalProperties": false,
                    "required": ["name", "sizes", "prices"],
                    "properties": {
                        "name": {
                            "type": "string",
                            "description": "Standardized full brand and perfume name, e.g. 'Tom Ford Tobacco Vanille'."
                        },
                        "sizes": {
                            "type": "array",
                            "description": "Available sizes. '<N>ml' for full bottles and decants, '<remaining>/<full>ml' for partials.",
                            "items": { "type": "string" }
                        },
                        "prices": {
                            "type": "array",
                            "description": "Prices as '$<number>', one per entry in sizes and in the same order.",
                            "items": { "type": "string" }
                        }
                    }
                }
            }
        }
    })
}

pub struct OpenAiExtractor {
    http: Client,
    endpoint: Url,
    api_key: String,
    model: String,
}

impl fmt::Debug for OpenAiExtractor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenAiExtractor")
            .field("endpoint", &self.endpoint)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

impl OpenAiExtractor {
    pub fn from_config(cfg: &OpenAiConfig) -> anyhow::Result<Self> {
        let base_url = Url::parse(OPENAI_API_BASE)?;
        Self::with_base_url(cfg.api_key.clone(), cfg.model.clone(), base_url)
    }

    pub fn with_base_url(api_key: String, model: String, base_url: Url) -> anyhow::Result<Self> {
        let http = Client::builder().user_agent("fragwatch/0.1").build()?;
        let endpoint = base_url.join("v1/chat/completions")?;
        Ok(Self {
            http,
            endpoint,
            api_key,
            model,
        })
    }

    pub fn request_body(&self, raw_text: &str) -> Value {
        json!({
            "model": self.model,
            "temperature": 0,
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                { "role": "user", "content": raw_text }
            ],
            "response_format": {
                "type": "json_schema",
                "json_schema": {
                    "name": "fragrance_listing",
                    "description": "Perfumes extracted from a sale listing",
                    "strict": true,
                    "schema": listing_schema()
                }
            }
        })
    }

    pub fn build_request(&self, raw_text: &str) -> Result<reqwest::Request, ExtractError> {
        let request = self
            .http
            .post(self.endpoint.clone())
            .bearer_auth(&self.api_key)
            .header("Content-Type", "application/json")
            .json(&self.request_body(raw_text))
            .build()?;
        Ok(request)
    }
}

#[async_trait]
impl Extractor for OpenAiExtractor {
    async fn extract(&self, raw_text: &str) -> Result<Listing, ExtractError> {
        let request = self.build_request(raw_text)?;
        let res = self.http.execute(request).await?;
        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            warn!(%status, "extraction service error");
            return Err(ExtractError::Api { status, body });
        }
        let body = res.text().await?;
        debug!(bytes = body.len(), "extraction response received");
        parse_completion(&body)
    }
}

#[derive(Deserialize)]
struct Completion {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    refusal: Option<String>,
}

/// Turn a chat completion response body into a listing.
pub fn parse_completion(body: &str) -> Result<Listing, ExtractError> {
    let completion: Completion = serde_json::from_str(body)?;
    let message = completion
        .choices
        .into_iter()
        .next()
        .map(|c| c.message)
        .ok_or(ExtractError::EmptyResponse)?;
    if let Some(reason) = message.refusal.filter(|r| !r.trim().is_empty()) {
        return Err(ExtractError::Refused(reason));
    }
    let content = message
        .content
        .filter(|c| !c.trim().is_empty())
        .ok_or(ExtractError::EmptyResponse)?;
    let raw: ExtractedListing = serde_json::from_str(&content)?;
    Ok(Listing::from(raw))
}
