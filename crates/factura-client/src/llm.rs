use std::time::Duration;

use factura_core::error::ExtractError;
use factura_core::models::RawInvoicePayload;
use factura_core::traits::Structurer;
use reqwest::Client;
use serde::{Deserialize, Serialize};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(45);
const DEFAULT_SYSTEM_PROMPT: &str = "You are a data extraction assistant for commercial invoices. Extract the requested fields from the provided invoice text. Respond ONLY with valid JSON matching the requested schema. Do not include explanations.";

/// OpenAI-compatible structuring client.
///
/// Works with any OpenAI-compatible API, including:
/// - OpenAI directly (`https://api.openai.com/v1`)
/// - Gemini via compatibility layer (`https://generativelanguage.googleapis.com/v1beta/openai`)
#[derive(Clone)]
pub struct OpenAiStructurer {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    timeout_secs: u64,
    system_prompt: String,
}

impl OpenAiStructurer {
    pub fn new(api_key: &str, model: &str) -> Result<Self, ExtractError> {
        Self::with_base_url(api_key, model, DEFAULT_BASE_URL)
    }

    pub fn with_base_url(api_key: &str, model: &str, base_url: &str) -> Result<Self, ExtractError> {
        Self::build(api_key, model, base_url, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(self, timeout: Duration) -> Result<Self, ExtractError> {
        Self::build(&self.api_key, &self.model, &self.base_url, timeout)
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    fn build(
        api_key: &str,
        model: &str,
        base_url: &str,
        timeout: Duration,
    ) -> Result<Self, ExtractError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ExtractError::Network(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            timeout_secs: timeout.as_secs(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        })
    }
}

/// JSON schema the model is constrained to. Field descriptions carry the
/// customs-form vocabulary the invoices use.
fn payload_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "supplier": { "type": "string", "description": "Supplier company name" },
            "invoice_date": { "type": "string", "description": "Invoice date" },
            "invoice_number": { "type": "string", "description": "Invoice number" },
            "line_items": {
                "type": "array",
                "description": "All line items from the invoice",
                "items": {
                    "type": "object",
                    "properties": {
                        "line_number": { "type": "integer", "description": "Line item number" },
                        "reference_code": { "type": "string", "description": "SKU or identification number" },
                        "description": { "type": "string", "description": "Product description in Spanish" },
                        "quantity": { "type": "number", "description": "Quantity for customs" },
                        "unit": { "type": "string", "description": "Unit code for customs" },
                        "tariff_code": { "type": "string", "description": "Tariff classification code" },
                        "unit_value": { "type": "number", "description": "Unit value in USD" },
                        "line_total": { "type": "number", "description": "Total value in USD" }
                    },
                    "required": [
                        "line_number", "reference_code", "description", "quantity",
                        "unit", "tariff_code", "unit_value", "line_total"
                    ],
                    "additionalProperties": false
                }
            }
        },
        "required": ["supplier", "invoice_date", "invoice_number", "line_items"],
        "additionalProperties": false
    })
}

// ---- OpenAI API types ----

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<Message>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Serialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    json_schema: Option<JsonSchemaWrapper>,
}

#[derive(Serialize)]
struct JsonSchemaWrapper {
    name: String,
    strict: bool,
    schema: serde_json::Value,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ApiError {
    error: ApiErrorDetail,
}

#[derive(Deserialize)]
struct ApiErrorDetail {
    message: String,
}

impl Structurer for OpenAiStructurer {
    async fn structure(&self, prompt: &str) -> Result<RawInvoicePayload, ExtractError> {
        let url = format!("{}/chat/completions", self.base_url);

        let request = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                Message {
                    role: "system".to_string(),
                    content: self.system_prompt.clone(),
                },
                Message {
                    role: "user".to_string(),
                    content: prompt.to_string(),
                },
            ],
            temperature: 0.1,
            response_format: Some(ResponseFormat {
                format_type: "json_schema".to_string(),
                json_schema: Some(JsonSchemaWrapper {
                    name: "invoice_extraction".to_string(),
                    strict: true,
                    schema: payload_schema(),
                }),
            }),
        };

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ExtractError::Timeout(self.timeout_secs)
                } else if e.is_connect() {
                    ExtractError::Network(format!("Connection failed: {}", e))
                } else {
                    ExtractError::Network(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let status_code = status.as_u16();
            let body = response.text().await.unwrap_or_default();

            let message = serde_json::from_str::<ApiError>(&body)
                .map(|e| e.error.message)
                .unwrap_or_else(|_| format!("HTTP {}: {}", status_code, body));

            if status_code == 429 {
                return Err(ExtractError::RateLimited);
            }

            return Err(ExtractError::Remote {
                message,
                status_code,
                retryable: status_code >= 500,
            });
        }

        let chat_response: ChatResponse = response
            .json()
            .await
            .map_err(|e| ExtractError::Network(format!("Failed to parse model response: {}", e)))?;

        let content = chat_response
            .choices
            .first()
            .and_then(|c| c.message.content.as_ref())
            .ok_or_else(|| ExtractError::Remote {
                message: "Empty response from model".into(),
                status_code: 200,
                retryable: false,
            })?;

        serde_json::from_str(content).map_err(|e| {
            ExtractError::ParseFailure(format!("model returned invalid JSON: {}. Raw: {}", e, content))
        })
    }
}
