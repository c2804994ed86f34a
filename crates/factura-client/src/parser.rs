use std::path::Path;
use std::time::Duration;

use factura_core::error::ExtractError;
use factura_core::traits::DocumentParser;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Response};
use serde::Deserialize;

const DEFAULT_BASE_URL: &str = "https://api.cloud.llamaindex.ai/api/parsing";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(2000);

/// Separator the parse service is asked to emit between pages, so the
/// result splits back into per-page text without guessing.
const PAGE_SEPARATOR: &str = "\n<<<PAGE_BREAK>>>\n";

/// Client for the hosted document-parse service.
///
/// Uploads a document, polls the parse job, and fetches the markdown
/// result. Each HTTP call carries its own timeout; the overall parse
/// budget is owned by the caller.
#[derive(Clone)]
pub struct ParseServiceClient {
    client: Client,
    base_url: String,
    api_key: String,
    timeout_secs: u64,
    poll_interval: Duration,
}

impl ParseServiceClient {
    pub fn new(api_key: &str) -> Result<Self, ExtractError> {
        Self::with_base_url(api_key, DEFAULT_BASE_URL)
    }

    pub fn with_base_url(api_key: &str, base_url: &str) -> Result<Self, ExtractError> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| ExtractError::Network(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            timeout_secs: DEFAULT_TIMEOUT.as_secs(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        })
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn map_send_error(&self, e: reqwest::Error) -> ExtractError {
        if e.is_timeout() {
            ExtractError::Timeout(self.timeout_secs)
        } else if e.is_connect() {
            ExtractError::Network(format!("Connection failed: {}", e))
        } else {
            ExtractError::Network(e.to_string())
        }
    }

    async fn check_status(&self, response: Response) -> Result<Response, ExtractError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let status_code = status.as_u16();
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ApiError>(&body)
            .map(|e| e.detail)
            .unwrap_or_else(|_| format!("HTTP {}: {}", status_code, body));

        if status_code == 429 {
            return Err(ExtractError::RateLimited);
        }

        Err(ExtractError::Remote {
            message,
            status_code,
            retryable: status_code >= 500,
        })
    }
}

// ---- Parse service API types ----

#[derive(Deserialize)]
struct ParseJob {
    id: String,
    status: String,
}

#[derive(Deserialize)]
struct ParseResult {
    markdown: String,
}

#[derive(Deserialize)]
struct ApiError {
    detail: String,
}

fn is_terminal(status: &str) -> bool {
    matches!(status, "SUCCESS" | "ERROR" | "CANCELED" | "CANCELLED")
}

fn split_pages(text: &str) -> Vec<String> {
    text.split(PAGE_SEPARATOR)
        .map(str::trim)
        .filter(|page| !page.is_empty())
        .map(str::to_string)
        .collect()
}

impl DocumentParser for ParseServiceClient {
    async fn parse(&self, path: &Path, language: &str) -> Result<Vec<String>, ExtractError> {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("document.pdf")
            .to_string();
        let bytes = tokio::fs::read(path).await?;

        let form = Form::new()
            .part("file", Part::bytes(bytes).file_name(file_name.clone()))
            .text("language", language.to_string())
            .text("page_separator", PAGE_SEPARATOR.to_string());

        let response = self
            .client
            .post(format!("{}/upload", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .multipart(form)
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;
        let job: ParseJob = self
            .check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| ExtractError::Network(format!("Failed to parse upload response: {}", e)))?;
        tracing::debug!(file = %file_name, job = %job.id, "parse job submitted");

        let mut status = job.status;
        while !is_terminal(&status) {
            tokio::time::sleep(self.poll_interval).await;
            let response = self
                .client
                .get(format!("{}/job/{}", self.base_url, job.id))
                .header("Authorization", format!("Bearer {}", self.api_key))
                .send()
                .await
                .map_err(|e| self.map_send_error(e))?;
            let update: ParseJob = self
                .check_status(response)
                .await?
                .json()
                .await
                .map_err(|e| {
                    ExtractError::Network(format!("Failed to parse job status: {}", e))
                })?;
            status = update.status;
        }
        if status != "SUCCESS" {
            return Err(ExtractError::ParseFailure(format!(
                "parse job for {} ended in status {}",
                file_name, status
            )));
        }

        let response = self
            .client
            .get(format!("{}/job/{}/result/markdown", self.base_url, job.id))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;
        let result: ParseResult = self
            .check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| ExtractError::Network(format!("Failed to parse job result: {}", e)))?;

        Ok(split_pages(&result.markdown))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_pages_on_separator() {
        let text = format!("first page{}second page{}third", PAGE_SEPARATOR, PAGE_SEPARATOR);
        let pages = split_pages(&text);
        assert_eq!(pages, vec!["first page", "second page", "third"]);
    }

    #[test]
    fn test_split_pages_drops_blank_segments() {
        let text = format!("only content{}   \n  ", PAGE_SEPARATOR);
        assert_eq!(split_pages(&text), vec!["only content"]);
    }

    #[test]
    fn test_split_pages_without_separator_is_one_page() {
        assert_eq!(split_pages("plain text"), vec!["plain text"]);
        assert!(split_pages("").is_empty());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(is_terminal("SUCCESS"));
        assert!(is_terminal("ERROR"));
        assert!(!is_terminal("PENDING"));
    }
}
