use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use factura_core::error::ExtractError;
use factura_core::fallback::parse_amount;
use factura_core::traits::ReferenceLookup;
use reqwest::{Client, Response};
use rust_decimal::Decimal;
use serde::Deserialize;
use tokio::sync::OnceCell;

const DEFAULT_BASE_URL: &str = "https://sheets.googleapis.com/v4";
const DEFAULT_RANGE: &str = "Sheet1!A:Z";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Declared-total lookup backed by a spreadsheet.
///
/// The sheet is fetched once per process and held as a key-to-amount
/// table; the key and amount columns are located by header name, so
/// column order in the sheet does not matter.
#[derive(Clone)]
pub struct SheetsLookup {
    client: Client,
    base_url: String,
    token: String,
    spreadsheet_id: String,
    range: String,
    timeout_secs: u64,
    table: Arc<OnceCell<HashMap<String, Decimal>>>,
}

impl SheetsLookup {
    pub fn new(token: &str, spreadsheet_id: &str) -> Result<Self, ExtractError> {
        Self::with_base_url(token, spreadsheet_id, DEFAULT_BASE_URL)
    }

    pub fn with_base_url(
        token: &str,
        spreadsheet_id: &str,
        base_url: &str,
    ) -> Result<Self, ExtractError> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| ExtractError::Network(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            spreadsheet_id: spreadsheet_id.to_string(),
            range: DEFAULT_RANGE.to_string(),
            timeout_secs: DEFAULT_TIMEOUT.as_secs(),
            table: Arc::new(OnceCell::new()),
        })
    }

    pub fn with_range(mut self, range: impl Into<String>) -> Self {
        self.range = range.into();
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
            .map(|e| e.error.message)
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

    async fn fetch_table(&self) -> Result<HashMap<String, Decimal>, ExtractError> {
        let url = format!(
            "{}/spreadsheets/{}/values/{}",
            self.base_url, self.spreadsheet_id, self.range
        );
        let response = self
            .client
            .get(url)
            .header("Authorization", format!("Bearer {}", self.token))
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;
        let range: ValueRange = self
            .check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| ExtractError::Network(format!("Failed to parse sheet values: {}", e)))?;

        let table = build_table(&range.values)?;
        tracing::info!(entries = table.len(), "reference table loaded");
        Ok(table)
    }
}

// ---- Sheets API types ----

#[derive(Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<String>>,
}

#[derive(Deserialize)]
struct ApiError {
    error: ApiErrorDetail,
}

#[derive(Deserialize)]
struct ApiErrorDetail {
    message: String,
}

/// Header whose name carries all of "entry", "summary", "number", with a
/// looser fallback on "entry" or "esn".
fn find_key_column(headers: &[String]) -> Option<usize> {
    headers
        .iter()
        .position(|h| {
            let h = h.to_lowercase();
            h.contains("entry") && h.contains("summary") && h.contains("number")
        })
        .or_else(|| {
            headers.iter().position(|h| {
                let h = h.to_lowercase();
                h.contains("entry") || h.contains("esn")
            })
        })
}

/// Header for the declared goods value, with a looser fallback on
/// "amount" or "value".
fn find_amount_column(headers: &[String]) -> Option<usize> {
    headers
        .iter()
        .position(|h| {
            let h = h.to_lowercase();
            ["line", "tariff", "goods", "value", "amount"]
                .iter()
                .all(|w| h.contains(w))
        })
        .or_else(|| {
            headers.iter().position(|h| {
                let h = h.to_lowercase();
                h.contains("amount") || h.contains("value")
            })
        })
}

/// Currency symbols and spacing stripped before the shared amount
/// parser runs.
fn parse_declared(raw: &str) -> Option<Decimal> {
    let cleaned: String = raw
        .chars()
        .filter(|c| *c != '$' && !c.is_whitespace())
        .collect();
    parse_amount(&cleaned)
}

fn build_table(rows: &[Vec<String>]) -> Result<HashMap<String, Decimal>, ExtractError> {
    let Some((headers, data)) = rows.split_first() else {
        tracing::warn!("reference sheet returned no rows");
        return Ok(HashMap::new());
    };

    let key_col = find_key_column(headers).ok_or_else(|| {
        ExtractError::Generic(format!(
            "reference sheet has no recognizable key column in {:?}",
            headers
        ))
    })?;
    let amount_col = find_amount_column(headers).ok_or_else(|| {
        ExtractError::Generic(format!(
            "reference sheet has no recognizable amount column in {:?}",
            headers
        ))
    })?;

    let mut table = HashMap::new();
    for row in data {
        let Some(key) = row.get(key_col) else { continue };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        match row.get(amount_col).and_then(|raw| parse_declared(raw)) {
            Some(amount) => {
                table.insert(key.to_string(), amount);
            }
            None => {
                tracing::debug!(key = %key, "skipping row with unparsable amount");
            }
        }
    }
    Ok(table)
}

impl ReferenceLookup for SheetsLookup {
    async fn declared_total(&self, key: &str) -> Result<Option<Decimal>, ExtractError> {
        let table = self.table.get_or_try_init(|| self.fetch_table()).await?;
        let declared = table.get(key.trim()).copied();
        if declared.is_none() {
            tracing::warn!(key = %key, "no declared total in reference sheet");
        }
        Ok(declared)
    }
}
