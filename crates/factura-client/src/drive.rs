use std::path::{Path, PathBuf};
use std::time::Duration;

use factura_core::error::ExtractError;
use factura_core::traits::{DocumentRef, FileDiscovery, FolderRef};
use reqwest::{Client, Response};
use serde::Deserialize;

const DEFAULT_BASE_URL: &str = "https://www.googleapis.com/drive/v3";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);
const FOLDER_MIME: &str = "application/vnd.google-apps.folder";
const PDF_MIME: &str = "application/pdf";

/// Subfolder names that hold the extractable documents, in order of
/// preference for exact matching.
const INVOICE_FOLDER_NAMES: [&str; 6] = [
    "COMMERCIAL INVOICES",
    "COMMERCIAL INVOICE",
    "Commercial Invoices",
    "Commercial Invoice",
    "commercial invoices",
    "commercial invoice",
];

/// Document discovery over the Drive v3 REST API.
///
/// Parent groups are the folders directly under a root folder; each
/// group's documents are the PDFs inside its commercial-invoice
/// subfolder.
#[derive(Clone)]
pub struct DriveDiscovery {
    client: Client,
    base_url: String,
    token: String,
    timeout_secs: u64,
    name_prefix: Option<String>,
}

impl DriveDiscovery {
    pub fn new(token: &str) -> Result<Self, ExtractError> {
        Self::with_base_url(token, DEFAULT_BASE_URL)
    }

    pub fn with_base_url(token: &str, base_url: &str) -> Result<Self, ExtractError> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| ExtractError::Network(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            timeout_secs: DEFAULT_TIMEOUT.as_secs(),
            name_prefix: None,
        })
    }

    /// Only treat folders whose name starts with `prefix` as parent
    /// groups (e.g. an entry-number prefix shared by all group folders).
    pub fn with_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.name_prefix = Some(prefix.into());
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

    /// Run a files query, following pagination to the end.
    async fn list_files(&self, query: &str) -> Result<Vec<FileItem>, ExtractError> {
        let mut files = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut request = self
                .client
                .get(format!("{}/files", self.base_url))
                .header("Authorization", format!("Bearer {}", self.token))
                .query(&[
                    ("q", query),
                    ("fields", "nextPageToken, files(id, name)"),
                    ("pageSize", "1000"),
                ]);
            if let Some(token) = &page_token {
                request = request.query(&[("pageToken", token.as_str())]);
            }

            let response = request.send().await.map_err(|e| self.map_send_error(e))?;
            let page: FileList = self
                .check_status(response)
                .await?
                .json()
                .await
                .map_err(|e| ExtractError::Network(format!("Failed to parse file list: {}", e)))?;

            files.extend(page.files);
            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }
        Ok(files)
    }
}

// ---- Drive API types ----

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileList {
    #[serde(default)]
    files: Vec<FileItem>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FileItem {
    id: String,
    name: String,
}

#[derive(Deserialize)]
struct ApiError {
    error: ApiErrorDetail,
}

#[derive(Deserialize)]
struct ApiErrorDetail {
    message: String,
}

/// Pick the subfolder holding the invoices: exact name first, then any
/// name with both "commercial" and "invoice", then any name with
/// "invoice" at all.
fn find_invoice_folder(folders: &[FileItem]) -> Option<&FileItem> {
    for pattern in INVOICE_FOLDER_NAMES {
        if let Some(folder) = folders.iter().find(|f| f.name.trim() == pattern) {
            return Some(folder);
        }
    }
    if let Some(folder) = folders.iter().find(|f| {
        let name = f.name.to_lowercase();
        name.contains("commercial") && name.contains("invoice")
    }) {
        return Some(folder);
    }
    folders
        .iter()
        .find(|f| f.name.to_lowercase().contains("invoice"))
}

impl FileDiscovery for DriveDiscovery {
    async fn list_folders(&self, root_id: &str) -> Result<Vec<FolderRef>, ExtractError> {
        let query = format!(
            "'{}' in parents and mimeType='{}' and trashed=false",
            root_id, FOLDER_MIME
        );
        let mut folders: Vec<FolderRef> = self
            .list_files(&query)
            .await?
            .into_iter()
            .map(|f| FolderRef {
                id: f.id,
                name: f.name.trim().to_string(),
            })
            .filter(|f| match &self.name_prefix {
                Some(prefix) => f.name.starts_with(prefix.as_str()),
                None => true,
            })
            .collect();
        folders.sort_by(|a, b| a.name.cmp(&b.name));
        tracing::info!(root = %root_id, count = folders.len(), "parent group folders listed");
        Ok(folders)
    }

    async fn list_documents(&self, folder_id: &str) -> Result<Vec<DocumentRef>, ExtractError> {
        let subfolder_query = format!(
            "'{}' in parents and mimeType='{}' and trashed=false",
            folder_id, FOLDER_MIME
        );
        let subfolders = self.list_files(&subfolder_query).await?;

        let Some(invoice_folder) = find_invoice_folder(&subfolders) else {
            tracing::warn!(folder = %folder_id, "no commercial invoice subfolder found");
            return Ok(Vec::new());
        };
        tracing::debug!(folder = %folder_id, subfolder = %invoice_folder.name, "invoice subfolder selected");

        let pdf_query = format!(
            "'{}' in parents and mimeType='{}' and trashed=false",
            invoice_folder.id, PDF_MIME
        );
        let mut documents: Vec<DocumentRef> = self
            .list_files(&pdf_query)
            .await?
            .into_iter()
            .map(|f| DocumentRef {
                id: f.id,
                name: f.name,
            })
            .collect();
        documents.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(documents)
    }

    async fn download(
        &self,
        file_id: &str,
        file_name: &str,
        dest_dir: &Path,
    ) -> Result<PathBuf, ExtractError> {
        let response = self
            .client
            .get(format!("{}/files/{}", self.base_url, file_id))
            .header("Authorization", format!("Bearer {}", self.token))
            .query(&[("alt", "media")])
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;
        let bytes = self
            .check_status(response)
            .await?
            .bytes()
            .await
            .map_err(|e| ExtractError::Network(format!("Failed to read download body: {}", e)))?;

        if bytes.is_empty() {
            return Err(ExtractError::Network(format!(
                "empty download for {}",
                file_name
            )));
        }

        let path = dest_dir.join(file_name);
        tokio::fs::write(&path, &bytes).await?;
        tracing::debug!(file = %file_name, bytes = bytes.len(), "document downloaded");
        Ok(path)
    }
}
