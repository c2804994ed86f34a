//! Test utilities: mock implementations of all core traits.
//!
//! Handwritten mocks for dependency injection in unit tests.
//! All mocks use `Arc<Mutex<_>>` for interior mutability, allowing
//! test assertions on recorded calls.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rust_decimal::Decimal;

use crate::error::ExtractError;
use crate::models::{ExtractedInvoice, ExtractionConfidence, LineItem, RawInvoicePayload, RawLineItem};
use crate::traits::{DocumentParser, DocumentRef, FileDiscovery, FolderRef, ReferenceLookup, Structurer};

// ---------------------------------------------------------------------------
// MockParser
// ---------------------------------------------------------------------------

/// Mock parser that returns configurable page text.
#[derive(Clone)]
pub struct MockParser {
    /// Queue of responses. Each call pops the first element.
    /// If empty, returns the fallback page.
    responses: Arc<Mutex<Vec<Result<Vec<String>, ExtractError>>>>,
    fallback: Arc<String>,
    delay: Option<Duration>,
    calls: Arc<AtomicU32>,
}

impl MockParser {
    /// Parser that returns `text` as a single page on every call.
    pub fn new(text: &str) -> Self {
        Self {
            responses: Arc::new(Mutex::new(Vec::new())),
            fallback: Arc::new(text.to_string()),
            delay: None,
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn with_error(error: ExtractError) -> Self {
        Self {
            responses: Arc::new(Mutex::new(vec![Err(error)])),
            fallback: Arc::new("default page content".to_string()),
            delay: None,
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn with_responses(responses: Vec<Result<Vec<String>, ExtractError>>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses)),
            fallback: Arc::new("default page content".to_string()),
            delay: None,
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Sleep this long inside every call, for timeout and concurrency tests.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl DocumentParser for MockParser {
    async fn parse(&self, _path: &Path, _language: &str) -> Result<Vec<String>, ExtractError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            Ok(vec![self.fallback.as_ref().clone()])
        } else {
            responses.remove(0)
        }
    }
}

// ---------------------------------------------------------------------------
// MockStructurer
// ---------------------------------------------------------------------------

/// Mock structurer that returns a configurable payload and records the
/// prompts it was given.
#[derive(Clone)]
pub struct MockStructurer {
    responses: Arc<Mutex<Vec<Result<RawInvoicePayload, ExtractError>>>>,
    fallback: Arc<RawInvoicePayload>,
    prompts: Arc<Mutex<Vec<String>>>,
    calls: Arc<AtomicU32>,
}

impl MockStructurer {
    /// Structurer that returns `payload` on every call.
    pub fn new(payload: RawInvoicePayload) -> Self {
        Self {
            responses: Arc::new(Mutex::new(Vec::new())),
            fallback: Arc::new(payload),
            prompts: Arc::new(Mutex::new(Vec::new())),
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn with_error(error: ExtractError) -> Self {
        Self {
            responses: Arc::new(Mutex::new(vec![Err(error)])),
            fallback: Arc::new(make_test_payload(&[("DEFAULT-1", "1.00")])),
            prompts: Arc::new(Mutex::new(Vec::new())),
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn with_responses(responses: Vec<Result<RawInvoicePayload, ExtractError>>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses)),
            fallback: Arc::new(make_test_payload(&[("DEFAULT-1", "1.00")])),
            prompts: Arc::new(Mutex::new(Vec::new())),
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Prompts received so far, in call order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Structurer for MockStructurer {
    async fn structure(&self, prompt: &str) -> Result<RawInvoicePayload, ExtractError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().unwrap().push(prompt.to_string());
        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            Ok(self.fallback.as_ref().clone())
        } else {
            responses.remove(0)
        }
    }
}

// ---------------------------------------------------------------------------
// MockDiscovery
// ---------------------------------------------------------------------------

/// Mock file discovery backed by in-memory folders. Downloads write the
/// configured content to the destination directory.
#[derive(Clone)]
pub struct MockDiscovery {
    folders: Arc<Mutex<Vec<FolderRef>>>,
    /// folder id -> documents
    documents: Arc<Mutex<HashMap<String, Vec<DocumentRef>>>>,
    /// file id -> content written on download
    contents: Arc<Mutex<HashMap<String, String>>>,
    list_error: Arc<Mutex<Option<ExtractError>>>,
    download_error: Arc<Mutex<Option<ExtractError>>>,
    /// File ids downloaded so far, in call order.
    pub downloads: Arc<Mutex<Vec<String>>>,
}

impl MockDiscovery {
    pub fn empty() -> Self {
        Self {
            folders: Arc::new(Mutex::new(Vec::new())),
            documents: Arc::new(Mutex::new(HashMap::new())),
            contents: Arc::new(Mutex::new(HashMap::new())),
            list_error: Arc::new(Mutex::new(None)),
            download_error: Arc::new(Mutex::new(None)),
            downloads: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Discovery with one folder. `docs` are `(file_name, content)` pairs;
    /// folder and file ids equal their names.
    pub fn with_documents(folder_name: &str, docs: &[(&str, &str)]) -> Self {
        Self::empty().add_folder(folder_name, docs)
    }

    pub fn add_folder(self, folder_name: &str, docs: &[(&str, &str)]) -> Self {
        self.folders.lock().unwrap().push(FolderRef {
            id: folder_name.to_string(),
            name: folder_name.to_string(),
        });
        let mut refs = Vec::new();
        for (file_name, content) in docs {
            refs.push(DocumentRef {
                id: file_name.to_string(),
                name: file_name.to_string(),
            });
            self.contents
                .lock()
                .unwrap()
                .insert(file_name.to_string(), content.to_string());
        }
        self.documents
            .lock()
            .unwrap()
            .insert(folder_name.to_string(), refs);
        self
    }

    /// The next `list_documents` call fails with `error`.
    pub fn with_list_error(self, error: ExtractError) -> Self {
        *self.list_error.lock().unwrap() = Some(error);
        self
    }

    /// The next download call fails with `error`.
    pub fn with_download_error(self, error: ExtractError) -> Self {
        *self.download_error.lock().unwrap() = Some(error);
        self
    }

    pub fn download_count(&self) -> usize {
        self.downloads.lock().unwrap().len()
    }
}

impl FileDiscovery for MockDiscovery {
    async fn list_folders(&self, _root_id: &str) -> Result<Vec<FolderRef>, ExtractError> {
        Ok(self.folders.lock().unwrap().clone())
    }

    async fn list_documents(&self, folder_id: &str) -> Result<Vec<DocumentRef>, ExtractError> {
        let mut err = self.list_error.lock().unwrap();
        if let Some(e) = err.take() {
            return Err(e);
        }
        Ok(self
            .documents
            .lock()
            .unwrap()
            .get(folder_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn download(
        &self,
        file_id: &str,
        file_name: &str,
        dest_dir: &Path,
    ) -> Result<PathBuf, ExtractError> {
        let mut err = self.download_error.lock().unwrap();
        if let Some(e) = err.take() {
            return Err(e);
        }
        self.downloads.lock().unwrap().push(file_id.to_string());
        let content = self
            .contents
            .lock()
            .unwrap()
            .get(file_id)
            .cloned()
            .unwrap_or_else(|| "default document content".to_string());
        let path = dest_dir.join(file_name);
        std::fs::write(&path, content)?;
        Ok(path)
    }
}

// ---------------------------------------------------------------------------
// MockLookup
// ---------------------------------------------------------------------------

/// Mock reference lookup backed by a map of declared totals.
#[derive(Clone)]
pub struct MockLookup {
    totals: Arc<Mutex<HashMap<String, Decimal>>>,
    /// Keys queried so far.
    pub queries: Arc<Mutex<Vec<String>>>,
}

impl MockLookup {
    /// Lookup with no entries. Every query returns `None`.
    pub fn empty() -> Self {
        Self {
            totals: Arc::new(Mutex::new(HashMap::new())),
            queries: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Lookup seeded with `(key, declared_total)` pairs.
    pub fn with_totals(entries: &[(&str, &str)]) -> Self {
        let mut totals = HashMap::new();
        for (key, total) in entries {
            totals.insert(key.to_string(), Decimal::from_str(total).unwrap());
        }
        Self {
            totals: Arc::new(Mutex::new(totals)),
            queries: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl ReferenceLookup for MockLookup {
    async fn declared_total(&self, key: &str) -> Result<Option<Decimal>, ExtractError> {
        self.queries.lock().unwrap().push(key.to_string());
        Ok(self.totals.lock().unwrap().get(key).copied())
    }
}

// ---------------------------------------------------------------------------
// Test helpers
// ---------------------------------------------------------------------------

/// Build a raw payload from `(reference_code, line_total)` pairs.
/// Quantity is 1 so `unit_value == line_total`.
pub fn make_test_payload(items: &[(&str, &str)]) -> RawInvoicePayload {
    RawInvoicePayload {
        supplier: "ACME Industrial SA".to_string(),
        invoice_date: "2024-01-15".to_string(),
        invoice_number: "F-2024-001".to_string(),
        line_items: items
            .iter()
            .enumerate()
            .map(|(i, (code, total))| make_test_raw_item(i as u32 + 1, code, total))
            .collect(),
    }
}

pub fn make_test_raw_item(line_number: u32, code: &str, total: &str) -> RawLineItem {
    let total = Decimal::from_str(total).unwrap();
    RawLineItem {
        line_number,
        reference_code: code.to_string(),
        description: format!("Item {line_number}"),
        quantity: Decimal::ONE,
        unit: "001".to_string(),
        tariff_code: "00000000".to_string(),
        unit_value: total,
        line_total: total,
    }
}

/// Build a High-confidence extracted record with one line item per total.
pub fn make_test_invoice(source: &str, totals: &[&str]) -> ExtractedInvoice {
    let line_items: Vec<LineItem> = totals
        .iter()
        .enumerate()
        .map(|(i, total)| {
            let total = Decimal::from_str(total).unwrap();
            LineItem::new(
                i as u32 + 1,
                format!("REF-{}", i + 1),
                format!("Item {}", i + 1),
                Decimal::ONE,
                "001",
                "00000000",
                total,
                total,
            )
        })
        .collect();
    let declared_total = line_items.iter().map(|i| i.line_total).sum();

    ExtractedInvoice {
        supplier: "ACME Industrial SA".to_string(),
        date: "2024-01-15".to_string(),
        invoice_number: format!("INV-{source}"),
        line_items,
        declared_total,
        confidence: ExtractionConfidence::High,
        notes: String::new(),
        source_identifier: source.to_string(),
        processing_secs: 1.0,
    }
}
