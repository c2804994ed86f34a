use std::future::Future;
use std::path::{Path, PathBuf};

use rust_decimal::Decimal;

use crate::error::ExtractError;
use crate::models::RawInvoicePayload;

/// Parses a document into text segments, one per page.
pub trait DocumentParser: Send + Sync + Clone {
    fn parse(
        &self,
        path: &Path,
        language: &str,
    ) -> impl Future<Output = Result<Vec<String>, ExtractError>> + Send;
}

/// Turns parsed text into a structured invoice payload using a remote
/// model.
pub trait Structurer: Send + Sync + Clone {
    fn structure(
        &self,
        prompt: &str,
    ) -> impl Future<Output = Result<RawInvoicePayload, ExtractError>> + Send;
}

/// A parent-group folder in the remote file store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderRef {
    pub id: String,
    pub name: String,
}

/// A document inside a parent-group folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentRef {
    pub id: String,
    pub name: String,
}

/// Enumerates parent groups and their documents in the remote file
/// store, and downloads documents for local processing.
pub trait FileDiscovery: Send + Sync + Clone {
    fn list_folders(
        &self,
        root_id: &str,
    ) -> impl Future<Output = Result<Vec<FolderRef>, ExtractError>> + Send;

    /// List the extractable documents in a folder, filtered by name/type.
    fn list_documents(
        &self,
        folder_id: &str,
    ) -> impl Future<Output = Result<Vec<DocumentRef>, ExtractError>> + Send;

    /// Download a document into `dest_dir`, returning its local path.
    fn download(
        &self,
        file_id: &str,
        file_name: &str,
        dest_dir: &Path,
    ) -> impl Future<Output = Result<PathBuf, ExtractError>> + Send;
}

/// Looks up the externally declared total for a parent group.
pub trait ReferenceLookup: Send + Sync + Clone {
    fn declared_total(
        &self,
        key: &str,
    ) -> impl Future<Output = Result<Option<Decimal>, ExtractError>> + Send;
}

/// A no-op lookup for runs without reference reconciliation.
#[derive(Debug, Clone)]
pub struct NullReferenceLookup;

impl ReferenceLookup for NullReferenceLookup {
    async fn declared_total(&self, _key: &str) -> Result<Option<Decimal>, ExtractError> {
        Ok(None)
    }
}
