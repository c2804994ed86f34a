pub mod cache;
pub mod engine;
pub mod error;
pub mod fallback;
pub mod fingerprint;
pub mod limiter;
pub mod models;
pub mod pipeline;
pub mod retry;
pub mod session;
pub mod traits;

#[cfg(test)]
pub mod testutil;

pub use error::ExtractError;
pub use models::{ExtractedInvoice, ExtractionConfidence, LineItem, RawInvoicePayload};
pub use pipeline::{BatchPipeline, BatchSummary, PipelineConfig};
pub use traits::{DocumentParser, FileDiscovery, ReferenceLookup, Structurer};
