//! Batch orchestration: discover parent groups, extract their documents
//! under a shared permit pool, and persist per-group results through the
//! checkpointed session store.
//!
//! Groups are processed a bounded number at a time; documents inside a
//! group all compete for the same global extraction permits. Cache hits
//! bypass the permit pool entirely. A cancelled run commits nothing
//! beyond the last completed group and leaves the session resumable.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::cache::{CacheConfig, ContentCache};
use crate::engine::{EngineConfig, ExtractionEngine};
use crate::error::ExtractError;
use crate::fingerprint::ContentFingerprint;
use crate::limiter::{ConcurrencyController, LimiterConfig};
use crate::models::{ExtractedInvoice, ExtractionConfidence, WorkUnit};
use crate::retry::{RetryPolicy, run_with_retry};
use crate::session::{SessionStore, SessionSummary};
use crate::traits::{DocumentParser, FileDiscovery, FolderRef, ReferenceLookup, Structurer};

/// Tunables for a whole batch run.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub cache: CacheConfig,
    pub session_dir: PathBuf,
    pub engine: EngineConfig,
    pub limiter: LimiterConfig,
    /// Parent groups in flight at once. Documents always share the
    /// global permit pool regardless of their group.
    pub group_concurrency: usize,
    /// Tolerance when reconciling against externally declared totals.
    pub tolerance: Decimal,
    /// Retry policy for discovery and download calls; the engine carries
    /// its own for parse and structuring.
    pub retry: RetryPolicy,
}

impl PipelineConfig {
    pub fn new(cache_dir: impl Into<PathBuf>, session_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache: CacheConfig::new(cache_dir),
            session_dir: session_dir.into(),
            engine: EngineConfig::default(),
            limiter: LimiterConfig::default(),
            group_concurrency: 2,
            tolerance: Decimal::new(1, 2),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_engine(mut self, engine: EngineConfig) -> Self {
        self.engine = engine;
        self
    }

    pub fn with_limiter(mut self, limiter: LimiterConfig) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn with_group_concurrency(mut self, n: usize) -> Self {
        self.group_concurrency = n;
        self
    }

    pub fn with_tolerance(mut self, tolerance: Decimal) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Per-confidence record counts for a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConfidenceTally {
    pub high: usize,
    pub medium: usize,
    pub low: usize,
    pub error: usize,
}

impl ConfidenceTally {
    fn bump(&mut self, confidence: ExtractionConfidence) {
        match confidence {
            ExtractionConfidence::High => self.high += 1,
            ExtractionConfidence::Medium => self.medium += 1,
            ExtractionConfidence::Low => self.low += 1,
            ExtractionConfidence::Error => self.error += 1,
        }
    }

    fn merge(&mut self, other: ConfidenceTally) {
        self.high += other.high;
        self.medium += other.medium;
        self.low += other.low;
        self.error += other.error;
    }

    pub fn total(&self) -> usize {
        self.high + self.medium + self.low + self.error
    }
}

/// A parent group's calculated total against the externally declared
/// one. `declared_total` is `None` when the reference source has no
/// entry for the group.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupReconciliation {
    pub parent_id: String,
    pub calculated_total: Decimal,
    pub declared_total: Option<Decimal>,
    pub difference: Option<Decimal>,
    pub within_tolerance: Option<bool>,
}

/// What a batch run accomplished. Unit counts are session-cumulative, so
/// a resumed session reports previously completed work as well.
#[derive(Debug, Clone)]
pub struct BatchSummary {
    pub session_id: String,
    pub total_units: usize,
    pub completed_units: usize,
    pub failed_units: usize,
    /// Units already complete when this run started.
    pub skipped_units: usize,
    pub total_records: usize,
    pub total_line_items: usize,
    pub cache_hits: usize,
    pub fallback_extractions: usize,
    pub tally: ConfidenceTally,
    pub reconciliations: Vec<GroupReconciliation>,
    pub interrupted: bool,
    pub checkpoint_file: PathBuf,
    pub csv_file: PathBuf,
    pub total_secs: f64,
}

/// What one group contributed to the run. Completion itself is tracked
/// by the session store; this only carries the run-level counters.
#[derive(Default)]
struct GroupOutcome {
    cache_hits: usize,
    fallbacks: usize,
    tally: ConfidenceTally,
    reconciliation: Option<GroupReconciliation>,
}

struct DocumentOutcome {
    invoice: ExtractedInvoice,
    cache_hit: bool,
    used_fallback: bool,
}

/// Drives whole batches end to end.
///
/// Generic over the remote collaborators so every seam can be mocked;
/// owns the content cache and the permit pool, while each run owns its
/// session store and download scratch space.
pub struct BatchPipeline<P, S, D, L>
where
    P: DocumentParser,
    S: Structurer,
    D: FileDiscovery,
    L: ReferenceLookup,
{
    engine: ExtractionEngine<P, S>,
    discovery: D,
    lookup: L,
    cache: Arc<Mutex<ContentCache>>,
    limiter: ConcurrencyController,
    config: PipelineConfig,
}

impl<P, S, D, L> BatchPipeline<P, S, D, L>
where
    P: DocumentParser,
    S: Structurer,
    D: FileDiscovery,
    L: ReferenceLookup,
{
    pub fn new(
        parser: P,
        structurer: S,
        discovery: D,
        lookup: L,
        config: PipelineConfig,
    ) -> Result<Self, ExtractError> {
        let cache = ContentCache::new(config.cache.clone())?;
        let limiter = ConcurrencyController::new(config.limiter.clone());
        let engine = ExtractionEngine::new(parser, structurer, config.engine.clone());
        Ok(Self {
            engine,
            discovery,
            lookup,
            cache: Arc::new(Mutex::new(cache)),
            limiter,
            config,
        })
    }

    /// Start a new session over every parent group under `root_id`.
    pub async fn run(
        &self,
        root_id: &str,
        cancel: &CancellationToken,
    ) -> Result<BatchSummary, ExtractError> {
        let session_id = new_session_id();
        let store = SessionStore::create(&self.config.session_dir, &session_id)?;
        self.run_session(store, root_id, cancel).await
    }

    /// Pick up an interrupted session. Completed groups are skipped;
    /// everything else is processed from scratch.
    pub async fn resume(
        &self,
        session_id: &str,
        cancel: &CancellationToken,
    ) -> Result<BatchSummary, ExtractError> {
        let store = SessionStore::resume(&self.config.session_dir, session_id)?;
        let root_id = store.state().root_id.clone();
        if root_id.is_empty() {
            return Err(ExtractError::Persistence(format!(
                "session {session_id} has no recorded root folder"
            )));
        }
        self.run_session(store, &root_id, cancel).await
    }

    /// Unfinished sessions in the session directory, newest first.
    pub fn list_sessions(&self) -> Result<Vec<SessionSummary>, ExtractError> {
        SessionStore::list_resumable(&self.config.session_dir)
    }

    async fn run_session(
        &self,
        mut store: SessionStore,
        root_id: &str,
        cancel: &CancellationToken,
    ) -> Result<BatchSummary, ExtractError> {
        let started = Instant::now();

        // 1. Discover parent groups and record the processing plan.
        let folders =
            run_with_retry(&self.config.retry, || self.discovery.list_folders(root_id)).await?;
        if folders.is_empty() {
            tracing::warn!(root = %root_id, "no parent groups found");
        }
        store.begin(root_id, folders.iter().map(|f| f.name.clone()).collect())?;

        // 2. Skip whatever a previous run already committed.
        let done = store.completed_unit_ids();
        let (skipped, pending): (Vec<FolderRef>, Vec<FolderRef>) =
            folders.into_iter().partition(|f| done.contains(&f.name));
        tracing::info!(
            session = %store.session_id(),
            pending = pending.len(),
            skipped = skipped.len(),
            "batch started"
        );

        // 3. Scratch space for downloads, removed when the run ends.
        let scratch = tempfile::tempdir()?;

        // 4. Process groups, a bounded number at a time.
        let session = Arc::new(Mutex::new(store));
        let outcomes: Vec<GroupOutcome> = stream::iter(
            pending
                .into_iter()
                .map(|folder| self.process_group(folder, &session, scratch.path(), cancel)),
        )
        .buffer_unordered(self.config.group_concurrency.max(1))
        .collect()
        .await;

        let mut store = Arc::try_unwrap(session)
            .map_err(|_| ExtractError::Generic("session store still shared after batch".into()))?
            .into_inner();

        // 5. Close out unless interrupted; an interrupted session stays
        //    resumable.
        let interrupted = cancel.is_cancelled();
        if interrupted {
            tracing::warn!(
                session = %store.session_id(),
                "batch interrupted; resume with this session id"
            );
        } else {
            store.finalize()?;
        }

        // 6. Fold per-group outcomes into the run summary.
        let mut summary = BatchSummary {
            session_id: store.session_id().to_string(),
            total_units: store.state().total_units,
            completed_units: store.state().completed_units.len(),
            failed_units: store.state().failed_units.len(),
            skipped_units: skipped.len(),
            total_records: store.state().total_records(),
            total_line_items: store.state().total_line_items(),
            cache_hits: 0,
            fallback_extractions: 0,
            tally: ConfidenceTally::default(),
            reconciliations: Vec::new(),
            interrupted,
            checkpoint_file: store.checkpoint_file(),
            csv_file: store.csv_file(),
            total_secs: started.elapsed().as_secs_f64(),
        };
        for outcome in outcomes {
            summary.cache_hits += outcome.cache_hits;
            summary.fallback_extractions += outcome.fallbacks;
            summary.tally.merge(outcome.tally);
            if let Some(reconciliation) = outcome.reconciliation {
                summary.reconciliations.push(reconciliation);
            }
        }

        tracing::info!(
            session = %summary.session_id,
            completed = summary.completed_units,
            failed = summary.failed_units,
            records = summary.total_records,
            cache_hits = summary.cache_hits,
            secs = summary.total_secs,
            "batch finished"
        );
        Ok(summary)
    }

    /// One parent group end to end: marker, documents, reconciliation,
    /// atomic commit. Never returns an error; failures are recorded on
    /// the session and the batch moves on.
    async fn process_group(
        &self,
        folder: FolderRef,
        session: &Arc<Mutex<SessionStore>>,
        scratch: &Path,
        cancel: &CancellationToken,
    ) -> GroupOutcome {
        if cancel.is_cancelled() {
            return GroupOutcome::default();
        }
        let unit_id = folder.name.clone();
        let group_started = Instant::now();

        if let Err(e) = session.lock().await.start_unit(&unit_id) {
            tracing::error!(unit = %unit_id, error = %e, "cannot persist start marker");
            return self.fail_group(session, &unit_id, &e.to_string()).await;
        }

        let documents = match run_with_retry(&self.config.retry, || {
            self.discovery.list_documents(&folder.id)
        })
        .await
        {
            Ok(documents) => documents,
            Err(e) => {
                return self
                    .fail_group(session, &unit_id, &format!("listing documents: {e}"))
                    .await;
            }
        };
        if documents.is_empty() {
            tracing::warn!(unit = %unit_id, "group has no documents");
        }

        let group_scratch = scratch.join(&folder.id);
        if let Err(e) = std::fs::create_dir_all(&group_scratch) {
            return self
                .fail_group(session, &unit_id, &format!("scratch dir: {e}"))
                .await;
        }

        // Everything in flight together; the permit pool bounds the
        // actual remote work.
        let units: Vec<WorkUnit> = documents
            .into_iter()
            .map(|doc| WorkUnit::new(&folder.name, doc.id, doc.name))
            .collect();
        let results = futures::future::join_all(
            units
                .into_iter()
                .map(|unit| self.process_document(unit, &group_scratch, cancel)),
        )
        .await;

        let mut records = Vec::new();
        let mut cache_hits = 0;
        let mut fallbacks = 0;
        let mut tally = ConfidenceTally::default();
        for result in results {
            match result {
                Some(doc) => {
                    cache_hits += usize::from(doc.cache_hit);
                    fallbacks += usize::from(doc.used_fallback);
                    tally.bump(doc.invoice.confidence);
                    records.push(doc.invoice);
                }
                // A document was abandoned mid-flight; the whole group
                // rolls back to pending.
                None => return GroupOutcome::default(),
            }
        }

        let reconciliation = self.reconcile(&unit_id, &records).await;

        if let Err(e) = session.lock().await.complete_unit(
            &unit_id,
            &records,
            group_started.elapsed().as_secs_f64(),
        ) {
            return self
                .fail_group(session, &unit_id, &format!("persisting unit: {e}"))
                .await;
        }

        GroupOutcome {
            cache_hits,
            fallbacks,
            tally,
            reconciliation: Some(reconciliation),
        }
    }

    async fn fail_group(
        &self,
        session: &Arc<Mutex<SessionStore>>,
        unit_id: &str,
        message: &str,
    ) -> GroupOutcome {
        if let Err(e) = session.lock().await.fail_unit(unit_id, message) {
            tracing::error!(unit = %unit_id, error = %e, "cannot record unit failure");
        }
        GroupOutcome::default()
    }

    async fn process_document(
        &self,
        unit: WorkUnit,
        dest_dir: &Path,
        cancel: &CancellationToken,
    ) -> Option<DocumentOutcome> {
        tokio::select! {
            _ = cancel.cancelled() => None,
            outcome = self.extract_one(&unit, dest_dir) => Some(outcome),
        }
    }

    /// Download, consult the cache, extract, cache the result. Failures
    /// become Error-confidence records so one bad document never sinks
    /// its group.
    async fn extract_one(&self, unit: &WorkUnit, dest_dir: &Path) -> DocumentOutcome {
        let path = match run_with_retry(&self.config.retry, || {
            self.discovery
                .download(&unit.document_handle, &unit.display_name, dest_dir)
        })
        .await
        {
            Ok(path) => path,
            Err(e) => {
                tracing::error!(
                    unit = %unit.parent_id,
                    document = %unit.display_name,
                    error = %e,
                    "download failed"
                );
                return DocumentOutcome {
                    invoice: ExtractedInvoice::error_record(
                        &unit.display_name,
                        format!("download failed: {e}"),
                        0.0,
                    ),
                    cache_hit: false,
                    used_fallback: false,
                };
            }
        };

        let fingerprint = match ContentFingerprint::of_file(&path) {
            Ok(fp) => Some(fp),
            Err(e) => {
                tracing::warn!(document = %unit.display_name, error = %e, "cannot fingerprint; skipping cache");
                None
            }
        };

        if let Some(fp) = &fingerprint {
            if let Some(invoice) = self.cache.lock().await.lookup(fp) {
                tracing::info!(document = %unit.display_name, "cache hit");
                return DocumentOutcome {
                    invoice,
                    cache_hit: true,
                    used_fallback: false,
                };
            }
        }

        let permit = match self.limiter.acquire().await {
            Ok(permit) => permit,
            Err(e) => {
                return DocumentOutcome {
                    invoice: ExtractedInvoice::error_record(
                        &unit.display_name,
                        format!("no extraction capacity: {e}"),
                        0.0,
                    ),
                    cache_hit: false,
                    used_fallback: false,
                };
            }
        };
        let outcome = self.engine.extract(&path, &unit.display_name).await;
        drop(permit);

        // Error records are rejected by the cache itself; anything else
        // is worth keeping.
        if let Some(fp) = &fingerprint {
            if let Err(e) = self.cache.lock().await.store(fp, &outcome.invoice) {
                tracing::warn!(document = %unit.display_name, error = %e, "cache write failed");
            }
        }

        DocumentOutcome {
            invoice: outcome.invoice,
            cache_hit: false,
            used_fallback: outcome.used_fallback,
        }
    }

    async fn reconcile(
        &self,
        unit_id: &str,
        records: &[ExtractedInvoice],
    ) -> GroupReconciliation {
        // Error records carry no usable totals.
        let calculated: Decimal = records
            .iter()
            .filter(|r| !r.is_error())
            .map(|r| r.calculated_total())
            .sum();
        let declared = match self.lookup.declared_total(unit_id).await {
            Ok(declared) => declared,
            Err(e) => {
                tracing::warn!(unit = %unit_id, error = %e, "reference lookup failed");
                None
            }
        };
        let difference = declared.map(|d| (d - calculated).abs());
        GroupReconciliation {
            parent_id: unit_id.to_string(),
            calculated_total: calculated,
            declared_total: declared,
            difference,
            within_tolerance: difference.map(|d| d <= self.config.tolerance),
        }
    }
}

/// Timestamped with a random suffix so concurrent starts never collide.
fn new_session_id() -> String {
    let stamp = Utc::now().format("%Y%m%d_%H%M%S");
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{stamp}_{}", &suffix[..8])
}
