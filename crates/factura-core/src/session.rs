//! Checkpointed batch sessions with crash recovery.
//!
//! Every session owns two files in the session directory: a JSON
//! checkpoint (`session_{id}.json`, the source of truth) and a flattened
//! CSV artifact (`invoices_{id}.csv`, one row per line item, regenerated
//! from the checkpoint on every completed unit). Both are staged as
//! temporary files and renamed into place only after every write has
//! succeeded; a failed checkpoint rename rolls the CSV back, so neither
//! artifact ever reflects a newer state than the other.

use std::collections::HashSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::error::ExtractError;
use crate::models::ExtractedInvoice;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SessionStatus {
    Initializing,
    Processing,
    Resumed,
    Completed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Initializing => "INITIALIZING",
            SessionStatus::Processing => "PROCESSING",
            SessionStatus::Resumed => "RESUMED",
            SessionStatus::Completed => "COMPLETED",
        }
    }

    /// Anything short of completion can be picked up again.
    pub fn is_resumable(&self) -> bool {
        !matches!(self, SessionStatus::Completed)
    }
}

/// Ledger entry for a unit that was persisted end-to-end.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletedUnit {
    pub unit_id: String,
    pub completion_time: DateTime<Utc>,
    pub record_count: usize,
    pub processing_secs: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedUnit {
    pub unit_id: String,
    pub error: String,
    pub failure_time: DateTime<Utc>,
}

/// An extracted record tagged with the parent unit it came from, so an
/// interrupted unit's records can be discarded on resume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttributedRecord {
    pub parent_id: String,
    pub invoice: ExtractedInvoice,
}

/// Everything the checkpoint file holds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub session_id: String,
    pub start_time: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: SessionStatus,
    /// Remote root the processing plan was listed from; resume re-lists
    /// from here.
    pub root_id: String,
    pub total_units: usize,
    pub unit_ids: Vec<String>,
    pub completed_units: Vec<CompletedUnit>,
    pub failed_units: Vec<FailedUnit>,
    pub in_progress_unit: Option<String>,
    pub records: Vec<AttributedRecord>,
    /// Wall-clock seconds for the whole session, set at finalize.
    pub total_secs: f64,
}

impl SessionState {
    fn new(session_id: &str) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.to_string(),
            start_time: now,
            last_updated: now,
            end_time: None,
            status: SessionStatus::Initializing,
            root_id: String::new(),
            total_units: 0,
            unit_ids: Vec::new(),
            completed_units: Vec::new(),
            failed_units: Vec::new(),
            in_progress_unit: None,
            records: Vec::new(),
            total_secs: 0.0,
        }
    }

    pub fn total_records(&self) -> usize {
        self.records.len()
    }

    pub fn total_line_items(&self) -> usize {
        self.records
            .iter()
            .map(|r| r.invoice.total_line_items())
            .sum()
    }
}

/// One row of the resumable-session listing.
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub session_id: String,
    pub status: SessionStatus,
    pub completed_units: usize,
    pub total_units: usize,
    pub last_updated: DateTime<Utc>,
}

/// A live session bound to its directory.
///
/// All mutations clone the state, persist the clone, and only then
/// commit it, so a failed write leaves both the in-memory state and the
/// on-disk checkpoint as they were.
#[derive(Debug)]
pub struct SessionStore {
    dir: PathBuf,
    state: SessionState,
}

impl SessionStore {
    /// Start a fresh session and write its initial checkpoint.
    pub fn create(dir: impl Into<PathBuf>, session_id: &str) -> Result<Self, ExtractError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let store = Self {
            dir,
            state: SessionState::new(session_id),
        };
        store.persist_checkpoint(&store.state)?;
        tracing::info!(session = %session_id, "session created");
        Ok(store)
    }

    /// Load an existing session, rolling back any unit that was in
    /// progress when the previous run stopped.
    pub fn resume(dir: impl Into<PathBuf>, session_id: &str) -> Result<Self, ExtractError> {
        let dir = dir.into();
        let path = checkpoint_path(&dir, session_id);
        let raw = fs::read_to_string(&path).map_err(|e| {
            ExtractError::Persistence(format!("cannot read session {session_id}: {e}"))
        })?;
        let mut state: SessionState = serde_json::from_str(&raw).map_err(|e| {
            ExtractError::Persistence(format!("session {session_id} checkpoint is malformed: {e}"))
        })?;

        if let Some(unit) = state.in_progress_unit.take() {
            let before = state.records.len();
            state.records.retain(|r| r.parent_id != unit);
            let removed = before - state.records.len();
            tracing::warn!(
                session = %session_id,
                unit = %unit,
                records_discarded = removed,
                "rolled back interrupted unit"
            );
        }
        state.status = SessionStatus::Resumed;
        state.last_updated = Utc::now();

        let store = Self { dir, state };
        store.persist_checkpoint(&store.state)?;
        tracing::info!(
            session = %session_id,
            completed = store.state.completed_units.len(),
            failed = store.state.failed_units.len(),
            "session resumed"
        );
        Ok(store)
    }

    /// Scan a directory for checkpoints of unfinished sessions, newest
    /// first. Unreadable checkpoints are skipped.
    pub fn list_resumable(dir: &Path) -> Result<Vec<SessionSummary>, ExtractError> {
        let mut summaries = Vec::new();
        if !dir.exists() {
            return Ok(summaries);
        }
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !name.starts_with("session_") || !name.ends_with(".json") {
                continue;
            }
            let state: SessionState = match fs::read_to_string(&path)
                .map_err(ExtractError::from)
                .and_then(|raw| serde_json::from_str(&raw).map_err(ExtractError::from))
            {
                Ok(state) => state,
                Err(e) => {
                    tracing::warn!(file = %path.display(), error = %e, "skipping unreadable checkpoint");
                    continue;
                }
            };
            if state.status.is_resumable() {
                summaries.push(SessionSummary {
                    session_id: state.session_id,
                    status: state.status,
                    completed_units: state.completed_units.len(),
                    total_units: state.total_units,
                    last_updated: state.last_updated,
                });
            }
        }
        summaries.sort_by(|a, b| b.last_updated.cmp(&a.last_updated));
        Ok(summaries)
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn session_id(&self) -> &str {
        &self.state.session_id
    }

    pub fn checkpoint_file(&self) -> PathBuf {
        checkpoint_path(&self.dir, &self.state.session_id)
    }

    pub fn csv_file(&self) -> PathBuf {
        csv_path(&self.dir, &self.state.session_id)
    }

    /// Unit ids already persisted end-to-end. Exactly these are skipped
    /// on resume.
    pub fn completed_unit_ids(&self) -> HashSet<String> {
        self.state
            .completed_units
            .iter()
            .map(|u| u.unit_id.clone())
            .collect()
    }

    /// Record the processing plan and move to Processing. Called again
    /// on resume with the freshly listed plan; completed units are kept.
    pub fn begin(&mut self, root_id: &str, unit_ids: Vec<String>) -> Result<(), ExtractError> {
        let mut next = self.state.clone();
        next.root_id = root_id.to_string();
        next.total_units = unit_ids.len();
        next.unit_ids = unit_ids;
        next.status = SessionStatus::Processing;
        next.last_updated = Utc::now();
        self.persist_checkpoint(&next)?;
        self.state = next;
        Ok(())
    }

    /// Mark a unit as in progress. The marker hits disk before any of
    /// the unit's work starts, so a crash mid-unit is detectable.
    pub fn start_unit(&mut self, unit_id: &str) -> Result<(), ExtractError> {
        let mut next = self.state.clone();
        next.in_progress_unit = Some(unit_id.to_string());
        next.last_updated = Utc::now();
        self.persist_checkpoint(&next)?;
        self.state = next;
        tracing::debug!(session = %self.state.session_id, unit = %unit_id, "unit started");
        Ok(())
    }

    /// Persist a unit's records and mark it completed, atomically across
    /// both artifacts.
    pub fn complete_unit(
        &mut self,
        unit_id: &str,
        records: &[ExtractedInvoice],
        processing_secs: f64,
    ) -> Result<(), ExtractError> {
        let mut next = self.state.clone();
        for invoice in records {
            next.records.push(AttributedRecord {
                parent_id: unit_id.to_string(),
                invoice: invoice.clone(),
            });
        }
        next.completed_units.push(CompletedUnit {
            unit_id: unit_id.to_string(),
            completion_time: Utc::now(),
            record_count: records.len(),
            processing_secs,
        });
        // Another unit may have taken the marker since; only clear our own.
        if next.in_progress_unit.as_deref() == Some(unit_id) {
            next.in_progress_unit = None;
        }
        next.last_updated = Utc::now();

        self.persist_all(&next)?;
        self.state = next;
        tracing::info!(
            session = %self.state.session_id,
            unit = %unit_id,
            records = records.len(),
            completed = self.state.completed_units.len(),
            total = self.state.total_units,
            "unit completed"
        );
        Ok(())
    }

    pub fn fail_unit(&mut self, unit_id: &str, error: &str) -> Result<(), ExtractError> {
        let mut next = self.state.clone();
        next.failed_units.push(FailedUnit {
            unit_id: unit_id.to_string(),
            error: error.to_string(),
            failure_time: Utc::now(),
        });
        if next.in_progress_unit.as_deref() == Some(unit_id) {
            next.in_progress_unit = None;
        }
        next.last_updated = Utc::now();
        self.persist_checkpoint(&next)?;
        self.state = next;
        tracing::warn!(session = %self.state.session_id, unit = %unit_id, error = %error, "unit failed");
        Ok(())
    }

    /// Close out the session and write the final artifacts.
    pub fn finalize(&mut self) -> Result<(), ExtractError> {
        let now = Utc::now();
        let mut next = self.state.clone();
        next.status = SessionStatus::Completed;
        next.end_time = Some(now);
        next.in_progress_unit = None;
        next.total_secs = (now - next.start_time).num_milliseconds() as f64 / 1000.0;
        next.last_updated = now;
        self.persist_all(&next)?;
        self.state = next;
        tracing::info!(
            session = %self.state.session_id,
            secs = format!("{:.1}", self.state.total_secs),
            "session finalized"
        );
        Ok(())
    }

    fn persist_checkpoint(&self, state: &SessionState) -> Result<(), ExtractError> {
        let json = serde_json::to_vec_pretty(state)?;
        write_atomic(&self.dir, &checkpoint_path(&self.dir, &state.session_id), &json)
    }

    fn persist_all(&self, state: &SessionState) -> Result<(), ExtractError> {
        let json = serde_json::to_vec_pretty(state)?;
        let csv = render_csv(&state.records)?;
        let csv_target = csv_path(&self.dir, &state.session_id);
        let checkpoint_target = checkpoint_path(&self.dir, &state.session_id);

        // Both artifacts are staged before either is moved into place,
        // so a failed write leaves every committed file as it was.
        let csv_tmp = stage(&self.dir, &csv)?;
        let checkpoint_tmp = stage(&self.dir, &json)?;

        // Renames only from here on. The checkpoint goes last; if its
        // rename still fails, the CSV rename is undone so neither
        // artifact reflects a newer state than the other.
        let previous_csv = fs::read(&csv_target).ok();
        persist(csv_tmp, &csv_target)?;
        if let Err(e) = persist(checkpoint_tmp, &checkpoint_target) {
            restore_csv(&self.dir, &csv_target, previous_csv);
            return Err(e);
        }
        Ok(())
    }
}

fn checkpoint_path(dir: &Path, session_id: &str) -> PathBuf {
    dir.join(format!("session_{session_id}.json"))
}

fn csv_path(dir: &Path, session_id: &str) -> PathBuf {
    dir.join(format!("invoices_{session_id}.csv"))
}

/// Write `bytes` to a temporary file in `dir`, ready to be renamed.
fn stage(dir: &Path, bytes: &[u8]) -> Result<NamedTempFile, ExtractError> {
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    Ok(tmp)
}

/// Move a staged file into place.
fn persist(tmp: NamedTempFile, target: &Path) -> Result<(), ExtractError> {
    tmp.persist(target)
        .map_err(|e| ExtractError::Persistence(format!("{}: {e}", target.display())))?;
    Ok(())
}

/// Put the previous CSV bytes back after a failed checkpoint rename.
/// Failures are logged, not returned; callers see the original error.
fn restore_csv(dir: &Path, target: &Path, previous: Option<Vec<u8>>) {
    let outcome = match previous {
        Some(bytes) => write_atomic(dir, target, &bytes),
        None => fs::remove_file(target).map_err(ExtractError::from),
    };
    if let Err(e) = outcome {
        tracing::warn!(csv = %target.display(), error = %e, "csv rollback failed");
    }
}

/// Write via a temporary file in the same directory, then rename.
fn write_atomic(dir: &Path, target: &Path, bytes: &[u8]) -> Result<(), ExtractError> {
    persist(stage(dir, bytes)?, target)
}

/// One CSV row per line item; records without items still get a row so
/// Error-confidence extractions stay visible in the artifact.
#[derive(Serialize)]
struct CsvRow<'a> {
    parent_group: &'a str,
    source_file: &'a str,
    invoice_date: &'a str,
    supplier: &'a str,
    invoice_number: &'a str,
    line_number: Option<u32>,
    reference_code: Option<&'a str>,
    description: Option<&'a str>,
    quantity: Option<Decimal>,
    unit: Option<&'a str>,
    tariff_code: Option<&'a str>,
    unit_value: Option<Decimal>,
    line_total: Option<Decimal>,
    confidence: &'a str,
    processing_secs: f64,
    notes: &'a str,
}

fn render_csv(records: &[AttributedRecord]) -> Result<Vec<u8>, ExtractError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    for record in records {
        let invoice = &record.invoice;
        let base = CsvRow {
            parent_group: &record.parent_id,
            source_file: &invoice.source_identifier,
            invoice_date: &invoice.date,
            supplier: &invoice.supplier,
            invoice_number: &invoice.invoice_number,
            line_number: None,
            reference_code: None,
            description: None,
            quantity: None,
            unit: None,
            tariff_code: None,
            unit_value: None,
            line_total: None,
            confidence: invoice.confidence.as_str(),
            processing_secs: invoice.processing_secs,
            notes: &invoice.notes,
        };
        if invoice.line_items.is_empty() {
            writer
                .serialize(&base)
                .map_err(|e| ExtractError::Persistence(e.to_string()))?;
        } else {
            for item in &invoice.line_items {
                writer
                    .serialize(CsvRow {
                        line_number: Some(item.line_number),
                        reference_code: Some(&item.reference_code),
                        description: Some(&item.description),
                        quantity: Some(item.quantity),
                        unit: Some(&item.unit),
                        tariff_code: Some(&item.tariff_code),
                        unit_value: Some(item.unit_value),
                        line_total: Some(item.line_total),
                        ..base
                    })
                    .map_err(|e| ExtractError::Persistence(e.to_string()))?;
            }
        }
    }
    writer
        .into_inner()
        .map_err(|e| ExtractError::Persistence(e.to_string()))
}
