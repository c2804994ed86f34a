use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// One source document to be extracted, within a parent group.
///
/// Ephemeral: created per batch item, discarded after processing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkUnit {
    /// Identifier of the parent group this document belongs to
    /// (e.g., one audit entry number covering several invoices).
    pub parent_id: String,
    /// Opaque handle used to fetch the document from the file store.
    pub document_handle: String,
    /// Human-readable name, used in logs and record metadata.
    pub display_name: String,
}

impl WorkUnit {
    pub fn new(
        parent_id: impl Into<String>,
        document_handle: impl Into<String>,
        display_name: impl Into<String>,
    ) -> Self {
        Self {
            parent_id: parent_id.into(),
            document_handle: document_handle.into(),
            display_name: display_name.into(),
        }
    }
}

/// Reliability label attached to an extracted record.
///
/// Totally ordered by reliability: `High > Medium > Low > Error`.
/// `Error` is terminal: such records are excluded from totals and
/// never written to the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ExtractionConfidence {
    Error,
    Low,
    Medium,
    High,
}

impl ExtractionConfidence {
    /// Map a fallback quality-signal count (0..=3) to a confidence level.
    pub fn from_signal_count(signals: usize) -> Self {
        match signals {
            n if n >= 3 => ExtractionConfidence::High,
            2 => ExtractionConfidence::Medium,
            1 => ExtractionConfidence::Low,
            _ => ExtractionConfidence::Error,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExtractionConfidence::High => "HIGH",
            ExtractionConfidence::Medium => "MEDIUM",
            ExtractionConfidence::Low => "LOW",
            ExtractionConfidence::Error => "ERROR",
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ExtractionConfidence::Error)
    }
}

/// A single extracted invoice line.
///
/// Negative numeric fields are clamped to zero at construction; whether
/// negative inputs should instead be rejected is a policy decision made
/// upstream (see `ValidationPolicy`), not here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    /// 1-based position within the invoice.
    pub line_number: u32,
    pub reference_code: String,
    pub description: String,
    pub quantity: Decimal,
    pub unit: String,
    pub tariff_code: String,
    pub unit_value: Decimal,
    pub line_total: Decimal,
}

impl LineItem {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        line_number: u32,
        reference_code: impl Into<String>,
        description: impl Into<String>,
        quantity: Decimal,
        unit: impl Into<String>,
        tariff_code: impl Into<String>,
        unit_value: Decimal,
        line_total: Decimal,
    ) -> Self {
        Self {
            line_number,
            reference_code: reference_code.into().trim().to_string(),
            description: description.into().trim().to_string(),
            quantity: quantity.max(Decimal::ZERO),
            unit: unit.into().trim().to_string(),
            tariff_code: tariff_code.into().trim().to_string(),
            unit_value: unit_value.max(Decimal::ZERO),
            line_total: line_total.max(Decimal::ZERO),
        }
    }
}

/// A complete extracted invoice record.
///
/// The line-item count is always derived from `line_items` via
/// [`ExtractedInvoice::total_line_items`], never stored or trusted from
/// an external source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedInvoice {
    pub supplier: String,
    pub date: String,
    pub invoice_number: String,
    pub line_items: Vec<LineItem>,
    /// Total stated on (or computed for) the invoice itself. Decimal to
    /// avoid float drift in persisted artifacts.
    pub declared_total: Decimal,
    pub confidence: ExtractionConfidence,
    pub notes: String,
    /// Name of the source document this record came from.
    pub source_identifier: String,
    /// Wall-clock extraction duration in seconds.
    pub processing_secs: f64,
}

impl ExtractedInvoice {
    pub fn total_line_items(&self) -> usize {
        self.line_items.len()
    }

    /// Sum of all line totals.
    pub fn calculated_total(&self) -> Decimal {
        self.line_items.iter().map(|item| item.line_total).sum()
    }

    /// Whether the declared total matches the sum of line totals within
    /// `tolerance`.
    pub fn totals_match(&self, tolerance: Decimal) -> bool {
        let diff = self.declared_total - self.calculated_total();
        diff.abs() <= tolerance
    }

    pub fn is_error(&self) -> bool {
        self.confidence.is_error()
    }

    /// Build the record for an unrecoverable extraction failure: zero
    /// line items, zero total, `Error` confidence, and a descriptive
    /// note. The unit is still recorded downstream, never dropped.
    pub fn error_record(
        source_identifier: impl Into<String>,
        note: impl Into<String>,
        processing_secs: f64,
    ) -> Self {
        Self {
            supplier: "ERROR_SUPPLIER".to_string(),
            date: "ERROR_DATE".to_string(),
            invoice_number: "ERROR_INVOICE".to_string(),
            line_items: Vec::new(),
            declared_total: Decimal::ZERO,
            confidence: ExtractionConfidence::Error,
            notes: format!("ERROR: {}", note.into()),
            source_identifier: source_identifier.into(),
            processing_secs,
        }
    }
}

/// Structured payload returned by the remote structuring collaborator.
///
/// This is the wire shape the model is asked to produce; it is converted
/// into an [`ExtractedInvoice`] by the engine, which owns validation and
/// confidence assignment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawInvoicePayload {
    pub supplier: String,
    pub invoice_date: String,
    pub invoice_number: String,
    pub line_items: Vec<RawLineItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawLineItem {
    pub line_number: u32,
    pub reference_code: String,
    pub description: String,
    pub quantity: Decimal,
    pub unit: String,
    pub tariff_code: String,
    pub unit_value: Decimal,
    pub line_total: Decimal,
}
