use std::path::Path;
use std::time::{Duration, Instant};

use rust_decimal::Decimal;

use crate::error::ExtractError;
use crate::fallback::{FieldMatches, extract_metadata, scan_heuristic_items, score_confidence};
use crate::models::{ExtractedInvoice, ExtractionConfidence, LineItem, RawLineItem};
use crate::retry::{RetryPolicy, run_with_retry, run_with_timeout};
use crate::traits::{DocumentParser, Structurer};

/// How negative numeric values from the structuring collaborator are
/// handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationPolicy {
    /// Clamp negatives to zero at construction (the historical behavior).
    ClampNegative,
    /// Drop line items carrying negative values and cap the record's
    /// confidence at Medium.
    RejectNegative,
}

/// Tunables for the per-document extraction state machine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Language hint passed to the parsing collaborator.
    pub language: String,
    /// Characters of parsed text sent to the structuring collaborator;
    /// the leading portion is kept since headers and early line items
    /// carry the most signal.
    pub prompt_char_budget: usize,
    /// Parsed documents below this length are a hard failure.
    pub min_content_chars: usize,
    pub parse_timeout: Duration,
    pub structure_timeout: Duration,
    /// Upper bound on items synthesized by the line-scan heuristic.
    pub heuristic_item_cap: usize,
    pub validation_policy: ValidationPolicy,
    pub retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            language: "es".to_string(),
            prompt_char_budget: 12_000,
            min_content_chars: 10,
            parse_timeout: Duration::from_secs(120),
            structure_timeout: Duration::from_secs(45),
            heuristic_item_cap: 10,
            validation_policy: ValidationPolicy::ClampNegative,
            retry: RetryPolicy::default(),
        }
    }
}

impl EngineConfig {
    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    pub fn with_prompt_char_budget(mut self, budget: usize) -> Self {
        self.prompt_char_budget = budget;
        self
    }

    pub fn with_timeouts(mut self, parse: Duration, structure: Duration) -> Self {
        self.parse_timeout = parse;
        self.structure_timeout = structure;
        self
    }

    pub fn with_validation_policy(mut self, policy: ValidationPolicy) -> Self {
        self.validation_policy = policy;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Converts a raw document into a confidence-scored structured record.
///
/// State machine per document: parse, then structure via the remote
/// model, falling back to pattern extraction when the primary strategy
/// fails or yields no items. Never more than one fallback tier.
///
/// Generic over the collaborators via traits, enabling dependency
/// injection and testability without real parse or model calls.
pub struct ExtractionEngine<P, S>
where
    P: DocumentParser,
    S: Structurer,
{
    parser: P,
    structurer: S,
    config: EngineConfig,
}

impl<P, S> ExtractionEngine<P, S>
where
    P: DocumentParser,
    S: Structurer,
{
    pub fn new(parser: P, structurer: S, config: EngineConfig) -> Self {
        Self {
            parser,
            structurer,
            config,
        }
    }

    /// Extract a structured record from the document at `path`.
    ///
    /// Never raises for a bad document: any unrecoverable failure yields
    /// an Error-confidence record with a descriptive note, so one
    /// unreadable scan cannot abort a batch. Whether the fallback tier
    /// ran is reported alongside the record.
    pub async fn extract(&self, path: &Path, display_name: &str) -> ExtractionOutcome {
        let started = Instant::now();

        match self.run_pipeline(path, display_name).await {
            Ok((mut invoice, used_fallback)) => {
                invoice.processing_secs = started.elapsed().as_secs_f64();
                tracing::info!(
                    document = %display_name,
                    items = invoice.total_line_items(),
                    confidence = invoice.confidence.as_str(),
                    secs = format!("{:.1}", invoice.processing_secs),
                    "extraction complete"
                );
                ExtractionOutcome {
                    invoice,
                    used_fallback,
                }
            }
            Err(e) => {
                let secs = started.elapsed().as_secs_f64();
                tracing::error!(document = %display_name, error = %e, "extraction failed");
                ExtractionOutcome {
                    invoice: ExtractedInvoice::error_record(display_name, e.to_string(), secs),
                    used_fallback: false,
                }
            }
        }
    }

    async fn run_pipeline(
        &self,
        path: &Path,
        display_name: &str,
    ) -> Result<(ExtractedInvoice, bool), ExtractError> {
        // 1. Parse into pages, with retry and a per-call timeout.
        let pages = run_with_retry(&self.config.retry, || {
            run_with_timeout(
                self.config.parse_timeout,
                self.parser.parse(path, &self.config.language),
            )
        })
        .await?;

        let text_len: usize = pages.iter().map(|p| p.trim().len()).sum();
        if text_len < self.config.min_content_chars {
            return Err(ExtractError::EmptyDocument);
        }
        let content = join_pages(&pages);
        tracing::debug!(document = %display_name, pages = pages.len(), chars = content.len(), "parsed");

        // 2. Primary structuring; any failure or empty result engages
        //    the pattern fallback.
        match self.structure_primary(&content, display_name).await {
            Ok(invoice) => Ok((invoice, false)),
            Err(e) => {
                tracing::warn!(
                    document = %display_name,
                    error = %e,
                    "primary structuring failed, engaging fallback"
                );
                Ok((self.structure_fallback(&content, display_name), true))
            }
        }
    }

    async fn structure_primary(
        &self,
        content: &str,
        display_name: &str,
    ) -> Result<ExtractedInvoice, ExtractError> {
        let prompt = build_prompt(content, self.config.prompt_char_budget);

        let payload = run_with_retry(&self.config.retry, || {
            run_with_timeout(
                self.config.structure_timeout,
                self.structurer.structure(&prompt),
            )
        })
        .await?;

        let (items, dropped) = self.convert_payload_items(payload.line_items);
        if items.is_empty() {
            // A successful call with zero items is still a failure.
            return Err(ExtractError::Generic(
                "structuring returned no line items".into(),
            ));
        }

        let confidence = if dropped > 0 {
            ExtractionConfidence::Medium
        } else {
            ExtractionConfidence::High
        };
        let declared_total: Decimal = items.iter().map(|i| i.line_total).sum();

        Ok(ExtractedInvoice {
            supplier: payload.supplier,
            date: payload.invoice_date,
            invoice_number: payload.invoice_number,
            line_items: items,
            declared_total,
            confidence,
            notes: if dropped > 0 {
                format!("{dropped} line item(s) rejected for negative values")
            } else {
                String::new()
            },
            source_identifier: display_name.to_string(),
            processing_secs: 0.0,
        })
    }

    /// Deterministic pattern tier: labeled field lists zipped into
    /// items, or the line-scan heuristic when no field matched at all.
    fn structure_fallback(&self, content: &str, display_name: &str) -> ExtractedInvoice {
        let matches = FieldMatches::scan(content);
        let items = if matches.is_empty() {
            scan_heuristic_items(content, self.config.heuristic_item_cap)
        } else {
            matches.into_line_items()
        };

        let confidence = score_confidence(&items);
        let meta = extract_metadata(content);
        let declared_total: Decimal = items.iter().map(|i| i.line_total).sum();
        let notes = if items.is_empty() {
            "REGEX_EXTRACTION: no line items matched".to_string()
        } else {
            "REGEX_EXTRACTION".to_string()
        };

        ExtractedInvoice {
            supplier: meta.supplier,
            date: meta.date,
            invoice_number: meta.invoice_number,
            line_items: items,
            declared_total,
            confidence,
            notes,
            source_identifier: display_name.to_string(),
            processing_secs: 0.0,
        }
    }

    /// Apply the validation policy to raw payload items. Returns the
    /// converted items and how many were rejected.
    fn convert_payload_items(&self, raw: Vec<RawLineItem>) -> (Vec<LineItem>, usize) {
        let mut items = Vec::with_capacity(raw.len());
        let mut dropped = 0;
        for entry in raw {
            let negative = entry.quantity < Decimal::ZERO
                || entry.unit_value < Decimal::ZERO
                || entry.line_total < Decimal::ZERO;
            if negative && self.config.validation_policy == ValidationPolicy::RejectNegative {
                dropped += 1;
                continue;
            }
            items.push(LineItem::new(
                entry.line_number,
                entry.reference_code,
                entry.description,
                entry.quantity,
                entry.unit,
                entry.tariff_code,
                entry.unit_value,
                entry.line_total,
            ));
        }
        (items, dropped)
    }
}

/// Result of one engine run: the record plus whether the fallback tier
/// produced it.
#[derive(Debug, Clone)]
pub struct ExtractionOutcome {
    pub invoice: ExtractedInvoice,
    pub used_fallback: bool,
}

/// Join parsed pages with visible markers so the structuring model sees
/// document boundaries.
fn join_pages(pages: &[String]) -> String {
    pages
        .iter()
        .enumerate()
        .map(|(i, page)| format!("=== PAGE {} ===\n{}", i + 1, page))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Build the structuring prompt, keeping at most `budget` characters of
/// the leading content.
fn build_prompt(content: &str, budget: usize) -> String {
    let kept = match content.char_indices().nth(budget) {
        Some((idx, _)) => &content[..idx],
        None => content,
    };
    format!(
        "Extract complete data from this commercial invoice.\n\n\
         Extract ALL line items with these field mappings:\n\
         - Numero de identificacion -> reference_code\n\
         - Descripcion de la mercancia -> description\n\
         - Cantidad aduanera -> quantity\n\
         - Unidad aduana -> unit\n\
         - Fraccion arancelaria -> tariff_code\n\
         - Valor unitario aduana -> unit_value\n\
         - Valor dolares -> line_total\n\n\
         Also extract the supplier name, invoice number, and invoice date.\n\n\
         Invoice content:\n{kept}"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RawInvoicePayload;
    use crate::testutil::*;
    use rust_decimal::Decimal;
    use std::str::FromStr;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn quick_config() -> EngineConfig {
        EngineConfig::default()
            .with_timeouts(Duration::from_millis(200), Duration::from_millis(200))
            .with_retry(RetryPolicy::new(3, Duration::from_millis(5)))
    }

    fn two_item_payload() -> RawInvoicePayload {
        make_test_payload(&[("A1", "10.00"), ("A2", "20.00")])
    }

    const LABELED_CONTENT: &str = "\
VENDEDOR: ACME Industrial SA
FACTURA: F-2024-001

Numero de identificacion: A1
Cantidad aduanera: 1
Valor dolares: 10.00

Numero de identificacion: A2
Cantidad aduanera: 2
Valor dolares: 20.00
";

    #[tokio::test]
    async fn primary_path_extracts_two_items() {
        let engine = ExtractionEngine::new(
            MockParser::new(LABELED_CONTENT),
            MockStructurer::new(two_item_payload()),
            quick_config(),
        );

        let outcome = engine
            .extract(Path::new("/tmp/inv.pdf"), "inv.pdf")
            .await;

        assert!(!outcome.used_fallback);
        let invoice = outcome.invoice;
        assert_eq!(invoice.total_line_items(), 2);
        assert_eq!(invoice.calculated_total(), dec("30.00"));
        assert_eq!(invoice.confidence, ExtractionConfidence::High);
        assert_eq!(invoice.source_identifier, "inv.pdf");
        assert!(invoice.processing_secs >= 0.0);
    }

    #[tokio::test]
    async fn primary_with_zero_items_falls_back() {
        let empty_payload = RawInvoicePayload {
            supplier: "ACME".into(),
            invoice_date: "2024-01-15".into(),
            invoice_number: "F-1".into(),
            line_items: vec![],
        };
        let engine = ExtractionEngine::new(
            MockParser::new(LABELED_CONTENT),
            MockStructurer::new(empty_payload),
            quick_config(),
        );

        let outcome = engine
            .extract(Path::new("/tmp/inv.pdf"), "inv.pdf")
            .await;

        assert!(outcome.used_fallback);
        let invoice = outcome.invoice;
        assert_eq!(invoice.total_line_items(), 2);
        assert_eq!(invoice.notes, "REGEX_EXTRACTION");
        assert_eq!(invoice.calculated_total(), dec("30.00"));
    }

    #[tokio::test]
    async fn primary_error_falls_back_to_patterns() {
        let engine = ExtractionEngine::new(
            MockParser::new(LABELED_CONTENT),
            MockStructurer::with_error(ExtractError::Remote {
                message: "model overloaded".into(),
                status_code: 500,
                retryable: false,
            }),
            quick_config(),
        );

        let outcome = engine
            .extract(Path::new("/tmp/inv.pdf"), "inv.pdf")
            .await;

        assert!(outcome.used_fallback);
        let invoice = outcome.invoice;
        assert_eq!(invoice.total_line_items(), 2);
        assert_eq!(invoice.supplier, "ACME Industrial SA");
        // Real references plus positive quantities and totals.
        assert_eq!(invoice.confidence, ExtractionConfidence::High);
    }

    #[tokio::test]
    async fn parse_failure_yields_error_record() {
        let engine = ExtractionEngine::new(
            MockParser::with_error(ExtractError::ParseFailure("unreadable scan".into())),
            MockStructurer::new(two_item_payload()),
            quick_config(),
        );

        let outcome = engine
            .extract(Path::new("/tmp/bad.pdf"), "bad.pdf")
            .await;

        let invoice = outcome.invoice;
        assert!(invoice.is_error());
        assert_eq!(invoice.total_line_items(), 0);
        assert_eq!(invoice.declared_total, Decimal::ZERO);
        assert!(invoice.notes.contains("unreadable scan"));
    }

    #[tokio::test]
    async fn near_empty_content_is_a_hard_failure() {
        let engine = ExtractionEngine::new(
            MockParser::new("   x   "),
            MockStructurer::new(two_item_payload()),
            quick_config(),
        );

        let outcome = engine
            .extract(Path::new("/tmp/empty.pdf"), "empty.pdf")
            .await;

        assert!(outcome.invoice.is_error());
        assert!(outcome.invoice.notes.contains("no usable text"));
        // No structuring call was made without content.
        assert_eq!(engine.structurer.calls(), 0);
    }

    #[tokio::test]
    async fn transient_parse_error_is_retried() {
        let parser = MockParser::with_responses(vec![
            Err(ExtractError::RateLimited),
            Ok(vec![LABELED_CONTENT.to_string()]),
        ]);
        let engine = ExtractionEngine::new(
            parser.clone(),
            MockStructurer::new(two_item_payload()),
            quick_config(),
        );

        let outcome = engine
            .extract(Path::new("/tmp/inv.pdf"), "inv.pdf")
            .await;

        assert!(!outcome.invoice.is_error());
        assert_eq!(parser.calls(), 2);
    }

    #[tokio::test]
    async fn stuck_parse_times_out_and_records_error() {
        let parser = MockParser::new(LABELED_CONTENT).with_delay(Duration::from_secs(5));
        let engine = ExtractionEngine::new(
            parser,
            MockStructurer::new(two_item_payload()),
            EngineConfig::default()
                .with_timeouts(Duration::from_millis(30), Duration::from_millis(30))
                .with_retry(RetryPolicy::new(1, Duration::from_millis(1))),
        );

        let outcome = engine
            .extract(Path::new("/tmp/slow.pdf"), "slow.pdf")
            .await;

        assert!(outcome.invoice.is_error());
        assert!(outcome.invoice.notes.contains("timed out"));
    }

    #[tokio::test]
    async fn prompt_keeps_leading_portion_within_budget() {
        let filler = "x".repeat(20_000);
        let content = format!("HEADER-FIRST\n{filler}\nTAIL-SENTINEL");
        let structurer = MockStructurer::new(two_item_payload());
        let engine = ExtractionEngine::new(
            MockParser::new(&content),
            structurer.clone(),
            quick_config().with_prompt_char_budget(500),
        );

        engine.extract(Path::new("/tmp/long.pdf"), "long.pdf").await;

        let prompts = structurer.prompts();
        assert_eq!(prompts.len(), 1);
        assert!(prompts[0].contains("HEADER-FIRST"));
        assert!(!prompts[0].contains("TAIL-SENTINEL"));
        assert!(prompts[0].chars().count() < 1_500);
    }

    #[tokio::test]
    async fn reject_negative_policy_drops_items_and_caps_confidence() {
        let payload = RawInvoicePayload {
            supplier: "ACME".into(),
            invoice_date: "2024-01-15".into(),
            invoice_number: "F-1".into(),
            line_items: vec![
                make_test_raw_item(1, "A1", "10.00"),
                RawLineItem {
                    line_number: 2,
                    reference_code: "A2".into(),
                    description: "refund".into(),
                    quantity: dec("1"),
                    unit: "001".into(),
                    tariff_code: "00000000".into(),
                    unit_value: dec("-5.00"),
                    line_total: dec("-5.00"),
                },
            ],
        };
        let engine = ExtractionEngine::new(
            MockParser::new(LABELED_CONTENT),
            MockStructurer::new(payload),
            quick_config().with_validation_policy(ValidationPolicy::RejectNegative),
        );

        let outcome = engine
            .extract(Path::new("/tmp/inv.pdf"), "inv.pdf")
            .await;

        let invoice = outcome.invoice;
        assert_eq!(invoice.total_line_items(), 1);
        assert_eq!(invoice.confidence, ExtractionConfidence::Medium);
        assert!(invoice.notes.contains("rejected"));
    }

    #[tokio::test]
    async fn clamp_policy_keeps_items_with_zeroed_values() {
        let payload = RawInvoicePayload {
            supplier: "ACME".into(),
            invoice_date: "2024-01-15".into(),
            invoice_number: "F-1".into(),
            line_items: vec![RawLineItem {
                line_number: 1,
                reference_code: "A1".into(),
                description: "refund".into(),
                quantity: dec("-1"),
                unit: "001".into(),
                tariff_code: "00000000".into(),
                unit_value: dec("-5.00"),
                line_total: dec("-5.00"),
            }],
        };
        let engine = ExtractionEngine::new(
            MockParser::new(LABELED_CONTENT),
            MockStructurer::new(payload),
            quick_config(),
        );

        let outcome = engine
            .extract(Path::new("/tmp/inv.pdf"), "inv.pdf")
            .await;

        let invoice = outcome.invoice;
        assert_eq!(invoice.total_line_items(), 1);
        assert_eq!(invoice.line_items[0].line_total, Decimal::ZERO);
        assert_eq!(invoice.confidence, ExtractionConfidence::High);
    }

    #[tokio::test]
    async fn fallback_without_patterns_uses_heuristic_scan() {
        let content = "\
manifest of goods
PART-4421 assorted fasteners
qty 12 total 42.00
";
        let engine = ExtractionEngine::new(
            MockParser::new(content),
            MockStructurer::with_error(ExtractError::Remote {
                message: "schema validation failed".into(),
                status_code: 400,
                retryable: false,
            }),
            quick_config(),
        );

        let outcome = engine
            .extract(Path::new("/tmp/odd.pdf"), "odd.pdf")
            .await;

        assert!(outcome.used_fallback);
        assert!(!outcome.invoice.line_items.is_empty());
        assert!(
            outcome
                .invoice
                .line_items
                .iter()
                .any(|i| i.reference_code == "PART-4421")
        );
    }

    #[test]
    fn page_markers_number_pages() {
        let joined = join_pages(&["first".to_string(), "second".to_string()]);
        assert!(joined.contains("=== PAGE 1 ===\nfirst"));
        assert!(joined.contains("=== PAGE 2 ===\nsecond"));
    }
}
