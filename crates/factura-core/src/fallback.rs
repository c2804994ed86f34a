//! Deterministic pattern-based extraction, the second tier behind the
//! remote structuring strategy.
//!
//! Each semantic field has one labeled pattern matched globally over the
//! parsed text, producing an ordered match list per field. Line items are
//! built positionally from those lists; the padding rule lives in
//! [`FieldMatches::into_line_items`]. Inputs without the labeled tabular
//! layout fall through to a line-scan heuristic.

use lazy_static::lazy_static;
use regex::Regex;
use rust_decimal::Decimal;
use std::str::FromStr;

use crate::models::{ExtractionConfidence, LineItem};

/// Default unit code assigned when no unit was matched for a position.
pub const DEFAULT_UNIT: &str = "001";
/// Default tariff code assigned when no tariff was matched for a position.
pub const DEFAULT_TARIFF: &str = "00000000";

lazy_static! {
    // Labeled line-item fields as printed on the customs invoice layout.
    static ref REFERENCE_CODE: Regex =
        Regex::new(r"(?i)Numero de identificacion:\s*([A-Z0-9\-\._]+)").unwrap();
    static ref DESCRIPTION: Regex =
        Regex::new(r"(?i)Descripcion de la mercancia:\s*([^\n|]+)").unwrap();
    static ref QUANTITY: Regex = Regex::new(r"(?i)Cantidad aduanera:\s*([\d.,]+)").unwrap();
    static ref UNIT: Regex = Regex::new(r"(?i)Unidad aduana:\s*(\d+)").unwrap();
    static ref TARIFF_CODE: Regex =
        Regex::new(r"(?i)Fraccion arancelaria:\s*(\d{8,10})").unwrap();
    static ref UNIT_VALUE: Regex =
        Regex::new(r"(?i)Valor unitario aduana:\s*([\d.,]+)").unwrap();
    static ref LINE_TOTAL: Regex = Regex::new(r"(?i)Valor d[oó]lares:\s*([\d.,]+)").unwrap();

    // Invoice header fields, tried in order.
    static ref SUPPLIER_PATTERNS: Vec<Regex> = vec![
        Regex::new(r"(?i)(?:VENDEDOR|EXPORTADOR|SUPPLIER)[:|\s]+([^\n\r]+)").unwrap(),
        Regex::new(r"(?i)RAZON SOCIAL[:|\s]+([^\n\r]+)").unwrap(),
        Regex::new(r"(?i)NOMBRE[:|\s]+([^\n\r]+)").unwrap(),
    ];
    static ref INVOICE_NUMBER_PATTERNS: Vec<Regex> = vec![
        Regex::new(r"(?i)(?:FACTURA|INVOICE|NO\.|NUM)[:|\s]*([A-Z0-9\-]+)").unwrap(),
        Regex::new(r"(?i)NUMERO DE FACTURA[:|\s]*([A-Z0-9\-]+)").unwrap(),
    ];
    static ref INVOICE_DATE_PATTERNS: Vec<Regex> = vec![
        Regex::new(r"(?i)(?:FECHA|DATE)[:|\s]*(\d{1,2}[/\-.]\d{1,2}[/\-.]\d{2,4})").unwrap(),
        Regex::new(r"(\d{1,2}[/\-.]\d{1,2}[/\-.]\d{2,4})").unwrap(),
    ];

    // Last-resort heuristic tokens.
    static ref IDENTIFIER_TOKEN: Regex = Regex::new(r"([A-Z0-9\-\.]{4,20})").unwrap();
    static ref NUMERIC_TOKEN: Regex = Regex::new(r"([\d,]+\.?\d*)").unwrap();
}

/// Synthetic reference code for a padded position (0-based).
pub fn synthetic_reference(position: usize) -> String {
    format!("SKU_EXTRACTED_{}", position + 1)
}

fn synthetic_description(position: usize) -> String {
    format!("PRODUCT_EXTRACTED_{}", position + 1)
}

/// Ordered per-field match lists pulled from the parsed text.
///
/// The lists are matched independently and aligned positionally; they
/// are not guaranteed equal length.
#[derive(Debug, Clone, Default)]
pub struct FieldMatches {
    pub reference_codes: Vec<String>,
    pub descriptions: Vec<String>,
    pub quantities: Vec<Decimal>,
    pub units: Vec<String>,
    pub tariff_codes: Vec<String>,
    pub unit_values: Vec<Decimal>,
    pub line_totals: Vec<Decimal>,
}

impl FieldMatches {
    /// Match every field pattern globally over `content`.
    pub fn scan(content: &str) -> Self {
        Self {
            reference_codes: capture_strings(&REFERENCE_CODE, content),
            descriptions: capture_strings(&DESCRIPTION, content),
            quantities: capture_amounts(&QUANTITY, content),
            units: capture_strings(&UNIT, content),
            tariff_codes: capture_strings(&TARIFF_CODE, content),
            unit_values: capture_amounts(&UNIT_VALUE, content),
            line_totals: capture_amounts(&LINE_TOTAL, content),
        }
    }

    /// The line count implied by these matches: the maximum length among
    /// all field lists.
    pub fn line_count(&self) -> usize {
        [
            self.reference_codes.len(),
            self.descriptions.len(),
            self.quantities.len(),
            self.units.len(),
            self.tariff_codes.len(),
            self.unit_values.len(),
            self.line_totals.len(),
        ]
        .into_iter()
        .max()
        .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.line_count() == 0
    }

    /// Zip the field lists into line items.
    ///
    /// Padding rule: any field whose list is shorter than
    /// [`FieldMatches::line_count`] is padded with a synthetic
    /// placeholder for the missing positions: a generated reference
    /// code and description, quantity 1, default unit and tariff codes,
    /// and zero values.
    pub fn into_line_items(self) -> Vec<LineItem> {
        let count = self.line_count();
        let mut items = Vec::with_capacity(count);
        for i in 0..count {
            items.push(LineItem::new(
                (i + 1) as u32,
                self.reference_codes
                    .get(i)
                    .cloned()
                    .unwrap_or_else(|| synthetic_reference(i)),
                self.descriptions
                    .get(i)
                    .cloned()
                    .unwrap_or_else(|| synthetic_description(i)),
                self.quantities.get(i).copied().unwrap_or(Decimal::ONE),
                self.units
                    .get(i)
                    .cloned()
                    .unwrap_or_else(|| DEFAULT_UNIT.to_string()),
                self.tariff_codes
                    .get(i)
                    .cloned()
                    .unwrap_or_else(|| DEFAULT_TARIFF.to_string()),
                self.unit_values.get(i).copied().unwrap_or(Decimal::ZERO),
                self.line_totals.get(i).copied().unwrap_or(Decimal::ZERO),
            ));
        }
        items
    }
}

/// Invoice header fields recovered by pattern, with explicit NOT_FOUND
/// defaults so a missing header never aborts the fallback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvoiceMetadata {
    pub supplier: String,
    pub invoice_number: String,
    pub date: String,
}

pub fn extract_metadata(content: &str) -> InvoiceMetadata {
    InvoiceMetadata {
        supplier: first_capture(&SUPPLIER_PATTERNS, content, "SUPPLIER_NOT_FOUND"),
        invoice_number: first_capture(&INVOICE_NUMBER_PATTERNS, content, "INV_NOT_FOUND"),
        date: first_capture(&INVOICE_DATE_PATTERNS, content, "DATE_NOT_FOUND"),
    }
}

/// Last-resort scan for inputs without the labeled tabular layout.
///
/// Looks for identifier-like tokens with plausible monetary magnitudes
/// within two lines either side, synthesizing at most `cap` items to
/// bound false positives.
pub fn scan_heuristic_items(content: &str, cap: usize) -> Vec<LineItem> {
    let min_plausible = Decimal::new(1, 2);
    let max_plausible = Decimal::from(1_000_000);

    let lines: Vec<&str> = content.lines().collect();
    let mut items: Vec<LineItem> = Vec::new();

    for (i, line) in lines.iter().enumerate() {
        let Some(reference) = IDENTIFIER_TOKEN
            .captures(line)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
        else {
            continue;
        };

        let window = lines[i.saturating_sub(2)..(i + 3).min(lines.len())].join(" ");
        let values: Vec<Decimal> = NUMERIC_TOKEN
            .find_iter(&window)
            .filter_map(|m| parse_amount(m.as_str()))
            .filter(|v| *v >= min_plausible && *v <= max_plausible)
            .collect();
        if values.is_empty() {
            continue;
        }

        let quantity = values[0];
        let line_total = if values.len() > 1 {
            values[values.len() - 1]
        } else {
            values[0]
        };
        let unit_value = if quantity > Decimal::ZERO {
            line_total / quantity
        } else {
            line_total
        };

        let position = items.len();
        items.push(LineItem::new(
            (position + 1) as u32,
            reference,
            format!("EXTRACTED_PRODUCT_{}", position + 1),
            quantity,
            DEFAULT_UNIT,
            DEFAULT_TARIFF,
            unit_value,
            line_total,
        ));
        if items.len() >= cap {
            break;
        }
    }
    items
}

/// Count the quality signals on a fallback result: (1) not every
/// reference code is the synthetic placeholder for its position,
/// (2) at least one line total is positive, (3) at least one quantity
/// is positive.
pub fn quality_signal_count(items: &[LineItem]) -> usize {
    let has_real_references = items
        .iter()
        .enumerate()
        .any(|(i, item)| item.reference_code != synthetic_reference(i));
    let has_positive_totals = items.iter().any(|item| item.line_total > Decimal::ZERO);
    let has_positive_quantities = items.iter().any(|item| item.quantity > Decimal::ZERO);

    [has_real_references, has_positive_totals, has_positive_quantities]
        .into_iter()
        .filter(|signal| *signal)
        .count()
}

/// Confidence for a fallback result. Empty input is always `Error`.
pub fn score_confidence(items: &[LineItem]) -> ExtractionConfidence {
    if items.is_empty() {
        return ExtractionConfidence::Error;
    }
    ExtractionConfidence::from_signal_count(quality_signal_count(items))
}

/// First capture of the first pattern that matches, or `default`.
fn first_capture(patterns: &[Regex], content: &str, default: &str) -> String {
    patterns
        .iter()
        .find_map(|p| p.captures(content))
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .unwrap_or_else(|| default.to_string())
}

fn capture_strings(pattern: &Regex, content: &str) -> Vec<String> {
    pattern
        .captures_iter(content)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .collect()
}

fn capture_amounts(pattern: &Regex, content: &str) -> Vec<Decimal> {
    pattern
        .captures_iter(content)
        .filter_map(|c| c.get(1))
        .filter_map(|m| parse_amount(m.as_str()))
        .collect()
}

/// Parse an amount that may use either comma or dot as the decimal
/// separator, with optional thousands separators.
pub fn parse_amount(raw: &str) -> Option<Decimal> {
    let raw = raw.trim().trim_matches(|c| c == '.' || c == ',');
    if raw.is_empty() {
        return None;
    }
    let normalized = match (raw.rfind(','), raw.rfind('.')) {
        // "1.234,56": dots group thousands, comma is the decimal mark.
        (Some(comma), Some(dot)) if comma > dot => raw.replace('.', "").replace(',', "."),
        // "1,234.56": commas group thousands.
        (Some(_), Some(_)) => raw.replace(',', ""),
        (Some(comma), None) => {
            let decimals = raw.len() - comma - 1;
            if raw.matches(',').count() == 1 && decimals <= 2 {
                // "1234,56": comma is the decimal mark.
                raw.replace(',', ".")
            } else {
                // "1,234" or "1,234,567": commas group thousands.
                raw.replace(',', "")
            }
        }
        _ => raw.to_string(),
    };
    Decimal::from_str(&normalized).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    const LABELED_SAMPLE: &str = "\
FACTURA: F-2024-001
VENDEDOR: ACME Industrial SA
FECHA: 15/01/2024

Numero de identificacion: A1
Descripcion de la mercancia: Tornillos de acero
Cantidad aduanera: 100
Unidad aduana: 001
Fraccion arancelaria: 73181502
Valor unitario aduana: 0.10
Valor dolares: 10.00

Numero de identificacion: A2
Descripcion de la mercancia: Tuercas de acero
Cantidad aduanera: 50
Unidad aduana: 001
Fraccion arancelaria: 73181601
Valor unitario aduana: 0.40
Valor dolares: 20.00
";

    #[test]
    fn test_scan_labeled_layout() {
        let matches = FieldMatches::scan(LABELED_SAMPLE);
        assert_eq!(matches.reference_codes, vec!["A1", "A2"]);
        assert_eq!(matches.quantities, vec![dec("100"), dec("50")]);
        assert_eq!(matches.line_totals, vec![dec("10.00"), dec("20.00")]);
        assert_eq!(matches.line_count(), 2);

        let items = matches.into_line_items();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].reference_code, "A1");
        assert_eq!(items[0].description, "Tornillos de acero");
        assert_eq!(items[1].line_total, dec("20.00"));
        let total: Decimal = items.iter().map(|i| i.line_total).sum();
        assert_eq!(total, dec("30.00"));
    }

    #[test]
    fn test_zip_padding_takes_longest_list() {
        // Field lists of lengths [3,1,2,0,3,3,3] must produce 3 items,
        // padded wherever the source list was shorter.
        let matches = FieldMatches {
            reference_codes: vec!["R1".into(), "R2".into(), "R3".into()],
            descriptions: vec!["only one".into()],
            quantities: vec![dec("5"), dec("6")],
            units: vec![],
            tariff_codes: vec!["11111111".into(), "22222222".into(), "33333333".into()],
            unit_values: vec![dec("1"), dec("2"), dec("3")],
            line_totals: vec![dec("5"), dec("12"), dec("21")],
        };
        assert_eq!(matches.line_count(), 3);

        let items = matches.into_line_items();
        assert_eq!(items.len(), 3);

        // Unpadded positions keep their matched values.
        assert_eq!(items[0].description, "only one");
        assert_eq!(items[1].quantity, dec("6"));
        // Padded positions carry the synthetic placeholders.
        assert_eq!(items[1].description, "PRODUCT_EXTRACTED_2");
        assert_eq!(items[2].description, "PRODUCT_EXTRACTED_3");
        assert_eq!(items[2].quantity, Decimal::ONE);
        for item in &items {
            assert_eq!(item.unit, DEFAULT_UNIT);
        }
        // No reference was padded, so none is synthetic.
        assert_eq!(quality_signal_count(&items), 3);
    }

    #[test]
    fn test_zip_padding_synthesizes_references() {
        let matches = FieldMatches {
            line_totals: vec![dec("10"), dec("20")],
            ..Default::default()
        };
        let items = matches.into_line_items();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].reference_code, "SKU_EXTRACTED_1");
        assert_eq!(items[1].reference_code, "SKU_EXTRACTED_2");
    }

    #[test]
    fn test_empty_content_has_no_matches() {
        let matches = FieldMatches::scan("no labeled fields at all");
        assert!(matches.is_empty());
        assert!(matches.into_line_items().is_empty());
    }

    #[test]
    fn test_confidence_tracks_signal_count() {
        // k = 0: synthetic refs, zero totals, zero quantities.
        let k0 = vec![LineItem::new(
            1,
            synthetic_reference(0),
            "x",
            Decimal::ZERO,
            DEFAULT_UNIT,
            DEFAULT_TARIFF,
            Decimal::ZERO,
            Decimal::ZERO,
        )];
        assert_eq!(score_confidence(&k0), ExtractionConfidence::Error);

        // k = 1: a positive quantity.
        let k1 = vec![LineItem::new(
            1,
            synthetic_reference(0),
            "x",
            Decimal::ONE,
            DEFAULT_UNIT,
            DEFAULT_TARIFF,
            Decimal::ZERO,
            Decimal::ZERO,
        )];
        assert_eq!(score_confidence(&k1), ExtractionConfidence::Low);

        // k = 2: positive quantity and line total.
        let k2 = vec![LineItem::new(
            1,
            synthetic_reference(0),
            "x",
            Decimal::ONE,
            DEFAULT_UNIT,
            DEFAULT_TARIFF,
            dec("2"),
            dec("2"),
        )];
        assert_eq!(score_confidence(&k2), ExtractionConfidence::Medium);

        // k = 3: a real reference code as well.
        let k3 = vec![LineItem::new(
            1,
            "REAL-REF-1",
            "x",
            Decimal::ONE,
            DEFAULT_UNIT,
            DEFAULT_TARIFF,
            dec("2"),
            dec("2"),
        )];
        assert_eq!(score_confidence(&k3), ExtractionConfidence::High);
    }

    #[test]
    fn test_confidence_of_empty_is_error() {
        assert_eq!(score_confidence(&[]), ExtractionConfidence::Error);
    }

    #[test]
    fn test_metadata_extraction() {
        let meta = extract_metadata(LABELED_SAMPLE);
        assert_eq!(meta.supplier, "ACME Industrial SA");
        assert_eq!(meta.invoice_number, "F-2024-001");
        assert_eq!(meta.date, "15/01/2024");
    }

    #[test]
    fn test_metadata_defaults_when_absent() {
        let meta = extract_metadata("nothing useful here");
        assert_eq!(meta.supplier, "SUPPLIER_NOT_FOUND");
        assert_eq!(meta.invoice_number, "INV_NOT_FOUND");
        assert_eq!(meta.date, "DATE_NOT_FOUND");
    }

    #[test]
    fn test_heuristic_scan_finds_identifier_lines() {
        let content = "\
shipment manifest
PART-4421 assorted fasteners
qty 12 @ 3.50 total 42.00
PART-9913 gasket kit
qty 4 @ 25.00 total 100.00
";
        let items = scan_heuristic_items(content, 10);
        assert!(!items.is_empty());
        assert!(items.iter().any(|i| i.reference_code == "PART-4421"));
        assert!(items.iter().all(|i| i.line_total >= Decimal::new(1, 2)));
    }

    #[test]
    fn test_heuristic_scan_respects_cap() {
        let mut content = String::new();
        for n in 0..30 {
            content.push_str(&format!("ITEM-{n:04} value 10.00\n"));
        }
        let items = scan_heuristic_items(&content, 10);
        assert_eq!(items.len(), 10);
    }

    #[test]
    fn test_heuristic_scan_ignores_implausible_magnitudes() {
        let content = "REFX-AB total 5000000.00";
        let items = scan_heuristic_items(content, 10);
        // 5M exceeds the plausible range; with no other value in the
        // window, the line is skipped entirely.
        assert!(items.is_empty());
    }

    #[test]
    fn test_parse_amount_formats() {
        assert_eq!(parse_amount("10.00"), Some(dec("10.00")));
        assert_eq!(parse_amount("1234,56"), Some(dec("1234.56")));
        assert_eq!(parse_amount("1.234,56"), Some(dec("1234.56")));
        assert_eq!(parse_amount("1,234.56"), Some(dec("1234.56")));
        assert_eq!(parse_amount("1,234"), Some(dec("1234")));
        assert_eq!(parse_amount("12,5"), Some(dec("12.5")));
        assert_eq!(parse_amount(""), None);
        assert_eq!(parse_amount("soup"), None);
    }
}
