//! Record shapes flowing through the pipeline.
//!
//! `LegacyRecord` → (Field Mapper) → `NormalizedRecord` → (Lookup Resolver)
//! → `ResolvedRecord` → (Batch Loader). Every canonical field is declared
//! explicitly and serializes as `null` when absent, so downstream consumers
//! always see the same shape.

use serde::{Deserialize, Serialize};

/// A raw cell from the legacy export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LegacyValue {
    Empty,
    Number(f64),
    Text(String),
}

impl LegacyValue {
    /// Text cells that are blank after trimming count as empty.
    pub fn is_empty(&self) -> bool {
        match self {
            LegacyValue::Empty => true,
            LegacyValue::Text(s) => s.trim().is_empty(),
            LegacyValue::Number(_) => false,
        }
    }

    /// The cell rendered as text, `None` when empty.
    pub fn as_text(&self) -> Option<String> {
        match self {
            LegacyValue::Empty => None,
            LegacyValue::Text(s) => {
                let trimmed = s.trim();
                (!trimmed.is_empty()).then(|| trimmed.to_string())
            }
            LegacyValue::Number(n) => Some(format_number(*n)),
        }
    }
}

impl From<&str> for LegacyValue {
    fn from(s: &str) -> Self {
        if s.trim().is_empty() {
            LegacyValue::Empty
        } else {
            LegacyValue::Text(s.to_string())
        }
    }
}

fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

/// One row of the legacy export: ordered label → value pairs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LegacyRecord {
    /// 1-based data row number in the source file (header excluded).
    pub source_row: usize,
    pub fields: Vec<(String, LegacyValue)>,
}

impl LegacyRecord {
    pub fn new(source_row: usize) -> Self {
        Self {
            source_row,
            fields: Vec::new(),
        }
    }

    pub fn with_field(mut self, label: impl Into<String>, value: impl Into<LegacyValue>) -> Self {
        self.push(label, value);
        self
    }

    pub fn push(&mut self, label: impl Into<String>, value: impl Into<LegacyValue>) {
        self.fields.push((label.into(), value.into()));
    }

    pub fn get(&self, label: &str) -> Option<&LegacyValue> {
        self.fields
            .iter()
            .find(|(l, _)| l == label)
            .map(|(_, v)| v)
    }
}

/// Listing attributes shared by normalized and resolved records.
///
/// Numeric fields are finite and non-negative, or `None`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListingFields {
    pub name: Option<String>,
    pub address: Option<String>,
    pub building: Option<String>,
    pub unit: Option<String>,

    pub price: Option<f64>,
    pub lease_price: Option<f64>,
    pub monthly_fee: Option<f64>,
    pub supply_area_sqm: Option<f64>,
    pub private_area_sqm: Option<f64>,
    pub supply_area_pyeong: Option<f64>,
    pub private_area_pyeong: Option<f64>,

    pub floor_info: Option<String>,
    pub rooms_bathrooms: Option<String>,
    pub direction: Option<String>,
    pub parking: Option<String>,
    pub move_in_date: Option<String>,
    pub special_notes: Option<String>,
    pub manager_memo: Option<String>,
}

/// Why a legacy value did not make it into its canonical field as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseNoteKind {
    /// The value could not be parsed; the field is null.
    Unparsed,
    /// A parenthetical hint was dropped from an otherwise parsed value.
    Annotation,
}

/// Side-channel note for manual review.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParseNote {
    pub label: String,
    pub kind: ParseNoteKind,
    pub raw: String,
}

/// A listing in canonical form with categorical fields still as labels.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    pub source_row: usize,
    pub source_hash: String,
    #[serde(flatten)]
    pub listing: ListingFields,

    pub property_type_label: Option<String>,
    pub status_label: Option<String>,
    pub transaction_type_label: Option<String>,
    pub manager_label: Option<String>,

    pub notes: Vec<ParseNote>,
}

impl NormalizedRecord {
    /// Short human-readable handle for logs and failure reports.
    pub fn display_label(&self) -> String {
        display_label(&self.listing, self.source_row)
    }
}

/// Foreign-key value as returned by the store (integer or uuid string).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReferenceId(pub serde_json::Value);

impl std::fmt::Display for ReferenceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.0 {
            serde_json::Value::String(s) => f.write_str(s),
            other => write!(f, "{}", other),
        }
    }
}

/// A listing whose labels have been replaced by reference ids.
/// The only shape the Batch Loader accepts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResolvedRecord {
    pub source_row: usize,
    pub source_hash: String,
    #[serde(flatten)]
    pub listing: ListingFields,

    pub property_type_id: Option<ReferenceId>,
    pub status_id: Option<ReferenceId>,
    pub transaction_type_id: Option<ReferenceId>,
    pub manager_id: Option<ReferenceId>,
}

impl ResolvedRecord {
    pub fn display_label(&self) -> String {
        display_label(&self.listing, self.source_row)
    }
}

fn display_label(listing: &ListingFields, source_row: usize) -> String {
    match &listing.name {
        Some(name) => format!("row {} ({})", source_row, name),
        None => format!("row {}", source_row),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legacy_value_text() {
        assert!(LegacyValue::from("  ").is_empty());
        assert_eq!(LegacyValue::Number(5000.0).as_text().as_deref(), Some("5000"));
        assert_eq!(LegacyValue::Number(84.5).as_text().as_deref(), Some("84.5"));
        assert_eq!(
            LegacyValue::Text(" 강남 ".into()).as_text().as_deref(),
            Some("강남")
        );
    }

    #[test]
    fn test_legacy_record_keeps_order() {
        let record = LegacyRecord::new(1)
            .with_field("매물명", "래미안")
            .with_field("주소", "서울");
        assert_eq!(record.fields[0].0, "매물명");
        assert_eq!(record.get("주소"), Some(&LegacyValue::Text("서울".into())));
        assert_eq!(record.get("없음"), None);
    }

    #[test]
    fn test_resolved_record_serializes_every_field() {
        let value = serde_json::to_value(ResolvedRecord::default()).unwrap();
        let obj = value.as_object().unwrap();
        for key in [
            "name",
            "price",
            "supply_area_pyeong",
            "manager_memo",
            "property_type_id",
            "manager_id",
        ] {
            assert!(obj.contains_key(key), "missing {}", key);
            assert!(obj[key].is_null());
        }
    }

    #[test]
    fn test_reference_id_display() {
        assert_eq!(ReferenceId(serde_json::json!(7)).to_string(), "7");
        assert_eq!(ReferenceId(serde_json::json!("a-b")).to_string(), "a-b");
    }
}
