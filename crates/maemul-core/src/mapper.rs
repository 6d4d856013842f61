//! Field mapper: legacy Korean column labels → canonical listing fields.
//!
//! The static [`LEGACY_FIELD_TABLE`] says where each known label goes. Labels
//! missing from the table are not errors; they are collected once per distinct
//! label so operators can extend the table instead of losing data unnoticed.

use crate::parsers::{
    currency_annotation, non_negative_finite, normalize_text, parse_dual_area_value,
    parse_floor_info, parse_korean_currency, parse_number, parse_rooms_bathrooms,
};
use crate::types::{LegacyRecord, LegacyValue, NormalizedRecord, ParseNote, ParseNoteKind};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

/// Square-metre unit suffix used in legacy area strings.
pub const SQM: &str = "㎡";
/// Pyeong unit suffix used in legacy area strings.
pub const PYEONG: &str = "평";

/// Canonical destination fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CanonicalField {
    Name,
    Address,
    Building,
    Unit,
    PropertyTypeLabel,
    StatusLabel,
    TransactionTypeLabel,
    ManagerLabel,
    Price,
    LeasePrice,
    MonthlyFee,
    SupplyAreaSqm,
    PrivateAreaSqm,
    SupplyAreaPyeong,
    PrivateAreaPyeong,
    FloorInfo,
    RoomsBathrooms,
    Direction,
    Parking,
    MoveInDate,
    SpecialNotes,
    ManagerMemo,
}

/// How a canonical field's value is parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    Currency,
    Area(&'static str),
}

impl CanonicalField {
    pub fn column(self) -> &'static str {
        match self {
            CanonicalField::Name => "name",
            CanonicalField::Address => "address",
            CanonicalField::Building => "building",
            CanonicalField::Unit => "unit",
            CanonicalField::PropertyTypeLabel => "property_type_label",
            CanonicalField::StatusLabel => "status_label",
            CanonicalField::TransactionTypeLabel => "transaction_type_label",
            CanonicalField::ManagerLabel => "manager_label",
            CanonicalField::Price => "price",
            CanonicalField::LeasePrice => "lease_price",
            CanonicalField::MonthlyFee => "monthly_fee",
            CanonicalField::SupplyAreaSqm => "supply_area_sqm",
            CanonicalField::PrivateAreaSqm => "private_area_sqm",
            CanonicalField::SupplyAreaPyeong => "supply_area_pyeong",
            CanonicalField::PrivateAreaPyeong => "private_area_pyeong",
            CanonicalField::FloorInfo => "floor_info",
            CanonicalField::RoomsBathrooms => "rooms_bathrooms",
            CanonicalField::Direction => "direction",
            CanonicalField::Parking => "parking",
            CanonicalField::MoveInDate => "move_in_date",
            CanonicalField::SpecialNotes => "special_notes",
            CanonicalField::ManagerMemo => "manager_memo",
        }
    }

    pub fn kind(self) -> FieldKind {
        match self {
            CanonicalField::Price | CanonicalField::LeasePrice | CanonicalField::MonthlyFee => {
                FieldKind::Currency
            }
            CanonicalField::SupplyAreaSqm | CanonicalField::PrivateAreaSqm => FieldKind::Area(SQM),
            CanonicalField::SupplyAreaPyeong | CanonicalField::PrivateAreaPyeong => {
                FieldKind::Area(PYEONG)
            }
            _ => FieldKind::Text,
        }
    }

    fn text_slot(self, record: &mut NormalizedRecord) -> Option<&mut Option<String>> {
        let l = &mut record.listing;
        Some(match self {
            CanonicalField::Name => &mut l.name,
            CanonicalField::Address => &mut l.address,
            CanonicalField::Building => &mut l.building,
            CanonicalField::Unit => &mut l.unit,
            CanonicalField::FloorInfo => &mut l.floor_info,
            CanonicalField::RoomsBathrooms => &mut l.rooms_bathrooms,
            CanonicalField::Direction => &mut l.direction,
            CanonicalField::Parking => &mut l.parking,
            CanonicalField::MoveInDate => &mut l.move_in_date,
            CanonicalField::SpecialNotes => &mut l.special_notes,
            CanonicalField::ManagerMemo => &mut l.manager_memo,
            CanonicalField::PropertyTypeLabel => &mut record.property_type_label,
            CanonicalField::StatusLabel => &mut record.status_label,
            CanonicalField::TransactionTypeLabel => &mut record.transaction_type_label,
            CanonicalField::ManagerLabel => &mut record.manager_label,
            _ => return None,
        })
    }

    fn number_slot(self, record: &mut NormalizedRecord) -> Option<&mut Option<f64>> {
        let l = &mut record.listing;
        Some(match self {
            CanonicalField::Price => &mut l.price,
            CanonicalField::LeasePrice => &mut l.lease_price,
            CanonicalField::MonthlyFee => &mut l.monthly_fee,
            CanonicalField::SupplyAreaSqm => &mut l.supply_area_sqm,
            CanonicalField::PrivateAreaSqm => &mut l.private_area_sqm,
            CanonicalField::SupplyAreaPyeong => &mut l.supply_area_pyeong,
            CanonicalField::PrivateAreaPyeong => &mut l.private_area_pyeong,
            _ => return None,
        })
    }
}

/// Destination of one legacy label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingTarget {
    /// One canonical field.
    Field(CanonicalField),
    /// A combined `"supply / private"` string with the given unit suffix.
    Composite {
        unit: &'static str,
        supply: CanonicalField,
        private: CanonicalField,
    },
    /// Known column with no destination.
    Ignored,
}

/// Known legacy labels. Several spellings of the same column map to one field;
/// the first non-empty value in a row wins.
pub static LEGACY_FIELD_TABLE: &[(&str, MappingTarget)] = &[
    ("매물명", MappingTarget::Field(CanonicalField::Name)),
    ("물건명", MappingTarget::Field(CanonicalField::Name)),
    ("주소", MappingTarget::Field(CanonicalField::Address)),
    ("소재지", MappingTarget::Field(CanonicalField::Address)),
    ("건물명", MappingTarget::Field(CanonicalField::Building)),
    ("단지명", MappingTarget::Field(CanonicalField::Building)),
    ("동호수", MappingTarget::Field(CanonicalField::Unit)),
    ("호수", MappingTarget::Field(CanonicalField::Unit)),
    ("매물종류", MappingTarget::Field(CanonicalField::PropertyTypeLabel)),
    ("매물유형", MappingTarget::Field(CanonicalField::PropertyTypeLabel)),
    ("진행상태", MappingTarget::Field(CanonicalField::StatusLabel)),
    ("상태", MappingTarget::Field(CanonicalField::StatusLabel)),
    ("거래유형", MappingTarget::Field(CanonicalField::TransactionTypeLabel)),
    ("거래종류", MappingTarget::Field(CanonicalField::TransactionTypeLabel)),
    ("담당자", MappingTarget::Field(CanonicalField::ManagerLabel)),
    ("매매가", MappingTarget::Field(CanonicalField::Price)),
    ("금액", MappingTarget::Field(CanonicalField::Price)),
    ("보증금", MappingTarget::Field(CanonicalField::LeasePrice)),
    ("전세가", MappingTarget::Field(CanonicalField::LeasePrice)),
    ("월세", MappingTarget::Field(CanonicalField::MonthlyFee)),
    (
        "면적(㎡)",
        MappingTarget::Composite {
            unit: SQM,
            supply: CanonicalField::SupplyAreaSqm,
            private: CanonicalField::PrivateAreaSqm,
        },
    ),
    (
        "공급/전용(㎡)",
        MappingTarget::Composite {
            unit: SQM,
            supply: CanonicalField::SupplyAreaSqm,
            private: CanonicalField::PrivateAreaSqm,
        },
    ),
    (
        "면적(평)",
        MappingTarget::Composite {
            unit: PYEONG,
            supply: CanonicalField::SupplyAreaPyeong,
            private: CanonicalField::PrivateAreaPyeong,
        },
    ),
    (
        "공급/전용(평)",
        MappingTarget::Composite {
            unit: PYEONG,
            supply: CanonicalField::SupplyAreaPyeong,
            private: CanonicalField::PrivateAreaPyeong,
        },
    ),
    ("공급면적", MappingTarget::Field(CanonicalField::SupplyAreaSqm)),
    ("전용면적", MappingTarget::Field(CanonicalField::PrivateAreaSqm)),
    ("층", MappingTarget::Field(CanonicalField::FloorInfo)),
    ("해당층/총층", MappingTarget::Field(CanonicalField::FloorInfo)),
    ("방/욕실", MappingTarget::Field(CanonicalField::RoomsBathrooms)),
    ("방수/욕실수", MappingTarget::Field(CanonicalField::RoomsBathrooms)),
    ("방향", MappingTarget::Field(CanonicalField::Direction)),
    ("주차", MappingTarget::Field(CanonicalField::Parking)),
    ("입주가능일", MappingTarget::Field(CanonicalField::MoveInDate)),
    ("입주일", MappingTarget::Field(CanonicalField::MoveInDate)),
    ("특이사항", MappingTarget::Field(CanonicalField::SpecialNotes)),
    ("비고", MappingTarget::Field(CanonicalField::SpecialNotes)),
    ("메모", MappingTarget::Field(CanonicalField::ManagerMemo)),
    ("담당자메모", MappingTarget::Field(CanonicalField::ManagerMemo)),
    ("번호", MappingTarget::Ignored),
    ("순번", MappingTarget::Ignored),
    ("No", MappingTarget::Ignored),
    ("등록일", MappingTarget::Ignored),
    ("수정일", MappingTarget::Ignored),
];

/// Normalize a header label: drop a BOM, trim, collapse inner whitespace.
pub fn normalize_label(label: &str) -> String {
    label
        .trim_start_matches('\u{feff}')
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Translates legacy rows into normalized records and remembers unmapped labels.
pub struct FieldMapper {
    table: HashMap<String, MappingTarget>,
    dropped: Vec<String>,
    dropped_seen: HashSet<String>,
}

impl Default for FieldMapper {
    fn default() -> Self {
        Self::new()
    }
}

impl FieldMapper {
    /// Mapper over [`LEGACY_FIELD_TABLE`].
    pub fn new() -> Self {
        Self::with_table(LEGACY_FIELD_TABLE.iter().map(|(l, t)| (l.to_string(), *t)))
    }

    /// Mapper over a custom table.
    pub fn with_table(entries: impl IntoIterator<Item = (String, MappingTarget)>) -> Self {
        let table = entries
            .into_iter()
            .map(|(label, target)| (normalize_label(&label), target))
            .collect();
        Self {
            table,
            dropped: Vec::new(),
            dropped_seen: HashSet::new(),
        }
    }

    /// Unmapped labels seen so far, first-seen order, each once.
    pub fn dropped_fields(&self) -> &[String] {
        &self.dropped
    }

    pub fn map_all(&mut self, records: &[LegacyRecord]) -> Vec<NormalizedRecord> {
        records.iter().map(|r| self.map_record(r)).collect()
    }

    /// Map one legacy row. Never fails; problems become notes on the record.
    pub fn map_record(&mut self, legacy: &LegacyRecord) -> NormalizedRecord {
        let mut record = NormalizedRecord {
            source_row: legacy.source_row,
            source_hash: self.source_fingerprint(legacy),
            ..Default::default()
        };

        for (raw_label, value) in &legacy.fields {
            let label = normalize_label(raw_label);
            match self.table.get(&label).copied() {
                None => self.note_dropped(label),
                Some(MappingTarget::Ignored) => {}
                Some(MappingTarget::Field(field)) => {
                    apply_field(&mut record, field, &label, value);
                }
                Some(MappingTarget::Composite {
                    unit,
                    supply,
                    private,
                }) => apply_composite(&mut record, &label, value, unit, supply, private),
            }
        }

        record
    }

    /// Content fingerprint of a legacy row: SHA-256 over the non-empty values
    /// of columns that reach a canonical field, sorted by label. Column order,
    /// blank cells, row numbers and other ignored or unknown columns do not matter.
    pub fn source_fingerprint(&self, record: &LegacyRecord) -> String {
        let mut pairs: Vec<(String, String)> = record
            .fields
            .iter()
            .map(|(label, value)| (normalize_label(label), value))
            .filter(|(label, _)| {
                matches!(
                    self.table.get(label),
                    Some(MappingTarget::Field(_) | MappingTarget::Composite { .. })
                )
            })
            .filter_map(|(label, value)| value.as_text().map(|v| (label, v)))
            .collect();
        pairs.sort();

        let mut hasher = Sha256::new();
        for (label, value) in &pairs {
            hasher.update(label.as_bytes());
            hasher.update([0x1f]);
            hasher.update(value.as_bytes());
            hasher.update([0x1e]);
        }
        hex::encode(hasher.finalize())
    }

    fn note_dropped(&mut self, label: String) {
        if label.is_empty() || !self.dropped_seen.insert(label.clone()) {
            return;
        }
        warn!(label = %label, "Unmapped legacy column, values will be dropped");
        self.dropped.push(label);
    }
}

fn apply_field(record: &mut NormalizedRecord, field: CanonicalField, label: &str, value: &LegacyValue) {
    let Some(text) = value.as_text() else {
        return;
    };

    match field.kind() {
        FieldKind::Text => {
            let normalized = match field {
                CanonicalField::FloorInfo => parse_floor_info(&text),
                CanonicalField::RoomsBathrooms => parse_rooms_bathrooms(&text),
                _ => normalize_text(&text),
            };
            if let Some(slot) = field.text_slot(record) {
                if slot.is_none() {
                    *slot = normalized;
                } else {
                    debug!(label, "Alias column ignored, field already set");
                }
            }
        }
        FieldKind::Currency => {
            let parsed = parse_korean_currency(&text);
            if parsed.is_some() {
                if let Some(annotation) = currency_annotation(&text) {
                    push_note(record, label, ParseNoteKind::Annotation, annotation);
                }
            }
            set_number(record, field, label, parsed, &text);
        }
        FieldKind::Area(unit) => {
            let parsed = match value {
                LegacyValue::Number(n) => non_negative_finite(*n),
                _ => parse_number(&text, unit),
            };
            set_number(record, field, label, parsed, &text);
        }
    }
}

fn set_number(
    record: &mut NormalizedRecord,
    field: CanonicalField,
    label: &str,
    parsed: Option<f64>,
    raw: &str,
) {
    let Some(value) = parsed else {
        push_note(record, label, ParseNoteKind::Unparsed, raw.to_string());
        return;
    };
    if let Some(slot) = field.number_slot(record) {
        if slot.is_none() {
            *slot = Some(value);
        }
    }
}

fn apply_composite(
    record: &mut NormalizedRecord,
    label: &str,
    value: &LegacyValue,
    unit: &'static str,
    supply: CanonicalField,
    private: CanonicalField,
) {
    let Some(text) = value.as_text() else {
        return;
    };

    match parse_dual_area_value(&text, unit) {
        Some(area) => {
            for (field, parsed) in [(supply, area.supply), (private, area.private)] {
                if let Some(slot) = field.number_slot(record) {
                    if slot.is_none() {
                        *slot = parsed;
                    }
                }
            }
        }
        None => {
            debug!(label, raw = %text, "Composite area value did not parse");
            push_note(record, label, ParseNoteKind::Unparsed, text);
        }
    }
}

fn push_note(record: &mut NormalizedRecord, label: &str, kind: ParseNoteKind, raw: String) {
    record.notes.push(ParseNote {
        label: label.to_string(),
        kind,
        raw,
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(fields: &[(&str, &str)]) -> LegacyRecord {
        let mut record = LegacyRecord::new(1);
        for (label, value) in fields {
            record.push(*label, *value);
        }
        record
    }

    #[test]
    fn test_maps_basic_fields() {
        let mut mapper = FieldMapper::new();
        let record = mapper.map_record(&row(&[
            ("매물명", "래미안 퍼스티지"),
            ("주소", " 서울 서초구 반포동 "),
            ("매물종류", "아파트"),
            ("거래유형", "매매"),
            ("매매가", "28억 (26억가능)"),
            ("면적(㎡)", "184.03㎡ / 171.7㎡"),
            ("층", "12/25"),
            ("담당자", "김부장"),
        ]));

        assert_eq!(record.listing.name.as_deref(), Some("래미안 퍼스티지"));
        assert_eq!(record.listing.address.as_deref(), Some("서울 서초구 반포동"));
        assert_eq!(record.property_type_label.as_deref(), Some("아파트"));
        assert_eq!(record.transaction_type_label.as_deref(), Some("매매"));
        assert_eq!(record.listing.price, Some(2_800_000_000.0));
        assert_eq!(record.listing.supply_area_sqm, Some(184.03));
        assert_eq!(record.listing.private_area_sqm, Some(171.7));
        assert_eq!(record.listing.floor_info.as_deref(), Some("12/25"));
        assert_eq!(record.manager_label.as_deref(), Some("김부장"));
        assert_eq!(
            record.notes,
            vec![ParseNote {
                label: "매매가".into(),
                kind: ParseNoteKind::Annotation,
                raw: "26억가능".into(),
            }]
        );
        assert!(mapper.dropped_fields().is_empty());
    }

    #[test]
    fn test_absent_fields_are_null_not_omitted() {
        let mut mapper = FieldMapper::new();
        let record = mapper.map_record(&row(&[("매물명", "테스트")]));
        let json = serde_json::to_value(&record).unwrap();
        let obj = json.as_object().unwrap();
        for key in [
            "address",
            "price",
            "lease_price",
            "private_area_pyeong",
            "status_label",
            "manager_label",
            "move_in_date",
        ] {
            assert!(obj.get(key).is_some_and(|v| v.is_null()), "{} should be null", key);
        }
    }

    #[test]
    fn test_unmapped_labels_reported_once() {
        let mut mapper = FieldMapper::new();
        for _ in 0..3 {
            mapper.map_record(&row(&[("매물명", "a"), ("옵션", "에어컨"), ("옵션 ", "x")]));
        }
        mapper.map_record(&row(&[("사진", "")]));
        assert_eq!(mapper.dropped_fields(), &["옵션".to_string(), "사진".to_string()]);
    }

    #[test]
    fn test_ignored_labels_are_not_dropped() {
        let mut mapper = FieldMapper::new();
        mapper.map_record(&row(&[("번호", "1"), ("등록일", "2023-01-01")]));
        assert!(mapper.dropped_fields().is_empty());
    }

    #[test]
    fn test_composite_failure_nulls_both_and_keeps_raw() {
        let mut mapper = FieldMapper::new();
        let record = mapper.map_record(&row(&[("면적(평)", "대략 50평 / ?")]));
        assert_eq!(record.listing.supply_area_pyeong, None);
        assert_eq!(record.listing.private_area_pyeong, None);
        assert_eq!(record.notes.len(), 1);
        assert_eq!(record.notes[0].kind, ParseNoteKind::Unparsed);
        assert_eq!(record.notes[0].raw, "대략 50평 / ?");
    }

    #[test]
    fn test_unparseable_currency_is_null_with_note() {
        let mut mapper = FieldMapper::new();
        let record = mapper.map_record(&row(&[("보증금", "모름"), ("월세", "")]));
        assert_eq!(record.listing.lease_price, None);
        assert_eq!(record.listing.monthly_fee, None);
        assert_eq!(record.notes.len(), 1);
        assert_eq!(record.notes[0].label, "보증금");
    }

    #[test]
    fn test_alias_first_value_wins() {
        let mut mapper = FieldMapper::new();
        let record = mapper.map_record(&row(&[("매물명", ""), ("물건명", "B"), ("매물명", "C")]));
        assert_eq!(record.listing.name.as_deref(), Some("B"));
    }

    #[test]
    fn test_numeric_cells() {
        let mut mapper = FieldMapper::new();
        let mut legacy = LegacyRecord::new(4);
        legacy.push("월세", LegacyValue::Number(150.0));
        legacy.push("전용면적", LegacyValue::Number(84.97));
        let record = mapper.map_record(&legacy);
        assert_eq!(record.listing.monthly_fee, Some(1_500_000.0));
        assert_eq!(record.listing.private_area_sqm, Some(84.97));
    }

    #[test]
    fn test_fingerprint_ignores_order_and_blanks() {
        let mapper = FieldMapper::new();
        let a = row(&[("매물명", "A"), ("주소", "서울"), ("비고", "")]);
        let b = row(&[("주소", "서울 "), ("매물명", "A")]);
        let c = row(&[("매물명", "A"), ("주소", "부산")]);
        assert_eq!(mapper.source_fingerprint(&a), mapper.source_fingerprint(&b));
        assert_ne!(mapper.source_fingerprint(&a), mapper.source_fingerprint(&c));
        assert_eq!(mapper.source_fingerprint(&a).len(), 64);
    }

    #[test]
    fn test_fingerprint_survives_renumbered_export() {
        let mapper = FieldMapper::new();
        let first = row(&[("번호", "12"), ("매물명", "A"), ("매매가", "3억"), ("등록일", "2023-01-01")]);
        let again = row(&[("번호", "40"), ("매물명", "A"), ("매매가", "3억"), ("등록일", "2024-06-30")]);
        let extra = row(&[("매물명", "A"), ("매매가", "3억"), ("사진", "a.jpg")]);
        let changed = row(&[("번호", "12"), ("매물명", "A"), ("매매가", "4억")]);

        assert_eq!(mapper.source_fingerprint(&first), mapper.source_fingerprint(&again));
        assert_eq!(mapper.source_fingerprint(&first), mapper.source_fingerprint(&extra));
        assert_ne!(mapper.source_fingerprint(&first), mapper.source_fingerprint(&changed));
    }

    #[test]
    fn test_normalize_label() {
        assert_eq!(normalize_label("\u{feff}매물명"), "매물명");
        assert_eq!(normalize_label("  면적(㎡)  "), "면적(㎡)");
        assert_eq!(normalize_label("해당층 \t 총층"), "해당층 총층");
    }
}
