//! Legacy export reader.
//!
//! Turns a spreadsheet export (CSV/TSV, or a JSON array of objects) into
//! `LegacyRecord`s. Column order is not assumed; headers are kept as labels.

use crate::error::{MigrateError, Result};
use crate::mapper::normalize_label;
use crate::types::{LegacyRecord, LegacyValue};
use serde_json::Value;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use tracing::{debug, info};

/// Read an export, picking the format from the file extension.
pub fn read_export(path: &Path) -> Result<Vec<LegacyRecord>> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();

    let file = File::open(path).map_err(|e| MigrateError::io_with_path(e, path))?;
    let reader = BufReader::new(file);

    let records = match extension.as_str() {
        "csv" => read_delimited(reader, b',')?,
        "tsv" => read_delimited(reader, b'\t')?,
        "json" => read_json(reader)?,
        _ => return Err(MigrateError::UnsupportedFormat(path.to_path_buf())),
    };

    info!(path = %path.display(), rows = records.len(), "Read legacy export");
    Ok(records)
}

/// Read delimited text with a header row.
///
/// Rows may be shorter or longer than the header; missing cells are empty
/// and surplus cells are ignored. Fully blank rows are skipped but still
/// count towards `source_row`.
pub fn read_delimited<R: Read>(reader: R, delimiter: u8) -> Result<Vec<LegacyRecord>> {
    let mut csv_reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .has_headers(true)
        .from_reader(reader);

    let headers: Vec<String> = csv_reader
        .headers()?
        .iter()
        .map(normalize_label)
        .collect();

    let mut records = Vec::new();
    for (index, row) in csv_reader.records().enumerate() {
        let row = row?;
        let source_row = index + 1;
        if row.iter().all(|cell| cell.trim().is_empty()) {
            debug!(row = source_row, "Blank row skipped");
            continue;
        }

        let mut record = LegacyRecord::new(source_row);
        for (label, cell) in headers.iter().zip(row.iter()) {
            record.push(label.clone(), LegacyValue::from(cell));
        }
        records.push(record);
    }
    Ok(records)
}

/// Read a JSON array of flat objects; key order is preserved.
pub fn read_json<R: Read>(reader: R) -> Result<Vec<LegacyRecord>> {
    let value: Value = serde_json::from_reader(reader)?;
    let Value::Array(rows) = value else {
        return Err(MigrateError::Validation {
            field: "export".to_string(),
            message: "expected a JSON array of row objects".to_string(),
        });
    };

    let mut records = Vec::with_capacity(rows.len());
    for (index, row) in rows.into_iter().enumerate() {
        let source_row = index + 1;
        let Value::Object(object) = row else {
            return Err(MigrateError::Validation {
                field: format!("row {}", source_row),
                message: "expected an object".to_string(),
            });
        };
        let mut record = LegacyRecord::new(source_row);
        for (label, value) in object {
            record.push(normalize_label(&label), json_cell(value));
        }
        records.push(record);
    }
    Ok(records)
}

fn json_cell(value: Value) -> LegacyValue {
    match value {
        Value::Null => LegacyValue::Empty,
        Value::Number(n) => n.as_f64().map_or(LegacyValue::Empty, LegacyValue::Number),
        Value::String(s) => LegacyValue::from(s.as_str()),
        other => LegacyValue::Text(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_csv_with_bom_and_short_rows() {
        let data = "\u{feff}매물명,매매가, 면적(㎡) \n래미안,60억 (미정),84.9㎡ / 59.9㎡\n,,\n자이,28억\n";
        let records = read_delimited(data.as_bytes(), b',').unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].source_row, 1);
        assert_eq!(records[0].fields[0].0, "매물명");
        assert_eq!(records[0].fields[2].0, "면적(㎡)");
        assert_eq!(
            records[0].get("매매가"),
            Some(&LegacyValue::Text("60억 (미정)".into()))
        );
        // The blank second row still counts.
        assert_eq!(records[1].source_row, 3);
        assert_eq!(records[1].fields.len(), 2);
    }

    #[test]
    fn test_json_array() {
        let data = r#"[{"매물명": "래미안", "월세": 150, "비고": null}]"#;
        let records = read_json(data.as_bytes()).unwrap();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].fields[0].0, "매물명");
        assert_eq!(records[0].get("월세"), Some(&LegacyValue::Number(150.0)));
        assert_eq!(records[0].get("비고"), Some(&LegacyValue::Empty));
    }

    #[test]
    fn test_json_must_be_array_of_objects() {
        assert!(read_json(r#"{"a": 1}"#.as_bytes()).is_err());
        assert!(read_json(r#"[1, 2]"#.as_bytes()).is_err());
    }

    #[test]
    fn test_read_export_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("listings.tsv");
        let mut file = File::create(&path).unwrap();
        writeln!(file, "매물명\t주소").unwrap();
        writeln!(file, "래미안\t서울 서초구").unwrap();
        drop(file);

        let records = read_export(&path).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].get("주소"), Some(&LegacyValue::Text("서울 서초구".into())));

        let other = dir.path().join("listings.xlsx");
        std::fs::write(&other, b"").unwrap();
        assert!(matches!(
            read_export(&other),
            Err(MigrateError::UnsupportedFormat(_))
        ));
    }
}
