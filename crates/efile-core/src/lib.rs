//! Core domain model for the e-file ingestion pipeline: manifests, group plans,
//! parsed records and the single raw-to-typed coercion policy.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Range;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod schema;

pub use schema::{FieldType, OfficerPaths, PathSet, SchemaError, SchemaField, SchemaTable};

/// Fixed width of the anonymized officer compensation vector.
pub const OFFICER_SLOTS: usize = 5;

pub fn officer_column(slot: usize) -> String {
    format!("officer_{slot}")
}

/// One remote document reference from the yearly index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    #[serde(alias = "EIN")]
    pub identity_key: String,
    #[serde(alias = "URL")]
    pub resource_locator: String,
    #[serde(alias = "TaxPeriod")]
    pub reporting_period: String,
    #[serde(alias = "FormType")]
    pub form_type: String,
}

impl ManifestEntry {
    /// Filing year implied by the reporting period. Fiscal years ending before
    /// December belong to the previous tax year.
    pub fn expected_filing_year(&self) -> Option<i32> {
        let period = self.reporting_period.trim();
        if period.len() != 6 || !period.is_ascii() {
            return None;
        }
        let year: i32 = period[..4].parse().ok()?;
        let month: u32 = period[4..].parse().ok()?;
        if !(1..=12).contains(&month) {
            return None;
        }
        Some(if month < 12 { year - 1 } else { year })
    }
}

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("reading manifest {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing manifest {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("manifest object must hold exactly one filings array, found {0} keys")]
    Shape(usize),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ManifestDocument {
    Entries(Vec<ManifestEntry>),
    Keyed(BTreeMap<String, Vec<ManifestEntry>>),
}

/// Read-only yearly index, in the remote index's insertion order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    pub year: i32,
    entries: Vec<ManifestEntry>,
}

impl Manifest {
    pub fn new(year: i32, entries: Vec<ManifestEntry>) -> Self {
        Self { year, entries }
    }

    /// Load a manifest file, optionally keeping only one declared form type.
    pub fn load(
        path: impl AsRef<Path>,
        year: i32,
        form_type: Option<&str>,
    ) -> Result<Self, ManifestError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ManifestError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&text, year, form_type).map_err(|err| match err {
            ManifestError::Parse { source, .. } => ManifestError::Parse {
                path: path.display().to_string(),
                source,
            },
            other => other,
        })
    }

    pub fn from_json_str(
        text: &str,
        year: i32,
        form_type: Option<&str>,
    ) -> Result<Self, ManifestError> {
        let document: ManifestDocument =
            serde_json::from_str(text).map_err(|source| ManifestError::Parse {
                path: "<inline>".to_string(),
                source,
            })?;
        let entries = match document {
            ManifestDocument::Entries(entries) => entries,
            ManifestDocument::Keyed(mut keyed) => {
                if keyed.len() != 1 {
                    return Err(ManifestError::Shape(keyed.len()));
                }
                keyed.pop_first().map(|(_, entries)| entries).unwrap_or_default()
            }
        };
        let entries = match form_type {
            Some(wanted) => entries.into_iter().filter(|e| e.form_type == wanted).collect(),
            None => entries,
        };
        Ok(Self { year, entries })
    }

    pub fn entries(&self) -> &[ManifestEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries belonging to one group of `plan`.
    pub fn group(&self, plan: &GroupPlan, ordinal: u32) -> Option<&[ManifestEntry]> {
        plan.range(ordinal).map(|range| &self.entries[range])
    }
}

/// Ordinal -> contiguous entry range mapping for one manifest.
///
/// The group count is rounded up, so a final group may hold fewer than
/// `group_size` entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupPlan {
    total: usize,
    group_size: usize,
}

impl GroupPlan {
    pub fn new(total: usize, group_size: usize) -> Self {
        Self {
            total,
            group_size: group_size.max(1),
        }
    }

    pub fn total_entries(&self) -> usize {
        self.total
    }

    pub fn group_size(&self) -> usize {
        self.group_size
    }

    pub fn group_count(&self) -> u32 {
        u32::try_from(self.total.div_ceil(self.group_size)).unwrap_or(u32::MAX)
    }

    pub fn ordinals(&self) -> Range<u32> {
        0..self.group_count()
    }

    pub fn range(&self, ordinal: u32) -> Option<Range<usize>> {
        if ordinal >= self.group_count() {
            return None;
        }
        let start = ordinal as usize * self.group_size;
        let end = (start + self.group_size).min(self.total);
        Some(start..end)
    }

    pub fn expected_rows(&self, ordinal: u32) -> Option<usize> {
        self.range(ordinal).map(|r| r.len())
    }
}

/// Raw extracted value. Absence is data and renders as `0`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RawValue {
    Absent,
    Text(String),
}

impl RawValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            RawValue::Absent => None,
            RawValue::Text(text) => Some(text),
        }
    }
}

impl fmt::Display for RawValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RawValue::Absent => f.write_str("0"),
            RawValue::Text(text) => f.write_str(text),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldValue {
    pub name: String,
    pub field_type: FieldType,
    pub raw: RawValue,
}

/// One document's extraction output, in schema field order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedRecord {
    pub values: Vec<FieldValue>,
    pub officer_compensation: [i64; OFFICER_SLOTS],
}

impl ParsedRecord {
    /// Placeholder for a document the remote index lists but cannot serve.
    pub fn missing(schema: &SchemaTable) -> Self {
        Self {
            values: schema
                .fields()
                .iter()
                .map(|field| FieldValue {
                    name: field.name.clone(),
                    field_type: field.field_type,
                    raw: RawValue::Absent,
                })
                .collect(),
            officer_compensation: [0; OFFICER_SLOTS],
        }
    }

    pub fn get(&self, name: &str) -> Option<&RawValue> {
        self.values.iter().find(|v| v.name == name).map(|v| &v.raw)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TypedValue {
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot read `{value}` as {field_type}")]
pub struct CoercionError {
    pub field_type: FieldType,
    pub value: String,
}

impl FieldType {
    pub fn default_value(self) -> TypedValue {
        match self {
            FieldType::Int => TypedValue::Int(0),
            FieldType::Float => TypedValue::Float(0.0),
            FieldType::Str => TypedValue::Str("0".to_string()),
            FieldType::Bool => TypedValue::Bool(false),
        }
    }

    pub fn coerce(self, raw: &RawValue) -> Result<TypedValue, CoercionError> {
        let Some(text) = raw.as_text() else {
            return Ok(self.default_value());
        };
        let invalid = || CoercionError {
            field_type: self,
            value: text.to_string(),
        };
        let trimmed = text.trim();
        match self {
            FieldType::Str => Ok(TypedValue::Str(text.to_string())),
            FieldType::Bool => Ok(TypedValue::Bool(matches!(trimmed, "1" | "true"))),
            FieldType::Int => {
                if let Ok(value) = trimmed.parse::<i64>() {
                    return Ok(TypedValue::Int(value));
                }
                match trimmed.parse::<f64>() {
                    Ok(value) if value.is_finite() => Ok(TypedValue::Int(value.trunc() as i64)),
                    _ => Err(invalid()),
                }
            }
            FieldType::Float => match trimmed.parse::<f64>() {
                Ok(value) if value.is_finite() => Ok(TypedValue::Float(value)),
                _ => Err(invalid()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(ein: &str, period: &str, form: &str) -> ManifestEntry {
        ManifestEntry {
            identity_key: ein.to_string(),
            resource_locator: format!("https://example.test/{ein}_public.xml"),
            reporting_period: period.to_string(),
            form_type: form.to_string(),
        }
    }

    #[test]
    fn manifest_accepts_remote_index_field_names_and_filters_form_type() {
        let text = r#"{"Filings2017": [
            {"EIN": "010000001", "URL": "https://x/1.xml", "TaxPeriod": "201612", "FormType": "990", "OrganizationName": "A"},
            {"EIN": "010000002", "URL": "https://x/2.xml", "TaxPeriod": "201606", "FormType": "990EZ"},
            {"EIN": "010000003", "URL": "https://x/3.xml", "TaxPeriod": "201606", "FormType": "990"}
        ]}"#;
        let manifest = Manifest::from_json_str(text, 2017, Some("990")).unwrap();
        assert_eq!(manifest.len(), 2);
        assert_eq!(manifest.entries()[0].identity_key, "010000001");
        assert_eq!(manifest.entries()[1].resource_locator, "https://x/3.xml");

        let unfiltered = Manifest::from_json_str(text, 2017, None).unwrap();
        assert_eq!(unfiltered.len(), 3);
    }

    #[test]
    fn manifest_accepts_plain_arrays_and_rejects_ambiguous_objects() {
        let text = r#"[{"identity_key": "1", "resource_locator": "u", "reporting_period": "201912", "form_type": "990"}]"#;
        assert_eq!(Manifest::from_json_str(text, 2019, None).unwrap().len(), 1);

        let two = r#"{"Filings2018": [], "Filings2019": []}"#;
        assert!(matches!(
            Manifest::from_json_str(two, 2019, None),
            Err(ManifestError::Shape(2))
        ));
    }

    #[test]
    fn expected_filing_year_rolls_back_fiscal_years() {
        assert_eq!(entry("1", "201812", "990").expected_filing_year(), Some(2018));
        assert_eq!(entry("1", "201806", "990").expected_filing_year(), Some(2017));
        assert_eq!(entry("1", "201801", "990").expected_filing_year(), Some(2017));
        assert_eq!(entry("1", "2018", "990").expected_filing_year(), None);
        assert_eq!(entry("1", "201813", "990").expected_filing_year(), None);
    }

    #[test]
    fn group_plan_keeps_the_final_partial_group() {
        let plan = GroupPlan::new(2500, 1000);
        assert_eq!(plan.group_count(), 3);
        assert_eq!(plan.range(0), Some(0..1000));
        assert_eq!(plan.range(2), Some(2000..2500));
        assert_eq!(plan.expected_rows(2), Some(500));
        assert_eq!(plan.range(3), None);
    }

    #[test]
    fn group_plan_exact_multiple_has_no_trailing_empty_group() {
        let plan = GroupPlan::new(2000, 1000);
        assert_eq!(plan.group_count(), 2);
        assert_eq!(plan.ordinals().collect::<Vec<_>>(), vec![0, 1]);
        assert_eq!(GroupPlan::new(0, 1000).group_count(), 0);
    }

    #[test]
    fn manifest_groups_follow_insertion_order() {
        let entries = (0..5).map(|i| entry(&i.to_string(), "201912", "990")).collect();
        let manifest = Manifest::new(2019, entries);
        let plan = GroupPlan::new(manifest.len(), 2);
        let last = manifest.group(&plan, 2).unwrap();
        assert_eq!(last.len(), 1);
        assert_eq!(last[0].identity_key, "4");
        assert!(manifest.group(&plan, 3).is_none());
    }

    #[test]
    fn coercion_follows_declared_types() {
        let text = |s: &str| RawValue::Text(s.to_string());

        assert_eq!(FieldType::Int.coerce(&text(" 42 ")).unwrap(), TypedValue::Int(42));
        assert_eq!(FieldType::Int.coerce(&text("12.9")).unwrap(), TypedValue::Int(12));
        assert_eq!(FieldType::Int.coerce(&RawValue::Absent).unwrap(), TypedValue::Int(0));
        assert!(FieldType::Int.coerce(&text("n/a")).is_err());

        assert_eq!(FieldType::Float.coerce(&text("1.5")).unwrap(), TypedValue::Float(1.5));
        assert_eq!(FieldType::Float.coerce(&RawValue::Absent).unwrap(), TypedValue::Float(0.0));

        assert_eq!(
            FieldType::Str.coerce(&RawValue::Absent).unwrap(),
            TypedValue::Str("0".to_string())
        );

        assert_eq!(FieldType::Bool.coerce(&text("1")).unwrap(), TypedValue::Bool(true));
        assert_eq!(FieldType::Bool.coerce(&text("true")).unwrap(), TypedValue::Bool(true));
        assert_eq!(FieldType::Bool.coerce(&text("X")).unwrap(), TypedValue::Bool(false));
        assert_eq!(FieldType::Bool.coerce(&RawValue::Absent).unwrap(), TypedValue::Bool(false));
    }

    #[test]
    fn missing_record_is_all_zero() {
        let schema = SchemaTable::builtin().unwrap();
        let record = ParsedRecord::missing(&schema);
        assert_eq!(record.values.len(), schema.fields().len());
        assert!(record.values.iter().all(|v| v.raw == RawValue::Absent));
        assert_eq!(record.officer_compensation, [0; OFFICER_SLOTS]);
        assert_eq!(record.get("ein").map(ToString::to_string).as_deref(), Some("0"));
    }
}
