//! Static field-to-path table governing extraction from e-file returns.

use std::collections::HashSet;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// First `returnVersion` year that uses the current path-set.
pub const CURRENT_PATHS_FROM: i32 = 2013;

const BUILTIN_SCHEMA: &str = include_str!("../schema/fields.yaml");

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("reading schema table {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing schema table: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("schema table declares no fields")]
    Empty,
    #[error("field `{0}` is declared more than once")]
    DuplicateField(String),
    #[error("{role} field `{name}` is not declared in the table")]
    UnknownField { role: &'static str, name: String },
    #[error("field `{0}` has an empty extraction path")]
    EmptyPath(String),
}

/// Declared column type of a logical field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Int,
    Float,
    Str,
    Bool,
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldType::Int => "int",
            FieldType::Float => "float",
            FieldType::Str => "str",
            FieldType::Bool => "bool",
        };
        f.pad(name)
    }
}

/// Which of the two path columns applies to a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathSet {
    Legacy,
    Current,
}

impl PathSet {
    pub fn for_version(version: i32) -> Self {
        if version < CURRENT_PATHS_FROM {
            PathSet::Legacy
        } else {
            PathSet::Current
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaField {
    pub name: String,
    pub category: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    pub legacy_path: String,
    pub current_path: String,
}

impl SchemaField {
    pub fn path(&self, set: PathSet) -> &str {
        match set {
            PathSet::Legacy => &self.legacy_path,
            PathSet::Current => &self.current_path,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfficerPaths {
    pub legacy_path: String,
    pub current_path: String,
}

impl OfficerPaths {
    pub fn path(&self, set: PathSet) -> &str {
        match set {
            PathSet::Legacy => &self.legacy_path,
            PathSet::Current => &self.current_path,
        }
    }
}

/// Immutable extraction table. Load once and share behind an `Arc`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaTable {
    pub version: u32,
    pub identity_field: String,
    pub tax_year_field: String,
    pub officer_compensation: OfficerPaths,
    fields: Vec<SchemaField>,
}

impl SchemaTable {
    /// The table shipped with the crate.
    pub fn builtin() -> Result<Self, SchemaError> {
        Self::from_yaml_str(BUILTIN_SCHEMA)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, SchemaError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| SchemaError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&text)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, SchemaError> {
        let table: SchemaTable = serde_yaml::from_str(text)?;
        table.validate()?;
        Ok(table)
    }

    pub fn fields(&self) -> &[SchemaField] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&SchemaField> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn fields_in_category<'a>(&'a self, category: &'a str) -> impl Iterator<Item = &'a SchemaField> {
        self.fields.iter().filter(move |f| f.category == category)
    }

    fn validate(&self) -> Result<(), SchemaError> {
        if self.fields.is_empty() {
            return Err(SchemaError::Empty);
        }

        let mut seen = HashSet::new();
        for field in &self.fields {
            if !seen.insert(field.name.as_str()) {
                return Err(SchemaError::DuplicateField(field.name.clone()));
            }
            if field.legacy_path.trim().is_empty() || field.current_path.trim().is_empty() {
                return Err(SchemaError::EmptyPath(field.name.clone()));
            }
        }

        for (role, name) in [
            ("identity", &self.identity_field),
            ("tax year", &self.tax_year_field),
        ] {
            if !seen.contains(name.as_str()) {
                return Err(SchemaError::UnknownField {
                    role,
                    name: name.clone(),
                });
            }
        }

        if self.officer_compensation.legacy_path.trim().is_empty()
            || self.officer_compensation.current_path.trim().is_empty()
        {
            return Err(SchemaError::EmptyPath("officer_compensation".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
version: 1
identity_field: ein
tax_year_field: tax_year
officer_compensation:
  legacy_path: A/Officer/Comp
  current_path: A/OfficerGrp/CompAmt
fields:
  - { name: ein, category: header, type: str, legacy_path: H/EIN, current_path: H/EIN }
  - { name: tax_year, category: header, type: int, legacy_path: H/TaxYear, current_path: H/TaxYr }
"#;

    #[test]
    fn builtin_table_loads_and_names_identity_fields() {
        let table = SchemaTable::builtin().unwrap();
        assert!(table.field(&table.identity_field).is_some());
        assert!(table.field(&table.tax_year_field).is_some());
        assert_eq!(
            table.field("organization_name").unwrap().current_path,
            "ReturnHeader/Filer/BusinessName/BusinessNameLine1Txt"
        );
        assert!(table.fields_in_category("revenue").count() >= 5);
        assert!(table.fields().iter().any(|f| f.field_type == FieldType::Float));
        assert!(table.fields().iter().any(|f| f.field_type == FieldType::Bool));
    }

    #[test]
    fn path_set_switches_at_2013() {
        assert_eq!(PathSet::for_version(2012), PathSet::Legacy);
        assert_eq!(PathSet::for_version(2013), PathSet::Current);
        assert_eq!(PathSet::for_version(2019), PathSet::Current);

        let table = SchemaTable::from_yaml_str(MINIMAL).unwrap();
        let tax_year = table.field("tax_year").unwrap();
        assert_eq!(tax_year.path(PathSet::Legacy), "H/TaxYear");
        assert_eq!(tax_year.path(PathSet::Current), "H/TaxYr");
    }

    #[test]
    fn duplicate_fields_are_rejected() {
        let text = MINIMAL.replace("name: tax_year", "name: ein");
        let err = SchemaTable::from_yaml_str(&text).unwrap_err();
        assert!(matches!(err, SchemaError::DuplicateField(name) if name == "ein"));
    }

    #[test]
    fn identity_field_must_exist() {
        let text = MINIMAL.replace("identity_field: ein", "identity_field: filer_id");
        let err = SchemaTable::from_yaml_str(&text).unwrap_err();
        assert!(matches!(err, SchemaError::UnknownField { role: "identity", .. }));
    }

    #[test]
    fn schema_file_can_be_loaded_from_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("fields.yaml");
        std::fs::write(&path, MINIMAL).expect("write schema");
        let table = SchemaTable::load(&path).unwrap();
        assert_eq!(table.fields().len(), 2);
        assert!(matches!(
            SchemaTable::load(dir.path().join("absent.yaml")),
            Err(SchemaError::Read { .. })
        ));
    }
}
