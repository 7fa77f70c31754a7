//! Structural extraction of e-file returns into [`ParsedRecord`]s.

use std::sync::Arc;

use efile_core::{
    FieldValue, ParsedRecord, PathSet, RawValue, SchemaField, SchemaTable, OFFICER_SLOTS,
};
use roxmltree::{Document, Node};
use thiserror::Error;

pub mod verify;

pub use verify::{VerificationOutcome, Verifier};

/// The 2013 transition schemas named the business-name line without the
/// `Txt` suffix that later versions carry.
const TRANSITION_YEAR: i32 = 2013;
const TRANSITION_FIELD: &str = "organization_name";
const TRANSITION_SUFFIX: &str = "Txt";

const VERSION_ATTRIBUTE: &str = "returnVersion";

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("document is not valid UTF-8: {0}")]
    Encoding(#[from] std::str::Utf8Error),
    #[error("malformed XML: {0}")]
    Xml(#[from] roxmltree::Error),
    #[error("remote returned an error document instead of a return")]
    ErrorDocument,
    #[error("root element has no returnVersion attribute")]
    MissingVersion,
    #[error("unreadable returnVersion `{0}`")]
    InvalidVersion(String),
    #[error("officer compensation `{0}` is not an integer amount")]
    InvalidCompensation(String),
}

#[derive(Debug, Clone)]
pub struct DocumentParser {
    schema: Arc<SchemaTable>,
}

impl DocumentParser {
    pub fn new(schema: Arc<SchemaTable>) -> Self {
        Self { schema }
    }

    pub fn schema(&self) -> &Arc<SchemaTable> {
        &self.schema
    }

    pub fn parse(&self, raw: &[u8]) -> Result<ParsedRecord, ParseError> {
        let text = std::str::from_utf8(raw)?;
        let document = Document::parse(text.trim_start_matches('\u{feff}'))?;
        let root = document.root_element();
        if root.tag_name().name() == "Error" {
            return Err(ParseError::ErrorDocument);
        }

        let version = schema_version(root)?;
        let path_set = PathSet::for_version(version);

        let values = self
            .schema
            .fields()
            .iter()
            .map(|field| FieldValue {
                name: field.name.clone(),
                field_type: field.field_type,
                raw: select_text(root, field_path(field, version))
                    .map(RawValue::Text)
                    .unwrap_or(RawValue::Absent),
            })
            .collect();

        let officer_path = self.schema.officer_compensation.path(path_set);
        let officer_compensation = officer_vector(root, officer_path)?;

        Ok(ParsedRecord {
            values,
            officer_compensation,
        })
    }
}

/// Year prefix of the root `returnVersion` attribute, e.g. `2013v3.0` -> 2013.
pub fn schema_version(root: Node<'_, '_>) -> Result<i32, ParseError> {
    let declared = root
        .attribute(VERSION_ATTRIBUTE)
        .ok_or(ParseError::MissingVersion)?;
    let digits: String = declared
        .trim()
        .chars()
        .take_while(char::is_ascii_digit)
        .collect();
    if digits.len() != 4 {
        return Err(ParseError::InvalidVersion(declared.to_string()));
    }
    digits
        .parse()
        .map_err(|_| ParseError::InvalidVersion(declared.to_string()))
}

/// Extraction path for `field` in a document of `version`.
pub fn field_path(field: &SchemaField, version: i32) -> &str {
    let path = field.path(PathSet::for_version(version));
    if version == TRANSITION_YEAR && field.name == TRANSITION_FIELD {
        return path.strip_suffix(TRANSITION_SUFFIX).unwrap_or(path);
    }
    path
}

/// Every element reached by `path` from `root`, in document order. Steps
/// match on local name within the root element's namespace.
pub fn select_all<'a, 'input>(root: Node<'a, 'input>, path: &str) -> Vec<Node<'a, 'input>> {
    let namespace = root.tag_name().namespace();
    let mut frontier = vec![root];
    for step in path.split('/').filter(|s| !s.is_empty()) {
        frontier = frontier
            .iter()
            .flat_map(|node| node.children())
            .filter(|child| {
                child.is_element()
                    && child.tag_name().name() == step
                    && child.tag_name().namespace() == namespace
            })
            .collect();
        if frontier.is_empty() {
            break;
        }
    }
    frontier
}

/// Trimmed text of the first element at `path`; empty text counts as absent.
pub fn select_text(root: Node<'_, '_>, path: &str) -> Option<String> {
    select_all(root, path)
        .into_iter()
        .next()
        .and_then(|node| node.text())
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(str::to_string)
}

fn officer_vector(root: Node<'_, '_>, path: &str) -> Result<[i64; OFFICER_SLOTS], ParseError> {
    let mut amounts = select_all(root, path)
        .into_iter()
        .map(|node| {
            let text = node.text().map(str::trim).unwrap_or_default();
            if text.is_empty() {
                return Ok(0);
            }
            text.parse::<i64>()
                .map_err(|_| ParseError::InvalidCompensation(text.to_string()))
        })
        .collect::<Result<Vec<_>, _>>()?;
    amounts.sort_unstable_by(|a, b| b.cmp(a));

    let mut slots = [0; OFFICER_SLOTS];
    for (slot, amount) in slots.iter_mut().zip(amounts) {
        *slot = amount;
    }
    Ok(slots)
}
