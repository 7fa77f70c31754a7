//! Cross-checks between a parsed record and the manifest entry it came from.

use std::sync::Arc;

use efile_core::{ManifestEntry, ParsedRecord, SchemaTable};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationOutcome {
    Ok,
    /// The document belongs to another organization. Fatal to the document.
    IdentityMismatch {
        expected: String,
        found: Option<String>,
    },
    /// Declared tax year is outside the window implied by the reporting
    /// period. Advisory only.
    PeriodMismatch {
        reporting_period: String,
        tax_year: Option<String>,
    },
}

impl VerificationOutcome {
    pub fn is_fatal(&self) -> bool {
        matches!(self, VerificationOutcome::IdentityMismatch { .. })
    }
}

#[derive(Debug, Clone)]
pub struct Verifier {
    schema: Arc<SchemaTable>,
}

impl Verifier {
    pub fn new(schema: Arc<SchemaTable>) -> Self {
        Self { schema }
    }

    pub fn verify(&self, record: &ParsedRecord, entry: &ManifestEntry) -> VerificationOutcome {
        let identity = record
            .get(&self.schema.identity_field)
            .and_then(|raw| raw.as_text())
            .map(str::trim);
        if identity != Some(entry.identity_key.trim()) {
            return VerificationOutcome::IdentityMismatch {
                expected: entry.identity_key.clone(),
                found: identity.map(str::to_string),
            };
        }

        let tax_year_text = record
            .get(&self.schema.tax_year_field)
            .and_then(|raw| raw.as_text())
            .map(str::trim);
        let tax_year = tax_year_text.and_then(|t| t.parse::<i32>().ok());
        let in_window = match (entry.expected_filing_year(), tax_year) {
            (Some(expected), Some(declared)) => (declared - expected).abs() <= 1,
            _ => false,
        };
        if !in_window {
            return VerificationOutcome::PeriodMismatch {
                reporting_period: entry.reporting_period.clone(),
                tax_year: tax_year_text.map(str::to_string),
            };
        }

        VerificationOutcome::Ok
    }
}
