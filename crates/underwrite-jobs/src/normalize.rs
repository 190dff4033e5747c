//! Oracle output normalization.
//!
//! Both extraction methods share one output contract, but backends are
//! sloppy: padded values, confidences outside [0, 1], fields attributed to
//! pages they also reported as failed. Everything downstream of this module
//! can rely on clean candidates.

use std::collections::BTreeSet;

use tracing::trace;

use underwrite_core::defaults::SNIPPET_MAX_CHARS;
use underwrite_core::{CandidateField, OracleOutput, PartialExtractionWarning};

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedOutput {
    pub fields: Vec<CandidateField>,
    pub page_count: Option<u32>,
    pub warning: Option<PartialExtractionWarning>,
    /// Candidates discarded during normalization.
    pub dropped: usize,
}

/// Clean an oracle response. `probed_pages` fills in the page count when the
/// backend did not report one.
pub fn normalize(output: OracleOutput, probed_pages: Option<u32>) -> NormalizedOutput {
    let page_count = output.page_count.or(probed_pages).filter(|&n| n > 0);
    let failed: BTreeSet<u32> = output.pages_failed.iter().copied().collect();
    let total = output.fields.len();

    let fields: Vec<CandidateField> = output
        .fields
        .into_iter()
        .filter_map(|field| clean_field(field, page_count, &failed))
        .collect();

    NormalizedOutput {
        dropped: total - fields.len(),
        fields,
        page_count,
        warning: PartialExtractionWarning::from_pages(output.pages_failed),
    }
}

fn clean_field(
    field: CandidateField,
    page_count: Option<u32>,
    failed: &BTreeSet<u32>,
) -> Option<CandidateField> {
    let name = field.name.trim().to_lowercase();
    let value = field.value.trim().to_string();
    if name.is_empty() || value.is_empty() {
        trace!(field = %field.name, "Dropping field with empty name or value");
        return None;
    }
    if field.page == 0 || page_count.is_some_and(|n| field.page > n) || failed.contains(&field.page)
    {
        trace!(field = %name, page = field.page, "Dropping field on invalid or failed page");
        return None;
    }

    let snippet = match field.snippet.trim() {
        "" => value.clone(),
        s => s.to_string(),
    };

    Some(CandidateField {
        confidence: clamp_confidence(field.confidence),
        snippet: truncate_chars(&snippet, SNIPPET_MAX_CHARS),
        section: non_empty(field.section),
        borrower: non_empty(field.borrower),
        page: field.page,
        name,
        value,
    })
}

pub(crate) fn clamp_confidence(c: f64) -> f64 {
    if c.is_nan() {
        0.0
    } else {
        c.clamp(0.0, 1.0)
    }
}

fn non_empty(s: Option<String>) -> Option<String> {
    s.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}
