//! Borrower identity resolution and cross-document aggregation.
//!
//! Fields are grouped under a borrower key, then every field name is merged
//! independently: the highest-confidence value wins, ties go to the most
//! recent extraction, then to the lexically smallest document id and value.
//! Losing values are kept as alternatives and every source reference is
//! retained.
//!
//! Aggregation is a pure function of the field set. Running it twice over
//! the same fields yields a byte-identical serialized record.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use similar::TextDiff;
use uuid::Uuid;

use underwrite_core::defaults::{
    FIELD_ACCOUNT_NUMBER, FIELD_ADDRESS, FIELD_BORROWER_NAME, FIELD_INCOME,
};
use underwrite_core::{
    AggregatedField, AlternativeValue, Borrower, CandidateField, ExtractedField, IncomeRecord,
    MatchConfig,
};

const DOCUMENT_KEY_PREFIX: &str = "document:";
const INCOME_TOTAL_LABEL: &str = "total";

/// Normalize a borrower name into a key: lower-cased, punctuation removed,
/// whitespace collapsed. `None` when nothing is left.
pub fn normalize_borrower_key(raw: &str) -> Option<String> {
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect();
    let key = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");
    (!key.is_empty()).then_some(key)
}

/// Key for a document that names no borrower. Never merges with anything.
pub fn document_scoped_key(document_id: Uuid) -> String {
    format!("{}{}", DOCUMENT_KEY_PREFIX, document_id)
}

pub fn is_document_scoped(key: &str) -> bool {
    key.starts_with(DOCUMENT_KEY_PREFIX)
}

/// Character-level similarity ratio in [0, 1].
pub fn similarity(a: &str, b: &str) -> f64 {
    TextDiff::from_chars(a, b).ratio() as f64
}

/// Resolves candidate keys against the keys already known to the store.
///
/// With the default threshold of 1.0 only identical keys merge. Below 1.0 a
/// new key folds into the most similar known key whose ratio reaches the
/// threshold; ties pick the lexically smallest key.
#[derive(Debug, Clone)]
pub struct BorrowerMatcher {
    config: MatchConfig,
    known: BTreeSet<String>,
}

impl BorrowerMatcher {
    pub fn new(config: MatchConfig, known: impl IntoIterator<Item = String>) -> Self {
        Self {
            config,
            known: known.into_iter().collect(),
        }
    }

    pub fn resolve(&mut self, candidate: &str) -> String {
        if self.known.contains(candidate) {
            return candidate.to_string();
        }
        if !self.config.is_exact() && !is_document_scoped(candidate) {
            let mut best: Option<(&String, f64)> = None;
            for known in self.known.iter().filter(|k| !is_document_scoped(k)) {
                let ratio = similarity(candidate, known);
                if ratio >= self.config.threshold && best.map_or(true, |(_, r)| ratio > r) {
                    best = Some((known, ratio));
                }
            }
            if let Some((key, _)) = best {
                return key.clone();
            }
        }
        self.known.insert(candidate.to_string());
        candidate.to_string()
    }
}

/// Assign a borrower key to every field of one document.
///
/// A field's own borrower hint wins; otherwise the document's best
/// `borrower_name` value keys it; a document naming nobody gets a
/// document-scoped key.
pub fn assign_keys(
    document_id: Uuid,
    fields: &[CandidateField],
    matcher: &mut BorrowerMatcher,
) -> Vec<String> {
    let document_name = fields
        .iter()
        .filter(|f| f.name == FIELD_BORROWER_NAME)
        .filter_map(|f| normalize_borrower_key(&f.value).map(|k| (f.confidence, k)))
        .max_by(|a, b| a.0.total_cmp(&b.0).then_with(|| b.1.cmp(&a.1)))
        .map(|(_, key)| key);

    let default_key = match document_name {
        Some(name) => matcher.resolve(&name),
        None => document_scoped_key(document_id),
    };

    fields
        .iter()
        .map(|f| {
            match f.borrower.as_deref().and_then(normalize_borrower_key) {
                Some(hint) => matcher.resolve(&hint),
                None => default_key.clone(),
            }
        })
        .collect()
}

/// Ranking used for conflict resolution, best first.
fn rank(a: &ExtractedField, b: &ExtractedField) -> Ordering {
    b.confidence
        .total_cmp(&a.confidence)
        .then_with(|| b.extracted_at.cmp(&a.extracted_at))
        .then_with(|| a.document_id.cmp(&b.document_id))
        .then_with(|| a.value.cmp(&b.value))
        .then_with(|| a.source.cmp(&b.source))
}

fn merge(mut group: Vec<&ExtractedField>) -> Option<AggregatedField> {
    group.sort_by(|a, b| rank(a, b));
    let winner = *group.first()?;

    let mut seen = BTreeSet::new();
    let alternatives = group
        .iter()
        .filter(|f| f.value != winner.value)
        .filter(|f| seen.insert((f.value.clone(), f.document_id)))
        .map(|f| AlternativeValue {
            value: f.value.clone(),
            confidence: f.confidence,
            document_id: f.document_id,
        })
        .collect();

    let sources: BTreeSet<_> = group.iter().map(|f| f.source.clone()).collect();

    Some(AggregatedField {
        value: winner.value.clone(),
        confidence: winner.confidence,
        sources: sources.into_iter().collect(),
        alternatives,
    })
}

fn account_identity(value: &str) -> String {
    value
        .chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

fn income_label(field_name: &str) -> Option<&str> {
    if field_name == FIELD_INCOME {
        return Some(INCOME_TOTAL_LABEL);
    }
    field_name
        .strip_prefix(FIELD_INCOME)
        .and_then(|rest| rest.strip_prefix(':'))
        .map(str::trim)
        .filter(|label| !label.is_empty())
}

/// Σc² / Σc over winning entries, 0.0 when there are none.
pub fn overall_confidence<'a>(winners: impl IntoIterator<Item = &'a AggregatedField>) -> f64 {
    let (sum_sq, sum) = winners
        .into_iter()
        .fold((0.0, 0.0), |(sq, s), f| (sq + f.confidence * f.confidence, s + f.confidence));
    if sum > 0.0 {
        sum_sq / sum
    } else {
        0.0
    }
}

/// Rebuild the borrower record for `key` from its current fields.
///
/// Returns `None` when no field belongs to the borrower any more.
pub fn aggregate(
    key: &str,
    fields: &[ExtractedField],
    created_at: DateTime<Utc>,
) -> Option<Borrower> {
    let mut by_name: BTreeMap<&str, Vec<&ExtractedField>> = BTreeMap::new();
    for field in fields.iter().filter(|f| f.borrower_key == key) {
        by_name.entry(field.field_name.as_str()).or_default().push(field);
    }
    if by_name.is_empty() {
        return None;
    }

    let mut name = None;
    let mut address = None;
    let mut accounts: BTreeMap<String, Vec<&ExtractedField>> = BTreeMap::new();
    let mut income: BTreeMap<String, Vec<&ExtractedField>> = BTreeMap::new();
    let mut other_fields = BTreeMap::new();

    for (field_name, group) in by_name {
        if field_name == FIELD_BORROWER_NAME {
            name = merge(group);
        } else if field_name == FIELD_ADDRESS {
            address = merge(group);
        } else if field_name == FIELD_ACCOUNT_NUMBER {
            for f in group {
                accounts.entry(account_identity(&f.value)).or_default().push(f);
            }
        } else if let Some(label) = income_label(field_name) {
            income.entry(label.to_string()).or_default().extend(group);
        } else if let Some(merged) = merge(group) {
            other_fields.insert(field_name.to_string(), merged);
        }
    }

    let account_numbers: Vec<AggregatedField> = accounts.into_values().filter_map(merge).collect();
    let income: Vec<IncomeRecord> = income
        .into_iter()
        .filter_map(|(label, group)| merge(group).map(|field| IncomeRecord { label, field }))
        .collect();

    let overall = overall_confidence(
        name.iter()
            .chain(address.iter())
            .chain(account_numbers.iter())
            .chain(income.iter().map(|r| &r.field))
            .chain(other_fields.values()),
    );

    Some(Borrower {
        key: key.to_string(),
        name,
        address,
        account_numbers,
        income,
        other_fields,
        overall_confidence: overall,
        created_at,
    })
}
