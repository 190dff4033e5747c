//! Domain models for documents, extracted fields and borrowers.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::status::DocumentStatus;

// =============================================================================
// DOCUMENTS
// =============================================================================

/// File types the pipeline accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    Pdf,
    Png,
    Jpeg,
    Tiff,
    Text,
}

impl FileType {
    /// Parse from a MIME type (`application/pdf`) or a bare extension (`pdf`).
    pub fn parse(value: &str) -> Result<Self> {
        let v = value.trim().to_lowercase();
        let v = v.trim_start_matches('.');
        match v {
            "pdf" | "application/pdf" => Ok(FileType::Pdf),
            "png" | "image/png" => Ok(FileType::Png),
            "jpg" | "jpeg" | "image/jpeg" => Ok(FileType::Jpeg),
            "tif" | "tiff" | "image/tiff" => Ok(FileType::Tiff),
            "txt" | "text" | "text/plain" => Ok(FileType::Text),
            other => Err(Error::InvalidInput(format!(
                "Unsupported file type: {}",
                other
            ))),
        }
    }

    /// Raster images carry no native text layer.
    pub fn is_image(self) -> bool {
        matches!(self, FileType::Png | FileType::Jpeg | FileType::Tiff)
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            FileType::Pdf => "application/pdf",
            FileType::Png => "image/png",
            FileType::Jpeg => "image/jpeg",
            FileType::Tiff => "image/tiff",
            FileType::Text => "text/plain",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FileType::Pdf => "pdf",
            FileType::Png => "png",
            FileType::Jpeg => "jpeg",
            FileType::Tiff => "tiff",
            FileType::Text => "text",
        }
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        FileType::parse(s)
    }
}

/// A loan document known to the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: Uuid,
    pub filename: String,
    pub file_type: FileType,
    pub size_bytes: Option<i64>,
    /// Hex-encoded SHA-256 of the blob, when the uploader supplied one.
    pub content_hash: Option<String>,
    pub storage_locator: String,
    pub status: DocumentStatus,
    pub page_count: Option<i32>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Upload trigger payload. The blob must already be durably stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub document_id: Uuid,
    pub storage_locator: String,
    pub file_type: FileType,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub size_bytes: Option<i64>,
    #[serde(default)]
    pub content_hash: Option<String>,
    #[serde(default)]
    pub method_hint: Option<MethodPreference>,
}

impl SubmitRequest {
    pub fn new(
        document_id: Uuid,
        storage_locator: impl Into<String>,
        file_type: FileType,
    ) -> Self {
        Self {
            document_id,
            storage_locator: storage_locator.into(),
            file_type,
            filename: None,
            size_bytes: None,
            content_hash: None,
            method_hint: None,
        }
    }

    pub fn with_content_hash(mut self, hash: impl Into<String>) -> Self {
        self.content_hash = Some(hash.into());
        self
    }

    pub fn with_method_hint(mut self, hint: MethodPreference) -> Self {
        self.method_hint = Some(hint);
        self
    }

    /// Filename to record: explicit, else the last locator segment.
    pub fn resolved_filename(&self) -> String {
        self.filename.clone().unwrap_or_else(|| {
            self.storage_locator
                .rsplit(['/', '\\'])
                .next()
                .filter(|s| !s.is_empty())
                .unwrap_or(&self.storage_locator)
                .to_string()
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.storage_locator.trim().is_empty() {
            return Err(Error::InvalidInput(
                "storage_locator must not be empty".to_string(),
            ));
        }
        if let Some(size) = self.size_bytes {
            if size < 0 {
                return Err(Error::InvalidInput(
                    "size_bytes must not be negative".to_string(),
                ));
            }
        }
        if let Some(ref hash) = self.content_hash {
            if hash.len() != 64 || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(Error::InvalidInput(
                    "content_hash must be a hex-encoded SHA-256 digest".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Acknowledgement returned by `submit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submitted {
    pub document_id: Uuid,
    pub task_id: Uuid,
}

/// Read-only status projection served to pollers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentStatusView {
    pub document_id: Uuid,
    pub status: DocumentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_count: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Suggested delay before the next poll; absent once terminal.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poll_after_secs: Option<u64>,
}

impl From<&Document> for DocumentStatusView {
    fn from(doc: &Document) -> Self {
        Self {
            document_id: doc.id,
            status: doc.status,
            page_count: doc.page_count,
            error_message: doc.error_message.clone(),
            poll_after_secs: doc
                .status
                .is_poll_eligible()
                .then_some(crate::defaults::STATUS_POLL_INTERVAL_SECS),
        }
    }
}

// =============================================================================
// EXTRACTION METHOD SELECTION
// =============================================================================

/// The two interchangeable extraction backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractionMethod {
    /// Page-level structural parsing (docling).
    Structural,
    /// Character-level span extraction with exact offsets (langextract).
    Span,
}

impl fmt::Display for ExtractionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExtractionMethod::Structural => write!(f, "structural"),
            ExtractionMethod::Span => write!(f, "span"),
        }
    }
}

/// Configured method preference.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MethodPreference {
    #[default]
    Auto,
    #[serde(alias = "docling")]
    Structural,
    #[serde(alias = "langextract")]
    Span,
}

impl FromStr for MethodPreference {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "auto" => Ok(MethodPreference::Auto),
            "docling" | "structural" => Ok(MethodPreference::Structural),
            "langextract" | "span" => Ok(MethodPreference::Span),
            other => Err(Error::Config(format!(
                "Unknown extraction method '{}' (expected auto, docling or langextract)",
                other
            ))),
        }
    }
}

impl fmt::Display for MethodPreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MethodPreference::Auto => write!(f, "auto"),
            MethodPreference::Structural => write!(f, "docling"),
            MethodPreference::Span => write!(f, "langextract"),
        }
    }
}

/// OCR policy. The orchestrator resolves `Auto` before calling the oracle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OcrMode {
    #[default]
    Auto,
    Force,
    Skip,
}

impl FromStr for OcrMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "auto" => Ok(OcrMode::Auto),
            "force" => Ok(OcrMode::Force),
            "skip" => Ok(OcrMode::Skip),
            other => Err(Error::Config(format!(
                "Unknown OCR mode '{}' (expected auto, force or skip)",
                other
            ))),
        }
    }
}

impl fmt::Display for OcrMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OcrMode::Auto => write!(f, "auto"),
            OcrMode::Force => write!(f, "force"),
            OcrMode::Skip => write!(f, "skip"),
        }
    }
}

/// Native text-layer statistics gathered before extraction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TextLayerStats {
    pub page_count: u32,
    /// Pages whose native text reaches `PAGE_TEXT_MIN_CHARS`.
    pub pages_with_text: u32,
    /// Non-whitespace characters across all pages.
    pub total_chars: u64,
}

impl TextLayerStats {
    /// Stats for input with no text layer at all (scans, photos).
    pub fn no_text(page_count: u32) -> Self {
        Self {
            page_count,
            pages_with_text: 0,
            total_chars: 0,
        }
    }

    /// Fraction of pages with native text, 0.0 for an empty document.
    pub fn coverage(&self) -> f64 {
        if self.page_count == 0 {
            0.0
        } else {
            self.pages_with_text as f64 / self.page_count as f64
        }
    }

    pub fn mean_chars_per_page(&self) -> f64 {
        if self.page_count == 0 {
            0.0
        } else {
            self.total_chars as f64 / self.page_count as f64
        }
    }
}

// =============================================================================
// ORACLE CONTRACT
// =============================================================================

/// A field proposed by the oracle, before normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateField {
    pub name: String,
    pub value: String,
    pub confidence: f64,
    pub page: u32,
    #[serde(default)]
    pub section: Option<String>,
    #[serde(default)]
    pub snippet: String,
    /// Borrower the field belongs to, when the backend attributes it.
    #[serde(default)]
    pub borrower: Option<String>,
}

/// Oracle response. Partial output lists the pages that failed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OracleOutput {
    pub fields: Vec<CandidateField>,
    #[serde(default)]
    pub pages_failed: Vec<u32>,
    #[serde(default)]
    pub page_count: Option<u32>,
}

// =============================================================================
// EXTRACTED FIELDS & PROVENANCE
// =============================================================================

/// Provenance pointer from an extracted value to its origin.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SourceReference {
    pub document_id: Uuid,
    pub page_number: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
    pub snippet: String,
}

/// One normalized field from one extraction run. Never edited after commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedField {
    pub document_id: Uuid,
    pub run_id: Uuid,
    pub borrower_key: String,
    pub field_name: String,
    pub value: String,
    pub confidence: f64,
    pub source: SourceReference,
    pub extracted_at: DateTime<Utc>,
}

// =============================================================================
// BORROWERS
// =============================================================================

/// A losing value for a field, kept for audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlternativeValue {
    pub value: String,
    pub confidence: f64,
    pub document_id: Uuid,
}

/// The merged view of one field across documents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedField {
    pub value: String,
    pub confidence: f64,
    /// Every source observed for this field: winner, corroborating and
    /// conflicting alike.
    pub sources: Vec<SourceReference>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub alternatives: Vec<AlternativeValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncomeRecord {
    pub label: String,
    #[serde(flatten)]
    pub field: AggregatedField,
}

/// Borrower record derived from every document sharing a borrower key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Borrower {
    pub key: String,
    pub name: Option<AggregatedField>,
    pub address: Option<AggregatedField>,
    pub account_numbers: Vec<AggregatedField>,
    /// Ordered by label.
    pub income: Vec<IncomeRecord>,
    /// Any other field names, keyed by name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub other_fields: BTreeMap<String, AggregatedField>,
    pub overall_confidence: f64,
    pub created_at: DateTime<Utc>,
}

impl Borrower {
    /// Documents contributing to this borrower, via field provenance.
    pub fn source_documents(&self) -> Vec<Uuid> {
        let mut ids: Vec<Uuid> = self
            .name
            .iter()
            .chain(self.address.iter())
            .chain(self.account_numbers.iter())
            .chain(self.income.iter().map(|r| &r.field))
            .chain(self.other_fields.values())
            .flat_map(|f| f.sources.iter().map(|s| s.document_id))
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }
}

/// Everything written atomically when a run completes.
#[derive(Debug, Clone)]
pub struct ExtractionCommit {
    pub document_id: Uuid,
    pub run_id: Uuid,
    pub page_count: Option<i32>,
    pub fields: Vec<ExtractedField>,
    /// Partial-extraction warning recorded as the document's error_message.
    pub warning: Option<String>,
    /// Recomputed borrowers replacing their previous records.
    pub borrowers: Vec<Borrower>,
    /// Borrower keys left with no current fields; their records are removed.
    pub retired_borrowers: Vec<String>,
}
