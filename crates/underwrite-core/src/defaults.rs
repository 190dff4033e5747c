//! Centralized default constants for the extraction pipeline.
//!
//! **This module is the single source of truth** for shared default values.
//! Crates reference these constants instead of defining their own magic
//! numbers. Organized by domain area.

// =============================================================================
// SERVER
// =============================================================================

/// Default HTTP server port.
pub const SERVER_PORT: u16 = 3000;

/// Default event broadcast channel capacity.
pub const EVENT_BUS_CAPACITY: usize = 256;

/// Client polling cadence advertised for non-terminal documents (seconds).
pub const STATUS_POLL_INTERVAL_SECS: u64 = 2;

// =============================================================================
// TASK QUEUE
// =============================================================================

/// Maximum extraction attempts per document before it is failed.
pub const QUEUE_MAX_ATTEMPTS: u32 = 5;

/// Backoff before the first retry (milliseconds).
pub const QUEUE_MIN_BACKOFF_MS: u64 = 1_000;

/// Upper bound for any single retry delay (milliseconds).
pub const QUEUE_MAX_BACKOFF_MS: u64 = 60_000;

/// Total window, measured from first enqueue, in which retries may happen.
pub const QUEUE_MAX_RETRY_DURATION_SECS: u64 = 3_600;

/// Concurrency ceiling: leases outstanding at once.
pub const QUEUE_MAX_CONCURRENT: usize = 4;

/// Dispatch rate ceiling (tasks per second).
pub const QUEUE_DISPATCH_RATE: u32 = 2;

/// A dispatched task becomes re-dispatchable after this long without ack.
pub const QUEUE_LEASE_TIMEOUT_SECS: u64 = 300;

// =============================================================================
// WORKER
// =============================================================================

/// Worker idle poll interval in milliseconds.
pub const WORKER_POLL_INTERVAL_MS: u64 = 500;

// =============================================================================
// EXTRACTION
// =============================================================================

/// Upper bound on a single oracle invocation (seconds).
pub const ORACLE_TIMEOUT_SECS: u64 = 120;

/// Native text coverage (pages with text / pages) below which `ocr=auto` OCRs.
pub const OCR_COVERAGE_THRESHOLD: f64 = 0.5;

/// Mean characters per page at which `method=auto` trusts the page layout.
pub const STRUCTURAL_MIN_CHARS_PER_PAGE: f64 = 200.0;

/// A page counts as having native text when it carries at least this many
/// non-whitespace characters.
pub const PAGE_TEXT_MIN_CHARS: usize = 50;

/// Upper bound on reading a document blob (seconds).
pub const BLOB_FETCH_TIMEOUT_SECS: u64 = 60;

/// Per-command timeout for external probing tools (seconds).
pub const PROBE_CMD_TIMEOUT_SECS: u64 = 60;

/// Snippets longer than this are truncated on normalization.
pub const SNIPPET_MAX_CHARS: usize = 280;

/// Default oracle service URL.
pub const ORACLE_URL: &str = "http://127.0.0.1:8088";

// =============================================================================
// AGGREGATION
// =============================================================================

/// Similarity required to merge two borrower keys. 1.0 means exact match.
pub const BORROWER_MATCH_THRESHOLD: f64 = 1.0;

/// Field holding the borrower's name.
pub const FIELD_BORROWER_NAME: &str = "borrower_name";

/// Field holding the borrower's mailing address.
pub const FIELD_ADDRESS: &str = "address";

/// Multi-valued field: one entry per distinct account.
pub const FIELD_ACCOUNT_NUMBER: &str = "account_number";

/// Income field prefix. `income` or `income:<label>`.
pub const FIELD_INCOME: &str = "income";
