//! Structured logging schema and field name constants.
//!
//! All crates use these constants for consistent structured logging fields
//! so log aggregation tools can query by standardized names across every
//! subsystem.
//!
//! ## Log Level Contract
//!
//! | Level | Usage |
//! |-------|-------|
//! | ERROR | Degraded service, requires operator attention |
//! | WARN  | Recoverable issue, retry or fallback applied |
//! | INFO  | Lifecycle events (startup, shutdown), document completions |
//! | DEBUG | Decision points (method/OCR selection, backoff), config choices |
//! | TRACE | Per-item iteration (fields, pages) |

// ─── Identity fields ───────────────────────────────────────────────────────

/// Correlation ID propagated across request → task → oracle call.
pub const REQUEST_ID: &str = "request_id";

/// Subsystem originating the log event.
/// Values: "api", "db", "oracle", "jobs"
pub const SUBSYSTEM: &str = "subsystem";

/// Component within a subsystem.
/// Examples: "queue", "orchestrator", "aggregation", "worker"
pub const COMPONENT: &str = "component";

// ─── Entity fields ─────────────────────────────────────────────────────────

/// Document UUID being operated on.
pub const DOCUMENT_ID: &str = "document_id";

/// Extraction task UUID.
pub const TASK_ID: &str = "task_id";

/// Extraction run UUID (one per lease).
pub const RUN_ID: &str = "run_id";

/// Normalized borrower key.
pub const BORROWER_KEY: &str = "borrower_key";

// ─── Extraction fields ─────────────────────────────────────────────────────

/// Attempt number of the current task (1-based).
pub const ATTEMPT: &str = "attempt";

/// Extraction method chosen ("structural", "span").
pub const METHOD: &str = "method";

/// Whether OCR ran before extraction.
pub const OCR: &str = "ocr";

/// Number of fields produced by a run.
pub const FIELD_COUNT: &str = "field_count";

// ─── Measurement fields ────────────────────────────────────────────────────

/// Wall-clock duration in milliseconds.
pub const DURATION_MS: &str = "duration_ms";

/// Retry delay in milliseconds.
pub const DELAY_MS: &str = "delay_ms";

// ─── Outcome fields ────────────────────────────────────────────────────────

/// Error message when an operation fails.
pub const ERROR_MSG: &str = "error";
