//! Pipeline configuration loaded from the environment.
//!
//! Every struct follows the same shape: `Default` from [`crate::defaults`],
//! `from_env()` overriding from environment variables, `with_*` setters for
//! tests and embedding, and `validate()` run once at startup.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::defaults;
use crate::error::{Error, Result};
use crate::models::{MethodPreference, OcrMode};

/// Read and parse an environment variable, `None` when unset or empty.
fn env_parse<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| Error::Config(format!("{}={:?}: {}", key, raw, e))),
        _ => Ok(None),
    }
}

fn env_bool(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|v| !matches!(v.trim().to_lowercase().as_str(), "false" | "0" | "no" | ""))
}

// =============================================================================
// EXTRACTION
// =============================================================================

/// Method and OCR selection policy.
///
/// | Variable | Default |
/// |----------|---------|
/// | `EXTRACTION_METHOD` | `auto` |
/// | `EXTRACTION_OCR` | `auto` |
/// | `EXTRACTION_REQUIRE_CHAR_OFFSETS` | `false` |
/// | `OCR_COVERAGE_THRESHOLD` | `0.5` |
/// | `STRUCTURAL_MIN_CHARS_PER_PAGE` | `200` |
/// | `ORACLE_TIMEOUT_SECS` | `120` |
/// | `BLOB_FETCH_TIMEOUT_SECS` | `60` |
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionConfig {
    pub method: MethodPreference,
    pub ocr: OcrMode,
    /// Under `method=auto`, prefer span extraction for exact offsets.
    pub require_char_offsets: bool,
    pub ocr_coverage_threshold: f64,
    pub structural_min_chars_per_page: f64,
    pub oracle_timeout: Duration,
    pub blob_timeout: Duration,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            method: MethodPreference::Auto,
            ocr: OcrMode::Auto,
            require_char_offsets: false,
            ocr_coverage_threshold: defaults::OCR_COVERAGE_THRESHOLD,
            structural_min_chars_per_page: defaults::STRUCTURAL_MIN_CHARS_PER_PAGE,
            oracle_timeout: Duration::from_secs(defaults::ORACLE_TIMEOUT_SECS),
            blob_timeout: Duration::from_secs(defaults::BLOB_FETCH_TIMEOUT_SECS),
        }
    }
}

impl ExtractionConfig {
    pub fn from_env() -> Result<Self> {
        let base = Self::default();
        Ok(Self {
            method: env_parse("EXTRACTION_METHOD")?.unwrap_or(base.method),
            ocr: env_parse("EXTRACTION_OCR")?.unwrap_or(base.ocr),
            require_char_offsets: env_bool("EXTRACTION_REQUIRE_CHAR_OFFSETS")
                .unwrap_or(base.require_char_offsets),
            ocr_coverage_threshold: env_parse("OCR_COVERAGE_THRESHOLD")?
                .unwrap_or(base.ocr_coverage_threshold),
            structural_min_chars_per_page: env_parse("STRUCTURAL_MIN_CHARS_PER_PAGE")?
                .unwrap_or(base.structural_min_chars_per_page),
            oracle_timeout: env_parse::<u64>("ORACLE_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(base.oracle_timeout),
            blob_timeout: env_parse::<u64>("BLOB_FETCH_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(base.blob_timeout),
        })
    }

    pub fn with_method(mut self, method: MethodPreference) -> Self {
        self.method = method;
        self
    }

    pub fn with_ocr(mut self, ocr: OcrMode) -> Self {
        self.ocr = ocr;
        self
    }

    pub fn with_require_char_offsets(mut self, require: bool) -> Self {
        self.require_char_offsets = require;
        self
    }

    pub fn with_ocr_coverage_threshold(mut self, threshold: f64) -> Self {
        self.ocr_coverage_threshold = threshold;
        self
    }

    pub fn with_structural_min_chars_per_page(mut self, chars: f64) -> Self {
        self.structural_min_chars_per_page = chars;
        self
    }

    pub fn with_oracle_timeout(mut self, timeout: Duration) -> Self {
        self.oracle_timeout = timeout;
        self
    }

    pub fn with_blob_timeout(mut self, timeout: Duration) -> Self {
        self.blob_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.ocr_coverage_threshold) {
            return Err(Error::Config(format!(
                "ocr_coverage_threshold must be within [0, 1], got {}",
                self.ocr_coverage_threshold
            )));
        }
        if !self.structural_min_chars_per_page.is_finite() || self.structural_min_chars_per_page < 0.0
        {
            return Err(Error::Config(
                "structural_min_chars_per_page must be a non-negative number".to_string(),
            ));
        }
        if self.oracle_timeout.is_zero() {
            return Err(Error::Config("oracle_timeout must be positive".to_string()));
        }
        if self.blob_timeout.is_zero() {
            return Err(Error::Config("blob_timeout must be positive".to_string()));
        }
        Ok(())
    }
}

// =============================================================================
// TASK QUEUE
// =============================================================================

/// Retry, rate and concurrency policy for the task queue.
///
/// | Variable | Default |
/// |----------|---------|
/// | `QUEUE_MAX_ATTEMPTS` | `5` |
/// | `QUEUE_MIN_BACKOFF_MS` | `1000` |
/// | `QUEUE_MAX_BACKOFF_MS` | `60000` |
/// | `QUEUE_MAX_RETRY_DURATION_SECS` | `3600` |
/// | `QUEUE_MAX_CONCURRENT` | `4` |
/// | `QUEUE_DISPATCH_RATE` | `2` (tasks/second) |
/// | `QUEUE_LEASE_TIMEOUT_SECS` | `300` |
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    pub max_attempts: u32,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
    pub max_retry_duration: Duration,
    pub max_concurrent: usize,
    pub dispatch_rate: u32,
    pub lease_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: defaults::QUEUE_MAX_ATTEMPTS,
            min_backoff: Duration::from_millis(defaults::QUEUE_MIN_BACKOFF_MS),
            max_backoff: Duration::from_millis(defaults::QUEUE_MAX_BACKOFF_MS),
            max_retry_duration: Duration::from_secs(defaults::QUEUE_MAX_RETRY_DURATION_SECS),
            max_concurrent: defaults::QUEUE_MAX_CONCURRENT,
            dispatch_rate: defaults::QUEUE_DISPATCH_RATE,
            lease_timeout: Duration::from_secs(defaults::QUEUE_LEASE_TIMEOUT_SECS),
        }
    }
}

impl QueueConfig {
    pub fn from_env() -> Result<Self> {
        let base = Self::default();
        Ok(Self {
            max_attempts: env_parse("QUEUE_MAX_ATTEMPTS")?.unwrap_or(base.max_attempts),
            min_backoff: env_parse::<u64>("QUEUE_MIN_BACKOFF_MS")?
                .map(Duration::from_millis)
                .unwrap_or(base.min_backoff),
            max_backoff: env_parse::<u64>("QUEUE_MAX_BACKOFF_MS")?
                .map(Duration::from_millis)
                .unwrap_or(base.max_backoff),
            max_retry_duration: env_parse::<u64>("QUEUE_MAX_RETRY_DURATION_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(base.max_retry_duration),
            max_concurrent: env_parse("QUEUE_MAX_CONCURRENT")?.unwrap_or(base.max_concurrent),
            dispatch_rate: env_parse("QUEUE_DISPATCH_RATE")?.unwrap_or(base.dispatch_rate),
            lease_timeout: env_parse::<u64>("QUEUE_LEASE_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(base.lease_timeout),
        })
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_backoff(mut self, min: Duration, max: Duration) -> Self {
        self.min_backoff = min;
        self.max_backoff = max;
        self
    }

    pub fn with_max_retry_duration(mut self, duration: Duration) -> Self {
        self.max_retry_duration = duration;
        self
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max;
        self
    }

    pub fn with_dispatch_rate(mut self, per_second: u32) -> Self {
        self.dispatch_rate = per_second;
        self
    }

    pub fn with_lease_timeout(mut self, timeout: Duration) -> Self {
        self.lease_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::Config("max_attempts must be at least 1".to_string()));
        }
        if self.max_concurrent == 0 {
            return Err(Error::Config("max_concurrent must be at least 1".to_string()));
        }
        if self.dispatch_rate == 0 {
            return Err(Error::Config("dispatch_rate must be positive".to_string()));
        }
        if self.min_backoff > self.max_backoff {
            return Err(Error::Config(format!(
                "min_backoff ({:?}) exceeds max_backoff ({:?})",
                self.min_backoff, self.max_backoff
            )));
        }
        if self.lease_timeout.is_zero() {
            return Err(Error::Config("lease_timeout must be positive".to_string()));
        }
        Ok(())
    }

    /// A single oracle call must fit in one lease. Runs renew their lease
    /// while in flight, so the other stages are not counted here.
    pub fn validate_against(&self, extraction: &ExtractionConfig) -> Result<()> {
        self.validate()?;
        if self.lease_timeout <= extraction.oracle_timeout {
            return Err(Error::Config(format!(
                "lease_timeout ({}s) must exceed oracle_timeout ({}s)",
                self.lease_timeout.as_secs(),
                extraction.oracle_timeout.as_secs()
            )));
        }
        Ok(())
    }
}

// =============================================================================
// BORROWER MATCHING
// =============================================================================

/// Borrower key matching policy. `BORROWER_MATCH_THRESHOLD`, default `1.0`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MatchConfig {
    /// Similarity ratio in (0, 1]. 1.0 merges only identical keys.
    pub threshold: f64,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            threshold: defaults::BORROWER_MATCH_THRESHOLD,
        }
    }
}

impl MatchConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            threshold: env_parse("BORROWER_MATCH_THRESHOLD")?
                .unwrap_or(defaults::BORROWER_MATCH_THRESHOLD),
        })
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn is_exact(&self) -> bool {
        self.threshold >= 1.0
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.threshold > 0.0 && self.threshold <= 1.0) {
            return Err(Error::Config(format!(
                "borrower match threshold must be within (0, 1], got {}",
                self.threshold
            )));
        }
        Ok(())
    }
}
