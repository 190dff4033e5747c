//! Scripted oracle and probe for deterministic pipeline tests.
//!
//! Responses are scripted per blob. Each call consumes the next scripted
//! step; the last step repeats once the script runs out.
//!
//! ```rust,ignore
//! use underwrite_oracle::mock::{ScriptedOracle, ScriptStep};
//!
//! let oracle = ScriptedOracle::new()
//!     .with_script(b"%PDF-w2", vec![
//!         ScriptStep::fail(OracleError::Timeout(Duration::from_secs(120))),
//!         ScriptStep::ok(output),
//!     ]);
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use underwrite_core::{
    ExtractionMethod, ExtractionOracle, FileType, OcrMode, OracleError, OracleOutput, Result,
    TextLayerProbe, TextLayerStats,
};

fn fingerprint(blob: &[u8]) -> String {
    hex::encode(Sha256::digest(blob))
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// One scripted oracle reply.
#[derive(Debug, Clone)]
pub struct ScriptStep {
    pub delay: Option<Duration>,
    pub result: std::result::Result<OracleOutput, OracleError>,
}

impl ScriptStep {
    pub fn ok(output: OracleOutput) -> Self {
        Self {
            delay: None,
            result: Ok(output),
        }
    }

    pub fn fail(error: OracleError) -> Self {
        Self {
            delay: None,
            result: Err(error),
        }
    }

    /// Sleep before replying (tokio time, so paused clocks apply).
    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// A recorded oracle invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct OracleCall {
    pub fingerprint: String,
    pub file_type: FileType,
    pub method: ExtractionMethod,
    pub ocr: OcrMode,
}

#[derive(Default)]
struct State {
    scripts: HashMap<String, VecDeque<ScriptStep>>,
    calls: Vec<OracleCall>,
    active: HashMap<String, usize>,
    max_active_per_blob: usize,
}

/// Scripted [`ExtractionOracle`].
///
/// When OCR is forced, every returned confidence is scaled by
/// `ocr_confidence_factor` (default 0.8), modelling the lower fidelity of
/// recognized text.
#[derive(Clone)]
pub struct ScriptedOracle {
    state: Arc<Mutex<State>>,
    default_step: ScriptStep,
    ocr_confidence_factor: f64,
}

impl Default for ScriptedOracle {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedOracle {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            default_step: ScriptStep::ok(OracleOutput::default()),
            ocr_confidence_factor: 0.8,
        }
    }

    /// Script the replies for one blob.
    pub fn with_script(self, blob: &[u8], steps: Vec<ScriptStep>) -> Self {
        lock(&self.state)
            .scripts
            .insert(fingerprint(blob), steps.into());
        self
    }

    /// Shorthand for a blob that always succeeds with `output`.
    pub fn with_output(self, blob: &[u8], output: OracleOutput) -> Self {
        self.with_script(blob, vec![ScriptStep::ok(output)])
    }

    /// Reply for blobs without a script.
    pub fn with_default(mut self, step: ScriptStep) -> Self {
        self.default_step = step;
        self
    }

    pub fn with_ocr_confidence_factor(mut self, factor: f64) -> Self {
        self.ocr_confidence_factor = factor;
        self
    }

    pub fn calls(&self) -> Vec<OracleCall> {
        lock(&self.state).calls.clone()
    }

    pub fn calls_for(&self, blob: &[u8]) -> Vec<OracleCall> {
        let fp = fingerprint(blob);
        lock(&self.state)
            .calls
            .iter()
            .filter(|c| c.fingerprint == fp)
            .cloned()
            .collect()
    }

    /// Highest number of simultaneous calls observed for any single blob.
    pub fn max_concurrent_per_blob(&self) -> usize {
        lock(&self.state).max_active_per_blob
    }

    fn next_step(&self, fp: &str) -> ScriptStep {
        let mut state = lock(&self.state);
        match state.scripts.get_mut(fp) {
            Some(steps) if steps.len() > 1 => steps.pop_front().unwrap_or_else(|| self.default_step.clone()),
            Some(steps) => steps.front().cloned().unwrap_or_else(|| self.default_step.clone()),
            None => self.default_step.clone(),
        }
    }

    fn enter(&self, call: OracleCall) {
        let mut state = lock(&self.state);
        let active = state.active.entry(call.fingerprint.clone()).or_insert(0);
        *active += 1;
        let now = *active;
        state.max_active_per_blob = state.max_active_per_blob.max(now);
        state.calls.push(call);
    }

    fn exit(&self, fp: &str) {
        let mut state = lock(&self.state);
        if let Some(active) = state.active.get_mut(fp) {
            *active = active.saturating_sub(1);
        }
    }
}

#[async_trait]
impl ExtractionOracle for ScriptedOracle {
    async fn extract(
        &self,
        blob: &[u8],
        file_type: FileType,
        method: ExtractionMethod,
        ocr: OcrMode,
    ) -> std::result::Result<OracleOutput, OracleError> {
        let fp = fingerprint(blob);
        self.enter(OracleCall {
            fingerprint: fp.clone(),
            file_type,
            method,
            ocr,
        });

        let step = self.next_step(&fp);
        if let Some(delay) = step.delay {
            tokio::time::sleep(delay).await;
        }
        self.exit(&fp);

        let mut output = step.result?;
        if ocr == OcrMode::Force {
            for field in &mut output.fields {
                field.confidence *= self.ocr_confidence_factor;
            }
        }
        Ok(output)
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// [`TextLayerProbe`] returning fixed statistics per blob.
#[derive(Clone, Default)]
pub struct StaticProbe {
    default: TextLayerStats,
    stats: Arc<Mutex<HashMap<String, TextLayerStats>>>,
    delay: Option<Duration>,
}

impl StaticProbe {
    pub fn new(default: TextLayerStats) -> Self {
        Self {
            default,
            stats: Arc::default(),
            delay: None,
        }
    }

    /// Sleep before every probe, like a slow `pdftotext`.
    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_stats(self, blob: &[u8], stats: TextLayerStats) -> Self {
        lock(&self.stats).insert(fingerprint(blob), stats);
        self
    }
}

#[async_trait]
impl TextLayerProbe for StaticProbe {
    async fn probe(&self, blob: &[u8], file_type: FileType) -> Result<TextLayerStats> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if file_type.is_image() {
            return Ok(TextLayerStats::no_text(1));
        }
        Ok(lock(&self.stats)
            .get(&fingerprint(blob))
            .copied()
            .unwrap_or(self.default))
    }
}
