//! Extraction method and OCR selection.

use serde::Serialize;

use underwrite_core::{
    ExtractionConfig, ExtractionMethod, FileType, MethodPreference, OcrMode, TextLayerStats,
};

/// Resolved backend choice for one run. `ocr` is never `Auto`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExtractionPlan {
    pub method: ExtractionMethod,
    pub ocr: OcrMode,
}

/// Decide method and OCR from configuration, the task's hint and the probed
/// text layer.
///
/// A hint other than `auto` overrides the configured method preference.
pub fn plan(
    config: &ExtractionConfig,
    hint: Option<MethodPreference>,
    file_type: FileType,
    stats: &TextLayerStats,
) -> ExtractionPlan {
    let preference = match hint {
        Some(MethodPreference::Auto) | None => config.method,
        Some(explicit) => explicit,
    };

    let method = match preference {
        MethodPreference::Structural => ExtractionMethod::Structural,
        MethodPreference::Span => ExtractionMethod::Span,
        MethodPreference::Auto if config.require_char_offsets => ExtractionMethod::Span,
        MethodPreference::Auto
            if stats.mean_chars_per_page() >= config.structural_min_chars_per_page =>
        {
            ExtractionMethod::Structural
        }
        MethodPreference::Auto => ExtractionMethod::Span,
    };

    let coverage = if file_type.is_image() {
        0.0
    } else {
        stats.coverage()
    };
    let ocr = match config.ocr {
        OcrMode::Auto if coverage < config.ocr_coverage_threshold => OcrMode::Force,
        OcrMode::Auto => OcrMode::Skip,
        explicit => explicit,
    };

    ExtractionPlan { method, ocr }
}
