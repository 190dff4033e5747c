//! Native text-layer probe backed by `pdfinfo`/`pdftotext` (poppler-utils).

use std::io::Write;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::NamedTempFile;
use tokio::process::Command;
use tracing::debug;

use underwrite_core::defaults::{PAGE_TEXT_MIN_CHARS, PROBE_CMD_TIMEOUT_SECS};
use underwrite_core::{Error, FileType, Result, TextLayerProbe, TextLayerStats};

/// Probes PDFs with poppler, plain text directly, and reports images as
/// having no text layer.
pub struct PdfTextProbe {
    cmd_timeout: Duration,
}

impl Default for PdfTextProbe {
    fn default() -> Self {
        Self {
            cmd_timeout: Duration::from_secs(PROBE_CMD_TIMEOUT_SECS),
        }
    }
}

impl PdfTextProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cmd_timeout(mut self, timeout: Duration) -> Self {
        self.cmd_timeout = timeout;
        self
    }

    /// Check that poppler's tools are installed.
    pub async fn health_check(&self) -> bool {
        Command::new("pdftotext")
            .arg("-v")
            .output()
            .await
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    async fn probe_pdf(&self, blob: &[u8]) -> Result<TextLayerStats> {
        if blob.len() < 4 || &blob[0..4] != b"%PDF" {
            return Err(Error::InvalidInput(
                "not a valid PDF (missing %PDF header)".to_string(),
            ));
        }

        let mut tmpfile = NamedTempFile::new()
            .map_err(|e| Error::Internal(format!("Failed to create temp file: {}", e)))?;
        tmpfile
            .write_all(blob)
            .map_err(|e| Error::Internal(format!("Failed to write temp file: {}", e)))?;
        let tmp_path = tmpfile.path().to_string_lossy().to_string();

        let info = run_cmd_with_timeout(Command::new("pdfinfo").arg(&tmp_path), self.cmd_timeout)
            .await?;
        let page_count = parse_page_count(&info).ok_or_else(|| {
            Error::InvalidInput("pdfinfo reported no page count".to_string())
        })?;

        let text = run_cmd_with_timeout(
            Command::new("pdftotext").arg("-layout").arg(&tmp_path).arg("-"),
            self.cmd_timeout,
        )
        .await?;

        let stats = stats_from_pages(&text, page_count);
        debug!(
            subsystem = "oracle",
            component = "probe",
            page_count = stats.page_count,
            pages_with_text = stats.pages_with_text,
            total_chars = stats.total_chars,
            "PDF text layer probed"
        );
        Ok(stats)
    }
}

#[async_trait]
impl TextLayerProbe for PdfTextProbe {
    async fn probe(&self, blob: &[u8], file_type: FileType) -> Result<TextLayerStats> {
        match file_type {
            FileType::Pdf => self.probe_pdf(blob).await,
            FileType::Text => {
                let text = String::from_utf8_lossy(blob);
                Ok(stats_from_pages(&text, 1))
            }
            // Raster images carry no native text.
            FileType::Png | FileType::Jpeg | FileType::Tiff => Ok(TextLayerStats::no_text(1)),
        }
    }
}

/// Run a command with a timeout, returning stdout.
///
/// Spawn failures and timeouts are infrastructure errors; a non-zero exit
/// means the tool rejected the input.
async fn run_cmd_with_timeout(cmd: &mut Command, timeout: Duration) -> Result<String> {
    let output = tokio::time::timeout(timeout, cmd.output())
        .await
        .map_err(|_| {
            Error::Internal(format!(
                "External command timed out after {}s",
                timeout.as_secs()
            ))
        })?
        .map_err(|e| Error::Internal(format!("Failed to execute command: {}", e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::InvalidInput(format!(
            "Command failed (exit {}): {}",
            output.status,
            stderr.trim()
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// `Pages:` line of `pdfinfo` output.
fn parse_page_count(info: &str) -> Option<u32> {
    info.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        if key.trim().eq_ignore_ascii_case("pages") {
            value.trim().parse().ok()
        } else {
            None
        }
    })
}

/// Per-page statistics over form-feed separated text.
fn stats_from_pages(text: &str, page_count: u32) -> TextLayerStats {
    let mut pages_with_text = 0;
    let mut total_chars = 0u64;
    for page in text.split('\x0c').take(page_count as usize) {
        let chars = page.chars().filter(|c| !c.is_whitespace()).count();
        total_chars += chars as u64;
        if chars >= PAGE_TEXT_MIN_CHARS {
            pages_with_text += 1;
        }
    }
    TextLayerStats {
        page_count,
        pages_with_text,
        total_chars,
    }
}
