//! # underwrite-oracle
//!
//! Extraction oracle backends for the underwrite pipeline.
//!
//! - [`HttpOracle`]: structural (docling) and span (langextract) extraction
//!   over HTTP, with an OCR pre-pass
//! - [`PdfTextProbe`]: native text-layer statistics via poppler
//! - [`mock`]: scripted oracle and probe (feature `mock`)

pub mod http;
pub mod probe;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use http::HttpOracle;
pub use probe::PdfTextProbe;
