//! Survey Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared utilities for the survey compiler workspace.
//!
//! - **Error Handling**: [`SurveyError`] and the crate [`Result`] alias
//! - **Checksums**: content hashes recorded for published artifacts
//! - **Logging**: subscriber setup shared by every binary
//!
//! # Example
//!
//! ```no_run
//! use survey_common::checksum::file_md5;
//!
//! fn fingerprint(path: &str) -> survey_common::Result<String> {
//!     file_md5(path)
//! }
//! ```

pub mod checksum;
pub mod error;
pub mod logging;

pub use error::{Result, SurveyError};
