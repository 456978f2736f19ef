//! docrelay common library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared error handling, logging and checksum utilities for the docrelay
//! workspace.
//!
//! - **Error Handling**: [`RelayError`] covers every failure a relay run can
//!   surface, from configuration through to database statements
//! - **Logging**: tracing subscriber setup driven by `LOG_*` variables
//! - **Checksums**: SHA-256 digests of staged files
//!
//! # Example
//!
//! ```no_run
//! use docrelay_common::{checksum, Result};
//!
//! fn describe(path: &str) -> Result<()> {
//!     let digest = checksum::sha256_file(path)?;
//!     tracing::info!(path, sha256 = %digest, "Staged file");
//!     Ok(())
//! }
//! ```

pub mod checksum;
pub mod error;
pub mod logging;

pub use error::{RelayError, Result};
