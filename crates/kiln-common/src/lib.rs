//! Kiln Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared error types, logging setup and hashing helpers for the Kiln workspace.
//!
//! - **Error Handling**: [`KilnError`] and the [`Result`] alias
//! - **Logging**: subscriber initialization driven by `KILN_LOG_*` variables
//! - **Digest**: deterministic short codes for derived keys
//!
//! # Example
//!
//! ```no_run
//! use kiln_common::digest::short_code;
//!
//! let code = short_code("Ministry of Labour", 10);
//! assert_eq!(code.len(), 10);
//! ```

pub mod digest;
pub mod error;
pub mod logging;

pub use error::{KilnError, Result};
