//! CDP Common Library
//!
//! Shared infrastructure for the CDP workspace members:
//!
//! - **Error Handling**: the [`CdpError`] type and [`Result`] alias
//! - **Logging**: centralized tracing setup with console/file output

pub mod error;
pub mod logging;

pub use error::{CdpError, Result};
