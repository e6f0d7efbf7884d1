//! evload Common Library
//!
//! Shared plumbing used by every evload workspace member:
//!
//! - **Logging**: subscriber setup for console/file output in text or JSON
//! - **Environment**: typed readers for `EVLOAD_*` style configuration variables
//! - **Errors**: the configuration error type those readers return
//!
//! # Example
//!
//! ```no_run
//! use evload_common::env;
//! use evload_common::logging::{init_logging, LogConfig};
//!
//! fn main() -> anyhow::Result<()> {
//!     let _guard = init_logging(&LogConfig::from_env()?)?;
//!     let page_size: u32 = env::var_or("EVLOAD_PAGE_SIZE", 1000)?;
//!     tracing::info!(page_size, "configured");
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod env;
pub mod error;
pub mod logging;

pub use error::{CommonError, Result};
