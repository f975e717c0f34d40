//! # Fynx Platform
//!
//! Types shared by the Fynx protocol daemons.
//!
//! This crate provides:
//! - Unified error types (`FynxError`, `FynxResult`)
//! - The `SecurityModule` lifecycle trait a daemon exposes to its host
//!
//! # Examples
//!
//! ```
//! use fynx_platform::{FynxError, FynxResult};
//!
//! fn load_secret(name: &str) -> FynxResult<Vec<u8>> {
//!     if name.is_empty() {
//!         return Err(FynxError::Config("secret name is empty".to_string()));
//!     }
//!     Ok(name.as_bytes().to_vec())
//! }
//!
//! # fn main() -> FynxResult<()> {
//! let secret = load_secret("home")?;
//! assert_eq!(secret, b"home");
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod error;
pub mod traits;

pub use error::{FynxError, FynxResult};
pub use traits::SecurityModule;

/// Platform version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
