//! # quanttp-core
//!
//! Hardware TRNG access for network serving: a uniform device abstraction,
//! a registry that resolves device ids, pure wire formatting, and a
//! synchronous request dispatcher.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use quanttp_core::{Dispatcher, DrawKind, Limits, SourceRegistry};
//! use quanttp_core::sources::{DiscoveryConfig, discover};
//!
//! let registry = SourceRegistry::new(discover(&DiscoveryConfig::default()))?;
//! let dispatcher = Dispatcher::new(Arc::new(registry), Limits::default());
//!
//! let value = dispatcher.one_shot(None, DrawKind::Int32)?;
//! println!("{}", value.to_text());
//!
//! let bytes = dispatcher.bytes(None, Some("32"))?;
//! assert_eq!(bytes.len(), 32);
//! # Ok::<(), quanttp_core::Error>(())
//! ```
//!
//! ## Architecture
//!
//! Device backend → [`EntropySource`] (lock + retry) → [`SourceRegistry`] →
//! [`Dispatcher`] / streaming sessions → [`format`] → wire
//!
//! Output is raw device entropy. Nothing here whitens, conditions or
//! health-tests the stream.

pub mod dispatch;
pub mod error;
pub mod format;
pub mod registry;
pub mod source;
pub mod sources;

pub use dispatch::{Batch, BatchData, BatchRequest, Dispatcher, DrawKind, Value, draw_value};
pub use error::{DeviceError, Error, Result};
pub use format::{Format, Limits, parse_count};
pub use registry::{SourceRegistry, validate_device_id};
pub use source::{DEVICE_ID_LEN, EntropyDevice, EntropySource, SourceStatus};

/// Library version (from Cargo.toml).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
