//! Wire frame types, codec, error vocabulary, and observability wiring
//! shared between every component of the sync server.
//!
//! - **types**: [`Topic`], [`Action`], [`Frame`], [`Version`]
//! - **codec**: encode/decode the `\x1F`-delimited frame format
//! - **error**: process errors ([`Error`]) and the wire error vocabulary ([`ErrorCode`])
//! - **observability**: OpenTelemetry traces/metrics + tracing-subscriber setup

pub mod codec;
pub mod error;
pub mod observability;
pub mod types;

pub use error::{Error, ErrorCode, Result};
pub use observability::{init_observability, shutdown_observability, ObservabilityConfig};
pub use types::{Action, Frame, Topic, Version, VersionNum};
