//! Logging facade selection (§4.11).
//!
//! On the default host build this crate calls `tracing`'s macros
//! directly. The `defmt-03` feature is for a future no_std/probe-rs port
//! of the non-I/O modules (codec, duty_cycle, cache, journal semantics),
//! where `tracing`'s subscriber machinery doesn't fit; it re-exports
//! `defmt`'s macros under the same names so call sites don't change.

#[cfg(not(feature = "defmt-03"))]
pub use tracing::{debug, error, info, trace, warn};

#[cfg(feature = "defmt-03")]
pub use defmt::{debug, error, info, trace, warn};
