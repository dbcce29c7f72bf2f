//! Centralized error handling for the fleet orchestrator.
//!
//! Every component returns `FleetResult<T>`; the web layer is the one place
//! that translates a [`FleetError`] into an HTTP status (spec §7's
//! "User-visible failures").

pub mod types;

pub use types::{FleetError, FleetResult};
