//! Core domain types for the maintenance scheduler.
//!
//! This module contains the fundamental value types used throughout the
//! crate, designed to encode invariants via the type system.

pub mod estimate;
pub mod ids;
pub mod state;

// Re-export commonly used types at the module level
pub use estimate::{Estimate, EstimateParseError};
pub use ids::RequestId;
pub use state::{
    ARCHIVE, EXIT_POSTPONE, EXIT_SOFTWARE, EXIT_SUCCESS, EXIT_TEMPFAIL, State, evaluate_state,
};
