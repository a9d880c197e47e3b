// Dispatch Module
// At-most-once claim of a model index per flow instance

pub mod guard;

pub use guard::{Claim, DispatchGuard};
