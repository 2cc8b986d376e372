/// Per-object access tracking and conflict checks.
pub mod detection;
/// Picking the loser of a conflict.
pub mod resolution;
