//! Bringing a stored artifact back onto the local filesystem.

pub(crate) mod logic;
pub(crate) mod verification;

pub use logic::{place_artifact, resolve_target};
