//! # ph-core
//!
//! Shared foundation for the piohmm workspace: the error taxonomy and the
//! workspace-wide `Result` alias. Every other crate in the workspace
//! depends on this one and nothing else here.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Error taxonomy and result alias.
pub mod error;

pub use error::{Error, Result};
