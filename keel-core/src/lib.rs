//! Keel Core - Strongly-typed identifiers shared by the keel crates.
//!
//! The consensus core addresses peers by opaque 64-bit identifiers. Wrapping
//! them in a newtype keeps peer IDs from being confused with the terms and
//! log indexes that flow through the same code paths.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod types;

pub use types::NodeId;
