//! Caching primitives for the photo pipeline.
//!
//! Currently there is a [`SerialCache`] which keeps fetched payloads in memory and funnels
//! every read and write through a single ordered queue.

#![warn(missing_docs)]

mod serial;

pub use serial::*;
