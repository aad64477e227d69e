//! Loading remote photos into reusable display slots.
//!
//! The [`pipeline`] module is the heart of this crate. [`fetch`] provides the transport it is
//! driven by, the remaining modules hold the ambient service setup.

#[macro_use]
pub mod metrics;

pub mod config;
pub mod fetch;
pub mod logging;
pub mod pipeline;
pub mod utils;
