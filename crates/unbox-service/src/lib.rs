//! The archive cache and resolution engine of the IF Archive unboxing service.
//!
//! Archives hosted on the IF Archive are downloaded on demand, listed, and kept in a local
//! cache directory so that individual files can be extracted from them without downloading
//! the whole archive again. See the [`caching`] module for how the cache is organized.

#[macro_use]
pub mod metrics;

pub mod archive;
pub mod caching;
pub mod config;
pub mod download;
pub mod extract;
pub mod index;
pub mod logging;
pub mod mime;
pub mod service;
