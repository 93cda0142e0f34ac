#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Per-record logic of the syndication pipeline.
//!
//! - [`filter`] decides whether a raw record is wanted at all.
//! - [`category`] resolves a hierarchical category string to a destination
//!   category id.
//! - [`transform`] maps a raw record into a destination product payload.
//!
//! Everything here is pure and synchronous; no I/O happens in this crate.

pub mod category;
pub mod filter;
pub mod transform;

pub use transform::{CategoryInput, SkipReason};
