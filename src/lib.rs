//! replisearch - relational tables mirrored into a document search index
//!
//! Changes flow from the relational store into the index two ways: a full
//! keyset-paged resync and a trigger-fed change queue drained incrementally.
//! Queries go through a router that races the index against the relational
//! store and returns whichever answers with hits first.

pub mod catalog;
pub mod commands;
pub mod config;
pub mod context;
pub mod document;
pub mod error;
pub mod incremental;
pub mod index;
pub mod indexing;
pub mod progress;
pub mod queue;
pub mod relational;
pub mod resync;
pub mod router;
pub mod structured;
pub mod verify;

pub use error::{Error, Result};
