//! Verdant: a published-content tree cache.
//!
//! The live site is held as one immutable tree snapshot, rebuilt from the
//! database, mirrored to a snapshot file for fast cold start, and patched in
//! place as single nodes are published or unpublished.

pub mod application;
pub mod cache;
pub mod config;
pub mod domain;
pub mod infra;
