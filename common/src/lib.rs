//! Shared building blocks for the marchive suite.
//!
//! This crate carries everything both the daemon and its tests need:
//! time-preserving file operations, the daemon configuration and its
//! `key = value` loader, the media domain types shared with the wire
//! protocol, and the tracing bootstrap.

pub mod config;
pub mod fs;
pub mod logging;
pub mod media;
pub mod testutils;
