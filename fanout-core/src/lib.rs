//! Fanout Core
//!
//! Core types and abstractions for dispatching one job onto several
//! compute sites.
//!
//! This crate contains:
//! - Domain types: sites, per-site job records, events and summaries
//! - Errors: the failure taxonomy shared by the runner and its adapters

pub mod domain;
pub mod error;
