//! Core domain types
//!
//! This module contains the structures shared between the coordinator, the
//! per-site runners and the reporting side. Sites are immutable once loaded;
//! job records are mutated only by the runner owning them.

pub mod event;
pub mod execution;
pub mod job;
pub mod site;
