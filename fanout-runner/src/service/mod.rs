//! Service layer
//!
//! Long-lived helpers shared by the coordinator and the site runners: the
//! single-writer event log, the output aggregator and the summary reporter.

pub mod aggregator;
pub mod event_log;
pub mod summary;

pub use aggregator::{OutputAggregator, OutputSink, TaggedLine};
pub use event_log::{EventLog, EventSink, read_events};
pub use summary::{SummaryReporter, load_summary};
