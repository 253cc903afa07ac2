//! Event log service
//!
//! The shared event log has a single owner: a writer task that receives
//! events over a channel and appends them, one JSON object per line, to
//! `events.jsonl`. Producers only hold a cheap `EventLog` handle, so appends
//! from concurrent site runners never interleave.

use anyhow::{Context, Result};
use fanout_core::domain::event::Event;
use fanout_core::domain::job::JobStatus;
use fanout_core::domain::site::SiteId;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Producer side of the event log
///
/// Anything that records lifecycle events depends on this trait so tests
/// can swap the channel for a plain vector.
pub trait EventSink: Send + Sync {
    /// Appends an event; never blocks and never fails the caller
    fn record(&self, event: Event);

    fn status(&self, site_id: &SiteId, status: JobStatus) {
        self.record(Event::new(site_id.clone(), status));
    }

    fn status_with(&self, site_id: &SiteId, status: JobStatus, message: String) {
        self.record(Event::new(site_id.clone(), status).with_message(message));
    }
}

/// Handle to the single writer task
#[derive(Clone)]
pub struct EventLog {
    tx: mpsc::UnboundedSender<Event>,
}

/// Join handle of the writer; resolves to every event once all handles drop
pub struct EventLogWriter {
    handle: JoinHandle<Vec<Event>>,
}

impl EventLog {
    /// Starts the writer task
    ///
    /// With `path` set, events are appended to that file as they arrive.
    pub fn spawn(path: Option<PathBuf>) -> (Self, EventLogWriter) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(write_events(rx, path));

        (Self { tx }, EventLogWriter { handle })
    }
}

impl EventSink for EventLog {
    fn record(&self, event: Event) {
        if self.tx.send(event).is_err() {
            warn!("Event log writer is gone, dropping event");
        }
    }
}

impl EventLogWriter {
    /// Waits for the writer to drain the channel
    ///
    /// Every `EventLog` handle must be dropped first, otherwise this waits
    /// forever.
    pub async fn finish(self) -> Vec<Event> {
        match self.handle.await {
            Ok(events) => events,
            Err(e) => {
                error!("Event log writer panicked: {}", e);
                Vec::new()
            }
        }
    }
}

async fn write_events(mut rx: mpsc::UnboundedReceiver<Event>, path: Option<PathBuf>) -> Vec<Event> {
    let mut file = match &path {
        Some(path) => match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
        {
            Ok(file) => Some(file),
            Err(e) => {
                error!("Failed to open event log {}: {}", path.display(), e);
                None
            }
        },
        None => None,
    };

    let mut events = Vec::new();

    while let Some(event) = rx.recv().await {
        debug!("{} -> {}", event.site_id, event.status);

        if let Some(out) = file.as_mut() {
            match serde_json::to_string(&event) {
                Ok(mut line) => {
                    line.push('\n');
                    if let Err(e) = out.write_all(line.as_bytes()).await {
                        error!("Failed to append to event log: {}", e);
                    }
                }
                Err(e) => error!("Failed to serialize event: {}", e),
            }
        }

        events.push(event);
    }

    if let Some(mut out) = file {
        if let Err(e) = out.flush().await {
            error!("Failed to flush event log: {}", e);
        }
    }

    events
}

/// Reads a stored `events.jsonl`, skipping lines that do not parse
pub fn read_events(path: &Path) -> Result<Vec<Event>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read event log {}", path.display()))?;

    Ok(content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| match serde_json::from_str::<Event>(line) {
            Ok(event) => Some(event),
            Err(e) => {
                warn!("Skipping malformed event line: {}", e);
                None
            }
        })
        .collect())
}
