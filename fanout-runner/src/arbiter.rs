//! Winner arbitration for race mode
//!
//! The winner slot is set at most once. Every site runner subscribes to the
//! broadcast side so losers learn about the winner as soon as the claim
//! succeeds instead of at their next poll.

use fanout_core::domain::site::SiteId;
use std::path::PathBuf;
use std::sync::OnceLock;
use tokio::sync::watch;
use tracing::{info, warn};

/// Result of a claim attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
    Won,
    /// Someone else got there first
    Lost(SiteId),
}

pub struct WinnerArbiter {
    slot: OnceLock<SiteId>,
    notify: watch::Sender<Option<SiteId>>,
    marker: Option<PathBuf>,
}

impl WinnerArbiter {
    /// Creates an empty arbiter; `marker` receives the winner id once decided
    pub fn new(marker: Option<PathBuf>) -> Self {
        let (notify, _) = watch::channel(None);

        Self {
            slot: OnceLock::new(),
            notify,
            marker,
        }
    }

    /// Attempts to become the winner
    ///
    /// Exactly one caller ever sees `Claim::Won`. Claiming again with the
    /// winning id reports `Won` without side effects.
    pub fn claim(&self, site_id: &SiteId) -> Claim {
        let mut created = false;
        let winner = self.slot.get_or_init(|| {
            created = true;
            site_id.clone()
        });

        if winner != site_id {
            return Claim::Lost(winner.clone());
        }

        if created {
            info!("{} won the race", site_id);
            self.notify.send_replace(Some(site_id.clone()));
            self.persist(site_id);
        }

        Claim::Won
    }

    pub fn winner(&self) -> Option<&SiteId> {
        self.slot.get()
    }

    /// Receiver that flips from `None` to the winner id once
    pub fn subscribe(&self) -> watch::Receiver<Option<SiteId>> {
        self.notify.subscribe()
    }

    fn persist(&self, site_id: &SiteId) {
        let Some(path) = &self.marker else {
            return;
        };

        let result = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .and_then(|mut file| {
                use std::io::Write;
                writeln!(file, "{}", site_id)
            });

        if let Err(e) = result {
            warn!("Failed to write winner marker {}: {}", path.display(), e);
        }
    }
}
