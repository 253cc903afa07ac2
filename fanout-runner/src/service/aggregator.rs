//! Output aggregation
//!
//! Tails every site's `run.out` and forwards complete lines, tagged with
//! the site they came from, to a single sink. Purely observational: read
//! errors are logged and skipped, never propagated.

use fanout_core::domain::site::{Site, SiteId};
use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::{mpsc, watch};
use tokio::time::{self, Duration};
use tracing::{debug, warn};

use crate::work_area::WorkArea;

/// One line of job output and where it came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaggedLine {
    pub site_id: SiteId,
    pub label: String,
    pub line: String,
}

/// Destination of the merged stream
pub trait OutputSink: Send + 'static {
    fn emit(&mut self, line: TaggedLine);
}

impl OutputSink for mpsc::UnboundedSender<TaggedLine> {
    fn emit(&mut self, line: TaggedLine) {
        // a closed receiver only means nobody is watching
        let _ = self.send(line);
    }
}

struct Source {
    site_id: SiteId,
    label: String,
    path: PathBuf,
    offset: u64,
    /// Bytes after the last newline, decoded once the line is complete
    partial: Vec<u8>,
}

pub struct OutputAggregator {
    sources: Vec<Source>,
    interval: Duration,
}

impl OutputAggregator {
    pub fn new(interval: Duration) -> Self {
        Self {
            sources: Vec::new(),
            interval,
        }
    }

    /// Starts following the output file of `site`
    pub fn follow(&mut self, site: &Site, area: &WorkArea) {
        self.sources.push(Source {
            site_id: site.id.clone(),
            label: site.name.clone(),
            path: area.output(),
            offset: 0,
            partial: Vec::new(),
        });
    }

    /// Reads whatever was appended since the last call
    ///
    /// Only complete lines are returned; a trailing fragment waits for its
    /// newline.
    pub async fn collect(&mut self) -> Vec<TaggedLine> {
        let mut lines = Vec::new();

        for source in &mut self.sources {
            match read_from(&source.path, source.offset).await {
                Ok(chunk) if chunk.is_empty() => {}
                Ok(chunk) => {
                    source.offset += chunk.len() as u64;
                    source.partial.extend_from_slice(&chunk);

                    while let Some(pos) = source.partial.iter().position(|&b| b == b'\n') {
                        let line: Vec<u8> = source.partial.drain(..=pos).collect();
                        lines.push(TaggedLine {
                            site_id: source.site_id.clone(),
                            label: source.label.clone(),
                            line: String::from_utf8_lossy(&line)
                                .trim_end_matches(['\n', '\r'])
                                .to_string(),
                        });
                    }
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to read {}: {}", source.path.display(), e),
            }
        }

        lines
    }

    /// Fragments left without a trailing newline
    fn flush_partials(&mut self) -> Vec<TaggedLine> {
        self.sources
            .iter_mut()
            .filter(|source| !source.partial.is_empty())
            .map(|source| TaggedLine {
                site_id: source.site_id.clone(),
                label: source.label.clone(),
                line: String::from_utf8_lossy(&std::mem::take(&mut source.partial)).into_owned(),
            })
            .collect()
    }

    /// Forwards output until `stop` flips, then drains what is left
    pub async fn run<S: OutputSink>(mut self, mut stop: watch::Receiver<bool>, mut sink: S) {
        debug!("Following output of {} site(s)", self.sources.len());

        let mut ticker = time::interval(self.interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    for line in self.collect().await {
                        sink.emit(line);
                    }
                }
                _ = stopped(&mut stop) => break,
            }
        }

        for line in self.collect().await {
            sink.emit(line);
        }
        for line in self.flush_partials() {
            sink.emit(line);
        }

        debug!("Output aggregator stopped");
    }
}

/// Resolves once `stop` is raised or its sender is gone
async fn stopped(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stop| *stop).await;
}

async fn read_from(path: &Path, offset: u64) -> std::io::Result<Vec<u8>> {
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(SeekFrom::Start(offset)).await?;

    let mut buf = Vec::new();
    file.read_to_end(&mut buf).await?;
    Ok(buf)
}
