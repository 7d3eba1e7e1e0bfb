//! Memory tracking of in-process builds
//!
//! Samples resident memory of this process and its children while a build
//! runs. Samples go to a JSON lines file, or are streamed to a single TCP
//! client for live inspection.

use super::MemoryDestination;
use crate::monitoring::{ResourceMonitor, ResourceSample, ResourceStats};
use crate::{Error, Result};
use serde::Serialize;
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// Default sample file name inside the profile directory
pub const MEMORY_PROFILE: &str = "memory_all.jsonl";

/// Timeline report derived from the sample file
pub const MEMORY_HTML: &str = "memory_all.html";

/// Port of the live listener
pub const LIVE_PORT: u16 = 13167;

pub const SAMPLE_INTERVAL: Duration = Duration::from_millis(20);

/// Result of one tracked build
#[derive(Debug, Clone, Serialize)]
pub struct MemoryProfile {
    pub stats: ResourceStats,
    /// Sample file, absent for live tracking
    pub path: Option<PathBuf>,
    #[serde(skip)]
    pub samples: Vec<ResourceSample>,
}

impl MemoryProfile {
    pub fn summary_lines(&self) -> Vec<String> {
        use crate::monitoring::format_bytes;
        vec![
            format!("peak memory:    {}", format_bytes(self.stats.peak_memory_bytes)),
            format!("average memory: {}", format_bytes(self.stats.avg_memory_bytes)),
            format!("p95 memory:     {}", format_bytes(self.stats.p95_memory_bytes)),
            format!("samples:        {}", self.stats.sample_count),
        ]
    }
}

/// Running memory tracker; finish it to get a [`MemoryProfile`].
pub struct MemoryTracker {
    monitor: ResourceMonitor,
    file: Option<PathBuf>,
    streamer: Option<JoinHandle<Result<()>>>,
}

impl MemoryTracker {
    /// Start tracking towards the given destination.
    ///
    /// A live destination blocks until one client connected.
    pub async fn start(destination: &MemoryDestination) -> Result<Self> {
        match destination {
            MemoryDestination::File(path) => {
                let monitor = ResourceMonitor::new();
                monitor.start(SAMPLE_INTERVAL).await;
                Ok(Self {
                    monitor,
                    file: Some(path.clone()),
                    streamer: None,
                })
            }
            MemoryDestination::Live(port) => {
                let listener = TcpListener::bind(("127.0.0.1", *port)).await.map_err(Error::Io)?;
                tracing::info!(port, "Waiting for a memory listener to connect");
                Self::start_live(listener).await
            }
        }
    }

    /// Accept one client on `listener` and stream samples to it.
    pub async fn start_live(listener: TcpListener) -> Result<Self> {
        let (mut stream, peer) = listener.accept().await.map_err(Error::Io)?;
        tracing::info!(%peer, "Memory listener connected");

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<ResourceSample>();
        let streamer = tokio::spawn(async move {
            while let Some(sample) = rx.recv().await {
                let mut line = serde_json::to_vec(&sample)?;
                line.push(b'\n');
                stream.write_all(&line).await.map_err(Error::Io)?;
            }
            stream.shutdown().await.map_err(Error::Io)?;
            Ok::<(), Error>(())
        });

        let monitor = ResourceMonitor::new().with_sink(tx);
        monitor.start(SAMPLE_INTERVAL).await;

        Ok(Self {
            monitor,
            file: None,
            streamer: Some(streamer),
        })
    }

    pub async fn finish(self) -> Result<MemoryProfile> {
        let samples = self.monitor.stop().await;
        // Dropping the monitor closes the sample channel and ends the stream.
        drop(self.monitor);

        if let Some(streamer) = self.streamer {
            match streamer.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(error = %e, "Memory listener disconnected early"),
                Err(e) => return Err(Error::Profiling(format!("Memory streaming task failed: {}", e))),
            }
        }

        if let Some(path) = &self.file {
            write_samples(&samples, path)?;
        }

        Ok(MemoryProfile {
            stats: ResourceMonitor::calculate_stats(&samples),
            path: self.file,
            samples,
        })
    }
}

pub fn write_samples(samples: &[ResourceSample], path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(Error::Io)?;
    }

    let mut file = std::io::BufWriter::new(fs::File::create(path).map_err(Error::Io)?);
    for sample in samples {
        serde_json::to_writer(&mut file, sample)?;
        file.write_all(b"\n").map_err(Error::Io)?;
    }
    file.flush().map_err(Error::Io)?;
    Ok(())
}

pub fn read_samples(path: &Path) -> Result<Vec<ResourceSample>> {
    let reader = BufReader::new(fs::File::open(path).map_err(Error::Io)?);
    let mut samples = Vec::new();
    for line in reader.lines() {
        let line = line.map_err(Error::Io)?;
        if line.trim().is_empty() {
            continue;
        }
        samples.push(serde_json::from_str(&line)?);
    }
    Ok(samples)
}
