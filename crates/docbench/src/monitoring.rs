//! Resource sampling for build processes
//!
//! [`ResourceMonitor`] polls memory and CPU usage of a process and all of its
//! descendants on a background task. The external driver points it at the
//! spawned build tool; the memory adapter points it at the current process.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;

/// One resource measurement of a process tree
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceSample {
    /// Milliseconds since monitoring started
    pub elapsed_ms: u64,
    /// Resident memory of the whole tree in bytes
    pub memory_bytes: u64,
    /// Summed CPU usage of the tree in percent of one core
    pub cpu_percent: f64,
}

/// Summary over a list of samples
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceStats {
    pub peak_memory_bytes: u64,
    pub avg_memory_bytes: u64,
    pub p50_memory_bytes: u64,
    pub p95_memory_bytes: u64,
    pub avg_cpu_percent: f64,
    pub sample_count: usize,
}

/// Background sampler of a process tree
pub struct ResourceMonitor {
    root: Pid,
    running: Arc<AtomicBool>,
    samples: Arc<Mutex<Vec<ResourceSample>>>,
    sink: Option<UnboundedSender<ResourceSample>>,
    handle: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ResourceMonitor {
    /// Monitor the current process and its children.
    pub fn new() -> Self {
        Self::for_pid(std::process::id())
    }

    pub fn for_pid(pid: u32) -> Self {
        Self {
            root: Pid::from_u32(pid),
            running: Arc::new(AtomicBool::new(false)),
            samples: Arc::new(Mutex::new(Vec::new())),
            sink: None,
            handle: tokio::sync::Mutex::new(None),
        }
    }

    /// Forward every sample to a channel while monitoring.
    pub fn with_sink(mut self, sink: UnboundedSender<ResourceSample>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Start sampling at the given interval.
    pub async fn start(&self, interval: Duration) {
        self.running.store(true, Ordering::SeqCst);

        let root = self.root;
        let running = Arc::clone(&self.running);
        let samples = Arc::clone(&self.samples);
        let sink = self.sink.clone();

        let handle = tokio::spawn(async move {
            let mut system = System::new();
            let mut ticker = tokio::time::interval(interval);
            let started = Instant::now();

            while running.load(Ordering::SeqCst) {
                ticker.tick().await;

                system.refresh_processes_specifics(
                    ProcessesToUpdate::All,
                    true,
                    ProcessRefreshKind::nothing().with_memory().with_cpu(),
                );

                let (memory_bytes, cpu_percent) = tree_usage(&system, root);
                let sample = ResourceSample {
                    elapsed_ms: started.elapsed().as_millis() as u64,
                    memory_bytes,
                    cpu_percent,
                };

                if let Some(sink) = &sink {
                    let _ = sink.send(sample);
                }

                match samples.lock() {
                    Ok(mut guard) => guard.push(sample),
                    Err(poisoned) => poisoned.into_inner().push(sample),
                }
            }
        });

        *self.handle.lock().await = Some(handle);
    }

    /// Stop sampling and return everything collected so far.
    pub async fn stop(&self) -> Vec<ResourceSample> {
        self.running.store(false, Ordering::SeqCst);

        if let Some(handle) = self.handle.lock().await.take() {
            let _ = handle.await;
        }

        match self.samples.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        }
    }

    pub fn calculate_stats(samples: &[ResourceSample]) -> ResourceStats {
        if samples.is_empty() {
            return ResourceStats::default();
        }

        let mut memory: Vec<u64> = samples.iter().map(|s| s.memory_bytes).collect();
        memory.sort_unstable();

        let count = samples.len();
        let total_memory: u128 = memory.iter().map(|m| u128::from(*m)).sum();
        let percentile = |p: f64| memory[((count as f64 - 1.0) * p).max(0.0) as usize];

        ResourceStats {
            peak_memory_bytes: memory[count - 1],
            avg_memory_bytes: (total_memory / count as u128) as u64,
            p50_memory_bytes: percentile(0.50),
            p95_memory_bytes: percentile(0.95),
            avg_cpu_percent: samples.iter().map(|s| s.cpu_percent).sum::<f64>() / count as f64,
            sample_count: count,
        }
    }
}

impl Default for ResourceMonitor {
    fn default() -> Self {
        Self::new()
    }
}

/// Memory and CPU of `root` and all of its descendants.
fn tree_usage(system: &System, root: Pid) -> (u64, f64) {
    let processes = system.processes();
    let mut memory = 0u64;
    let mut cpu = 0f64;

    for (pid, process) in processes {
        let mut current = Some(*pid);
        // Bounded walk up the parent chain; pid reuse can create cycles.
        for _ in 0..64 {
            match current {
                Some(candidate) if candidate == root => {
                    memory = memory.saturating_add(process.memory());
                    cpu += f64::from(process.cpu_usage());
                    break;
                }
                Some(candidate) => current = processes.get(&candidate).and_then(|p| p.parent()),
                None => break,
            }
        }
    }

    (memory, cpu)
}

/// Human readable byte size with two decimals.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "kB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.2} {}", UNITS[unit])
}
