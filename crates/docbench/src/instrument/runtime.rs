//! CPU time profiling of in-process builds
//!
//! [`RuntimeProfiler`] records user and system CPU time of this process and
//! its waited-for children around a build. With the `profiling` feature on a
//! non-Windows target it additionally samples stacks with pprof at 1000 Hz and
//! keeps a flamegraph plus the hottest functions.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

#[cfg(all(feature = "profiling", not(target_os = "windows")))]
use std::collections::HashMap;

/// Exported profile file name inside the profile directory
pub const RUNTIME_PROFILE: &str = "runtime_all.json";

/// Flamegraph file name inside the profile directory
pub const RUNTIME_FLAMEGRAPH: &str = "runtime_all.svg";

/// Sampling frequency of the stack profiler in Hz
pub const SAMPLING_FREQUENCY: i32 = 1000;

#[cfg(all(feature = "profiling", not(target_os = "windows")))]
const TOP_FUNCTIONS: usize = 10;

/// Accumulated CPU time in seconds
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CpuTimes {
    pub user: f64,
    pub system: f64,
}

impl CpuTimes {
    /// CPU time of this process plus all terminated and waited-for children.
    #[cfg(unix)]
    pub fn now() -> Self {
        let own = rusage(libc::RUSAGE_SELF);
        let children = rusage(libc::RUSAGE_CHILDREN);
        Self {
            user: own.user + children.user,
            system: own.system + children.system,
        }
    }

    #[cfg(not(unix))]
    pub fn now() -> Self {
        Self::default()
    }

    pub fn total(&self) -> f64 {
        self.user + self.system
    }

    pub fn since(&self, earlier: &CpuTimes) -> CpuTimes {
        CpuTimes {
            user: (self.user - earlier.user).max(0.0),
            system: (self.system - earlier.system).max(0.0),
        }
    }
}

#[cfg(unix)]
fn rusage(who: libc::c_int) -> CpuTimes {
    use std::mem::MaybeUninit;

    let mut usage = MaybeUninit::<libc::rusage>::uninit();
    let rc = unsafe { libc::getrusage(who, usage.as_mut_ptr()) };
    if rc != 0 {
        return CpuTimes::default();
    }
    let usage = unsafe { usage.assume_init() };

    let seconds = |tv: libc::timeval| tv.tv_sec as f64 + tv.tv_usec as f64 / 1_000_000.0;
    CpuTimes {
        user: seconds(usage.ru_utime),
        system: seconds(usage.ru_stime),
    }
}

/// Share of stack samples attributed to one function
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionSample {
    pub function: String,
    pub samples: i64,
    pub percentage: f64,
}

/// Result of one profiled build
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeProfile {
    pub wall_seconds: f64,
    pub cpu: CpuTimes,
    #[serde(default)]
    pub top_functions: Vec<FunctionSample>,
    #[serde(skip)]
    pub flamegraph_svg: Option<Vec<u8>>,
}

impl RuntimeProfile {
    /// Write the profile JSON and, if requested and available, the flamegraph.
    pub fn write(&self, profile_dir: &Path, flamegraph: bool) -> Result<Vec<PathBuf>> {
        fs::create_dir_all(profile_dir).map_err(Error::Io)?;

        let mut written = Vec::new();
        let json_path = profile_dir.join(RUNTIME_PROFILE);
        fs::write(&json_path, serde_json::to_string_pretty(self)?).map_err(Error::Io)?;
        written.push(json_path);

        if flamegraph {
            match &self.flamegraph_svg {
                Some(svg) => {
                    let svg_path = profile_dir.join(RUNTIME_FLAMEGRAPH);
                    fs::write(&svg_path, svg).map_err(Error::Io)?;
                    tracing::info!(path = %svg_path.display(), "Flamegraph written");
                    written.push(svg_path);
                }
                None => tracing::warn!("Stack sampling is not available; build with the `profiling` feature"),
            }
        }

        Ok(written)
    }

    /// Human readable statistics, one line each.
    pub fn stats_lines(&self) -> Vec<String> {
        let mut lines = vec![
            format!("wall time:   {:.3} s", self.wall_seconds),
            format!("user time:   {:.3} s", self.cpu.user),
            format!("system time: {:.3} s", self.cpu.system),
        ];
        for sample in &self.top_functions {
            lines.push(format!(
                "{:>8} {:>6.2}%  {}",
                sample.samples, sample.percentage, sample.function
            ));
        }
        lines
    }
}

/// Running CPU profile; finish it to get a [`RuntimeProfile`].
pub struct RuntimeProfiler {
    cpu_start: CpuTimes,
    started: Instant,
    #[cfg(all(feature = "profiling", not(target_os = "windows")))]
    guard: Option<pprof::ProfilerGuard<'static>>,
}

impl RuntimeProfiler {
    /// Start measuring.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Profiling`] if the stack sampler can not be initialized.
    pub fn start() -> Result<Self> {
        #[cfg(all(feature = "profiling", not(target_os = "windows")))]
        let guard = pprof::ProfilerGuardBuilder::default()
            .frequency(SAMPLING_FREQUENCY)
            .blocklist(&["libc", "libpthread", "libgcc", "libm"])
            .build()
            .map_err(|e| Error::Profiling(format!("Failed to initialize profiler: {}", e)))?;

        Ok(Self {
            cpu_start: CpuTimes::now(),
            started: Instant::now(),
            #[cfg(all(feature = "profiling", not(target_os = "windows")))]
            guard: Some(guard),
        })
    }

    pub fn finish(mut self) -> Result<RuntimeProfile> {
        let wall_seconds = self.started.elapsed().as_secs_f64();
        let cpu = CpuTimes::now().since(&self.cpu_start);
        let (top_functions, flamegraph_svg) = self.take_samples()?;

        Ok(RuntimeProfile {
            wall_seconds,
            cpu,
            top_functions,
            flamegraph_svg,
        })
    }

    #[cfg(all(feature = "profiling", not(target_os = "windows")))]
    fn take_samples(&mut self) -> Result<(Vec<FunctionSample>, Option<Vec<u8>>)> {
        let guard = self
            .guard
            .take()
            .ok_or_else(|| Error::Profiling("Profiler already finished".to_string()))?;

        let report = guard
            .report()
            .build()
            .map_err(|e| Error::Profiling(format!("Failed to generate profiler report: {}", e)))?;

        let mut svg = Vec::new();
        report
            .flamegraph(&mut svg)
            .map_err(|e| Error::Profiling(format!("Failed to generate flamegraph: {}", e)))?;

        Ok((summarize_top_functions(&report, TOP_FUNCTIONS), Some(svg)))
    }

    #[cfg(not(all(feature = "profiling", not(target_os = "windows"))))]
    fn take_samples(&mut self) -> Result<(Vec<FunctionSample>, Option<Vec<u8>>)> {
        Ok((Vec::new(), None))
    }
}

#[cfg(all(feature = "profiling", not(target_os = "windows")))]
fn summarize_top_functions(report: &pprof::Report, limit: usize) -> Vec<FunctionSample> {
    let mut totals: HashMap<String, i64> = HashMap::new();

    for (frames, count) in &report.data {
        let count = *count as i64;
        if count <= 0 {
            continue;
        }

        for frame_symbols in &frames.frames {
            for symbol in frame_symbols {
                *totals.entry(symbol.name()).or_insert(0) += count;
            }
        }
    }

    let total_counts: i64 = totals.values().copied().sum();

    let mut summary: Vec<FunctionSample> = totals
        .into_iter()
        .map(|(function, samples)| FunctionSample {
            percentage: if total_counts > 0 {
                (samples as f64 / total_counts as f64) * 100.0
            } else {
                0.0
            },
            function,
            samples,
        })
        .collect();

    summary.sort_by(|a, b| b.samples.cmp(&a.samples));
    summary.into_iter().take(limit).collect()
}
