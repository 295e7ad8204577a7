// Copyright 2018-2026 the Som authors. MIT license.

//! Latency recorders, counters and health grading. Recorders keep a
//! bounded sample window so percentile queries stay cheap and memory
//! stays flat no matter how long the process runs.

use std::collections::VecDeque;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

use serde::Serialize;

use crate::cache::CacheStats;

const DEFAULT_SAMPLE_WINDOW: usize = 10_000;

#[derive(Debug)]
pub struct LatencyRecorder {
  count: u64,
  sum: f64,
  min: f64,
  max: f64,
  samples: VecDeque<f64>,
  window: usize,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LatencySnapshot {
  pub count: u64,
  pub mean_ms: f64,
  pub min_ms: f64,
  pub max_ms: f64,
  pub p50: f64,
  pub p95: f64,
  pub p99: f64,
  pub p999: f64,
}

impl LatencyRecorder {
  pub fn new(window: usize) -> Self {
    Self {
      count: 0,
      sum: 0.0,
      min: f64::INFINITY,
      max: 0.0,
      samples: VecDeque::with_capacity(window.min(1024)),
      window,
    }
  }

  pub fn record(&mut self, duration_ms: f64) {
    self.count += 1;
    self.sum += duration_ms;
    self.min = self.min.min(duration_ms);
    self.max = self.max.max(duration_ms);
    if self.samples.len() == self.window {
      self.samples.pop_front();
    }
    self.samples.push_back(duration_ms);
  }

  /// Percentile over the sample window, `p` in 0..=100.
  pub fn percentile(&self, p: f64) -> f64 {
    if self.samples.is_empty() {
      return 0.0;
    }
    let mut sorted: Vec<f64> = self.samples.iter().copied().collect();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let rank = (p / 100.0 * (sorted.len() - 1) as f64).round() as usize;
    sorted[rank.min(sorted.len() - 1)]
  }

  pub fn snapshot(&self) -> LatencySnapshot {
    LatencySnapshot {
      count: self.count,
      mean_ms: if self.count == 0 {
        0.0
      } else {
        self.sum / self.count as f64
      },
      min_ms: if self.min.is_finite() { self.min } else { 0.0 },
      max_ms: self.max,
      p50: self.percentile(50.0),
      p95: self.percentile(95.0),
      p99: self.percentile(99.0),
      p999: self.percentile(99.9),
    }
  }
}

#[derive(Debug, Default)]
pub struct Counters {
  pub requests: AtomicU64,
  pub load_errors: AtomicU64,
  pub compile_errors: AtomicU64,
  pub bundle_errors: AtomicU64,
  pub breaker_trips: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CounterSnapshot {
  pub requests: u64,
  pub load_errors: u64,
  pub compile_errors: u64,
  pub bundle_errors: u64,
  pub breaker_trips: u64,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemorySnapshot {
  pub rss_bytes: u64,
  pub heap_bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
  pub uptime_seconds: u64,
  pub counters: CounterSnapshot,
  pub load: LatencySnapshot,
  pub compile: LatencySnapshot,
  pub bundle: LatencySnapshot,
  pub memory: MemorySnapshot,
  pub cpu_percent: f64,
  pub load_average: [f64; 3],
  pub cache: CacheStats,
  pub cache_hit_rate: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
  Pass,
  Warn,
  Fail,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheck {
  pub name: String,
  pub status: CheckStatus,
  pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallHealth {
  Healthy,
  Degraded,
  Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
  pub status: OverallHealth,
  pub checks: Vec<HealthCheck>,
}

struct CpuTracker {
  last_cpu: Duration,
  last_wall: Instant,
}

pub struct Metrics {
  started_at: Instant,
  pub counters: Counters,
  load: Mutex<LatencyRecorder>,
  compile: Mutex<LatencyRecorder>,
  bundle: Mutex<LatencyRecorder>,
  cpu: Mutex<CpuTracker>,
}

impl Metrics {
  pub fn new() -> Self {
    Self {
      started_at: Instant::now(),
      counters: Counters::default(),
      load: Mutex::new(LatencyRecorder::new(DEFAULT_SAMPLE_WINDOW)),
      compile: Mutex::new(LatencyRecorder::new(DEFAULT_SAMPLE_WINDOW)),
      bundle: Mutex::new(LatencyRecorder::new(DEFAULT_SAMPLE_WINDOW)),
      cpu: Mutex::new(CpuTracker {
        last_cpu: process_cpu_time(),
        last_wall: Instant::now(),
      }),
    }
  }

  pub fn record_load(&self, duration: Duration) {
    self
      .load
      .lock()
      .unwrap()
      .record(duration.as_secs_f64() * 1000.0);
  }

  pub fn record_compile(&self, duration: Duration) {
    self
      .compile
      .lock()
      .unwrap()
      .record(duration.as_secs_f64() * 1000.0);
  }

  pub fn record_bundle(&self, duration: Duration) {
    self
      .bundle
      .lock()
      .unwrap()
      .record(duration.as_secs_f64() * 1000.0);
  }

  pub fn reset(&self) {
    *self.load.lock().unwrap() = LatencyRecorder::new(DEFAULT_SAMPLE_WINDOW);
    *self.compile.lock().unwrap() =
      LatencyRecorder::new(DEFAULT_SAMPLE_WINDOW);
    *self.bundle.lock().unwrap() = LatencyRecorder::new(DEFAULT_SAMPLE_WINDOW);
    self.counters.requests.store(0, Ordering::Relaxed);
    self.counters.load_errors.store(0, Ordering::Relaxed);
    self.counters.compile_errors.store(0, Ordering::Relaxed);
    self.counters.bundle_errors.store(0, Ordering::Relaxed);
    self.counters.breaker_trips.store(0, Ordering::Relaxed);
  }

  /// CPU percent since the previous call, derived from process CPU time
  /// deltas over wall time.
  fn cpu_percent(&self) -> f64 {
    let mut tracker = self.cpu.lock().unwrap();
    let now_cpu = process_cpu_time();
    let now_wall = Instant::now();
    let cpu_delta = now_cpu.saturating_sub(tracker.last_cpu);
    let wall_delta = now_wall.duration_since(tracker.last_wall);
    tracker.last_cpu = now_cpu;
    tracker.last_wall = now_wall;
    if wall_delta.is_zero() {
      return 0.0;
    }
    (cpu_delta.as_secs_f64() / wall_delta.as_secs_f64()) * 100.0
  }

  pub fn snapshot(&self, cache: CacheStats) -> MetricsSnapshot {
    MetricsSnapshot {
      uptime_seconds: self.started_at.elapsed().as_secs(),
      counters: CounterSnapshot {
        requests: self.counters.requests.load(Ordering::Relaxed),
        load_errors: self.counters.load_errors.load(Ordering::Relaxed),
        compile_errors: self.counters.compile_errors.load(Ordering::Relaxed),
        bundle_errors: self.counters.bundle_errors.load(Ordering::Relaxed),
        breaker_trips: self.counters.breaker_trips.load(Ordering::Relaxed),
      },
      load: self.load.lock().unwrap().snapshot(),
      compile: self.compile.lock().unwrap().snapshot(),
      bundle: self.bundle.lock().unwrap().snapshot(),
      memory: MemorySnapshot {
        rss_bytes: rss_bytes(),
        heap_bytes: heap_bytes(),
      },
      cpu_percent: self.cpu_percent(),
      load_average: load_average(),
      cache,
      cache_hit_rate: cache.hit_rate(),
    }
  }

  /// Grade memory, CPU, cache and error rate into a single report.
  pub fn health(&self, cache: CacheStats, memory_limit: u64) -> HealthReport {
    let mut checks = Vec::new();

    let rss = rss_bytes();
    let memory_fraction = if memory_limit == 0 {
      0.0
    } else {
      rss as f64 / memory_limit as f64
    };
    checks.push(grade(
      "memory",
      memory_fraction,
      0.75,
      0.9,
      format!("rss {} of limit {}", rss, memory_limit),
    ));

    let cores = available_cores().max(1) as f64;
    let load = load_average()[0] / cores;
    checks.push(grade(
      "cpu",
      load,
      0.8,
      1.0,
      format!("1m load average per core {:.2}", load),
    ));

    let cache_fraction = if cache.max_cache_size == 0 {
      0.0
    } else {
      cache.size as f64 / cache.max_cache_size as f64
    };
    checks.push(grade(
      "cache",
      cache_fraction,
      0.85,
      0.98,
      format!("{} of {} entries", cache.size, cache.max_cache_size),
    ));

    let requests = self.counters.requests.load(Ordering::Relaxed);
    let errors = self.counters.load_errors.load(Ordering::Relaxed)
      + self.counters.compile_errors.load(Ordering::Relaxed)
      + self.counters.bundle_errors.load(Ordering::Relaxed);
    let error_rate = if requests == 0 {
      0.0
    } else {
      errors as f64 / requests as f64
    };
    checks.push(grade(
      "errorRate",
      error_rate,
      0.05,
      0.25,
      format!("{} errors over {} requests", errors, requests),
    ));

    let status = if checks.iter().any(|c| c.status == CheckStatus::Fail) {
      OverallHealth::Unhealthy
    } else if checks.iter().any(|c| c.status == CheckStatus::Warn) {
      OverallHealth::Degraded
    } else {
      OverallHealth::Healthy
    };
    HealthReport { status, checks }
  }
}

impl Default for Metrics {
  fn default() -> Self {
    Self::new()
  }
}

fn grade(
  name: &str,
  value: f64,
  warn_at: f64,
  fail_at: f64,
  detail: String,
) -> HealthCheck {
  let status = if value >= fail_at {
    CheckStatus::Fail
  } else if value >= warn_at {
    CheckStatus::Warn
  } else {
    CheckStatus::Pass
  };
  HealthCheck {
    name: name.to_string(),
    status,
    detail,
  }
}

/// Process CPU time (user + system).
pub(crate) fn process_cpu_time() -> Duration {
  #[cfg(unix)]
  {
    // SAFETY: getrusage writes into the zeroed struct we hand it.
    unsafe {
      let mut usage: libc::rusage = std::mem::zeroed();
      if libc::getrusage(libc::RUSAGE_SELF, &mut usage) == 0 {
        let user = Duration::new(
          usage.ru_utime.tv_sec as u64,
          (usage.ru_utime.tv_usec as u32) * 1000,
        );
        let system = Duration::new(
          usage.ru_stime.tv_sec as u64,
          (usage.ru_stime.tv_usec as u32) * 1000,
        );
        return user + system;
      }
    }
  }
  Duration::ZERO
}

/// Resident set size in bytes; 0 where unsupported.
pub(crate) fn rss_bytes() -> u64 {
  #[cfg(target_os = "linux")]
  {
    if let Ok(statm) = std::fs::read_to_string("/proc/self/statm") {
      let mut fields = statm.split_whitespace();
      let _total = fields.next();
      if let Some(resident) = fields.next() {
        if let Ok(pages) = resident.parse::<u64>() {
          return pages * page_size();
        }
      }
    }
  }
  0
}

/// Data segment size, the closest stand-in for heap usage; 0 where
/// unsupported.
pub(crate) fn heap_bytes() -> u64 {
  #[cfg(target_os = "linux")]
  {
    if let Ok(statm) = std::fs::read_to_string("/proc/self/statm") {
      let fields: Vec<&str> = statm.split_whitespace().collect();
      if let Some(data) = fields.get(5) {
        if let Ok(pages) = data.parse::<u64>() {
          return pages * page_size();
        }
      }
    }
  }
  0
}

/// Open descriptor count; 0 where unsupported.
pub(crate) fn open_file_handles() -> u64 {
  #[cfg(target_os = "linux")]
  {
    if let Ok(entries) = std::fs::read_dir("/proc/self/fd") {
      return entries.count() as u64;
    }
  }
  0
}

pub(crate) fn load_average() -> [f64; 3] {
  #[cfg(unix)]
  {
    let mut avgs = [0.0f64; 3];
    // SAFETY: getloadavg fills at most the three slots we pass.
    let written = unsafe { libc::getloadavg(avgs.as_mut_ptr(), 3) };
    if written == 3 {
      return avgs;
    }
  }
  [0.0, 0.0, 0.0]
}

pub(crate) fn available_cores() -> usize {
  std::thread::available_parallelism()
    .map(|n| n.get())
    .unwrap_or(1)
}

#[cfg(target_os = "linux")]
fn page_size() -> u64 {
  // SAFETY: sysconf with a valid name has no preconditions.
  let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
  if size > 0 {
    size as u64
  } else {
    4096
  }
}
