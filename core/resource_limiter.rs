// Copyright 2018-2026 the Som authors. MIT license.

//! Background resource sampling: RSS, open file handles and cached-module
//! count. Crossing 90% of any configured limit fires the warning callback
//! once; the latch re-arms when the resource drops back below the line.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use log::warn;
use serde::Serialize;

use crate::config::ResourceLimitsConfig;
use crate::metrics;

const WARNING_FRACTION: f64 = 0.9;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceWarning {
  pub resource: String,
  pub current: u64,
  pub limit: u64,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceUsage {
  pub rss_bytes: u64,
  pub open_file_handles: u64,
  pub cached_modules: usize,
}

type WarningCallback = Box<dyn Fn(&ResourceWarning) + Send + Sync>;
type CachedModulesProvider = Arc<dyn Fn() -> usize + Send + Sync>;

pub struct ResourceLimiter {
  limits: ResourceLimitsConfig,
  warning_callback: Mutex<Option<WarningCallback>>,
  cached_modules: Mutex<Option<CachedModulesProvider>>,
  task: Mutex<Option<tokio::task::JoinHandle<()>>>,
  memory_warned: AtomicBool,
  handles_warned: AtomicBool,
  cache_warned: AtomicBool,
}

impl ResourceLimiter {
  pub fn new(limits: ResourceLimitsConfig) -> Self {
    Self {
      limits,
      warning_callback: Mutex::new(None),
      cached_modules: Mutex::new(None),
      task: Mutex::new(None),
      memory_warned: AtomicBool::new(false),
      handles_warned: AtomicBool::new(false),
      cache_warned: AtomicBool::new(false),
    }
  }

  pub fn limits(&self) -> &ResourceLimitsConfig {
    &self.limits
  }

  pub fn on_warning(&self, callback: WarningCallback) {
    *self.warning_callback.lock().unwrap() = Some(callback);
  }

  pub fn set_cached_modules_provider(&self, provider: CachedModulesProvider) {
    *self.cached_modules.lock().unwrap() = Some(provider);
  }

  /// Admission check: false once the module cache is at its limit.
  pub fn can_load_module(&self, cached_modules: usize) -> bool {
    cached_modules < self.limits.max_cached_modules
  }

  pub fn usage(&self) -> ResourceUsage {
    ResourceUsage {
      rss_bytes: metrics::rss_bytes(),
      open_file_handles: metrics::open_file_handles(),
      cached_modules: self
        .cached_modules
        .lock()
        .unwrap()
        .as_ref()
        .map(|provider| provider())
        .unwrap_or(0),
    }
  }

  /// Start the background sampling task. The task is detached and is
  /// aborted by `stop` (or on drop); it never blocks runtime shutdown.
  pub fn start(self: &Arc<Self>) {
    let mut task = self.task.lock().unwrap();
    if task.is_some() {
      return;
    }
    let limiter = Arc::clone(self);
    let interval = Duration::from_millis(self.limits.check_interval_ms);
    *task = Some(tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      ticker.set_missed_tick_behavior(
        tokio::time::MissedTickBehavior::Delay,
      );
      loop {
        ticker.tick().await;
        let usage = limiter.usage();
        limiter.evaluate_sample(&usage);
      }
    }));
  }

  pub fn stop(&self) {
    if let Some(task) = self.task.lock().unwrap().take() {
      task.abort();
    }
  }

  fn evaluate_sample(&self, usage: &ResourceUsage) {
    self.check_threshold(
      "memory",
      usage.rss_bytes,
      self.limits.max_memory_bytes,
      &self.memory_warned,
    );
    self.check_threshold(
      "fileHandles",
      usage.open_file_handles,
      self.limits.max_file_handles,
      &self.handles_warned,
    );
    self.check_threshold(
      "cachedModules",
      usage.cached_modules as u64,
      self.limits.max_cached_modules as u64,
      &self.cache_warned,
    );
  }

  fn check_threshold(
    &self,
    resource: &str,
    current: u64,
    limit: u64,
    latch: &AtomicBool,
  ) {
    let threshold = (limit as f64 * WARNING_FRACTION) as u64;
    if current >= threshold && limit > 0 {
      if !latch.swap(true, Ordering::SeqCst) {
        let warning = ResourceWarning {
          resource: resource.to_string(),
          current,
          limit,
        };
        warn!(
          "resource warning: {} at {} of limit {}",
          warning.resource, warning.current, warning.limit
        );
        if let Some(callback) = &*self.warning_callback.lock().unwrap() {
          callback(&warning);
        }
      }
    } else {
      latch.store(false, Ordering::SeqCst);
    }
  }
}

impl Drop for ResourceLimiter {
  fn drop(&mut self) {
    if let Some(task) = self.task.lock().unwrap().take() {
      task.abort();
    }
  }
}
