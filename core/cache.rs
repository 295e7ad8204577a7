// Copyright 2018-2026 the Som authors. MIT license.

use std::collections::HashMap;
use std::time::Instant;

use serde::Serialize;

use crate::loader::LoadedModule;

/// Headroom left after a memory-driven eviction pass.
const EVICTION_HEADROOM: f64 = 0.8;

/// Per-entry footprint estimate. The constants are heuristics, tuned once
/// and kept in a single place.
pub fn estimate_footprint(module: &LoadedModule) -> u64 {
  2 * module.source.len() as u64
    + 2 * module.ast_size as u64
    + 50 * module.dependencies.len() as u64
    + 200
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
  pub size: usize,
  pub memory_usage: u64,
  pub max_cache_size: usize,
  pub max_cache_memory: u64,
  pub hits: u64,
  pub misses: u64,
}

impl CacheStats {
  pub fn hit_rate(&self) -> f64 {
    let total = self.hits + self.misses;
    if total == 0 {
      return 0.0;
    }
    self.hits as f64 / total as f64
  }
}

/// In-process module cache with LRU eviction over `last_accessed`.
/// Eviction fires when the entry count exceeds `max_size` or the estimated
/// memory exceeds `max_memory`; the memory pass trims to 80% of the budget.
#[derive(Debug)]
pub struct ModuleCache {
  entries: HashMap<String, LoadedModule>,
  max_size: usize,
  max_memory: u64,
  current_memory: u64,
  hits: u64,
  misses: u64,
}

impl ModuleCache {
  pub fn new(max_size: usize, max_memory: u64) -> Self {
    Self {
      entries: HashMap::new(),
      max_size,
      max_memory,
      current_memory: 0,
      hits: 0,
      misses: 0,
    }
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  pub fn contains(&self, id: &str) -> bool {
    self.entries.contains_key(id)
  }

  /// Cache probe. A hit refreshes the LRU timestamp.
  pub fn get(&mut self, id: &str) -> Option<LoadedModule> {
    match self.entries.get_mut(id) {
      Some(entry) => {
        entry.last_accessed = Instant::now();
        self.hits += 1;
        Some(entry.clone())
      }
      None => {
        self.misses += 1;
        None
      }
    }
  }

  /// Probe without touching hit counters or the LRU timestamp.
  pub fn peek(&self, id: &str) -> Option<&LoadedModule> {
    self.entries.get(id)
  }

  /// Insert or replace an entry, re-estimating its footprint and then
  /// enforcing both budgets.
  pub fn insert(&mut self, mut module: LoadedModule) {
    module.last_accessed = Instant::now();
    let footprint = estimate_footprint(&module);
    if let Some(previous) = self.entries.get(&module.id) {
      self.current_memory =
        self.current_memory.saturating_sub(estimate_footprint(previous));
    }
    self.current_memory += footprint;
    self.entries.insert(module.id.clone(), module);
    self.enforce_limits();
  }

  pub fn remove(&mut self, id: &str) -> Option<LoadedModule> {
    let removed = self.entries.remove(id);
    if let Some(module) = &removed {
      self.current_memory =
        self.current_memory.saturating_sub(estimate_footprint(module));
    }
    removed
  }

  pub fn clear(&mut self) {
    self.entries.clear();
    self.current_memory = 0;
  }

  pub fn module_ids(&self) -> Vec<String> {
    self.entries.keys().cloned().collect()
  }

  pub fn modules(&self) -> impl Iterator<Item = &LoadedModule> {
    self.entries.values()
  }

  pub fn stats(&self) -> CacheStats {
    CacheStats {
      size: self.entries.len(),
      memory_usage: self.current_memory,
      max_cache_size: self.max_size,
      max_cache_memory: self.max_memory,
      hits: self.hits,
      misses: self.misses,
    }
  }

  fn enforce_limits(&mut self) {
    while self.entries.len() > self.max_size {
      if !self.evict_oldest() {
        break;
      }
    }
    if self.current_memory > self.max_memory {
      let target = (self.max_memory as f64 * EVICTION_HEADROOM) as u64;
      while self.current_memory > target {
        if !self.evict_oldest() {
          break;
        }
      }
    }
  }

  /// Evict the least recently used finished entry. In-flight entries are
  /// never evicted; their bookkeeping lives on the loading stack.
  fn evict_oldest(&mut self) -> bool {
    let oldest = self
      .entries
      .values()
      .filter(|entry| !entry.is_loading)
      .min_by_key(|entry| entry.last_accessed)
      .map(|entry| entry.id.clone());
    match oldest {
      Some(id) => {
        log::debug!("evicting module from cache: {}", id);
        self.remove(&id).is_some()
      }
      None => false,
    }
  }
}

#[cfg(test)]
mod tests {
  use pretty_assertions::assert_eq;

  use super::*;
  use crate::loader::LoadedModule;

  fn module(id: &str, source_len: usize) -> LoadedModule {
    let mut module = LoadedModule::new(
      id.to_string(),
      std::path::PathBuf::from(id),
      ".som".to_string(),
    );
    module.source = "x".repeat(source_len);
    module.is_loaded = true;
    module.is_loading = false;
    module
  }

  #[test]
  fn tracks_memory_of_inserted_entries() {
    let mut cache = ModuleCache::new(10, 1024 * 1024);
    let m = module("/a.som", 100);
    let expected = estimate_footprint(&m);
    cache.insert(m);
    assert_eq!(cache.stats().memory_usage, expected);
    assert_eq!(cache.stats().size, 1);
  }

  #[test]
  fn count_eviction_removes_oldest_first() {
    let mut cache = ModuleCache::new(2, 1024 * 1024);
    cache.insert(module("/a.som", 10));
    std::thread::sleep(std::time::Duration::from_millis(2));
    cache.insert(module("/b.som", 10));
    std::thread::sleep(std::time::Duration::from_millis(2));
    // touch /a so /b becomes the LRU entry
    assert!(cache.get("/a.som").is_some());
    cache.insert(module("/c.som", 10));
    assert!(cache.contains("/a.som"));
    assert!(!cache.contains("/b.som"));
    assert!(cache.contains("/c.som"));
  }

  #[test]
  fn memory_eviction_trims_to_headroom() {
    // each module is 2*400 + 200 = 1000 bytes
    let mut cache = ModuleCache::new(100, 3000);
    for id in ["/a.som", "/b.som", "/c.som"] {
      std::thread::sleep(std::time::Duration::from_millis(2));
      cache.insert(module(id, 400));
    }
    assert_eq!(cache.stats().memory_usage, 3000);
    std::thread::sleep(std::time::Duration::from_millis(2));
    cache.insert(module("/d.som", 400));
    // 4000 bytes exceeds the budget; trimmed to <= 80% of 3000
    assert!(cache.stats().memory_usage <= 2400);
    assert!(!cache.contains("/a.som"));
    assert!(cache.contains("/d.som"));
  }

  #[test]
  fn replacing_an_entry_does_not_double_count() {
    let mut cache = ModuleCache::new(10, 1024 * 1024);
    cache.insert(module("/a.som", 100));
    cache.insert(module("/a.som", 100));
    let single = estimate_footprint(&module("/a.som", 100));
    assert_eq!(cache.stats().memory_usage, single);
  }

  #[test]
  fn hit_rate_counts_probes() {
    let mut cache = ModuleCache::new(10, 1024 * 1024);
    cache.insert(module("/a.som", 10));
    assert!(cache.get("/a.som").is_some());
    assert!(cache.get("/nope.som").is_none());
    let stats = cache.stats();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.hit_rate(), 0.5);
  }
}
