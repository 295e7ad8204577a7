// Copyright 2018-2026 the Som authors. MIT license.

//! Loads modules: resolve, read, parse, extract imports, recurse. The
//! loader owns the module cache and the in-flight loading stack; every
//! exit path restores both before propagating.

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Instant;

use futures::future::BoxFuture;
use futures::FutureExt;
use indexmap::IndexMap;
use log::debug;
use serde_json::Value;

use crate::ast::Program;
use crate::ast::SourcePipeline;
use crate::cache::CacheStats;
use crate::cache::ModuleCache;
use crate::circuit_breaker::CircuitBreakerManager;
use crate::config::CircularDependencyStrategy;
use crate::config::LoadingConfig;
use crate::config::ResolutionConfig;
use crate::errors::CircularDependencyError;
use crate::errors::LoadError;
use crate::errors::ParseError;
use crate::fs_util;
use crate::resolver::ResolvedModule;
use crate::resolver::Resolver;

const MAX_SPECIFIER_LENGTH: usize = 500;
const MAX_PARENT_SEGMENTS: usize = 5;

pub type LoadFuture<'a> = BoxFuture<'a, Result<LoadedModule, LoadError>>;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModuleExports {
  pub default: Option<Value>,
  pub named: IndexMap<String, Value>,
}

/// A module as the loader sees it. `is_loaded` and `is_loading` are
/// mutually exclusive once a load reaches a terminal state; an errored
/// module has both cleared and `error` set.
#[derive(Debug, Clone)]
pub struct LoadedModule {
  pub id: String,
  pub absolute_path: PathBuf,
  pub extension: String,
  pub source: String,
  pub ast: Option<Program>,
  pub ast_size: usize,
  /// Raw import specifiers in source order.
  pub dependencies: Vec<String>,
  pub exports: ModuleExports,
  pub is_loaded: bool,
  pub is_loading: bool,
  pub is_external: bool,
  pub last_accessed: Instant,
  pub error: Option<String>,
}

impl LoadedModule {
  pub fn new(id: String, absolute_path: PathBuf, extension: String) -> Self {
    Self {
      id,
      absolute_path,
      extension,
      source: String::new(),
      ast: None,
      ast_size: 0,
      dependencies: Vec::new(),
      exports: ModuleExports::default(),
      is_loaded: false,
      is_loading: false,
      is_external: false,
      last_accessed: Instant::now(),
      error: None,
    }
  }
}

/// Outcome of the shared pre-read phase of a load.
enum Begin {
  /// Cache hit, external, or policy-permitted cycle.
  Ready(LoadedModule),
  /// A fresh entry was created; the caller must read + ingest + finish.
  Fetch(ResolvedModule),
}

pub struct ModuleLoader {
  resolver: Resolver,
  pipeline: Arc<dyn SourcePipeline>,
  loading: LoadingConfig,
  /// The source-language extension; only files with it are parsed.
  language_extension: String,
  cache: Mutex<ModuleCache>,
  loading_stack: Mutex<Vec<String>>,
  warnings: Mutex<Vec<String>>,
  externals: Mutex<Vec<String>>,
  maybe_breakers: Option<Arc<CircuitBreakerManager>>,
}

impl ModuleLoader {
  pub fn new(
    resolution: ResolutionConfig,
    loading: LoadingConfig,
    pipeline: Arc<dyn SourcePipeline>,
    maybe_breakers: Option<Arc<CircuitBreakerManager>>,
  ) -> Self {
    let language_extension = resolution
      .extensions
      .first()
      .cloned()
      .unwrap_or_else(|| ".som".to_string());
    let cache =
      ModuleCache::new(loading.max_cache_size, loading.max_cache_memory);
    let externals = loading.externals.clone();
    Self {
      resolver: Resolver::new(resolution),
      pipeline,
      loading,
      language_extension,
      cache: Mutex::new(cache),
      loading_stack: Mutex::new(Vec::new()),
      warnings: Mutex::new(Vec::new()),
      externals: Mutex::new(externals),
      maybe_breakers,
    }
  }

  pub fn resolver(&self) -> &Resolver {
    &self.resolver
  }

  pub fn language_extension(&self) -> &str {
    &self.language_extension
  }

  /// Asynchronous load. Dependencies are loaded depth-first in source
  /// order; the returned module has its transitive closure in the cache.
  pub fn load<'a>(
    &'a self,
    specifier: &'a str,
    referrer: &'a Path,
  ) -> LoadFuture<'a> {
    async move {
      match self.begin(specifier, referrer)? {
        Begin::Ready(module) => Ok(module),
        Begin::Fetch(resolved) => {
          let id = module_id(&resolved.absolute_path);
          let bytes = match tokio::fs::read(&resolved.absolute_path).await {
            Ok(bytes) => bytes,
            Err(source) => {
              let err = LoadError::Io {
                path: resolved.absolute_path.clone(),
                source,
              };
              self.abandon(&id, &err);
              return Err(err);
            }
          };
          let dependencies = match self.ingest(&id, &resolved, bytes) {
            Ok(dependencies) => dependencies,
            Err(err) => {
              self.abandon(&id, &err);
              return Err(err);
            }
          };
          // Siblings keep loading after a failure; each failed subtree
          // retains its own error and the first one is propagated.
          let mut first_error = None;
          for dependency in &dependencies {
            if let Err(err) =
              self.load(dependency, &resolved.absolute_path).await
            {
              first_error.get_or_insert(err);
            }
          }
          if let Some(err) = first_error {
            self.abandon(&id, &err);
            return Err(err);
          }
          Ok(self.finish(&id))
        }
      }
    }
    .boxed()
  }

  /// Synchronous variant with identical semantics; performs the same work
  /// inline without yielding.
  pub fn load_sync(
    &self,
    specifier: &str,
    referrer: &Path,
  ) -> Result<LoadedModule, LoadError> {
    match self.begin(specifier, referrer)? {
      Begin::Ready(module) => Ok(module),
      Begin::Fetch(resolved) => {
        let id = module_id(&resolved.absolute_path);
        let bytes = match std::fs::read(&resolved.absolute_path) {
          Ok(bytes) => bytes,
          Err(source) => {
            let err = LoadError::Io {
              path: resolved.absolute_path.clone(),
              source,
            };
            self.abandon(&id, &err);
            return Err(err);
          }
        };
        let dependencies = match self.ingest(&id, &resolved, bytes) {
          Ok(dependencies) => dependencies,
          Err(err) => {
            self.abandon(&id, &err);
            return Err(err);
          }
        };
        let mut first_error = None;
        for dependency in &dependencies {
          if let Err(err) =
            self.load_sync(dependency, &resolved.absolute_path)
          {
            first_error.get_or_insert(err);
          }
        }
        if let Some(err) = first_error {
          self.abandon(&id, &err);
          return Err(err);
        }
        Ok(self.finish(&id))
      }
    }
  }

  /// Shared pre-read phase: externals, resolution, cache probe, cycle
  /// policy, entry creation.
  fn begin(
    &self,
    specifier: &str,
    referrer: &Path,
  ) -> Result<Begin, LoadError> {
    if let Some(canonical) = self.match_external(specifier) {
      return Ok(Begin::Ready(self.external_module(&canonical)));
    }

    let resolved = self.resolver.resolve(specifier, referrer)?;
    let id = module_id(&resolved.absolute_path);

    {
      let mut cache = self.cache.lock().unwrap();
      if let Some(entry) = cache.get(&id) {
        if entry.is_loaded {
          return Ok(Begin::Ready(entry));
        }
        if entry.is_loading {
          return self.handle_cycle(&id, entry).map(Begin::Ready);
        }
        // A previously failed entry: fall through and reload it.
      }
    }

    if self.loading_stack.lock().unwrap().contains(&id) {
      let partial = self
        .cache
        .lock()
        .unwrap()
        .peek(&id)
        .cloned()
        .unwrap_or_else(|| {
          LoadedModule::new(
            id.clone(),
            resolved.absolute_path.clone(),
            resolved.extension.clone(),
          )
        });
      return self.handle_cycle(&id, partial).map(Begin::Ready);
    }

    let mut entry = LoadedModule::new(
      id.clone(),
      resolved.absolute_path.clone(),
      resolved.extension.clone(),
    );
    entry.is_loading = true;
    self.cache.lock().unwrap().insert(entry);
    self.loading_stack.lock().unwrap().push(id);
    Ok(Begin::Fetch(resolved))
  }

  /// Apply the configured cycle policy to an in-flight entry.
  fn handle_cycle(
    &self,
    id: &str,
    partial: LoadedModule,
  ) -> Result<LoadedModule, LoadError> {
    let chain = {
      let stack = self.loading_stack.lock().unwrap();
      let start = stack.iter().position(|entry| entry == id).unwrap_or(0);
      let mut chain: Vec<String> = stack[start..].to_vec();
      chain.push(id.to_string());
      chain
    };
    let err = CircularDependencyError::new(chain);
    match self.loading.circular_dependency_strategy {
      CircularDependencyStrategy::Error => Err(err.into()),
      CircularDependencyStrategy::Warn => {
        self.warnings.lock().unwrap().push(err.to_string());
        Ok(partial)
      }
      CircularDependencyStrategy::Ignore => Ok(partial),
    }
  }

  /// Decode, parse and record a freshly read module; returns the raw
  /// dependency specifiers to load next.
  fn ingest(
    &self,
    id: &str,
    resolved: &ResolvedModule,
    bytes: Vec<u8>,
  ) -> Result<Vec<String>, LoadError> {
    let source = self.decode(&resolved.absolute_path, bytes)?;

    let (ast, ast_size, dependencies) =
      if resolved.extension == self.language_extension {
        let output = self.pipeline.parse(&source);
        if !output.errors.is_empty() {
          return Err(
            ParseError {
              path: resolved.absolute_path.clone(),
              message: output.errors[0].clone(),
              diagnostics: output.errors,
            }
            .into(),
          );
        }
        let mut dependencies = Vec::new();
        for declaration in &output.dependencies {
          let raw = declaration.source.value.as_str();
          if let Some(reason) = suspicious_specifier(raw) {
            self.warnings.lock().unwrap().push(format!(
              "Ignoring suspicious import specifier \"{}\" in {}: {}",
              raw, id, reason
            ));
            continue;
          }
          dependencies.push(raw.to_string());
        }
        let ast_size = output.program.serialized_len();
        (Some(output.program), ast_size, dependencies)
      } else {
        (None, 0, Vec::new())
      };

    {
      let mut cache = self.cache.lock().unwrap();
      if let Some(mut entry) = cache.peek(id).cloned() {
        entry.source = source;
        entry.ast = ast;
        entry.ast_size = ast_size;
        entry.dependencies = dependencies.clone();
        cache.insert(entry);
      }
    }
    Ok(dependencies)
  }

  /// Terminal success: flip the entry to loaded, enforce cache budgets,
  /// pop the loading stack.
  fn finish(&self, id: &str) -> LoadedModule {
    let mut cache = self.cache.lock().unwrap();
    let mut entry = cache
      .peek(id)
      .cloned()
      .expect("in-flight module disappeared from cache");
    entry.is_loading = false;
    entry.is_loaded = true;
    entry.error = None;
    cache.insert(entry.clone());
    drop(cache);
    self.pop_loading(id);
    debug!("loaded module {}", id);
    entry
  }

  /// Terminal failure: retain the entry with its error for validation
  /// queries, pop the loading stack.
  fn abandon(&self, id: &str, err: &LoadError) {
    let mut cache = self.cache.lock().unwrap();
    if let Some(mut entry) = cache.peek(id).cloned() {
      entry.is_loading = false;
      entry.is_loaded = false;
      entry.error = Some(err.to_retained());
      cache.insert(entry);
    }
    drop(cache);
    self.pop_loading(id);
  }

  fn pop_loading(&self, id: &str) {
    let mut stack = self.loading_stack.lock().unwrap();
    if let Some(position) = stack.iter().rposition(|entry| entry == id) {
      stack.remove(position);
    }
  }

  fn decode(
    &self,
    path: &Path,
    bytes: Vec<u8>,
  ) -> Result<String, LoadError> {
    let encoding =
      encoding_rs::Encoding::for_label(self.loading.encoding.as_bytes())
        .ok_or_else(|| LoadError::Encoding {
          path: path.to_path_buf(),
          label: self.loading.encoding.clone(),
        })?;
    let (text, _, _) = encoding.decode(&bytes);
    Ok(text.into_owned())
  }

  /// Raw-specifier match against the configured externals, with and
  /// without the `.js` / language extensions. Returns the canonical name.
  fn match_external(&self, specifier: &str) -> Option<String> {
    let canonical = |name: &str| -> String {
      name
        .strip_suffix(".js")
        .or_else(|| name.strip_suffix(self.language_extension.as_str()))
        .unwrap_or(name)
        .to_string()
    };
    let target = canonical(specifier);
    let externals = self.externals.lock().unwrap();
    externals
      .iter()
      .find(|external| canonical(external) == target)
      .map(|_| target.clone())
  }

  /// Construct (or fetch) the synthetic module for an external. The
  /// construction is gated by the external's circuit breaker; an open
  /// circuit yields a fallback stub carrying the failure cause.
  fn external_module(&self, canonical: &str) -> LoadedModule {
    let id = format!("external:{}", canonical);
    if let Some(entry) = self.cache.lock().unwrap().get(&id) {
      return entry;
    }
    let mut module =
      LoadedModule::new(id.clone(), PathBuf::from(&id), String::new());
    module.is_external = true;
    module.is_loaded = true;
    if let Some(breakers) = &self.maybe_breakers {
      match breakers.check(&id) {
        Ok(()) => breakers.record_success(&id),
        Err(open) => {
          // Fallback stub; not cached, so recovery is observed.
          module.error = Some(open.to_string());
          return module;
        }
      }
    }
    self.cache.lock().unwrap().insert(module.clone());
    module
  }

  pub fn get_module(&self, id: &str) -> Option<LoadedModule> {
    self.cache.lock().unwrap().peek(id).cloned()
  }

  pub fn is_loaded(&self, id: &str) -> bool {
    self
      .cache
      .lock()
      .unwrap()
      .peek(id)
      .map(|entry| entry.is_loaded)
      .unwrap_or(false)
  }

  pub fn get_all_modules(&self) -> Vec<LoadedModule> {
    self.cache.lock().unwrap().modules().cloned().collect()
  }

  /// Module id -> raw dependency specifiers.
  pub fn get_dependency_graph(&self) -> IndexMap<String, Vec<String>> {
    let cache = self.cache.lock().unwrap();
    let mut graph = IndexMap::new();
    for module in cache.modules() {
      graph.insert(module.id.clone(), module.dependencies.clone());
    }
    graph
  }

  pub fn invalidate(&self, path: &Path) -> bool {
    let id = module_id(path);
    self.cache.lock().unwrap().remove(&id).is_some()
  }

  pub fn clear_cache(&self) {
    self.cache.lock().unwrap().clear();
    self.loading_stack.lock().unwrap().clear();
  }

  pub fn get_cache_stats(&self) -> CacheStats {
    self.cache.lock().unwrap().stats()
  }

  pub fn cached_module_count(&self) -> usize {
    self.cache.lock().unwrap().len()
  }

  pub fn get_warnings(&self) -> Vec<String> {
    self.warnings.lock().unwrap().clone()
  }

  pub fn clear_warnings(&self) {
    self.warnings.lock().unwrap().clear();
  }

  pub fn drain_warnings(&self) -> Vec<String> {
    std::mem::take(&mut *self.warnings.lock().unwrap())
  }

  pub fn set_externals(&self, externals: Vec<String>) {
    *self.externals.lock().unwrap() = externals;
  }

  pub fn get_externals(&self) -> Vec<String> {
    self.externals.lock().unwrap().clone()
  }
}

/// Stable module id: the normalized absolute path with forward slashes.
pub fn module_id(path: &Path) -> String {
  fs_util::to_forward_slashes(&fs_util::normalize_path(path))
}

/// Why a specifier is rejected before resolution, if it is.
fn suspicious_specifier(specifier: &str) -> Option<&'static str> {
  if specifier.is_empty() {
    return Some("empty specifier");
  }
  if specifier.len() > MAX_SPECIFIER_LENGTH {
    return Some("specifier too long");
  }
  if specifier.contains('\\') {
    return Some("backslashes are not allowed in specifiers");
  }
  let parents = specifier
    .split('/')
    .filter(|segment| *segment == "..")
    .count();
  if parents >= MAX_PARENT_SEGMENTS {
    return Some("too many parent directory segments");
  }
  None
}
