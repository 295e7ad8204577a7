// Copyright 2018-2026 the Som authors. MIT license.

use std::path::PathBuf;

use indexmap::IndexMap;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::errors::AnyError;
use crate::errors::ConfigurationError;

pub const DEFAULT_OPERATION_TIMEOUT_MS: u64 = 120_000;
pub const MIN_OPERATION_TIMEOUT_MS: u64 = 1_000;
pub const MAX_OPERATION_TIMEOUT_MS: u64 = 600_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Target {
  #[serde(rename = "es5")]
  Es5,
  #[serde(rename = "es2015")]
  Es2015,
  #[serde(rename = "es2020")]
  Es2020,
  #[serde(rename = "esnext")]
  EsNext,
}

impl Default for Target {
  fn default() -> Self {
    Self::Es2015
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CircularDependencyStrategy {
  Error,
  Warn,
  Ignore,
}

impl Default for CircularDependencyStrategy {
  fn default() -> Self {
    Self::Warn
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ResolutionConfig {
  /// Base directory for `/`-prefixed project-relative specifiers. Must be
  /// supplied explicitly; there is no current-directory fallback.
  pub base_url: PathBuf,
  /// Pattern -> mapping list, tried in order. Patterns are exact, `*`, or
  /// `prefix/*`.
  pub paths: IndexMap<String, Vec<String>>,
  pub extensions: Vec<String>,
  pub module_directories: Vec<String>,
}

impl Default for ResolutionConfig {
  fn default() -> Self {
    Self {
      base_url: PathBuf::new(),
      paths: IndexMap::new(),
      extensions: vec![
        ".som".to_string(),
        ".js".to_string(),
        ".json".to_string(),
      ],
      module_directories: vec!["node_modules".to_string()],
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LoadingConfig {
  pub circular_dependency_strategy: CircularDependencyStrategy,
  pub encoding: String,
  pub externals: Vec<String>,
  pub max_cache_size: usize,
  pub max_cache_memory: u64,
}

impl Default for LoadingConfig {
  fn default() -> Self {
    Self {
      circular_dependency_strategy: CircularDependencyStrategy::default(),
      encoding: "utf-8".to_string(),
      externals: Vec::new(),
      max_cache_size: 500,
      max_cache_memory: 100 * 1024 * 1024,
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CompilationConfig {
  pub target: Target,
  pub source_map: bool,
  pub minify: bool,
  pub no_type_check: bool,
  pub strict: bool,
  pub output: Option<PathBuf>,
  pub out_dir: Option<PathBuf>,
}

impl Default for CompilationConfig {
  fn default() -> Self {
    Self {
      target: Target::default(),
      source_map: true,
      minify: false,
      no_type_check: false,
      strict: false,
      output: None,
      out_dir: None,
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ResourceLimitsConfig {
  pub max_memory_bytes: u64,
  pub max_file_handles: u64,
  pub max_cached_modules: usize,
  #[serde(rename = "checkInterval")]
  pub check_interval_ms: u64,
}

impl Default for ResourceLimitsConfig {
  fn default() -> Self {
    Self {
      max_memory_bytes: 512 * 1024 * 1024,
      max_file_handles: 1_000,
      max_cached_modules: 1_000,
      check_interval_ms: 5_000,
    }
  }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ModuleSystemConfig {
  pub resolution: ResolutionConfig,
  pub loading: LoadingConfig,
  pub compilation: CompilationConfig,
  pub metrics: bool,
  pub circuit_breakers: bool,
  pub logger: bool,
  pub management_server: bool,
  pub management_port: u16,
  #[serde(rename = "operationTimeout")]
  pub operation_timeout_ms: u64,
  pub resource_limits: ResourceLimitsConfig,
}

impl ModuleSystemConfig {
  pub fn new(base_url: impl Into<PathBuf>) -> Self {
    Self {
      resolution: ResolutionConfig {
        base_url: base_url.into(),
        ..Default::default()
      },
      metrics: true,
      circuit_breakers: true,
      logger: true,
      management_server: false,
      management_port: 9090,
      operation_timeout_ms: DEFAULT_OPERATION_TIMEOUT_MS,
      ..Default::default()
    }
  }

  /// Validate the whole configuration, collecting every problem instead of
  /// failing on the first.
  pub fn validate(&self) -> Result<(), ConfigurationError> {
    let mut problems = Vec::new();

    if self.resolution.base_url.as_os_str().is_empty() {
      problems
        .push("resolution.baseUrl must be supplied explicitly".to_string());
    } else if !self.resolution.base_url.is_absolute() {
      problems.push(format!(
        "resolution.baseUrl must be an absolute path, got \"{}\"",
        self.resolution.base_url.display()
      ));
    }

    if self.resolution.extensions.is_empty() {
      problems
        .push("resolution.extensions must be a non-empty list".to_string());
    }
    for extension in &self.resolution.extensions {
      if !extension.starts_with('.') {
        problems.push(format!(
          "resolution.extensions entries must start with '.', got \"{}\"",
          extension
        ));
      }
    }

    if self.resolution.module_directories.is_empty() {
      problems.push(
        "resolution.moduleDirectories must be a non-empty list".to_string(),
      );
    }

    if self.loading.max_cache_size < 1 {
      problems.push("loading.maxCacheSize must be >= 1".to_string());
    }
    if self.loading.max_cache_memory < 1024 {
      problems.push("loading.maxCacheMemory must be >= 1024 bytes".to_string());
    }
    if encoding_rs::Encoding::for_label(self.loading.encoding.as_bytes())
      .is_none()
    {
      problems.push(format!(
        "loading.encoding \"{}\" is not a recognized encoding label",
        self.loading.encoding
      ));
    }

    if self.management_port < 1 {
      problems.push("managementPort must be in 1..65535".to_string());
    }
    if self.operation_timeout_ms < MIN_OPERATION_TIMEOUT_MS
      || self.operation_timeout_ms > MAX_OPERATION_TIMEOUT_MS
    {
      problems.push(format!(
        "operationTimeout must be between {}ms and {}ms, got {}ms",
        MIN_OPERATION_TIMEOUT_MS,
        MAX_OPERATION_TIMEOUT_MS,
        self.operation_timeout_ms
      ));
    }
    if self.management_server && !(self.metrics && self.circuit_breakers) {
      problems.push(
        "managementServer requires metrics and circuitBreakers to be enabled"
          .to_string(),
      );
    }

    let limits = &self.resource_limits;
    if limits.max_memory_bytes < 1024 * 1024 {
      problems
        .push("resourceLimits.maxMemoryBytes must be >= 1MB".to_string());
    }
    if limits.max_file_handles < 1 {
      problems
        .push("resourceLimits.maxFileHandles must be >= 1".to_string());
    }
    if limits.max_cached_modules < 1 {
      problems
        .push("resourceLimits.maxCachedModules must be >= 1".to_string());
    }
    if limits.check_interval_ms < 100 || limits.check_interval_ms > 60_000 {
      problems.push(
        "resourceLimits.checkInterval must be between 100ms and 60000ms"
          .to_string(),
      );
    }

    if problems.is_empty() {
      Ok(())
    } else {
      Err(ConfigurationError { problems })
    }
  }

  /// Apply a JSON object of updates on top of the current configuration and
  /// re-validate the result. Rejected wholesale on any problem.
  pub fn with_updates(&self, updates: &Value) -> Result<Self, AnyError> {
    if !updates.is_object() {
      anyhow::bail!("configuration updates must be a JSON object");
    }
    let mut merged = serde_json::to_value(self)?;
    json_merge(&mut merged, updates);
    let updated: ModuleSystemConfig = serde_json::from_value(merged)?;
    updated.validate()?;
    Ok(updated)
  }
}

/// A function that works like JavaScript's `Object.assign()`, recursively.
pub fn json_merge(a: &mut Value, b: &Value) {
  match (a, b) {
    (&mut Value::Object(ref mut a), &Value::Object(ref b)) => {
      for (k, v) in b {
        json_merge(a.entry(k.clone()).or_insert(Value::Null), v);
      }
    }
    (a, b) => {
      *a = b.clone();
    }
  }
}

#[cfg(test)]
mod tests {
  use pretty_assertions::assert_eq;
  use serde_json::json;

  use super::*;

  #[test]
  fn default_config_with_base_url_validates() {
    let config = ModuleSystemConfig::new("/project/src");
    assert!(config.validate().is_ok());
  }

  #[test]
  fn missing_base_url_is_rejected() {
    let config = ModuleSystemConfig::default();
    let err = config.validate().unwrap_err();
    assert!(err
      .problems
      .iter()
      .any(|p| p.contains("baseUrl must be supplied")));
  }

  #[test]
  fn validation_collects_every_problem() {
    let mut config = ModuleSystemConfig::new("/project");
    config.resolution.extensions = vec!["som".to_string()];
    config.loading.max_cache_memory = 10;
    config.operation_timeout_ms = 5;
    config.loading.encoding = "no-such-encoding".to_string();
    let err = config.validate().unwrap_err();
    assert_eq!(err.problems.len(), 4);
  }

  #[test]
  fn management_server_requires_metrics_and_breakers() {
    let mut config = ModuleSystemConfig::new("/project");
    config.management_server = true;
    config.metrics = false;
    let err = config.validate().unwrap_err();
    assert!(err
      .problems
      .iter()
      .any(|p| p.contains("managementServer requires")));
  }

  #[test]
  fn with_updates_merges_nested_objects() {
    let config = ModuleSystemConfig::new("/project");
    let updated = config
      .with_updates(&json!({
        "loading": { "maxCacheSize": 42 },
        "operationTimeout": 30_000,
      }))
      .unwrap();
    assert_eq!(updated.loading.max_cache_size, 42);
    assert_eq!(updated.operation_timeout_ms, 30_000);
    // untouched values survive the merge
    assert_eq!(updated.resolution.base_url, PathBuf::from("/project"));
  }

  #[test]
  fn with_updates_rejects_invalid_result() {
    let config = ModuleSystemConfig::new("/project");
    let result = config.with_updates(&json!({
      "loading": { "maxCacheMemory": 1 },
    }));
    assert!(result.is_err());
  }
}
