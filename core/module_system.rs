// Copyright 2018-2026 the Som authors. MIT license.

//! The module system facade: wires the resolver, loader, registry, driver
//! and bundler together with the operational envelope (timeouts, breakers,
//! resource limits, metrics, logging, management server, shutdown).

use std::future::Future;
use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

use serde::Serialize;

use crate::ast::SourcePipeline;
use crate::bundler::BundleOptions;
use crate::bundler::BundleOutput;
use crate::bundler::Bundler;
use crate::bundler::Minifier;
use crate::cache::CacheStats;
use crate::circuit_breaker::CircuitBreakerConfig;
use crate::circuit_breaker::CircuitBreakerManager;
use crate::compiler::CompileResult;
use crate::compiler::CompilerDriver;
use crate::config::CompilationConfig;
use crate::config::ModuleSystemConfig;
use crate::errors::AnyError;
use crate::errors::ConfigurationError;
use crate::errors::ResourceLimitError;
use crate::errors::TimeoutError;
use crate::loader::LoadedModule;
use crate::loader::ModuleLoader;
use crate::logger;
use crate::logger::LogFormat;
use crate::logger::LogLevel;
use crate::logger::Logger;
use crate::management_server::ManagementServer;
use crate::management_server::ManagementState;
use crate::metrics::HealthReport;
use crate::metrics::Metrics;
use crate::metrics::MetricsSnapshot;
use crate::registry::ModuleRegistry;
use crate::registry::RegistryStatistics;
use crate::resolver::Resolver;
use crate::resource_limiter::ResourceLimiter;
use crate::watcher::FileWatcher;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_millis(30_000);

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
  pub is_valid: bool,
  pub errors: Vec<String>,
  pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleInfo {
  pub id: String,
  pub absolute_path: PathBuf,
  pub is_loaded: bool,
  pub is_external: bool,
  pub source_size: usize,
  pub error: Option<String>,
  pub dependencies: Vec<String>,
  pub dependents: Vec<String>,
  pub level: Option<usize>,
}

pub struct ModuleSystem {
  config: Arc<Mutex<ModuleSystemConfig>>,
  logger: Logger,
  metrics: Arc<Metrics>,
  breakers: Arc<CircuitBreakerManager>,
  limiter: Arc<ResourceLimiter>,
  loader: Arc<ModuleLoader>,
  registry: Arc<ModuleRegistry>,
  driver: CompilerDriver,
  bundler: Bundler,
  management: Mutex<Option<ManagementServer>>,
  watchers: Mutex<Vec<FileWatcher>>,
  shutdown_started: AtomicBool,
}

impl ModuleSystem {
  /// Validate the configuration eagerly and wire every component. Fails
  /// with the full list of configuration problems, never the first one.
  pub fn new(
    config: ModuleSystemConfig,
    pipeline: Arc<dyn SourcePipeline>,
  ) -> Result<Arc<Self>, ConfigurationError> {
    Self::build(config, pipeline, None)
  }

  /// Like `new`, with a minifier plugged into the bundler.
  pub fn new_with_minifier(
    config: ModuleSystemConfig,
    pipeline: Arc<dyn SourcePipeline>,
    minifier: Box<dyn Minifier>,
  ) -> Result<Arc<Self>, ConfigurationError> {
    Self::build(config, pipeline, Some(minifier))
  }

  fn build(
    config: ModuleSystemConfig,
    pipeline: Arc<dyn SourcePipeline>,
    maybe_minifier: Option<Box<dyn Minifier>>,
  ) -> Result<Arc<Self>, ConfigurationError> {
    config.validate()?;

    let logger = if config.logger {
      Logger::new("module-system", LogLevel::Info, LogFormat::Pretty)
    } else {
      logger::disabled()
    };
    let metrics = Arc::new(Metrics::new());
    let breakers = Arc::new(CircuitBreakerManager::new(
      CircuitBreakerConfig::default(),
      Some(Arc::clone(&metrics)),
    ));
    let limiter =
      Arc::new(ResourceLimiter::new(config.resource_limits.clone()));

    let loader = Arc::new(ModuleLoader::new(
      config.resolution.clone(),
      config.loading.clone(),
      Arc::clone(&pipeline),
      config.circuit_breakers.then(|| Arc::clone(&breakers)),
    ));
    let registry =
      Arc::new(ModuleRegistry::new(config.resolution.extensions.clone()));
    let driver = CompilerDriver::new(
      Arc::clone(&loader),
      Arc::clone(&registry),
      pipeline,
      config.compilation.clone(),
    );
    let mut bundler = Bundler::new(Resolver::new(config.resolution.clone()));
    if let Some(minifier) = maybe_minifier {
      bundler = bundler.with_minifier(minifier);
    }

    let cached_loader = Arc::clone(&loader);
    limiter.set_cached_modules_provider(Arc::new(move || {
      cached_loader.cached_module_count()
    }));

    let system = Arc::new(Self {
      config: Arc::new(Mutex::new(config)),
      logger,
      metrics,
      breakers,
      limiter,
      loader,
      registry,
      driver,
      bundler,
      management: Mutex::new(None),
      watchers: Mutex::new(Vec::new()),
      shutdown_started: AtomicBool::new(false),
    });
    system.logger.info("module system initialized");
    Ok(system)
  }

  /// Launch the background pieces: resource sampling and, when enabled,
  /// the management HTTP listener.
  pub async fn start(&self) -> Result<(), AnyError> {
    self.limiter.start();
    let (enabled, port) = {
      let config = self.config.lock().unwrap();
      (config.management_server, config.management_port)
    };
    if enabled {
      let state = Arc::new(ManagementState {
        config: Arc::clone(&self.config),
        metrics: Arc::clone(&self.metrics),
        breakers: Arc::clone(&self.breakers),
        cache_stats: {
          let loader = Arc::clone(&self.loader);
          Arc::new(move || loader.get_cache_stats())
        },
      });
      let server = ManagementServer::start(port, state).await?;
      self
        .logger
        .info(&format!("management server on {}", server.local_addr()));
      *self.management.lock().unwrap() = Some(server);
    }
    Ok(())
  }

  pub fn management_addr(&self) -> Option<std::net::SocketAddr> {
    self
      .management
      .lock()
      .unwrap()
      .as_ref()
      .map(|server| server.local_addr())
  }

  fn operation_timeout(&self) -> Duration {
    Duration::from_millis(self.config.lock().unwrap().operation_timeout_ms)
  }

  fn admit_load(&self) -> Result<(), ResourceLimitError> {
    let cached = self.loader.cached_module_count();
    if !self.limiter.can_load_module(cached) {
      return Err(ResourceLimitError {
        resource: "cachedModules".to_string(),
        message: format!(
          "module cache holds {} of {} entries",
          cached,
          self.limiter.limits().max_cached_modules
        ),
      });
    }
    Ok(())
  }

  /// Load a module and its transitive dependencies.
  pub async fn load(
    &self,
    specifier: &str,
    maybe_referrer: Option<&Path>,
  ) -> Result<LoadedModule, AnyError> {
    self.metrics.counters.requests.fetch_add(1, Ordering::Relaxed);
    self.admit_load()?;
    let referrer = self.referrer_or_base(maybe_referrer);
    let op_logger = self.operation_logger("load");
    let started = Instant::now();
    let result = with_timeout(
      "load",
      self.operation_timeout(),
      async { self.loader.load(specifier, &referrer).await.map_err(Into::into) },
    )
    .await;
    self.metrics.record_load(started.elapsed());
    match &result {
      Ok(module) => {
        self.register_graph();
        op_logger.debug(&format!("loaded {}", module.id));
      }
      Err(err) => {
        self
          .metrics
          .counters
          .load_errors
          .fetch_add(1, Ordering::Relaxed);
        op_logger.error(&format!("load failed: {}", err));
      }
    }
    result
  }

  /// Synchronous load with identical semantics.
  pub fn load_sync(
    &self,
    specifier: &str,
    maybe_referrer: Option<&Path>,
  ) -> Result<LoadedModule, AnyError> {
    self.metrics.counters.requests.fetch_add(1, Ordering::Relaxed);
    self.admit_load()?;
    let referrer = self.referrer_or_base(maybe_referrer);
    let started = Instant::now();
    let result = self
      .loader
      .load_sync(specifier, &referrer)
      .map_err(AnyError::from);
    self.metrics.record_load(started.elapsed());
    match &result {
      Ok(_) => self.register_graph(),
      Err(_) => {
        self
          .metrics
          .counters
          .load_errors
          .fetch_add(1, Ordering::Relaxed);
      }
    }
    result
  }

  pub async fn compile(
    &self,
    entry_point: &Path,
    externals: Option<Vec<String>>,
    overrides: Option<CompilationConfig>,
  ) -> Result<CompileResult, AnyError> {
    self.metrics.counters.requests.fetch_add(1, Ordering::Relaxed);
    let op_logger = self.operation_logger("compile");
    let started = Instant::now();
    let result = with_timeout(
      "compile",
      self.operation_timeout(),
      async {
        Ok(self.driver.compile(entry_point, externals, overrides).await)
      },
    )
    .await;
    self.metrics.record_compile(started.elapsed());
    if let Ok(compile_result) = &result {
      if !compile_result.errors.is_empty() {
        self.metrics.counters.compile_errors.fetch_add(
          compile_result.errors.len() as u64,
          Ordering::Relaxed,
        );
      }
      op_logger.debug(&format!(
        "compiled {} modules with {} errors",
        compile_result.modules.len(),
        compile_result.errors.len()
      ));
    }
    result
  }

  pub fn compile_sync(
    &self,
    entry_point: &Path,
    externals: Option<Vec<String>>,
    overrides: Option<CompilationConfig>,
  ) -> CompileResult {
    self.metrics.counters.requests.fetch_add(1, Ordering::Relaxed);
    let started = Instant::now();
    let result = self.driver.compile_sync(entry_point, externals, overrides);
    self.metrics.record_compile(started.elapsed());
    if !result.errors.is_empty() {
      self
        .metrics
        .counters
        .compile_errors
        .fetch_add(result.errors.len() as u64, Ordering::Relaxed);
    }
    result
  }

  /// Configured output location, used when the caller does not name one.
  fn default_output_path(&self) -> Option<PathBuf> {
    let config = self.config.lock().unwrap();
    let output = config.compilation.output.clone()?;
    Some(match &config.compilation.out_dir {
      Some(dir) => dir.join(output),
      None => output,
    })
  }

  /// Compile the entry's graph and splice it into one artifact.
  pub async fn bundle(
    &self,
    entry_point: &Path,
    mut options: BundleOptions,
  ) -> Result<BundleOutput, AnyError> {
    if options.output_path.is_none() {
      options.output_path = self.default_output_path();
    }
    self.metrics.counters.requests.fetch_add(1, Ordering::Relaxed);
    let op_logger = self.operation_logger("bundle");
    let started = Instant::now();
    let externals = if options.externals.is_empty() {
      None
    } else {
      Some(options.externals.clone())
    };
    let result = with_timeout(
      "bundle",
      self.operation_timeout(),
      async {
        let compiled =
          self.driver.compile(entry_point, externals, None).await;
        self.bundler.bundle(&compiled, &options).map_err(Into::into)
      },
    )
    .await;
    self.metrics.record_bundle(started.elapsed());
    match &result {
      Ok(output) => op_logger.debug(&format!(
        "bundle produced {} bytes",
        output.code.len()
      )),
      Err(err) => {
        self
          .metrics
          .counters
          .bundle_errors
          .fetch_add(1, Ordering::Relaxed);
        op_logger.error(&format!("bundle failed: {}", err));
      }
    }
    result
  }

  pub fn bundle_sync(
    &self,
    entry_point: &Path,
    mut options: BundleOptions,
  ) -> Result<BundleOutput, AnyError> {
    if options.output_path.is_none() {
      options.output_path = self.default_output_path();
    }
    self.metrics.counters.requests.fetch_add(1, Ordering::Relaxed);
    let started = Instant::now();
    let externals = if options.externals.is_empty() {
      None
    } else {
      Some(options.externals.clone())
    };
    let compiled = self.driver.compile_sync(entry_point, externals, None);
    let result = self
      .bundler
      .bundle(&compiled, &options)
      .map_err(AnyError::from);
    self.metrics.record_bundle(started.elapsed());
    if result.is_err() {
      self
        .metrics
        .counters
        .bundle_errors
        .fetch_add(1, Ordering::Relaxed);
    }
    result
  }

  /// Re-resolve every recorded dependency and report what is missing.
  pub fn validate(&self) -> ValidationReport {
    let mut report = ValidationReport {
      is_valid: true,
      errors: Vec::new(),
      warnings: self.loader.get_warnings(),
    };
    let externals = self.loader.get_externals();
    for module in self.loader.get_all_modules() {
      if module.is_external {
        continue;
      }
      let mut missing = 0;
      for raw in &module.dependencies {
        if externals.iter().any(|external| external == raw) {
          continue;
        }
        if let Err(err) = self
          .loader
          .resolver()
          .resolve(raw, &module.absolute_path)
        {
          missing += 1;
          report.errors.push(format!(
            "Missing dependency '{}' in module '{}': {}",
            raw, module.id, err
          ));
        }
      }
      // A load failure not explained by a missing dependency (I/O, parse)
      // is reported on its own.
      if missing == 0 {
        if let Some(error) = &module.error {
          report.errors.push(format!(
            "Module '{}' failed to load: {}",
            module.id, error
          ));
        }
      }
    }
    for cycle in self.registry.find_circular_dependencies() {
      report
        .warnings
        .push(format!("Circular dependency: {}", cycle.join(" -> ")));
    }
    report.is_valid = report.errors.is_empty();
    report
  }

  /// Watch paths and invalidate changed modules; `callback` fires after
  /// the loader state is refreshed.
  pub fn watch(
    &self,
    paths: Vec<PathBuf>,
    callback: Option<Arc<dyn Fn(&[PathBuf]) + Send + Sync>>,
  ) -> Result<(), AnyError> {
    let loader = Arc::clone(&self.loader);
    let registry = Arc::clone(&self.registry);
    let watcher = FileWatcher::start(
      paths,
      Arc::new(move |changed: &[PathBuf]| {
        for path in changed {
          if loader.invalidate(path) {
            registry.remove(&crate::loader::module_id(path));
          }
        }
        if let Some(callback) = &callback {
          callback(changed);
        }
      }),
    )?;
    self.watchers.lock().unwrap().push(watcher);
    Ok(())
  }

  /// Close every active watcher; each close races a bounded timeout.
  pub async fn stop_watching(&self) {
    let watchers: Vec<FileWatcher> =
      self.watchers.lock().unwrap().drain(..).collect();
    for watcher in watchers {
      if !watcher.close().await {
        self.logger.warn("file watcher did not close in time");
      }
    }
  }

  pub fn get_module(&self, id: &str) -> Option<LoadedModule> {
    self.loader.get_module(id)
  }

  /// Combined loader + registry view of one module.
  pub fn get_module_info(&self, id: &str) -> Option<ModuleInfo> {
    let module = self.loader.get_module(id)?;
    let node = self.registry.get_node(id);
    Some(ModuleInfo {
      id: module.id.clone(),
      absolute_path: module.absolute_path.clone(),
      is_loaded: module.is_loaded,
      is_external: module.is_external,
      source_size: module.source.len(),
      error: module.error.clone(),
      dependencies: node
        .as_ref()
        .map(|node| node.dependencies.clone())
        .unwrap_or_else(|| module.dependencies.clone()),
      dependents: node
        .as_ref()
        .map(|node| node.dependents.clone())
        .unwrap_or_default(),
      level: node.and_then(|node| node.level),
    })
  }

  pub fn loader(&self) -> &ModuleLoader {
    &self.loader
  }

  pub fn registry(&self) -> &ModuleRegistry {
    &self.registry
  }

  pub fn breakers(&self) -> &CircuitBreakerManager {
    &self.breakers
  }

  pub fn get_cache_stats(&self) -> CacheStats {
    self.loader.get_cache_stats()
  }

  pub fn get_statistics(&self) -> RegistryStatistics {
    self.registry.get_statistics()
  }

  pub fn metrics_snapshot(&self) -> MetricsSnapshot {
    self.metrics.snapshot(self.loader.get_cache_stats())
  }

  pub fn health(&self) -> HealthReport {
    let memory_limit = self
      .config
      .lock()
      .unwrap()
      .resource_limits
      .max_memory_bytes;
    self
      .metrics
      .health(self.loader.get_cache_stats(), memory_limit)
  }

  pub fn clear_cache(&self) {
    self.loader.clear_cache();
    self.registry.clear();
  }

  pub fn config_snapshot(&self) -> ModuleSystemConfig {
    self.config.lock().unwrap().clone()
  }

  /// Register the loader's current module set into the registry.
  fn register_graph(&self) {
    for module in self.loader.get_all_modules() {
      let _ = self.registry.register(&module);
    }
  }

  fn referrer_or_base(&self, maybe_referrer: Option<&Path>) -> PathBuf {
    match maybe_referrer {
      Some(referrer) => referrer.to_path_buf(),
      None => self.config.lock().unwrap().resolution.base_url.clone(),
    }
  }

  fn operation_logger(&self, operation: &str) -> Logger {
    self
      .logger
      .child(operation)
      .with_context("correlationId", &uuid::Uuid::new_v4().to_string())
  }

  /// Graceful shutdown: resource limiter, watchers, breakers, management
  /// server, caches. Each step may fail without aborting the rest; the
  /// whole sequence is bounded by one timeout. Safe to call twice.
  pub async fn shutdown(&self) {
    if self.shutdown_started.swap(true, Ordering::SeqCst) {
      return;
    }
    self.logger.info("shutting down module system");
    let sequence = async {
      self.limiter.stop();
      self.stop_watching().await;
      self.breakers.shutdown();
      let maybe_server = self.management.lock().unwrap().take();
      if let Some(server) = maybe_server {
        server.stop().await;
      }
      self.clear_cache();
    };
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, sequence).await.is_err() {
      self.logger.error("shutdown timed out; continuing exit");
    } else {
      self.logger.info("shutdown complete");
    }
  }

  /// Install SIGTERM/SIGINT/SIGHUP handlers that trigger `shutdown()`
  /// exactly once; later signals are ignored.
  #[cfg(unix)]
  pub fn install_signal_handlers(self: &Arc<Self>) -> Result<(), AnyError> {
    use tokio::signal::unix::signal;
    use tokio::signal::unix::SignalKind;

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sighup = signal(SignalKind::hangup())?;
    let system = Arc::clone(self);
    tokio::spawn(async move {
      tokio::select! {
        _ = sigterm.recv() => {}
        _ = sigint.recv() => {}
        _ = sighup.recv() => {}
      }
      system.shutdown().await;
    });
    Ok(())
  }
}

/// Race a future against a deadline. The timer is dropped with the race,
/// so neither path leaks it.
pub(crate) async fn with_timeout<T, F>(
  operation: &str,
  timeout: Duration,
  future: F,
) -> Result<T, AnyError>
where
  F: Future<Output = Result<T, AnyError>>,
{
  match tokio::time::timeout(timeout, future).await {
    Ok(result) => result,
    Err(_) => Err(
      TimeoutError {
        operation: operation.to_string(),
        timeout_ms: timeout.as_millis() as u64,
      }
      .into(),
    ),
  }
}
