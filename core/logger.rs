// Copyright 2018-2026 the Som authors. MIT license.

//! Structured logging. Loggers are dependency-injected values, not
//! globals; children inherit an immutable context map from their parent.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use serde::Deserialize;
use serde::Serialize;
use serde_json::json;

#[derive(
  Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
  Trace,
  Debug,
  Info,
  Warn,
  Error,
  Fatal,
}

impl LogLevel {
  fn label(self) -> &'static str {
    match self {
      LogLevel::Trace => "TRACE",
      LogLevel::Debug => "DEBUG",
      LogLevel::Info => "INFO",
      LogLevel::Warn => "WARN",
      LogLevel::Error => "ERROR",
      LogLevel::Fatal => "FATAL",
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
  Pretty,
  Json,
}

type Sink = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Clone)]
pub struct Logger {
  component: String,
  min_level: LogLevel,
  format: LogFormat,
  context: BTreeMap<String, String>,
  sink: Sink,
}

impl Logger {
  pub fn new(component: &str, min_level: LogLevel, format: LogFormat) -> Self {
    Self {
      component: component.to_string(),
      min_level,
      format,
      context: BTreeMap::new(),
      sink: Arc::new(|line| eprintln!("{}", line)),
    }
  }

  /// Redirect output; used by tests and by hosts that own stderr.
  pub fn with_sink(mut self, sink: Sink) -> Self {
    self.sink = sink;
    self
  }

  /// Child logger for a sub-component, inheriting context.
  pub fn child(&self, component: &str) -> Logger {
    let mut child = self.clone();
    child.component = format!("{}.{}", self.component, component);
    child
  }

  /// Same logger with one more context entry (e.g. a correlation id).
  pub fn with_context(&self, key: &str, value: &str) -> Logger {
    let mut logger = self.clone();
    logger.context.insert(key.to_string(), value.to_string());
    logger
  }

  pub fn trace(&self, message: &str) {
    self.log(LogLevel::Trace, message, None);
  }

  pub fn debug(&self, message: &str) {
    self.log(LogLevel::Debug, message, None);
  }

  pub fn info(&self, message: &str) {
    self.log(LogLevel::Info, message, None);
  }

  pub fn warn(&self, message: &str) {
    self.log(LogLevel::Warn, message, None);
  }

  pub fn error(&self, message: &str) {
    self.log(LogLevel::Error, message, None);
  }

  pub fn fatal(&self, message: &str) {
    self.log(LogLevel::Fatal, message, None);
  }

  pub fn log(
    &self,
    level: LogLevel,
    message: &str,
    metadata: Option<serde_json::Value>,
  ) {
    if level < self.min_level {
      return;
    }
    let timestamp = chrono::Utc::now().to_rfc3339_opts(
      chrono::SecondsFormat::Millis,
      true,
    );
    let line = match self.format {
      LogFormat::Json => {
        let mut entry = json!({
          "timestamp": timestamp,
          "level": level,
          "component": self.component,
          "message": message,
        });
        let object = entry.as_object_mut().unwrap();
        for (key, value) in &self.context {
          object.insert(key.clone(), json!(value));
        }
        if let Some(metadata) = metadata {
          object.insert("metadata".to_string(), metadata);
        }
        entry.to_string()
      }
      LogFormat::Pretty => {
        let mut line = format!(
          "{} {:5} [{}] {}",
          timestamp,
          level.label(),
          self.component,
          message
        );
        for (key, value) in &self.context {
          line.push_str(&format!(" {}={}", key, value));
        }
        if let Some(metadata) = metadata {
          line.push_str(&format!(" metadata={}", metadata));
        }
        line
      }
    };
    (self.sink)(&line);
  }

  /// Run an async operation, logging its duration and outcome.
  pub async fn measure_async<T, E, Fut>(
    &self,
    operation: &str,
    future: Fut,
  ) -> Result<T, E>
  where
    E: std::fmt::Display,
    Fut: Future<Output = Result<T, E>>,
  {
    let started = Instant::now();
    let result = future.await;
    self.log_measurement(operation, started, result.as_ref().err());
    result
  }

  pub fn measure_sync<T, E, F>(&self, operation: &str, f: F) -> Result<T, E>
  where
    E: std::fmt::Display,
    F: FnOnce() -> Result<T, E>,
  {
    let started = Instant::now();
    let result = f();
    self.log_measurement(operation, started, result.as_ref().err());
    result
  }

  fn log_measurement<E: std::fmt::Display>(
    &self,
    operation: &str,
    started: Instant,
    maybe_error: Option<&E>,
  ) {
    let duration_ms = started.elapsed().as_secs_f64() * 1000.0;
    let (level, result) = match maybe_error {
      None => (LogLevel::Info, "success"),
      Some(_) => (LogLevel::Error, "error"),
    };
    let mut metadata = json!({
      "operation": operation,
      "duration": duration_ms,
      "result": result,
    });
    if let Some(error) = maybe_error {
      metadata
        .as_object_mut()
        .unwrap()
        .insert("error".to_string(), json!(error.to_string()));
    }
    self.log(
      level,
      &format!("{} finished", operation),
      Some(metadata),
    );
  }
}

/// A no-op logger for configurations where logging is disabled.
pub fn disabled() -> Logger {
  Logger::new("disabled", LogLevel::Fatal, LogFormat::Pretty)
    .with_sink(Arc::new(|_| {}))
}

#[cfg(test)]
mod tests {
  use std::sync::Mutex;

  use pretty_assertions::assert_eq;

  use super::*;

  fn capture() -> (Logger, Arc<Mutex<Vec<String>>>) {
    let lines = Arc::new(Mutex::new(Vec::new()));
    let sink_lines = Arc::clone(&lines);
    let logger = Logger::new("module-system", LogLevel::Trace, LogFormat::Json)
      .with_sink(Arc::new(move |line| {
        sink_lines.lock().unwrap().push(line.to_string());
      }));
    (logger, lines)
  }

  #[test]
  fn json_entries_carry_component_and_context() {
    let (logger, lines) = capture();
    let child = logger
      .child("loader")
      .with_context("correlationId", "abc-123");
    child.info("loaded module");
    let lines = lines.lock().unwrap();
    assert_eq!(lines.len(), 1);
    let entry: serde_json::Value = serde_json::from_str(&lines[0]).unwrap();
    assert_eq!(entry["component"], "module-system.loader");
    assert_eq!(entry["correlationId"], "abc-123");
    assert_eq!(entry["level"], "info");
    assert_eq!(entry["message"], "loaded module");
    assert!(entry["timestamp"].is_string());
  }

  #[test]
  fn levels_below_minimum_are_dropped() {
    let lines = Arc::new(Mutex::new(Vec::new()));
    let sink_lines = Arc::clone(&lines);
    let logger = Logger::new("x", LogLevel::Warn, LogFormat::Pretty)
      .with_sink(Arc::new(move |line| {
        sink_lines.lock().unwrap().push(line.to_string());
      }));
    logger.debug("quiet");
    logger.info("quiet");
    logger.warn("loud");
    logger.fatal("loud");
    assert_eq!(lines.lock().unwrap().len(), 2);
  }

  #[test]
  fn pretty_format_is_single_line() {
    let lines = Arc::new(Mutex::new(Vec::new()));
    let sink_lines = Arc::clone(&lines);
    let logger = Logger::new("core", LogLevel::Trace, LogFormat::Pretty)
      .with_sink(Arc::new(move |line| {
        sink_lines.lock().unwrap().push(line.to_string());
      }));
    logger.with_context("op", "load").info("hello");
    let lines = lines.lock().unwrap();
    assert!(lines[0].contains("INFO"));
    assert!(lines[0].contains("[core]"));
    assert!(lines[0].contains("op=load"));
    assert!(!lines[0].contains('\n'));
  }

  #[tokio::test]
  async fn measure_async_logs_success_and_duration() {
    let (logger, lines) = capture();
    let result: Result<u32, String> = logger
      .measure_async("load", async { Ok(41) })
      .await;
    assert_eq!(result.unwrap(), 41);
    let lines = lines.lock().unwrap();
    let entry: serde_json::Value = serde_json::from_str(&lines[0]).unwrap();
    assert_eq!(entry["metadata"]["result"], "success");
    assert!(entry["metadata"]["duration"].is_number());
  }

  #[test]
  fn measure_sync_logs_errors() {
    let (logger, lines) = capture();
    let result: Result<(), String> =
      logger.measure_sync("compile", || Err("boom".to_string()));
    assert!(result.is_err());
    let lines = lines.lock().unwrap();
    let entry: serde_json::Value = serde_json::from_str(&lines[0]).unwrap();
    assert_eq!(entry["metadata"]["result"], "error");
    assert_eq!(entry["metadata"]["error"], "boom");
    assert_eq!(entry["level"], "error");
  }
}
