// Copyright 2018-2026 the Som authors. MIT license.

//! Error taxonomy for the module system. Every fallible boundary surfaces
//! one of the types below; `AnyError` is the catch-all used where errors
//! from several components funnel into a single result.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

pub type AnyError = anyhow::Error;

/// Failure to map a specifier + referrer to a file on disk.
#[derive(Debug, Clone, Error)]
pub enum ResolveError {
  #[error("Cannot resolve module \"{specifier}\" from \"{referrer}\"")]
  NotFound { specifier: String, referrer: String },
  #[error(
    "Ambiguous specifier \"{specifier}\": candidates {candidates:?}"
  )]
  Ambiguous {
    specifier: String,
    candidates: Vec<String>,
  },
  #[error("Invalid base directory \"{path}\": {reason}")]
  InvalidBase { path: String, reason: String },
}

/// A dependency chain that closes back on itself. The chain always repeats
/// the closing id at the end, e.g. `a -> b -> a`.
#[derive(Debug, Clone)]
pub struct CircularDependencyError {
  pub chain: Vec<String>,
}

impl std::error::Error for CircularDependencyError {}

impl CircularDependencyError {
  pub fn new(chain: Vec<String>) -> Self {
    Self { chain }
  }

  pub fn format_chain(&self) -> String {
    self.chain.join(" -> ")
  }
}

impl fmt::Display for CircularDependencyError {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    write!(f, "Circular dependency detected: {}", self.format_chain())
  }
}

/// The external parser reported diagnostics for a source file. The first
/// diagnostic is the primary message; the rest ride along.
#[derive(Debug, Clone)]
pub struct ParseError {
  pub path: PathBuf,
  pub message: String,
  pub diagnostics: Vec<String>,
}

impl std::error::Error for ParseError {}

impl fmt::Display for ParseError {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    write!(f, "Parse error in {}: {}", self.path.display(), self.message)
  }
}

#[derive(Debug, Error)]
pub enum LoadError {
  #[error(transparent)]
  Resolve(#[from] ResolveError),
  #[error("Failed to read {}: {}", .path.display(), .source)]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error(transparent)]
  Parse(#[from] ParseError),
  #[error(transparent)]
  Circular(#[from] CircularDependencyError),
  #[error(transparent)]
  ResourceLimit(#[from] ResourceLimitError),
  #[error(transparent)]
  CircuitOpen(#[from] CircuitOpenError),
  #[error("Unsupported encoding \"{}\" for {}", .label, .path.display())]
  Encoding { path: PathBuf, label: String },
}

impl LoadError {
  /// Loader failures are retained on cache entries; errors there need to be
  /// cloneable, so they are flattened to display strings.
  pub fn to_retained(&self) -> String {
    self.to_string()
  }
}

#[derive(Debug, Clone, Error)]
pub enum RegistryError {
  #[error(
    "Invalid module id \"{id}\": expected an absolute path or an \
     \"external:\" identifier"
  )]
  InvalidModuleId { id: String },
  #[error(transparent)]
  Circular(#[from] CircularDependencyError),
}

/// One failed module inside a compilation pass. The driver collects these
/// instead of aborting, so a single pass can report every broken module.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct CompilationError {
  pub message: String,
  pub file_path: String,
  pub line: Option<u32>,
  pub column: Option<u32>,
  pub suggestion: Option<String>,
  pub original_error: Option<String>,
}

impl fmt::Display for CompilationError {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    write!(f, "{}: {}", self.file_path, self.message)?;
    if let Some(line) = self.line {
      write!(f, " ({}:{})", line, self.column.unwrap_or(0))?;
    }
    if let Some(suggestion) = &self.suggestion {
      write!(f, "\n  suggestion: {}", suggestion)?;
    }
    Ok(())
  }
}

impl std::error::Error for CompilationError {}

#[derive(Debug, Error)]
pub enum BundleError {
  #[error("Unsupported bundle construct in {module}: {construct}")]
  UnsupportedConstruct { module: String, construct: String },
  #[error("Bundling aborted, compilation failed:\n{}", format_errors(.errors))]
  Compilation { errors: Vec<CompilationError> },
  #[error("Minification failed: {0}")]
  Minify(String),
  #[error("Source map error: {0}")]
  SourceMap(String),
  #[error("{0}")]
  InvalidInput(String),
}

fn format_errors(errors: &[CompilationError]) -> String {
  errors
    .iter()
    .map(|e| format!("  {}", e))
    .collect::<Vec<_>>()
    .join("\n")
}

/// Aggregate of every problem found while validating a configuration. The
/// constructor fails once with the whole list instead of drip-feeding.
#[derive(Debug, Clone)]
pub struct ConfigurationError {
  pub problems: Vec<String>,
}

impl std::error::Error for ConfigurationError {}

impl fmt::Display for ConfigurationError {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    writeln!(f, "Invalid configuration ({} problems):", self.problems.len())?;
    for problem in &self.problems {
      writeln!(f, "  - {}", problem)?;
    }
    Ok(())
  }
}

#[derive(Debug, Clone, Error)]
#[error("Operation \"{operation}\" timed out after {timeout_ms}ms")]
pub struct TimeoutError {
  pub operation: String,
  pub timeout_ms: u64,
}

#[derive(Debug, Clone, Error)]
#[error("Circuit breaker open for \"{key}\"")]
pub struct CircuitOpenError {
  pub key: String,
}

#[derive(Debug, Clone, Error)]
#[error("Resource limit reached for {resource}: {message}")]
pub struct ResourceLimitError {
  pub resource: String,
  pub message: String,
}
