// Copyright 2018-2026 the Som authors. MIT license.

//! Compile orchestration: load the entry's graph, register it, walk the
//! topological order and compile each source module. Errors are collected
//! across the whole pass; one broken module never hides the others.

use std::path::Path;
use std::sync::Arc;

use indexmap::IndexMap;
use log::debug;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::ast::EmitOptions;
use crate::ast::SourcePipeline;
use crate::config::CompilationConfig;
use crate::errors::CompilationError;
use crate::errors::LoadError;
use crate::loader::LoadedModule;
use crate::loader::ModuleLoader;
use crate::registry::ModuleRegistry;
use crate::source_map;

/// Matches `<file>:<line>[:<col>]` or a bare `<line>:<col>` inside a
/// diagnostic message.
static FILE_LINE_COL_RE: Lazy<Regex> =
  Lazy::new(|| Regex::new(r"([^\s:]+\.\w+):(\d+)(?::(\d+))?").unwrap());
static LINE_COL_RE: Lazy<Regex> =
  Lazy::new(|| Regex::new(r"\b(\d+):(\d+)\b").unwrap());

#[derive(Debug, Clone)]
pub struct CompiledModule {
  pub code: String,
  pub map: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct CompileResult {
  pub modules: IndexMap<String, CompiledModule>,
  pub entry_point: String,
  /// All graph ids in topological order (dependencies first).
  pub dependencies: Vec<String>,
  pub errors: Vec<CompilationError>,
  pub warnings: Vec<String>,
}

impl CompileResult {
  pub fn is_success(&self) -> bool {
    self.errors.is_empty()
  }
}

pub struct CompilerDriver {
  loader: Arc<ModuleLoader>,
  registry: Arc<ModuleRegistry>,
  pipeline: Arc<dyn SourcePipeline>,
  compilation: CompilationConfig,
}

/// Restores the loader's externals when a compile pass ends, whichever
/// way it ends.
struct ExternalsGuard<'a> {
  loader: &'a ModuleLoader,
  saved: Vec<String>,
}

impl Drop for ExternalsGuard<'_> {
  fn drop(&mut self) {
    self.loader.set_externals(std::mem::take(&mut self.saved));
  }
}

impl CompilerDriver {
  pub fn new(
    loader: Arc<ModuleLoader>,
    registry: Arc<ModuleRegistry>,
    pipeline: Arc<dyn SourcePipeline>,
    compilation: CompilationConfig,
  ) -> Self {
    Self {
      loader,
      registry,
      pipeline,
      compilation,
    }
  }

  pub async fn compile(
    &self,
    entry_point: &Path,
    externals: Option<Vec<String>>,
    overrides: Option<CompilationConfig>,
  ) -> CompileResult {
    let guard = self.apply_externals(externals);
    let referrer = crate::fs_util::referrer_dir(entry_point);
    let loaded = self
      .loader
      .load(&entry_point.to_string_lossy(), &referrer)
      .await;
    let result = self.finish(entry_point, loaded, overrides);
    drop(guard);
    result
  }

  pub fn compile_sync(
    &self,
    entry_point: &Path,
    externals: Option<Vec<String>>,
    overrides: Option<CompilationConfig>,
  ) -> CompileResult {
    let guard = self.apply_externals(externals);
    let referrer = crate::fs_util::referrer_dir(entry_point);
    let loaded = self
      .loader
      .load_sync(&entry_point.to_string_lossy(), &referrer);
    let result = self.finish(entry_point, loaded, overrides);
    drop(guard);
    result
  }

  fn apply_externals(
    &self,
    externals: Option<Vec<String>>,
  ) -> Option<ExternalsGuard<'_>> {
    externals.map(|externals| {
      let saved = self.loader.get_externals();
      self.loader.set_externals(externals);
      ExternalsGuard {
        loader: self.loader.as_ref(),
        saved,
      }
    })
  }

  fn finish(
    &self,
    entry_point: &Path,
    loaded: Result<LoadedModule, LoadError>,
    overrides: Option<CompilationConfig>,
  ) -> CompileResult {
    let mut result = CompileResult::default();

    let entry = match loaded {
      Ok(entry) => entry,
      Err(err) => {
        result.errors.push(load_failure_to_error(entry_point, &err));
        result.warnings.extend(self.loader.drain_warnings());
        return result;
      }
    };
    result.entry_point = entry.id.clone();
    result.warnings.extend(self.loader.drain_warnings());

    for module in self.loader.get_all_modules() {
      if let Err(err) = self.registry.register(&module) {
        result.warnings.push(err.to_string());
      }
    }

    result.dependencies = match self.registry.get_topological_sort() {
      Ok(order) => order,
      Err(_) => {
        for cycle in self.registry.find_circular_dependencies() {
          result
            .warnings
            .push(format!("Circular dependency: {}", cycle.join(" -> ")));
        }
        // Cycles leave no strict order; registration order stands in.
        self
          .registry
          .get_all()
          .into_iter()
          .map(|module| module.id)
          .collect()
      }
    };

    let config = overrides.as_ref().unwrap_or(&self.compilation);
    let emit_options = EmitOptions {
      target: config.target,
      source_map: config.source_map,
      minify: config.minify,
      type_check: !config.no_type_check,
      strict: config.strict,
    };

    for id in result.dependencies.clone() {
      let module = match self.loader.get_module(&id) {
        Some(module) => module,
        None => continue,
      };
      if module.is_external {
        continue;
      }
      if module.extension == self.loader.language_extension() {
        self.compile_module(&module, &emit_options, &mut result);
      } else if module.extension == ".json" {
        result.modules.insert(
          id,
          CompiledModule {
            code: format!("module.exports = {};", module.source.trim_end()),
            map: None,
          },
        );
      } else {
        // Already-compiled sources pass through untouched.
        result.modules.insert(
          id,
          CompiledModule {
            code: module.source.clone(),
            map: None,
          },
        );
      }
    }

    debug!(
      "compiled {} modules, {} errors",
      result.modules.len(),
      result.errors.len()
    );
    result
  }

  fn compile_module(
    &self,
    module: &LoadedModule,
    emit_options: &EmitOptions,
    result: &mut CompileResult,
  ) {
    let output = self.pipeline.compile(&module.source, emit_options);
    result.warnings.extend(
      output
        .warnings
        .into_iter()
        .map(|warning| format!("{}: {}", module.id, warning)),
    );
    if !output.errors.is_empty() {
      for message in output.errors {
        result
          .errors
          .push(message_to_error(&module.absolute_path, &message));
      }
      return;
    }

    let map = match output.source_map {
      Some(map_json) => match source_map::rewrite_for_module(
        &map_json,
        &module.absolute_path,
        &module.source,
      ) {
        Ok(rewritten) => Some(rewritten),
        Err(err) => {
          result.errors.push(CompilationError {
            message: format!("invalid source map produced: {}", err),
            file_path: module.absolute_path.display().to_string(),
            line: None,
            column: None,
            suggestion: None,
            original_error: Some(err.to_string()),
          });
          return;
        }
      },
      None => None,
    };

    result.modules.insert(
      module.id.clone(),
      CompiledModule {
        code: output.code,
        map,
      },
    );
  }
}

/// Turn an entry-load failure into the pass's single compilation error.
fn load_failure_to_error(
  entry_point: &Path,
  err: &LoadError,
) -> CompilationError {
  let message = err.to_string();
  let file_path = match err {
    LoadError::Parse(parse) => parse.path.display().to_string(),
    LoadError::Io { path, .. } => path.display().to_string(),
    _ => entry_point.display().to_string(),
  };
  let (line, column) = extract_location(&message);
  CompilationError {
    message: message.clone(),
    file_path,
    line,
    column,
    suggestion: suggestion_for(&message),
    original_error: Some(message),
  }
}

fn message_to_error(path: &Path, message: &str) -> CompilationError {
  let (line, column) = extract_location(message);
  CompilationError {
    message: message.to_string(),
    file_path: path.display().to_string(),
    line,
    column,
    suggestion: suggestion_for(message),
    original_error: None,
  }
}

/// Pull `<file>:<line>[:<col>]` (or a bare `<line>:<col>`) out of a
/// diagnostic message.
fn extract_location(message: &str) -> (Option<u32>, Option<u32>) {
  if let Some(captures) = FILE_LINE_COL_RE.captures(message) {
    let line = captures.get(2).and_then(|m| m.as_str().parse().ok());
    let column = captures.get(3).and_then(|m| m.as_str().parse().ok());
    return (line, column);
  }
  if let Some(captures) = LINE_COL_RE.captures(message) {
    let line = captures.get(1).and_then(|m| m.as_str().parse().ok());
    let column = captures.get(2).and_then(|m| m.as_str().parse().ok());
    return (line, column);
  }
  (None, None)
}

/// Keyword table mapping common diagnostics to actionable hints.
fn suggestion_for(message: &str) -> Option<String> {
  let lower = message.to_lowercase();
  let suggestion = if lower.contains("unexpected token") {
    "Check for missing or extra brackets, parentheses, or semicolons"
  } else if lower.contains("cannot find module")
    || lower.contains("cannot resolve module")
  {
    "Verify the import path and that the file exists"
  } else if lower.contains("circular dependency") {
    "Refactor the modules involved to break the dependency cycle"
  } else if lower.contains("type mismatch") {
    "Check the types of parameters and variables"
  } else if lower.contains("undefined") {
    "Declare variables and functions before using them"
  } else if lower.contains("redeclared") || lower.contains("already declared")
  {
    "Rename or remove the duplicate declaration"
  } else {
    return None;
  };
  Some(suggestion.to_string())
}
