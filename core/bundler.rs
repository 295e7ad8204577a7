// Copyright 2018-2026 the Som authors. MIT license.

//! Splices a compilation result into one self-contained CommonJS-style
//! artifact: rewrites inter-module `require` calls to stable bundle keys,
//! wraps each module in a loader function, and composes the per-module
//! source maps into a single bundle map.

use std::collections::HashSet;
use std::path::Path;
use std::path::PathBuf;

use log::debug;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::compiler::CompileResult;
use crate::errors::AnyError;
use crate::errors::BundleError;
use crate::loader::module_id;
use crate::resolver::Resolver;
use crate::source_map::BundleMapBuilder;

const MAX_REQUIRE_SPECIFIER_LENGTH: usize = 500;
const MAX_REQUIRE_PARENT_SEGMENTS: usize = 4;

static REQUIRE_CALL_RE: Lazy<Regex> =
  Lazy::new(|| Regex::new(r"\brequire\s*\(\s*").unwrap());

#[derive(Debug, Clone, Default)]
pub struct BundleOptions {
  pub entry_point: PathBuf,
  pub output_path: Option<PathBuf>,
  pub minify: bool,
  pub source_maps: bool,
  pub externals: Vec<String>,
  pub inline_sources: bool,
}

#[derive(Debug, Clone)]
pub struct BundleOutput {
  pub code: String,
  pub map: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MinifyOutput {
  pub code: String,
  pub map: Option<String>,
}

/// Pluggable minifier. Failures are fatal for the bundle.
pub trait Minifier: Send + Sync {
  fn minify(
    &self,
    code: &str,
    map: Option<&str>,
  ) -> Result<MinifyOutput, AnyError>;
}

pub struct Bundler {
  resolver: Resolver,
  maybe_minifier: Option<Box<dyn Minifier>>,
}

impl Bundler {
  pub fn new(resolver: Resolver) -> Self {
    Self {
      resolver,
      maybe_minifier: None,
    }
  }

  pub fn with_minifier(mut self, minifier: Box<dyn Minifier>) -> Self {
    self.maybe_minifier = Some(minifier);
    self
  }

  pub fn bundle(
    &self,
    result: &CompileResult,
    options: &BundleOptions,
  ) -> Result<BundleOutput, BundleError> {
    if !result.errors.is_empty() {
      return Err(BundleError::Compilation {
        errors: result.errors.clone(),
      });
    }
    if !options.entry_point.is_absolute() {
      return Err(BundleError::InvalidInput(format!(
        "entry point must be absolute, got \"{}\"",
        options.entry_point.display()
      )));
    }
    for id in result.modules.keys() {
      if !Path::new(id).is_absolute() {
        return Err(BundleError::InvalidInput(format!(
          "module id must be absolute, got \"{}\"",
          id
        )));
      }
    }

    let entry_id = if result.entry_point.is_empty() {
      module_id(&options.entry_point)
    } else {
      result.entry_point.clone()
    };
    let entry_dir = crate::fs_util::referrer_dir(&options.entry_point);
    let external_module_ids = self.mark_externals(options, &entry_dir);

    // Stable, entry-relative identifiers for everything we emit.
    let mut keys: indexmap::IndexMap<String, String> = indexmap::IndexMap::new();
    for id in ordered_module_ids(result) {
      if external_module_ids.contains(&id) {
        continue;
      }
      keys.insert(id.clone(), bundle_key(&entry_dir, Path::new(&id)));
    }
    let entry_key = keys
      .get(&entry_id)
      .cloned()
      .ok_or_else(|| {
        BundleError::InvalidInput(format!(
          "entry module \"{}\" is not part of the compilation result",
          entry_id
        ))
      })?;

    let output_file = output_file_name(options);
    let mut lines: Vec<String> = Vec::new();
    let mut maybe_map = if options.source_maps {
      Some(BundleMapBuilder::new(&output_file))
    } else {
      None
    };

    lines.push("(function() {".to_string());
    lines.push("  var modules = {".to_string());
    let module_count = keys.len();
    for (index, (id, key)) in keys.iter().enumerate() {
      let compiled = &result.modules[id];
      let rewritten = self.rewrite_requires(
        &compiled.code,
        Path::new(id),
        &keys,
        &external_module_ids,
        options,
      )?;
      lines.push(format!(
        "    \"{}\": function(module, exports, require) {{",
        key
      ));
      let start_line = lines.len() as u32 + 1;
      for line in rewritten.lines() {
        lines.push(line.to_string());
      }
      if let (Some(builder), Some(map_json)) =
        (maybe_map.as_mut(), compiled.map.as_deref())
      {
        let inline = if options.inline_sources {
          extract_source_content(map_json)
        } else {
          None
        };
        builder
          .add_module(key, map_json, start_line, inline.as_deref())
          .map_err(|err| BundleError::SourceMap(err.to_string()))?;
      }
      if index + 1 == module_count {
        lines.push("    }".to_string());
      } else {
        lines.push("    },".to_string());
      }
    }
    lines.push("  };".to_string());
    lines.push("  var cache = {};".to_string());
    lines.push(
      "  var __externalRequire = typeof require === 'function' ? require : null;"
        .to_string(),
    );
    lines.push("  function _require(id) {".to_string());
    lines.push("    if (cache[id]) {".to_string());
    lines.push("      return cache[id].exports;".to_string());
    lines.push("    }".to_string());
    lines.push("    if (!modules[id]) {".to_string());
    lines.push("      if (__externalRequire) {".to_string());
    lines.push("        return __externalRequire(id);".to_string());
    lines.push("      }".to_string());
    lines.push(
      "      throw new Error(\"Module '\" + id + \"' not found in bundle \
       and no external require available.\");"
        .to_string(),
    );
    lines.push("    }".to_string());
    lines.push("    var module = { exports: {} };".to_string());
    lines.push("    cache[id] = module;".to_string());
    lines.push("    modules[id](module, module.exports, _require);".to_string());
    lines.push("    return module.exports;".to_string());
    lines.push("  }".to_string());
    lines.push(format!("  var __entryExports = _require(\"{}\");", entry_key));
    lines.push(
      "  if (typeof module !== 'undefined' && module.exports) {".to_string(),
    );
    lines.push("    module.exports = __entryExports;".to_string());
    lines.push("  }".to_string());
    lines.push("  return __entryExports;".to_string());
    lines.push("})()".to_string());

    let code = lines.join("\n");
    let map = match maybe_map {
      Some(builder) => Some(
        builder
          .into_json()
          .map_err(|err| BundleError::SourceMap(err.to_string()))?,
      ),
      None => None,
    };

    debug!(
      "bundled {} modules into {} ({} lines)",
      module_count,
      output_file,
      code.lines().count()
    );

    if options.minify {
      if let Some(minifier) = &self.maybe_minifier {
        let minified = minifier
          .minify(&code, map.as_deref())
          .map_err(|err| BundleError::Minify(err.to_string()))?;
        return Ok(BundleOutput {
          code: minified.code,
          map: minified.map,
        });
      }
    }

    Ok(BundleOutput { code, map })
  }

  /// Resolve each configured external from the entry point; whatever
  /// resolves is excluded from emission.
  fn mark_externals(
    &self,
    options: &BundleOptions,
    entry_dir: &Path,
  ) -> HashSet<String> {
    let mut external_module_ids = HashSet::new();
    for external in &options.externals {
      let mut attempts = vec![
        external.clone(),
        format!("{}.som", external),
        format!("{}.js", external),
        format!("{}/index.som", external),
        format!("{}/index.js", external),
      ];
      if external.starts_with("./") || external.starts_with("../") {
        attempts.push(
          entry_dir.join(external).to_string_lossy().into_owned(),
        );
      }
      for attempt in attempts {
        if let Ok(resolved) = self.resolver.resolve(&attempt, entry_dir) {
          external_module_ids.insert(module_id(&resolved.absolute_path));
        }
      }
    }
    external_module_ids
  }

  /// Rewrite every literal `require('x')` so `x` becomes the bundle key of
  /// its resolved target. Dynamic requires are unsupported.
  fn rewrite_requires(
    &self,
    code: &str,
    module_path: &Path,
    keys: &indexmap::IndexMap<String, String>,
    external_module_ids: &HashSet<String>,
    options: &BundleOptions,
  ) -> Result<String, BundleError> {
    let mut out = String::with_capacity(code.len());
    let mut cursor = 0;

    for call in REQUIRE_CALL_RE.find_iter(code) {
      if call.start() < cursor {
        continue;
      }
      out.push_str(&code[cursor..call.end()]);
      cursor = call.end();

      let rest = &code[cursor..];
      let mut chars = rest.chars();
      let delimiter = match chars.next() {
        Some(c @ ('\'' | '"' | '`')) => c,
        _ => {
          return Err(BundleError::UnsupportedConstruct {
            module: module_path.display().to_string(),
            construct: "dynamic require".to_string(),
          });
        }
      };
      let literal_end = match rest[1..].find(delimiter) {
        Some(end) => end + 1,
        None => {
          return Err(BundleError::UnsupportedConstruct {
            module: module_path.display().to_string(),
            construct: "unterminated require literal".to_string(),
          });
        }
      };
      let specifier = &rest[1..literal_end];
      if delimiter == '`' && specifier.contains("${") {
        return Err(BundleError::UnsupportedConstruct {
          module: module_path.display().to_string(),
          construct: "template literal with interpolation in require"
            .to_string(),
        });
      }

      let replacement =
        self.replacement_for(specifier, module_path, keys, external_module_ids, options);
      match replacement {
        Some(key) => {
          out.push(delimiter);
          out.push_str(&key);
          out.push(delimiter);
        }
        None => {
          out.push(delimiter);
          out.push_str(specifier);
          out.push(delimiter);
        }
      }
      cursor += literal_end + 1;
    }
    out.push_str(&code[cursor..]);
    Ok(out)
  }

  fn replacement_for(
    &self,
    specifier: &str,
    module_path: &Path,
    keys: &indexmap::IndexMap<String, String>,
    external_module_ids: &HashSet<String>,
    options: &BundleOptions,
  ) -> Option<String> {
    if specifier.len() > MAX_REQUIRE_SPECIFIER_LENGTH {
      return None;
    }
    let parents = specifier
      .split('/')
      .filter(|segment| *segment == "..")
      .count();
    if parents > MAX_REQUIRE_PARENT_SEGMENTS {
      return None;
    }
    if matches_external(specifier, &options.externals) {
      return None;
    }
    let resolved = self.resolver.resolve(specifier, module_path).ok()?;
    let id = module_id(&resolved.absolute_path);
    if external_module_ids.contains(&id) {
      return None;
    }
    keys.get(&id).map(|key| sanitize_key(key))
  }
}

/// Module ids in emission order: the compile pass's topological order,
/// restricted to modules that produced code.
fn ordered_module_ids(result: &CompileResult) -> Vec<String> {
  let mut ordered: Vec<String> = result
    .dependencies
    .iter()
    .filter(|id| result.modules.contains_key(*id))
    .cloned()
    .collect();
  for id in result.modules.keys() {
    if !ordered.contains(id) {
      ordered.push(id.clone());
    }
  }
  ordered
}

/// Stable key: path relative to the entry directory with forward slashes;
/// the basename when the relative path is empty.
fn bundle_key(entry_dir: &Path, module_path: &Path) -> String {
  let relative = pathdiff::diff_paths(module_path, entry_dir)
    .unwrap_or_else(|| module_path.to_path_buf());
  let key = crate::fs_util::to_forward_slashes(&relative);
  let key = if key.is_empty() {
    module_path
      .file_name()
      .map(|name| name.to_string_lossy().into_owned())
      .unwrap_or_default()
  } else {
    key
  };
  sanitize_key(&key)
}

fn sanitize_key(key: &str) -> String {
  key
    .chars()
    .filter(|c| !matches!(c, '\'' | '"' | '`' | '\\'))
    .collect()
}

fn matches_external(specifier: &str, externals: &[String]) -> bool {
  fn canonical(name: &str) -> &str {
    name
      .strip_suffix(".js")
      .or_else(|| name.strip_suffix(".som"))
      .unwrap_or(name)
  }
  let target = canonical(specifier);
  externals.iter().any(|external| canonical(external) == target)
}

fn output_file_name(options: &BundleOptions) -> String {
  match &options.output_path {
    Some(path) => path
      .file_name()
      .map(|name| name.to_string_lossy().into_owned())
      .unwrap_or_else(|| "bundle.js".to_string()),
    None => {
      let stem = options
        .entry_point
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "main".to_string());
      format!("{}.bundle.js", stem)
    }
  }
}

fn extract_source_content(map_json: &str) -> Option<String> {
  let value: serde_json::Value = serde_json::from_str(map_json).ok()?;
  value
    .get("sourcesContent")?
    .as_array()?
    .first()?
    .as_str()
    .map(|content| content.to_string())
}

#[cfg(test)]
mod tests {
  use pretty_assertions::assert_eq;
  use tempfile::TempDir;

  use super::*;
  use crate::compiler::CompiledModule;
  use crate::config::ResolutionConfig;

  fn write(dir: &Path, rel: &str, contents: &str) -> PathBuf {
    let path = dir.join(rel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, contents).unwrap();
    path
  }

  fn bundler_for(base: &Path) -> Bundler {
    Bundler::new(Resolver::new(ResolutionConfig {
      base_url: base.to_path_buf(),
      ..Default::default()
    }))
  }

  fn compile_result(
    entry: &Path,
    modules: &[(&Path, &str)],
  ) -> CompileResult {
    let mut result = CompileResult::default();
    result.entry_point = module_id(entry);
    for (path, code) in modules {
      let id = module_id(path);
      result.dependencies.push(id.clone());
      result.modules.insert(
        id,
        CompiledModule {
          code: code.to_string(),
          map: None,
        },
      );
    }
    result
  }

  #[test]
  fn emits_an_iife_with_entry_relative_keys() {
    let t = TempDir::new().unwrap();
    let entry = write(t.path(), "a.som", "");
    let dep = write(t.path(), "b.som", "");
    let result = compile_result(
      &entry,
      &[
        (dep.as_path(), "module.exports.default = 2;"),
        (entry.as_path(), "const b = require('./b');"),
      ],
    );
    let bundler = bundler_for(t.path());
    let output = bundler
      .bundle(
        &result,
        &BundleOptions {
          entry_point: entry.clone(),
          ..Default::default()
        },
      )
      .unwrap();
    assert!(output.code.starts_with("(function() {"));
    assert!(output.code.contains("\"a.som\": function(module, exports, require)"));
    assert!(output.code.contains("\"b.som\": function(module, exports, require)"));
    // the relative require was rewritten to the bundle key
    assert!(output.code.contains("const b = require('b.som');"));
    assert!(output.code.contains("var __entryExports = _require(\"a.som\");"));
    assert!(output.code.ends_with("})()"));
  }

  #[test]
  fn keys_use_forward_slashes_for_nested_modules() {
    let t = TempDir::new().unwrap();
    let entry = write(t.path(), "a.som", "");
    let nested = write(t.path(), "lib/util.som", "");
    let result = compile_result(
      &entry,
      &[
        (nested.as_path(), "module.exports.x = 1;"),
        (entry.as_path(), "const u = require('./lib/util');"),
      ],
    );
    let bundler = bundler_for(t.path());
    let output = bundler
      .bundle(
        &result,
        &BundleOptions {
          entry_point: entry,
          ..Default::default()
        },
      )
      .unwrap();
    assert!(output.code.contains("\"lib/util.som\""));
    assert!(output.code.contains("require('lib/util.som')"));
  }

  #[test]
  fn unresolvable_requires_are_left_alone() {
    let t = TempDir::new().unwrap();
    let entry = write(t.path(), "a.som", "");
    let result = compile_result(
      &entry,
      &[(entry.as_path(), "const fs = require('fs');")],
    );
    let bundler = bundler_for(t.path());
    let output = bundler
      .bundle(
        &result,
        &BundleOptions {
          entry_point: entry,
          externals: vec!["fs".to_string()],
          ..Default::default()
        },
      )
      .unwrap();
    assert!(output.code.contains("require('fs')"));
    assert!(!output.code.contains("\"fs\": function"));
  }

  #[test]
  fn dynamic_requires_are_rejected() {
    let t = TempDir::new().unwrap();
    let entry = write(t.path(), "a.som", "");
    let result = compile_result(
      &entry,
      &[(entry.as_path(), "const x = require(someVariable);")],
    );
    let bundler = bundler_for(t.path());
    let err = bundler
      .bundle(
        &result,
        &BundleOptions {
          entry_point: entry,
          ..Default::default()
        },
      )
      .unwrap_err();
    assert!(matches!(err, BundleError::UnsupportedConstruct { .. }));
  }

  #[test]
  fn template_interpolation_is_rejected() {
    let t = TempDir::new().unwrap();
    let entry = write(t.path(), "a.som", "");
    let result = compile_result(
      &entry,
      &[(entry.as_path(), "const x = require(`./mod_${name}`);")],
    );
    let bundler = bundler_for(t.path());
    let err = bundler
      .bundle(
        &result,
        &BundleOptions {
          entry_point: entry,
          ..Default::default()
        },
      )
      .unwrap_err();
    assert!(matches!(err, BundleError::UnsupportedConstruct { .. }));
  }

  #[test]
  fn deep_parent_traversals_are_kept_verbatim() {
    let t = TempDir::new().unwrap();
    let entry = write(t.path(), "a.som", "");
    let code = "const x = require('../../../../../x');";
    let result = compile_result(&entry, &[(entry.as_path(), code)]);
    let bundler = bundler_for(t.path());
    let output = bundler
      .bundle(
        &result,
        &BundleOptions {
          entry_point: entry,
          ..Default::default()
        },
      )
      .unwrap();
    assert!(output.code.contains("require('../../../../../x')"));
  }

  #[test]
  fn compilation_errors_abort_the_bundle() {
    let t = TempDir::new().unwrap();
    let entry = write(t.path(), "a.som", "");
    let mut result = compile_result(&entry, &[(entry.as_path(), "")]);
    result.errors.push(crate::errors::CompilationError {
      message: "boom".to_string(),
      file_path: "a.som".to_string(),
      line: None,
      column: None,
      suggestion: None,
      original_error: None,
    });
    let bundler = bundler_for(t.path());
    let err = bundler
      .bundle(
        &result,
        &BundleOptions {
          entry_point: entry,
          ..Default::default()
        },
      )
      .unwrap_err();
    assert!(matches!(err, BundleError::Compilation { .. }));
  }

  #[test]
  fn relative_entry_point_is_invalid() {
    let t = TempDir::new().unwrap();
    let entry = write(t.path(), "a.som", "");
    let result = compile_result(&entry, &[(entry.as_path(), "")]);
    let bundler = bundler_for(t.path());
    let err = bundler
      .bundle(
        &result,
        &BundleOptions {
          entry_point: PathBuf::from("a.som"),
          ..Default::default()
        },
      )
      .unwrap_err();
    assert!(matches!(err, BundleError::InvalidInput(_)));
  }

  struct UpperMinifier;

  impl Minifier for UpperMinifier {
    fn minify(
      &self,
      code: &str,
      map: Option<&str>,
    ) -> Result<MinifyOutput, AnyError> {
      Ok(MinifyOutput {
        code: code.lines().collect::<Vec<_>>().join(" "),
        map: map.map(|m| m.to_string()),
      })
    }
  }

  struct FailingMinifier;

  impl Minifier for FailingMinifier {
    fn minify(
      &self,
      _code: &str,
      _map: Option<&str>,
    ) -> Result<MinifyOutput, AnyError> {
      anyhow::bail!("minifier exploded")
    }
  }

  #[test]
  fn minifier_is_applied_when_enabled() {
    let t = TempDir::new().unwrap();
    let entry = write(t.path(), "a.som", "");
    let result = compile_result(&entry, &[(entry.as_path(), "var x = 1;")]);
    let bundler = bundler_for(t.path()).with_minifier(Box::new(UpperMinifier));
    let output = bundler
      .bundle(
        &result,
        &BundleOptions {
          entry_point: entry,
          minify: true,
          ..Default::default()
        },
      )
      .unwrap();
    assert!(!output.code.contains('\n'));
  }

  #[test]
  fn minifier_failures_are_fatal() {
    let t = TempDir::new().unwrap();
    let entry = write(t.path(), "a.som", "");
    let result = compile_result(&entry, &[(entry.as_path(), "var x = 1;")]);
    let bundler =
      bundler_for(t.path()).with_minifier(Box::new(FailingMinifier));
    let err = bundler
      .bundle(
        &result,
        &BundleOptions {
          entry_point: entry,
          minify: true,
          ..Default::default()
        },
      )
      .unwrap_err();
    assert!(matches!(err, BundleError::Minify(_)));
  }

  #[test]
  fn bundle_key_falls_back_to_basename() {
    assert_eq!(
      bundle_key(Path::new("/proj"), Path::new("/proj/a.som")),
      "a.som"
    );
    assert_eq!(
      bundle_key(Path::new("/proj"), Path::new("/proj/lib/b.som")),
      "lib/b.som"
    );
  }
}
