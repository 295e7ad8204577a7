// Copyright 2018-2026 the Som authors. MIT license.

//! Source-map handling: V3 validation, per-module `sources` rewriting,
//! and composition of per-module maps into a single bundle map.

use std::path::Path;

use serde_json::Value;

use crate::errors::AnyError;

/// Check the fields the pipeline is required to produce: `version` is 3,
/// `sources` is a list, `mappings` is a string. Returns the parsed JSON.
pub fn validate(map_json: &str) -> Result<Value, AnyError> {
  let value: Value = serde_json::from_str(map_json)
    .map_err(|err| anyhow::anyhow!("source map is not valid JSON: {}", err))?;
  if value.get("version").and_then(|v| v.as_u64()) != Some(3) {
    anyhow::bail!("source map version must be 3");
  }
  if !value.get("sources").map(|s| s.is_array()).unwrap_or(false) {
    anyhow::bail!("source map \"sources\" must be a list");
  }
  if !value.get("mappings").map(|m| m.is_string()).unwrap_or(false) {
    anyhow::bail!("source map \"mappings\" must be a string");
  }
  Ok(value)
}

/// Rewrite a module's map so `sources` names the module's absolute path
/// and `sourcesContent` carries the original source.
pub fn rewrite_for_module(
  map_json: &str,
  absolute_path: &Path,
  source: &str,
) -> Result<String, AnyError> {
  let mut value = validate(map_json)?;
  let object = value
    .as_object_mut()
    .expect("validated source map is an object");
  object.insert(
    "sources".to_string(),
    Value::Array(vec![Value::String(
      absolute_path.to_string_lossy().into_owned(),
    )]),
  );
  object.insert(
    "sourcesContent".to_string(),
    Value::Array(vec![Value::String(source.to_string())]),
  );
  Ok(serde_json::to_string(&value)?)
}

/// Builds the composed bundle map. Each module's mappings are shifted onto
/// the bundle's line axis and re-sourced to the module's bundle key.
pub struct BundleMapBuilder {
  builder: sourcemap::SourceMapBuilder,
  inlined: std::collections::HashSet<String>,
}

impl BundleMapBuilder {
  pub fn new(file: &str) -> Self {
    Self {
      builder: sourcemap::SourceMapBuilder::new(Some(file)),
      inlined: std::collections::HashSet::new(),
    }
  }

  /// Splice one module's map in. `start_line` is the 1-based bundle line
  /// where the module body begins. `inline_source` attaches the module's
  /// original content the first time the module is encountered.
  pub fn add_module(
    &mut self,
    bundle_key: &str,
    map_json: &str,
    start_line: u32,
    inline_source: Option<&str>,
  ) -> Result<(), AnyError> {
    let map = sourcemap::SourceMap::from_slice(map_json.as_bytes())
      .map_err(|err| anyhow::anyhow!("unparsable module map: {}", err))?;
    let mut source_id = None;
    for token in map.tokens() {
      let raw = self.builder.add(
        token.get_dst_line() + start_line - 1,
        token.get_dst_col(),
        token.get_src_line(),
        token.get_src_col(),
        Some(bundle_key),
        token.get_name(),
        false,
      );
      source_id.get_or_insert(raw.src_id);
    }
    if let (Some(id), Some(content)) = (source_id, inline_source) {
      if self.inlined.insert(bundle_key.to_string()) {
        self.builder.set_source_contents(id, Some(content));
      }
    }
    Ok(())
  }

  pub fn into_json(self) -> Result<String, AnyError> {
    let map = self.builder.into_sourcemap();
    let mut out = Vec::new();
    map
      .to_writer(&mut out)
      .map_err(|err| anyhow::anyhow!("serialize bundle map: {}", err))?;
    Ok(String::from_utf8(out)?)
  }
}

#[cfg(test)]
mod tests {
  use pretty_assertions::assert_eq;

  use super::*;

  fn one_line_map() -> String {
    let mut builder = sourcemap::SourceMapBuilder::new(None);
    let source = builder.add_source("source.som");
    builder.add_raw(0, 0, 0, 0, Some(source), None, false);
    let map = builder.into_sourcemap();
    let mut out = Vec::new();
    map.to_writer(&mut out).unwrap();
    String::from_utf8(out).unwrap()
  }

  #[test]
  fn validate_accepts_v3_maps() {
    assert!(validate(&one_line_map()).is_ok());
  }

  #[test]
  fn validate_rejects_wrong_version() {
    let err =
      validate(r#"{"version":2,"sources":[],"mappings":""}"#).unwrap_err();
    assert!(err.to_string().contains("version"));
  }

  #[test]
  fn validate_rejects_missing_mappings() {
    let err = validate(r#"{"version":3,"sources":[]}"#).unwrap_err();
    assert!(err.to_string().contains("mappings"));
  }

  #[test]
  fn rewrite_sets_sources_and_content() {
    let rewritten = rewrite_for_module(
      &one_line_map(),
      Path::new("/proj/a.som"),
      "export default 1",
    )
    .unwrap();
    let value: Value = serde_json::from_str(&rewritten).unwrap();
    assert_eq!(value["sources"][0], "/proj/a.som");
    assert_eq!(value["sourcesContent"][0], "export default 1");
  }

  #[test]
  fn composition_shifts_lines_and_renames_sources() {
    let mut builder = BundleMapBuilder::new("out.bundle.js");
    builder
      .add_module("a.som", &one_line_map(), 3, Some("source a"))
      .unwrap();
    builder
      .add_module("b.som", &one_line_map(), 7, None)
      .unwrap();
    let composed = builder.into_json().unwrap();
    let map = sourcemap::SourceMap::from_slice(composed.as_bytes()).unwrap();
    let tokens: Vec<_> = map.tokens().collect();
    assert_eq!(tokens.len(), 2);
    assert_eq!(tokens[0].get_dst_line(), 2); // bundle line 3, 0-based 2
    assert_eq!(tokens[0].get_source(), Some("a.som"));
    assert_eq!(tokens[1].get_dst_line(), 6);
    assert_eq!(tokens[1].get_source(), Some("b.som"));
    assert_eq!(
      map.get_source_contents(tokens[0].get_raw_token().src_id),
      Some("source a")
    );
  }
}
