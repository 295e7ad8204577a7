// Copyright 2018-2026 the Som authors. MIT license.

//! Reference pipeline used by the test suites. It understands just enough
//! of the surface syntax (line-oriented imports and exports) to exercise
//! the module system end to end without the real front-end.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::ast::CompileOutput;
use crate::ast::EmitOptions;
use crate::ast::ImportDeclaration;
use crate::ast::ImportSpecifier;
use crate::ast::OtherStatement;
use crate::ast::ParseOutput;
use crate::ast::Program;
use crate::ast::SourcePipeline;
use crate::ast::Statement;
use crate::ast::StringLiteral;

static IMPORT_RE: Lazy<Regex> = Lazy::new(|| {
  Regex::new(r#"^import\s+(.+?)\s+from\s+['"]([^'"]+)['"]\s*;?\s*$"#).unwrap()
});
static EXPORT_DEFAULT_RE: Lazy<Regex> =
  Lazy::new(|| Regex::new(r"^export\s+default\s+(.+?)\s*;?\s*$").unwrap());
static EXPORT_NAMED_RE: Lazy<Regex> = Lazy::new(|| {
  Regex::new(r"^export\s+(\w+)\s*=\s*(.+?)\s*;?\s*$").unwrap()
});

#[derive(Debug, Default)]
pub struct LineParserPipeline;

impl LineParserPipeline {
  pub fn new() -> Self {
    Self
  }

  fn parse_specifiers(clause: &str) -> Option<Vec<ImportSpecifier>> {
    let clause = clause.trim();
    if let Some(rest) = clause.strip_prefix("* as ") {
      return Some(vec![ImportSpecifier::Namespace {
        local: rest.trim().to_string(),
      }]);
    }
    if clause.starts_with('{') && clause.ends_with('}') {
      let inner = &clause[1..clause.len() - 1];
      let mut specifiers = Vec::new();
      for item in inner.split(',') {
        let item = item.trim();
        if item.is_empty() {
          continue;
        }
        let (imported, local) = match item.split_once(" as ") {
          Some((imported, local)) => (imported.trim(), local.trim()),
          None => (item, item),
        };
        specifiers.push(ImportSpecifier::Named {
          imported: imported.to_string(),
          local: local.to_string(),
        });
      }
      return Some(specifiers);
    }
    if clause.chars().all(|c| c.is_alphanumeric() || c == '_') {
      return Some(vec![ImportSpecifier::Default {
        local: clause.to_string(),
      }]);
    }
    None
  }
}

impl SourcePipeline for LineParserPipeline {
  fn parse(&self, source: &str) -> ParseOutput {
    let mut program = Program::default();
    let mut dependencies = Vec::new();
    let mut errors = Vec::new();

    for (index, line) in source.lines().enumerate() {
      let trimmed = line.trim();
      if trimmed.starts_with("import") {
        match IMPORT_RE.captures(trimmed) {
          Some(captures) => {
            let clause = captures.get(1).unwrap().as_str();
            match Self::parse_specifiers(clause) {
              Some(specifiers) => {
                let declaration = ImportDeclaration {
                  source: StringLiteral {
                    value: captures.get(2).unwrap().as_str().to_string(),
                  },
                  specifiers,
                };
                dependencies.push(declaration.clone());
                program.body.push(Statement::Import(declaration));
              }
              None => errors.push(format!(
                "Unexpected token at {}:8: invalid import clause",
                index + 1
              )),
            }
          }
          None => errors.push(format!(
            "Unexpected token at {}:1: malformed import statement",
            index + 1
          )),
        }
      } else if !trimmed.is_empty() {
        program.body.push(Statement::Other(OtherStatement {
          text: line.to_string(),
        }));
      }
    }

    ParseOutput {
      program,
      dependencies,
      errors,
    }
  }

  fn compile(&self, source: &str, options: &EmitOptions) -> CompileOutput {
    let mut lines = Vec::new();
    let mut errors = Vec::new();
    let warnings = Vec::new();

    for (index, line) in source.lines().enumerate() {
      let trimmed = line.trim();
      if trimmed.starts_with('!') {
        errors.push(format!("Unexpected token '!' at {}:1", index + 1));
        lines.push(String::new());
        continue;
      }
      if let Some(captures) = IMPORT_RE.captures(trimmed) {
        let specifier = captures.get(2).unwrap().as_str();
        let clause = captures.get(1).unwrap().as_str().trim();
        let binding = match clause.strip_prefix("* as ") {
          Some(rest) => rest.trim().to_string(),
          None => clause.to_string(),
        };
        lines.push(format!("const {} = require('{}');", binding, specifier));
        continue;
      }
      if let Some(captures) = EXPORT_DEFAULT_RE.captures(trimmed) {
        lines.push(format!(
          "module.exports.default = {};",
          captures.get(1).unwrap().as_str()
        ));
        continue;
      }
      if let Some(captures) = EXPORT_NAMED_RE.captures(trimmed) {
        lines.push(format!(
          "module.exports.{} = {};",
          captures.get(1).unwrap().as_str(),
          captures.get(2).unwrap().as_str()
        ));
        continue;
      }
      lines.push(line.to_string());
    }

    let code = lines.join("\n");
    let source_map = if options.source_map {
      Some(identity_map(lines.len()))
    } else {
      None
    };

    CompileOutput {
      code,
      source_map,
      errors,
      warnings,
    }
  }
}

/// A V3 map with one line-start mapping per generated line.
fn identity_map(line_count: usize) -> String {
  let mut builder = sourcemap::SourceMapBuilder::new(None);
  let source_id = builder.add_source("source.som");
  for line in 0..line_count as u32 {
    builder.add_raw(line, 0, line, 0, Some(source_id), None, false);
  }
  let map = builder.into_sourcemap();
  let mut out = Vec::new();
  map.to_writer(&mut out).expect("serialize identity map");
  String::from_utf8(out).expect("source map is utf-8")
}

#[cfg(test)]
mod tests {
  use pretty_assertions::assert_eq;

  use super::*;
  use crate::config::Target;

  fn emit_options() -> EmitOptions {
    EmitOptions {
      target: Target::Es2015,
      source_map: false,
      minify: false,
      type_check: false,
      strict: false,
    }
  }

  #[test]
  fn parses_the_three_import_forms() {
    let pipeline = LineParserPipeline::new();
    let output = pipeline.parse(
      "import x from './a'\n\
       import { one, two as second } from './b'\n\
       import * as ns from './c'\n",
    );
    assert!(output.errors.is_empty());
    assert_eq!(output.dependencies.len(), 3);
    assert_eq!(output.dependencies[0].source.value, "./a");
    assert_eq!(
      output.dependencies[1].specifiers,
      vec![
        ImportSpecifier::Named {
          imported: "one".to_string(),
          local: "one".to_string()
        },
        ImportSpecifier::Named {
          imported: "two".to_string(),
          local: "second".to_string()
        },
      ]
    );
    assert_eq!(
      output.dependencies[2].specifiers,
      vec![ImportSpecifier::Namespace {
        local: "ns".to_string()
      }]
    );
  }

  #[test]
  fn malformed_import_is_a_parse_error() {
    let pipeline = LineParserPipeline::new();
    let output = pipeline.parse("import broken\n");
    assert_eq!(output.errors.len(), 1);
    assert!(output.errors[0].contains("1:1"));
  }

  #[test]
  fn compiles_imports_to_requires() {
    let pipeline = LineParserPipeline::new();
    let output = pipeline.compile(
      "import x from './a'\nexport default x\n",
      &emit_options(),
    );
    assert!(output.errors.is_empty());
    assert_eq!(
      output.code,
      "const x = require('./a');\nmodule.exports.default = x;"
    );
  }

  #[test]
  fn compile_reports_bang_lines() {
    let pipeline = LineParserPipeline::new();
    let output = pipeline.compile("ok = 1\n!boom\n", &emit_options());
    assert_eq!(output.errors.len(), 1);
    assert!(output.errors[0].contains("2:1"));
  }

  #[test]
  fn source_map_lines_up_with_output() {
    let pipeline = LineParserPipeline::new();
    let mut options = emit_options();
    options.source_map = true;
    let output = pipeline.compile("a = 1\nb = 2\n", &options);
    let map =
      sourcemap::SourceMap::from_slice(output.source_map.unwrap().as_bytes())
        .unwrap();
    assert_eq!(map.get_token_count(), 2);
  }
}
