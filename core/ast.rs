// Copyright 2018-2026 the Som authors. MIT license.

//! The narrow seam between the module system and the external Som
//! front-end. The loader only ever looks at import declarations; every
//! other statement stays opaque.

use serde::Serialize;

use crate::config::Target;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StringLiteral {
  pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ImportSpecifier {
  /// `import x from '...'`
  Default { local: String },
  /// `import { imported as local } from '...'`
  Named { imported: String, local: String },
  /// `import * as local from '...'`
  Namespace { local: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImportDeclaration {
  pub source: StringLiteral,
  pub specifiers: Vec<ImportSpecifier>,
}

/// Anything the loader does not need to understand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OtherStatement {
  pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Statement {
  Import(ImportDeclaration),
  Other(OtherStatement),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Program {
  pub body: Vec<Statement>,
}

impl Program {
  pub fn import_declarations(&self) -> impl Iterator<Item = &ImportDeclaration> {
    self.body.iter().filter_map(|statement| match statement {
      Statement::Import(decl) => Some(decl),
      Statement::Other(_) => None,
    })
  }

  /// Size of the serialized AST, used by the cache footprint estimator.
  pub fn serialized_len(&self) -> usize {
    serde_json::to_string(self).map(|s| s.len()).unwrap_or(0)
  }
}

#[derive(Debug, Clone, Default)]
pub struct ParseOutput {
  pub program: Program,
  pub dependencies: Vec<ImportDeclaration>,
  pub errors: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct CompileOutput {
  pub code: String,
  pub source_map: Option<String>,
  pub errors: Vec<String>,
  pub warnings: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct EmitOptions {
  pub target: Target,
  pub source_map: bool,
  pub minify: bool,
  pub type_check: bool,
  pub strict: bool,
}

/// The external lexer/parser/code-generator. The module system drives it,
/// it never drives the module system.
pub trait SourcePipeline: Send + Sync {
  fn parse(&self, source: &str) -> ParseOutput;
  fn compile(&self, source: &str, options: &EmitOptions) -> CompileOutput;
}
