// Copyright 2018-2026 the Som authors. MIT license.

//! Persistent view of every module the loader has produced: the resolved
//! dependency graph, reverse edges, topological ordering, cycle and
//! dead-code queries. Registration order is the tie-break everywhere, so
//! results are deterministic for a fixed load sequence.

use std::collections::HashMap;
use std::collections::HashSet;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::SystemTime;

use indexmap::IndexMap;
use serde::Serialize;

use crate::errors::CircularDependencyError;
use crate::errors::RegistryError;
use crate::fs_util;
use crate::loader::module_id;
use crate::loader::LoadedModule;
use crate::loader::ModuleExports;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModuleImports {
  pub default: Vec<String>,
  pub named: IndexMap<String, Vec<String>>,
  pub namespace: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ModuleMetadata {
  pub id: String,
  pub absolute_path: PathBuf,
  /// Resolved ids where known, otherwise the raw specifier.
  pub dependencies: Vec<String>,
  pub dependents: Vec<String>,
  pub exports: ModuleExports,
  pub imports: ModuleImports,
  pub last_modified: Option<SystemTime>,
  pub source_size: usize,
  /// Raw specifiers as recorded by the loader; the source of truth for
  /// edge re-resolution.
  raw_dependencies: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencyNode {
  pub id: String,
  pub dependencies: Vec<String>,
  pub dependents: Vec<String>,
  /// 0 for modules with no dependencies, otherwise 1 + the maximum level
  /// of the resolved dependencies. `None` inside a cycle.
  pub level: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStatistics {
  pub total_modules: usize,
  pub total_dependencies: usize,
  pub average_dependencies: f64,
  pub max_dependency_depth: usize,
  pub circular_dependency_count: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencyTreeNode {
  pub id: String,
  pub circular: bool,
  pub dependencies: Vec<DependencyTreeNode>,
}

#[derive(Debug, Default)]
struct RegistryInner {
  modules: IndexMap<String, ModuleMetadata>,
  /// Resolved forward edges, parallel to `modules`.
  edges: HashMap<String, Vec<String>>,
  levels: HashMap<String, Option<usize>>,
}

pub struct ModuleRegistry {
  extensions: Vec<String>,
  inner: Mutex<RegistryInner>,
}

impl ModuleRegistry {
  pub fn new(extensions: Vec<String>) -> Self {
    Self {
      extensions,
      inner: Mutex::new(RegistryInner::default()),
    }
  }

  /// Register a loaded module. Idempotent: re-registration replaces the
  /// stored metadata and recomputes edges and levels.
  pub fn register(&self, module: &LoadedModule) -> Result<(), RegistryError> {
    if !valid_module_id(&module.id) {
      return Err(RegistryError::InvalidModuleId {
        id: module.id.clone(),
      });
    }

    let imports = collect_imports(module);
    let last_modified = std::fs::metadata(&module.absolute_path)
      .and_then(|meta| meta.modified())
      .ok();
    let metadata = ModuleMetadata {
      id: module.id.clone(),
      absolute_path: module.absolute_path.clone(),
      dependencies: module.dependencies.clone(),
      dependents: Vec::new(),
      exports: module.exports.clone(),
      imports,
      last_modified,
      source_size: module.source.len(),
      raw_dependencies: module.dependencies.clone(),
    };

    let mut inner = self.inner.lock().unwrap();
    inner.modules.insert(metadata.id.clone(), metadata);
    self.resolve_edges(&mut inner);
    self.recompute_levels(&mut inner);
    Ok(())
  }

  pub fn remove(&self, id: &str) -> bool {
    let mut inner = self.inner.lock().unwrap();
    let removed = inner.modules.shift_remove(id).is_some();
    if removed {
      self.resolve_edges(&mut inner);
      self.recompute_levels(&mut inner);
    }
    removed
  }

  pub fn clear(&self) {
    let mut inner = self.inner.lock().unwrap();
    inner.modules.clear();
    inner.edges.clear();
    inner.levels.clear();
  }

  pub fn has(&self, id: &str) -> bool {
    self.inner.lock().unwrap().modules.contains_key(id)
  }

  pub fn get(&self, id: &str) -> Option<ModuleMetadata> {
    self.inner.lock().unwrap().modules.get(id).cloned()
  }

  pub fn get_all(&self) -> Vec<ModuleMetadata> {
    self.inner.lock().unwrap().modules.values().cloned().collect()
  }

  pub fn len(&self) -> usize {
    self.inner.lock().unwrap().modules.len()
  }

  pub fn is_empty(&self) -> bool {
    self.inner.lock().unwrap().modules.is_empty()
  }

  /// Resolved dependency ids of `id` (unmatched raw specifiers excluded).
  pub fn get_dependencies(&self, id: &str) -> Vec<String> {
    let inner = self.inner.lock().unwrap();
    inner.edges.get(id).cloned().unwrap_or_default()
  }

  pub fn get_dependents(&self, id: &str) -> Vec<String> {
    let inner = self.inner.lock().unwrap();
    inner
      .modules
      .get(id)
      .map(|module| module.dependents.clone())
      .unwrap_or_default()
  }

  /// Raw specifiers that did not resolve to any registered module.
  pub fn unresolved_dependencies(&self, id: &str) -> Vec<String> {
    let inner = self.inner.lock().unwrap();
    let resolved: HashSet<&String> = inner
      .edges
      .get(id)
      .map(|edges| edges.iter().collect())
      .unwrap_or_default();
    match inner.modules.get(id) {
      Some(module) => module
        .dependencies
        .iter()
        .filter(|dep| !resolved.contains(dep))
        .cloned()
        .collect(),
      None => Vec::new(),
    }
  }

  pub fn get_node(&self, id: &str) -> Option<DependencyNode> {
    let inner = self.inner.lock().unwrap();
    inner.modules.get(id).map(|module| DependencyNode {
      id: module.id.clone(),
      dependencies: inner.edges.get(id).cloned().unwrap_or_default(),
      dependents: module.dependents.clone(),
      level: inner.levels.get(id).copied().flatten(),
    })
  }

  /// Deterministic ordering with every dependency strictly before its
  /// dependents. Fails when the graph has a cycle.
  pub fn get_topological_sort(&self) -> Result<Vec<String>, RegistryError> {
    let inner = self.inner.lock().unwrap();
    let mut sorted = Vec::with_capacity(inner.modules.len());
    let mut visited: HashSet<String> = HashSet::new();
    let mut visiting: Vec<String> = Vec::new();

    fn visit(
      id: &str,
      inner: &RegistryInner,
      visited: &mut HashSet<String>,
      visiting: &mut Vec<String>,
      sorted: &mut Vec<String>,
    ) -> Result<(), RegistryError> {
      if visited.contains(id) {
        return Ok(());
      }
      if let Some(position) = visiting.iter().position(|entry| entry == id) {
        let mut chain: Vec<String> = visiting[position..].to_vec();
        chain.push(id.to_string());
        return Err(CircularDependencyError::new(chain).into());
      }
      visiting.push(id.to_string());
      if let Some(edges) = inner.edges.get(id) {
        for dependency in edges {
          visit(dependency, inner, visited, visiting, sorted)?;
        }
      }
      visiting.pop();
      visited.insert(id.to_string());
      sorted.push(id.to_string());
      Ok(())
    }

    let ids: Vec<String> = inner.modules.keys().cloned().collect();
    for id in ids {
      visit(&id, &inner, &mut visited, &mut visiting, &mut sorted)?;
    }
    Ok(sorted)
  }

  /// Every cycle in the graph; each entry repeats the closing id at the
  /// end (`[a, b, a]`).
  pub fn find_circular_dependencies(&self) -> Vec<Vec<String>> {
    let inner = self.inner.lock().unwrap();
    let mut cycles = Vec::new();
    let mut visited: HashSet<String> = HashSet::new();
    let mut stack: Vec<String> = Vec::new();

    fn visit(
      id: &str,
      inner: &RegistryInner,
      visited: &mut HashSet<String>,
      stack: &mut Vec<String>,
      cycles: &mut Vec<Vec<String>>,
    ) {
      if let Some(position) = stack.iter().position(|entry| entry == id) {
        let mut chain: Vec<String> = stack[position..].to_vec();
        chain.push(id.to_string());
        cycles.push(chain);
        return;
      }
      if visited.contains(id) {
        return;
      }
      visited.insert(id.to_string());
      stack.push(id.to_string());
      if let Some(edges) = inner.edges.get(id) {
        for dependency in edges {
          visit(dependency, inner, visited, stack, cycles);
        }
      }
      stack.pop();
    }

    let ids: Vec<String> = inner.modules.keys().cloned().collect();
    for id in ids {
      visit(&id, &inner, &mut visited, &mut stack, &mut cycles);
    }
    cycles
  }

  pub fn get_statistics(&self) -> RegistryStatistics {
    let circular_dependency_count = self.find_circular_dependencies().len();
    let inner = self.inner.lock().unwrap();
    let total_modules = inner.modules.len();
    let total_dependencies: usize =
      inner.edges.values().map(|edges| edges.len()).sum();
    let average_dependencies = if total_modules == 0 {
      0.0
    } else {
      total_dependencies as f64 / total_modules as f64
    };
    let max_dependency_depth = inner
      .levels
      .values()
      .filter_map(|level| *level)
      .max()
      .unwrap_or(0);
    RegistryStatistics {
      total_modules,
      total_dependencies,
      average_dependencies,
      max_dependency_depth,
      circular_dependency_count,
    }
  }

  /// Modules with no dependencies.
  pub fn get_entry_points(&self) -> Vec<String> {
    let inner = self.inner.lock().unwrap();
    inner
      .modules
      .keys()
      .filter(|id| {
        inner.edges.get(*id).map(|edges| edges.is_empty()).unwrap_or(true)
      })
      .cloned()
      .collect()
  }

  /// Modules nothing depends on.
  pub fn get_dead_code_candidates(&self) -> Vec<String> {
    let inner = self.inner.lock().unwrap();
    inner
      .modules
      .values()
      .filter(|module| module.dependents.is_empty())
      .map(|module| module.id.clone())
      .collect()
  }

  /// Dependency tree rooted at `id`; ids already on the path are marked
  /// `circular` and not expanded further.
  pub fn get_dependency_tree(&self, id: &str) -> Option<DependencyTreeNode> {
    let inner = self.inner.lock().unwrap();
    if !inner.modules.contains_key(id) {
      return None;
    }

    fn build(
      id: &str,
      inner: &RegistryInner,
      path: &mut Vec<String>,
    ) -> DependencyTreeNode {
      if path.iter().any(|entry| entry == id) {
        return DependencyTreeNode {
          id: id.to_string(),
          circular: true,
          dependencies: Vec::new(),
        };
      }
      path.push(id.to_string());
      let dependencies = inner
        .edges
        .get(id)
        .map(|edges| {
          edges.iter().map(|dep| build(dep, inner, path)).collect()
        })
        .unwrap_or_default();
      path.pop();
      DependencyTreeNode {
        id: id.to_string(),
        circular: false,
        dependencies,
      }
    }

    let mut path = Vec::new();
    Some(build(id, &inner, &mut path))
  }

  /// Re-resolve every node's raw specifiers against the registered set:
  /// the raw string as-is, then with each configured extension, then as
  /// `<specifier>/index.<ext>`, all against the referrer's directory.
  /// External specifiers match their `external:` registration.
  fn resolve_edges(&self, inner: &mut RegistryInner) {
    let known: HashSet<String> = inner.modules.keys().cloned().collect();
    let mut edges: HashMap<String, Vec<String>> = HashMap::new();
    let mut dependents: HashMap<String, Vec<String>> = HashMap::new();

    for (id, module) in &inner.modules {
      let from_dir = fs_util::referrer_dir(&module.absolute_path);
      let mut resolved_edges = Vec::new();
      for raw in &module.raw_dependencies {
        if let Some(target) =
          self.resolve_edge(raw, &from_dir, &known)
        {
          if !resolved_edges.contains(&target) {
            dependents
              .entry(target.clone())
              .or_default()
              .push(id.clone());
            resolved_edges.push(target);
          }
        }
      }
      edges.insert(id.clone(), resolved_edges);
    }

    for (id, module) in inner.modules.iter_mut() {
      module.dependents = dependents.remove(id).unwrap_or_default();
      let resolved = edges.get(id).cloned().unwrap_or_default();
      // Metadata view: resolved ids where known, raw otherwise.
      let resolved_set: HashSet<&String> = resolved.iter().collect();
      let mut view = resolved.clone();
      for raw in &module.raw_dependencies {
        let matched = self
          .resolve_edge(raw, &fs_util::referrer_dir(&module.absolute_path), &known)
          .map(|target| resolved_set.contains(&target))
          .unwrap_or(false);
        if !matched {
          view.push(raw.clone());
        }
      }
      module.dependencies = view;
    }
    inner.edges = edges;
  }

  fn resolve_edge(
    &self,
    raw: &str,
    from_dir: &Path,
    known: &HashSet<String>,
  ) -> Option<String> {
    if known.contains(raw) {
      return Some(raw.to_string());
    }
    if raw.starts_with("external:") {
      return None;
    }
    let external_id = format!("external:{}", raw);
    if known.contains(&external_id) {
      return Some(external_id);
    }

    let mut candidates = Vec::new();
    candidates.push(raw.to_string());
    for extension in &self.extensions {
      candidates.push(format!("{}{}", raw, extension));
    }
    for extension in &self.extensions {
      candidates.push(format!("{}/index{}", raw, extension));
    }

    for candidate in candidates {
      let absolute = if Path::new(&candidate).is_absolute() {
        module_id(Path::new(&candidate))
      } else {
        module_id(&from_dir.join(&candidate))
      };
      if known.contains(&absolute) {
        return Some(absolute);
      }
    }
    None
  }

  /// Memoized level computation. Nodes inside a cycle keep their previous
  /// level (none when fresh).
  fn recompute_levels(&self, inner: &mut RegistryInner) {
    let mut levels: HashMap<String, Option<usize>> = HashMap::new();

    fn level_of(
      id: &str,
      inner: &RegistryInner,
      levels: &mut HashMap<String, Option<usize>>,
      path: &mut Vec<String>,
    ) -> Option<usize> {
      if let Some(level) = levels.get(id) {
        return *level;
      }
      if path.iter().any(|entry| entry == id) {
        // In a cycle: keep whatever level the node had before.
        return inner.levels.get(id).copied().flatten();
      }
      path.push(id.to_string());
      let edges = inner.edges.get(id);
      let level = match edges {
        None => Some(0),
        Some(edges) if edges.is_empty() => Some(0),
        Some(edges) => {
          let mut max_level = None;
          let mut incomplete = false;
          for dependency in edges {
            match level_of(dependency, inner, levels, path) {
              Some(level) => {
                max_level =
                  Some(max_level.map_or(level, |m: usize| m.max(level)));
              }
              None => incomplete = true,
            }
          }
          if incomplete && max_level.is_none() {
            inner.levels.get(id).copied().flatten()
          } else {
            max_level.map(|m| m + 1)
          }
        }
      };
      path.pop();
      levels.insert(id.to_string(), level);
      level
    }

    let ids: Vec<String> = inner.modules.keys().cloned().collect();
    for id in &ids {
      let mut path = Vec::new();
      level_of(id, inner, &mut levels, &mut path);
    }
    inner.levels = levels;
  }
}

fn valid_module_id(id: &str) -> bool {
  id.starts_with("external:") || Path::new(id).is_absolute()
}

fn collect_imports(module: &LoadedModule) -> ModuleImports {
  let mut imports = ModuleImports::default();
  if let Some(program) = &module.ast {
    for declaration in program.import_declarations() {
      let source = declaration.source.value.clone();
      for specifier in &declaration.specifiers {
        match specifier {
          crate::ast::ImportSpecifier::Default { local } => {
            imports.default.push(local.clone());
          }
          crate::ast::ImportSpecifier::Named { imported, .. } => {
            imports
              .named
              .entry(source.clone())
              .or_default()
              .push(imported.clone());
          }
          crate::ast::ImportSpecifier::Namespace { local } => {
            imports.namespace.push(local.clone());
          }
        }
      }
    }
  }
  imports
}

#[cfg(test)]
mod tests {
  use pretty_assertions::assert_eq;

  use super::*;

  fn module(id: &str, dependencies: &[&str]) -> LoadedModule {
    let mut module = LoadedModule::new(
      id.to_string(),
      PathBuf::from(id),
      ".som".to_string(),
    );
    module.dependencies =
      dependencies.iter().map(|d| d.to_string()).collect();
    module.is_loaded = true;
    module
  }

  fn registry() -> ModuleRegistry {
    ModuleRegistry::new(vec![".som".to_string(), ".js".to_string()])
  }

  #[test]
  fn rejects_relative_module_ids() {
    let registry = registry();
    let err = registry.register(&module("not/absolute", &[])).unwrap_err();
    assert!(matches!(err, RegistryError::InvalidModuleId { .. }));
  }

  #[test]
  fn accepts_external_ids() {
    let registry = registry();
    registry.register(&module("external:fs", &[])).unwrap();
    assert!(registry.has("external:fs"));
  }

  #[test]
  fn back_edges_mirror_forward_edges() {
    let registry = registry();
    registry.register(&module("/src/a.som", &["./b"])).unwrap();
    registry.register(&module("/src/b.som", &[])).unwrap();
    assert_eq!(
      registry.get_dependencies("/src/a.som"),
      vec!["/src/b.som".to_string()]
    );
    assert_eq!(
      registry.get_dependents("/src/b.som"),
      vec!["/src/a.som".to_string()]
    );
  }

  #[test]
  fn edge_resolution_probes_extensions_and_index() {
    let registry = registry();
    registry
      .register(&module("/src/a.som", &["./lib", "./widgets"]))
      .unwrap();
    registry.register(&module("/src/lib.som", &[])).unwrap();
    registry
      .register(&module("/src/widgets/index.som", &[]))
      .unwrap();
    assert_eq!(
      registry.get_dependencies("/src/a.som"),
      vec![
        "/src/lib.som".to_string(),
        "/src/widgets/index.som".to_string()
      ]
    );
  }

  #[test]
  fn unresolved_raw_specifiers_stay_visible() {
    let registry = registry();
    registry
      .register(&module("/src/a.som", &["./missing"]))
      .unwrap();
    assert!(registry.get_dependencies("/src/a.som").is_empty());
    assert_eq!(
      registry.unresolved_dependencies("/src/a.som"),
      vec!["./missing".to_string()]
    );
    let metadata = registry.get("/src/a.som").unwrap();
    assert_eq!(metadata.dependencies, vec!["./missing".to_string()]);
  }

  #[test]
  fn topological_sort_puts_dependencies_first() {
    let registry = registry();
    registry.register(&module("/a.som", &["./b"])).unwrap();
    registry.register(&module("/b.som", &["./c"])).unwrap();
    registry.register(&module("/c.som", &[])).unwrap();
    let sorted = registry.get_topological_sort().unwrap();
    assert_eq!(
      sorted,
      vec![
        "/c.som".to_string(),
        "/b.som".to_string(),
        "/a.som".to_string()
      ]
    );
  }

  #[test]
  fn diamond_orders_shared_dependency_once() {
    let registry = registry();
    registry.register(&module("/a.som", &["./b", "./c"])).unwrap();
    registry.register(&module("/b.som", &["./d"])).unwrap();
    registry.register(&module("/c.som", &["./d"])).unwrap();
    registry.register(&module("/d.som", &[])).unwrap();
    let sorted = registry.get_topological_sort().unwrap();
    let position =
      |id: &str| sorted.iter().position(|entry| entry == id).unwrap();
    assert!(position("/d.som") < position("/b.som"));
    assert!(position("/d.som") < position("/c.som"));
    assert!(position("/b.som") < position("/a.som"));
    assert!(position("/c.som") < position("/a.som"));
    assert_eq!(sorted.len(), 4);
  }

  #[test]
  fn cycles_fail_the_sort_and_are_enumerable() {
    let registry = registry();
    registry.register(&module("/a.som", &["./b"])).unwrap();
    registry.register(&module("/b.som", &["./a"])).unwrap();
    let err = registry.get_topological_sort().unwrap_err();
    assert!(matches!(err, RegistryError::Circular(_)));
    let cycles = registry.find_circular_dependencies();
    assert_eq!(cycles.len(), 1);
    assert_eq!(
      cycles[0],
      vec![
        "/a.som".to_string(),
        "/b.som".to_string(),
        "/a.som".to_string()
      ]
    );
  }

  #[test]
  fn no_cycles_means_sort_succeeds() {
    let registry = registry();
    registry.register(&module("/a.som", &["./b"])).unwrap();
    registry.register(&module("/b.som", &[])).unwrap();
    assert!(registry.find_circular_dependencies().is_empty());
    assert!(registry.get_topological_sort().is_ok());
  }

  #[test]
  fn levels_follow_the_longest_path() {
    let registry = registry();
    registry.register(&module("/a.som", &["./b", "./d"])).unwrap();
    registry.register(&module("/b.som", &["./c"])).unwrap();
    registry.register(&module("/c.som", &[])).unwrap();
    registry.register(&module("/d.som", &[])).unwrap();
    assert_eq!(registry.get_node("/c.som").unwrap().level, Some(0));
    assert_eq!(registry.get_node("/b.som").unwrap().level, Some(1));
    assert_eq!(registry.get_node("/a.som").unwrap().level, Some(2));
  }

  #[test]
  fn statistics_summarize_the_graph() {
    let registry = registry();
    registry.register(&module("/a.som", &["./b"])).unwrap();
    registry.register(&module("/b.som", &[])).unwrap();
    let stats = registry.get_statistics();
    assert_eq!(stats.total_modules, 2);
    assert_eq!(stats.total_dependencies, 1);
    assert_eq!(stats.average_dependencies, 0.5);
    assert_eq!(stats.max_dependency_depth, 1);
    assert_eq!(stats.circular_dependency_count, 0);
  }

  #[test]
  fn entry_points_and_dead_code() {
    let registry = registry();
    registry.register(&module("/a.som", &["./b"])).unwrap();
    registry.register(&module("/b.som", &[])).unwrap();
    assert_eq!(registry.get_entry_points(), vec!["/b.som".to_string()]);
    assert_eq!(
      registry.get_dead_code_candidates(),
      vec!["/a.som".to_string()]
    );
  }

  #[test]
  fn dependency_tree_marks_cycles() {
    let registry = registry();
    registry.register(&module("/a.som", &["./b"])).unwrap();
    registry.register(&module("/b.som", &["./a"])).unwrap();
    let tree = registry.get_dependency_tree("/a.som").unwrap();
    assert_eq!(tree.id, "/a.som");
    assert!(!tree.circular);
    let child = &tree.dependencies[0];
    assert_eq!(child.id, "/b.som");
    let back = &child.dependencies[0];
    assert_eq!(back.id, "/a.som");
    assert!(back.circular);
  }

  #[test]
  fn registration_is_idempotent() {
    let registry = registry();
    registry.register(&module("/a.som", &["./b"])).unwrap();
    registry.register(&module("/a.som", &["./b"])).unwrap();
    registry.register(&module("/b.som", &[])).unwrap();
    assert_eq!(registry.len(), 2);
    assert_eq!(
      registry.get_dependents("/b.som"),
      vec!["/a.som".to_string()]
    );
  }
}
