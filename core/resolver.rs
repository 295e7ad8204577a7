// Copyright 2018-2026 the Som authors. MIT license.

//! Maps import specifiers to concrete files. Classification of a specifier
//! (relative, project-relative, OS path, bare) is pure string analysis and
//! never touches the filesystem; only file resolution probes disk.

use std::path::Path;
use std::path::PathBuf;

use log::debug;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::ResolutionConfig;
use crate::errors::ResolveError;
use crate::fs_util;

/// Path prefixes recognized as OS roots. A leading-slash specifier outside
/// these (and outside the configured base) is treated as project-relative.
const OS_ROOT_PREFIXES: [&str; 7] =
  ["/Users/", "/home/", "/var/", "/tmp/", "/opt/", "/usr/", "/etc/"];

static WINDOWS_DRIVE_RE: Lazy<Regex> =
  Lazy::new(|| Regex::new(r"^[A-Za-z]:[/\\]").unwrap());

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedModule {
  pub absolute_path: PathBuf,
  pub is_external_library: bool,
  pub package_name: Option<String>,
  pub extension: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SpecifierKind {
  Relative,
  ProjectRelative,
  OsPath,
  Bare,
}

pub struct Resolver {
  config: ResolutionConfig,
}

impl Resolver {
  pub fn new(config: ResolutionConfig) -> Self {
    Self { config }
  }

  pub fn config(&self) -> &ResolutionConfig {
    &self.config
  }

  /// Resolve `specifier` as seen from `referrer` (a file or a directory).
  pub fn resolve(
    &self,
    specifier: &str,
    referrer: &Path,
  ) -> Result<ResolvedModule, ResolveError> {
    let from_dir = fs_util::referrer_dir(referrer);
    debug!("resolve \"{}\" from {}", specifier, from_dir.display());

    match self.classify(specifier) {
      SpecifierKind::OsPath => {
        // OS-absolute paths bypass project resolution entirely.
        let path = fs_util::normalize_path(Path::new(specifier));
        let extension =
          fs_util::get_extension(&path).unwrap_or_default();
        Ok(ResolvedModule {
          absolute_path: path,
          is_external_library: false,
          package_name: None,
          extension,
        })
      }
      SpecifierKind::Relative => {
        let candidate = from_dir.join(specifier);
        self
          .resolve_file(&candidate)
          .map(|(path, extension)| ResolvedModule {
            absolute_path: path,
            is_external_library: false,
            package_name: None,
            extension,
          })
          .ok_or_else(|| not_found(specifier, referrer))
      }
      SpecifierKind::ProjectRelative => {
        let base = self.base_url()?;
        let candidate = base.join(specifier.trim_start_matches('/'));
        self
          .resolve_file(&candidate)
          .map(|(path, extension)| ResolvedModule {
            absolute_path: path,
            is_external_library: false,
            package_name: None,
            extension,
          })
          .ok_or_else(|| not_found(specifier, referrer))
      }
      SpecifierKind::Bare => {
        if let Some(resolved) = self.resolve_mapped(specifier)? {
          return Ok(resolved);
        }
        self
          .resolve_bare(specifier, &from_dir)
          .ok_or_else(|| not_found(specifier, referrer))
      }
    }
  }

  fn classify(&self, specifier: &str) -> SpecifierKind {
    if specifier.starts_with("./") || specifier.starts_with("../") {
      return SpecifierKind::Relative;
    }
    if WINDOWS_DRIVE_RE.is_match(specifier) {
      return SpecifierKind::OsPath;
    }
    if specifier.starts_with('/') {
      if OS_ROOT_PREFIXES.iter().any(|root| specifier.starts_with(root)) {
        return SpecifierKind::OsPath;
      }
      // Paths strictly inside the configured base are OS paths too; a bare
      // "/" specifier equal to the base itself is not.
      let base = self.config.base_url.to_string_lossy();
      if !base.is_empty()
        && specifier.len() > base.len()
        && specifier.starts_with(base.as_ref())
      {
        return SpecifierKind::OsPath;
      }
      return SpecifierKind::ProjectRelative;
    }
    SpecifierKind::Bare
  }

  fn base_url(&self) -> Result<&PathBuf, ResolveError> {
    let base = &self.config.base_url;
    if base.as_os_str().is_empty() {
      return Err(ResolveError::InvalidBase {
        path: String::new(),
        reason: "no baseUrl configured".to_string(),
      });
    }
    if !base.is_absolute() {
      return Err(ResolveError::InvalidBase {
        path: base.display().to_string(),
        reason: "baseUrl must be absolute".to_string(),
      });
    }
    Ok(base)
  }

  /// Try the configured path mappings. Patterns are exact, `*`, or
  /// `prefix/*`; for a matching pattern each mapping is tried in order
  /// until one resolves.
  fn resolve_mapped(
    &self,
    specifier: &str,
  ) -> Result<Option<ResolvedModule>, ResolveError> {
    if self.config.paths.is_empty() {
      return Ok(None);
    }
    let base = self.base_url()?;
    for (pattern, mappings) in &self.config.paths {
      let tail = match match_pattern(pattern, specifier) {
        Some(tail) => tail,
        None => continue,
      };
      for mapping in mappings {
        let substituted = mapping.replace('*', tail);
        let candidate = if Path::new(&substituted).is_absolute() {
          fs_util::normalize_path(Path::new(&substituted))
        } else {
          base.join(&substituted)
        };
        if let Some((path, extension)) = self.resolve_file(&candidate) {
          return Ok(Some(ResolvedModule {
            absolute_path: path,
            is_external_library: false,
            package_name: Some(package_name_of(specifier)),
            extension,
          }));
        }
      }
    }
    Ok(None)
  }

  /// `node_modules`-style walk: probe each configured module directory in
  /// every ancestor of `from_dir`. The first hit wins.
  fn resolve_bare(
    &self,
    specifier: &str,
    from_dir: &Path,
  ) -> Option<ResolvedModule> {
    let mut dir = Some(from_dir.to_path_buf());
    while let Some(current) = dir {
      for module_dir in &self.config.module_directories {
        let candidate = current.join(module_dir).join(specifier);
        if let Some((path, extension)) = self.resolve_file(&candidate) {
          return Some(ResolvedModule {
            absolute_path: path,
            is_external_library: true,
            package_name: Some(package_name_of(specifier)),
            extension,
          });
        }
      }
      dir = current.parent().map(|p| p.to_path_buf());
    }
    None
  }

  /// File resolution: exact file, then appended extensions, then directory
  /// handling (`package.json#main`, `index.<ext>`).
  fn resolve_file(&self, candidate: &Path) -> Option<(PathBuf, String)> {
    let candidate = fs_util::normalize_path(candidate);
    if candidate.is_file() {
      let extension = fs_util::get_extension(&candidate).unwrap_or_default();
      return Some((candidate, extension));
    }

    for extension in &self.config.extensions {
      let mut with_ext = candidate.as_os_str().to_owned();
      with_ext.push(extension);
      let with_ext = PathBuf::from(with_ext);
      if with_ext.is_file() {
        return Some((with_ext, extension.clone()));
      }
    }

    if candidate.is_dir() {
      if let Some(main) = read_package_main(&candidate) {
        let main_path = candidate.join(main);
        if main_path.is_file() {
          let extension =
            fs_util::get_extension(&main_path).unwrap_or_default();
          return Some((fs_util::normalize_path(&main_path), extension));
        }
        for extension in &self.config.extensions {
          let mut with_ext = main_path.as_os_str().to_owned();
          with_ext.push(extension);
          let with_ext = PathBuf::from(with_ext);
          if with_ext.is_file() {
            return Some((
              fs_util::normalize_path(&with_ext),
              extension.clone(),
            ));
          }
        }
      }
      for extension in &self.config.extensions {
        let index = candidate.join(format!("index{}", extension));
        if index.is_file() {
          return Some((index, extension.clone()));
        }
      }
    }

    None
  }
}

fn not_found(specifier: &str, referrer: &Path) -> ResolveError {
  ResolveError::NotFound {
    specifier: specifier.to_string(),
    referrer: referrer.display().to_string(),
  }
}

/// Match a `paths` pattern against a specifier, returning the `*` tail
/// (empty for exact matches).
fn match_pattern<'a>(pattern: &str, specifier: &'a str) -> Option<&'a str> {
  if pattern == "*" {
    return Some(specifier);
  }
  if let Some(prefix) = pattern.strip_suffix("/*") {
    let rest = specifier.strip_prefix(prefix)?;
    return rest.strip_prefix('/');
  }
  if pattern == specifier {
    return Some("");
  }
  None
}

/// First path segment of a bare specifier; scoped packages keep two
/// segments (`@scope/name`).
fn package_name_of(specifier: &str) -> String {
  let mut segments = specifier.split('/');
  match segments.next() {
    Some(scope) if scope.starts_with('@') => match segments.next() {
      Some(name) => format!("{}/{}", scope, name),
      None => scope.to_string(),
    },
    Some(name) => name.to_string(),
    None => specifier.to_string(),
  }
}

fn read_package_main(dir: &Path) -> Option<String> {
  let manifest = dir.join("package.json");
  let text = std::fs::read_to_string(manifest).ok()?;
  let value: serde_json::Value = serde_json::from_str(&text).ok()?;
  value
    .get("main")
    .and_then(|main| main.as_str())
    .map(|main| main.to_string())
}

#[cfg(test)]
mod tests {
  use pretty_assertions::assert_eq;
  use tempfile::TempDir;

  use super::*;
  use crate::config::ResolutionConfig;

  fn write(dir: &Path, rel: &str, contents: &str) -> PathBuf {
    let path = dir.join(rel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, contents).unwrap();
    path
  }

  fn resolver_for(base: &Path) -> Resolver {
    Resolver::new(ResolutionConfig {
      base_url: base.to_path_buf(),
      ..Default::default()
    })
  }

  #[test]
  fn resolves_relative_with_extension_probing() {
    let t = TempDir::new().unwrap();
    let entry = write(t.path(), "src/main.som", "");
    let dep = write(t.path(), "src/util.som", "");
    let resolver = resolver_for(t.path());
    let resolved = resolver.resolve("./util", &entry).unwrap();
    assert_eq!(resolved.absolute_path, dep);
    assert_eq!(resolved.extension, ".som");
    assert!(!resolved.is_external_library);
  }

  #[test]
  fn resolves_parent_relative() {
    let t = TempDir::new().unwrap();
    let entry = write(t.path(), "src/deep/main.som", "");
    let dep = write(t.path(), "src/shared.som", "");
    let resolver = resolver_for(t.path());
    let resolved = resolver.resolve("../shared", &entry).unwrap();
    assert_eq!(resolved.absolute_path, dep);
  }

  #[test]
  fn resolves_project_relative_against_base() {
    let t = TempDir::new().unwrap();
    let entry = write(t.path(), "src/main.som", "");
    let dep = write(t.path(), "lib/helpers.som", "");
    let resolver = resolver_for(t.path());
    let resolved = resolver.resolve("/lib/helpers", &entry).unwrap();
    assert_eq!(resolved.absolute_path, dep);
  }

  #[test]
  fn resolves_directory_index() {
    let t = TempDir::new().unwrap();
    let entry = write(t.path(), "main.som", "");
    let index = write(t.path(), "widgets/index.som", "");
    let resolver = resolver_for(t.path());
    let resolved = resolver.resolve("./widgets", &entry).unwrap();
    assert_eq!(resolved.absolute_path, index);
  }

  #[test]
  fn resolves_package_json_main() {
    let t = TempDir::new().unwrap();
    let entry = write(t.path(), "main.som", "");
    write(t.path(), "pkg/package.json", r#"{ "main": "entry.som" }"#);
    let main = write(t.path(), "pkg/entry.som", "");
    let resolver = resolver_for(t.path());
    let resolved = resolver.resolve("./pkg", &entry).unwrap();
    assert_eq!(resolved.absolute_path, main);
  }

  #[test]
  fn resolves_bare_through_module_directories() {
    let t = TempDir::new().unwrap();
    let entry = write(t.path(), "src/deep/main.som", "");
    let dep = write(t.path(), "node_modules/leftpad/index.som", "");
    let resolver = resolver_for(t.path());
    let resolved = resolver.resolve("leftpad", &entry).unwrap();
    assert_eq!(resolved.absolute_path, dep);
    assert!(resolved.is_external_library);
    assert_eq!(resolved.package_name.as_deref(), Some("leftpad"));
  }

  #[test]
  fn path_mapping_wins_over_module_walk() {
    let t = TempDir::new().unwrap();
    let entry = write(t.path(), "src/main.som", "");
    let mapped = write(t.path(), "vendor/fancy/mod.som", "");
    let mut config = ResolutionConfig {
      base_url: t.path().to_path_buf(),
      ..Default::default()
    };
    config
      .paths
      .insert("@fancy/*".to_string(), vec!["vendor/fancy/*".to_string()]);
    let resolver = Resolver::new(config);
    let resolved = resolver.resolve("@fancy/mod", &entry).unwrap();
    assert_eq!(resolved.absolute_path, mapped);
    assert_eq!(resolved.package_name.as_deref(), Some("@fancy/mod"));
  }

  #[test]
  fn os_path_specifiers_pass_through() {
    let resolver = resolver_for(Path::new("/project"));
    let resolved = resolver
      .resolve("/usr/lib/som/runtime.som", Path::new("/project/main.som"))
      .unwrap();
    assert_eq!(
      resolved.absolute_path,
      PathBuf::from("/usr/lib/som/runtime.som")
    );
    assert_eq!(resolved.extension, ".som");
  }

  #[test]
  fn missing_module_is_not_found() {
    let t = TempDir::new().unwrap();
    let entry = write(t.path(), "main.som", "");
    let resolver = resolver_for(t.path());
    let err = resolver.resolve("./missing", &entry).unwrap_err();
    assert!(matches!(err, ResolveError::NotFound { .. }));
    assert!(err.to_string().contains("./missing"));
  }

  #[test]
  fn resolution_is_idempotent() {
    let t = TempDir::new().unwrap();
    let entry = write(t.path(), "src/main.som", "");
    write(t.path(), "src/util.som", "");
    let resolver = resolver_for(t.path());
    let first = resolver.resolve("./util", &entry).unwrap();
    let again = resolver
      .resolve(first.absolute_path.to_str().unwrap(), &entry)
      .unwrap();
    assert_eq!(first.absolute_path, again.absolute_path);
  }

  #[test]
  fn exact_pattern_mapping() {
    assert_eq!(match_pattern("config", "config"), Some(""));
    assert_eq!(match_pattern("config", "config/x"), None);
    assert_eq!(match_pattern("*", "anything/at/all"), Some("anything/at/all"));
    assert_eq!(match_pattern("lib/*", "lib/a/b"), Some("a/b"));
    assert_eq!(match_pattern("lib/*", "other/a"), None);
  }

  #[test]
  fn scoped_package_names() {
    assert_eq!(package_name_of("@scope/pkg/inner"), "@scope/pkg");
    assert_eq!(package_name_of("plain/inner"), "plain");
  }
}
