// Copyright 2018-2026 the Som authors. MIT license.

use std::path::Component;
use std::path::Path;
use std::path::PathBuf;

/// Normalize all intermediate components of the path (ie. remove "./" and
/// "../" components) without touching the filesystem.
pub fn normalize_path(path: &Path) -> PathBuf {
  let mut components = path.components().peekable();
  let mut ret =
    if let Some(c @ Component::Prefix(..)) = components.peek().cloned() {
      components.next();
      PathBuf::from(c.as_os_str())
    } else {
      PathBuf::new()
    };

  for component in components {
    match component {
      Component::Prefix(..) => unreachable!(),
      Component::RootDir => {
        ret.push(component.as_os_str());
      }
      Component::CurDir => {}
      Component::ParentDir => {
        ret.pop();
      }
      Component::Normal(c) => {
        ret.push(c);
      }
    }
  }
  ret
}

/// Similar to `std::fs::canonicalize()` but strips UNC prefixes on Windows.
pub fn canonicalize_path(path: &Path) -> Result<PathBuf, std::io::Error> {
  let mut canonicalized_path = path.canonicalize()?;
  if cfg!(windows) {
    canonicalized_path = PathBuf::from(
      canonicalized_path
        .display()
        .to_string()
        .trim_start_matches("\\\\?\\"),
    );
  }
  Ok(canonicalized_path)
}

/// Get the extension of a file including the leading dot, in lowercase.
pub fn get_extension(file_path: &Path) -> Option<String> {
  file_path
    .extension()
    .and_then(|e| e.to_str())
    .map(|e| format!(".{}", e.to_lowercase()))
}

/// The directory a referrer resolves relative imports from: the referrer
/// itself when it names a directory, otherwise its parent.
pub fn referrer_dir(referrer: &Path) -> PathBuf {
  if referrer.is_dir() {
    referrer.to_path_buf()
  } else {
    referrer
      .parent()
      .map(|p| p.to_path_buf())
      .unwrap_or_else(|| PathBuf::from("/"))
  }
}

/// Forward-slash rendering of a path, used for bundle keys and module ids
/// that must be stable across platforms.
pub fn to_forward_slashes(path: &Path) -> String {
  let text = path.to_string_lossy();
  if cfg!(windows) {
    text.replace('\\', "/")
  } else {
    text.into_owned()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_normalize_path() {
    assert_eq!(normalize_path(Path::new("a/../b")), PathBuf::from("b"));
    assert_eq!(normalize_path(Path::new("a/./b/")), PathBuf::from("a/b"));
    assert_eq!(
      normalize_path(Path::new("a/./b/../c")),
      PathBuf::from("a/c")
    );
    assert_eq!(
      normalize_path(Path::new("/src/../lib/x.som")),
      PathBuf::from("/lib/x.som")
    );
  }

  #[test]
  fn test_get_extension() {
    assert_eq!(
      get_extension(Path::new("/a/b/mod.som")),
      Some(".som".to_string())
    );
    assert_eq!(
      get_extension(Path::new("/a/b/mod.JSON")),
      Some(".json".to_string())
    );
    assert_eq!(get_extension(Path::new("/a/b/README")), None);
  }

  #[test]
  fn test_referrer_dir_of_file() {
    assert_eq!(
      referrer_dir(Path::new("/proj/src/main.som")),
      PathBuf::from("/proj/src")
    );
  }
}
