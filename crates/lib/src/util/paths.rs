//! Path helpers shared by both resolution passes.
//!
//! Resolution never relies on the filesystem for path arithmetic: `resolve`
//! and `clean` work purely on components so that paths of not-yet-existing
//! build artifacts behave the same as source paths.

use std::path::{Component, Path, PathBuf};

use crate::error::{CodeLocation, LoadError};

/// Resolve `path` against `base` and clean the result.
///
/// Absolute paths are cleaned as-is; relative paths are joined onto `base`.
pub fn resolve(base: &Path, path: impl AsRef<Path>) -> PathBuf {
  let path = path.as_ref();
  if path.is_absolute() {
    clean(path)
  } else {
    clean(&base.join(path))
  }
}

/// Normalize `.` and `..` components without touching the filesystem.
pub fn clean(path: &Path) -> PathBuf {
  let mut out = PathBuf::new();
  for component in path.components() {
    match component {
      Component::CurDir => {}
      Component::ParentDir => {
        if !out.pop() {
          out.push(Component::ParentDir);
        }
      }
      other => out.push(other),
    }
  }
  out
}

/// Canonicalize an existing file path, reporting failures as located i/o
/// errors. Uses dunce so Windows paths stay in their familiar form.
pub fn canonicalize(path: &Path) -> Result<PathBuf, LoadError> {
  dunce::canonicalize(path).map_err(|source| LoadError::Io {
    path: path.to_path_buf(),
    source,
  })
}

/// The file name without its last extension, used as the fallback project
/// and product name.
pub fn complete_base_name(path: &Path) -> String {
  let name = path
    .file_name()
    .map(|n| n.to_string_lossy().into_owned())
    .unwrap_or_default();
  // Description files end in a double extension (.weft.lua).
  let stripped = name
    .strip_suffix(crate::consts::DESC_FILE_SUFFIX)
    .map(str::to_owned);
  stripped.unwrap_or_else(|| match name.rsplit_once('.') {
    Some((stem, _)) if !stem.is_empty() => stem.to_owned(),
    _ => name,
  })
}

/// Whether a file entry in a `files` list is a wildcard pattern.
pub fn is_pattern(entry: &str) -> bool {
  entry.contains(['*', '?', '['])
}

/// The directory of the file a location points into.
pub fn location_dir(location: &CodeLocation) -> PathBuf {
  location
    .file
    .parent()
    .map(Path::to_path_buf)
    .unwrap_or_else(|| PathBuf::from("."))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn clean_removes_dot_and_dotdot() {
    assert_eq!(clean(Path::new("/a/b/../c/./d")), PathBuf::from("/a/c/d"));
    assert_eq!(clean(Path::new("a/./b")), PathBuf::from("a/b"));
  }

  #[test]
  fn resolve_keeps_absolute_paths() {
    assert_eq!(
      resolve(Path::new("/base"), "/other/file"),
      PathBuf::from("/other/file")
    );
    assert_eq!(
      resolve(Path::new("/base"), "sub/file"),
      PathBuf::from("/base/sub/file")
    );
  }

  #[test]
  fn base_name_strips_description_suffix() {
    assert_eq!(complete_base_name(Path::new("/x/app.weft.lua")), "app");
    assert_eq!(complete_base_name(Path::new("/x/main.src")), "main");
  }

  #[test]
  fn pattern_detection() {
    assert!(is_pattern("*.src"));
    assert!(is_pattern("a?.src"));
    assert!(!is_pattern("main.src"));
  }
}
