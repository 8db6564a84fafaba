//! Group and source-artifact resolution.
//!
//! Literal file entries and wildcard patterns are separated before
//! expansion. Every referenced file of an enabled group must exist, and a
//! duplicate absolute path across the groups of one product is an error;
//! both kinds are aggregated into one multi-location failure instead of
//! stopping at the first file.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use super::{ProductState, ProjectResolver};
use crate::consts::UNKNOWN_FILE_TAG;
use crate::error::LoadError;
use crate::graph::{ArtifactProperties, PropertyMap, ResolvedGroup, SourceArtifact, SourceWildcards};
use crate::item::ItemId;
use crate::item::value::Value;
use crate::util::paths;

impl ProjectResolver<'_> {
  pub(crate) fn resolve_group(
    &mut self,
    item: ItemId,
    state: &mut ProductState,
  ) -> Result<(), LoadError> {
    self.check_cancelation()?;
    let location = self.pool.borrow().get(item).location.clone();

    // Groups that set module properties get their own property snapshot;
    // all others share the product's map.
    let module_properties = if self.is_some_module_property_set(item) {
      PropertyMap::new(self.evaluate_module_values(item, true)?)
    } else {
      self.products[state.id].module_properties.clone()
    };

    let enabled = self.evaluator.bool_value(item, "condition", true)?;
    let files = self.evaluator.string_list_value(item, "files")?;
    let file_tags_filter = self
      .evaluator
      .string_list_value(item, "fileTagsFilter")?
      .unwrap_or_default();

    if !file_tags_filter.is_empty() {
      if files.as_ref().is_some_and(|f| !f.is_empty()) {
        return Err(LoadError::invalid(
          "Group.files and Group.fileTagsFilter are exclusive",
          location,
        ));
      }
      if let Some((previous_index, previous_location)) = state
        .artifact_properties_per_filter
        .get(&file_tags_filter)
        .cloned()
      {
        if previous_location.file == location.file {
          return Err(LoadError::duplicate(
            format!(
              "conflicting fileTagsFilter in Group items (first one at {})",
              previous_location
            ),
            location,
          ));
        }
        // A group in a derived file overrides one with the same filter from
        // a base file.
        self.products[state.id].artifact_properties.remove(previous_index);
        for entry in state.artifact_properties_per_filter.values_mut() {
          if entry.0 > previous_index {
            entry.0 -= 1;
          }
        }
        state.artifact_properties_per_filter.remove(&file_tags_filter);
      }
      if !enabled {
        return Ok(());
      }
      let index = self.products[state.id].artifact_properties.len();
      self.products[state.id]
        .artifact_properties
        .push(ArtifactProperties {
          file_tags_filter: file_tags_filter.iter().cloned().collect(),
          properties: module_properties,
          location: location.clone(),
        });
      state
        .artifact_properties_per_filter
        .insert(file_tags_filter, (index, location));
      return Ok(());
    }

    // A binding must exist, but an empty files list is fine.
    let Some(mut files) = files else {
      return Err(LoadError::invalid("Group without files is not allowed", location));
    };

    let mut patterns = Vec::new();
    let mut index = 0;
    while index < files.len() {
      if paths::is_pattern(&files[index]) {
        patterns.push(files.remove(index));
      } else {
        index += 1;
      }
    }

    let prefix = self
      .evaluator
      .string_value(item, "prefix")?
      .unwrap_or_default();
    let (mut file_tags, file_tags_set) = self.evaluator.file_tags_value(item, "fileTags")?;
    let override_tags = self.evaluator.bool_value(item, "overrideTags", true)?;
    if override_tags && file_tags.is_empty() && file_tags_set {
      file_tags.insert(UNKNOWN_FILE_TAG.to_owned());
    }

    let source_dir = state.source_directory.clone();
    let wildcards = if patterns.is_empty() {
      None
    } else {
      let exclude_patterns = self
        .evaluator
        .string_list_value(item, "excludeFiles")?
        .unwrap_or_default();
      let expanded = expand_patterns(&source_dir, &patterns, &exclude_patterns, &prefix);
      let files = expanded
        .into_iter()
        .map(|path| SourceArtifact {
          file_path: path,
          file_tags: file_tags.clone(),
          override_file_tags: override_tags,
          properties: module_properties.clone(),
        })
        .collect();
      Some(SourceWildcards {
        patterns,
        exclude_patterns,
        prefix: prefix.clone(),
        files,
      })
    };

    let literal_files: Vec<SourceArtifact> = files
      .iter()
      .map(|name| SourceArtifact {
        file_path: paths::resolve(&source_dir, format!("{}{}", prefix, name)),
        file_tags: file_tags.clone(),
        override_file_tags: override_tags,
        properties: module_properties.clone(),
      })
      .collect();

    let mut group = ResolvedGroup {
      name: String::new(),
      enabled,
      location: location.clone(),
      prefix,
      files: literal_files,
      wildcards,
      file_tags,
      override_tags,
      properties: module_properties,
    };

    if group.enabled {
      let mut file_errors = Vec::new();
      for artifact in group.all_files() {
        if !artifact.file_path.exists() {
          file_errors.push(LoadError::MissingFile {
            path: artifact.file_path.clone(),
            location: location.clone(),
          });
        }
        if let Some(previous) = state
          .source_artifact_locations
          .insert(artifact.file_path.clone(), location.clone())
        {
          file_errors.push(LoadError::duplicate(
            format!(
              "duplicate source file '{}' (already listed at {})",
              artifact.file_path.display(),
              previous
            ),
            location.clone(),
          ));
        }
      }
      if !file_errors.is_empty() {
        return Err(LoadError::Aggregate(file_errors));
      }
    }

    group.name = match self.evaluator.string_value(item, "name")? {
      Some(name) => name,
      None => format!("Group {}", self.products[state.id].groups.len()),
    };
    self.products[state.id].groups.push(group);
    Ok(())
  }

  /// Whether a group sets module properties of its own, which forces a
  /// fresh property snapshot instead of sharing the product's map.
  fn is_some_module_property_set(&self, item: ItemId) -> bool {
    let pool = self.pool.borrow();
    pool.get(item).properties.values().any(|value| {
      let Value::Item(target) = value else {
        return false;
      };
      pool
        .get(*target)
        .properties
        .values()
        .any(|v| matches!(v, Value::Thunk(_) | Value::Variant(_)))
    })
  }
}

/// Expand wildcard patterns relative to a base directory. `**` matches any
/// number of directory levels; `*`, `?` and `[...]` match within one name.
pub(crate) fn expand_patterns(
  base_dir: &Path,
  patterns: &[String],
  exclude_patterns: &[String],
  prefix: &str,
) -> Vec<PathBuf> {
  let mut result = BTreeSet::new();
  for pattern in patterns {
    let full = format!("{}{}", prefix, pattern);
    for path in expand_one_pattern(base_dir, &full) {
      let excluded = exclude_patterns.iter().any(|exclude| {
        let name = path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
        let relative = path
          .strip_prefix(base_dir)
          .map(|p| p.to_string_lossy().replace('\\', "/"))
          .unwrap_or_default();
        matches_pattern(exclude, &name) || matches_pattern(exclude, &relative)
      });
      if !excluded {
        result.insert(path);
      }
    }
  }
  result.into_iter().collect()
}

fn expand_one_pattern(base_dir: &Path, pattern: &str) -> Vec<PathBuf> {
  let segments: Vec<&str> = pattern.split('/').filter(|s| !s.is_empty()).collect();
  if segments.is_empty() {
    return Vec::new();
  }
  let mut dirs = vec![base_dir.to_path_buf()];
  for segment in &segments[..segments.len() - 1] {
    let mut next = Vec::new();
    for dir in &dirs {
      if *segment == "**" {
        next.push(dir.clone());
        for entry in WalkDir::new(dir).min_depth(1).into_iter().flatten() {
          if entry.file_type().is_dir() {
            next.push(entry.into_path());
          }
        }
      } else if paths::is_pattern(segment) {
        if let Ok(entries) = std::fs::read_dir(dir) {
          for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if entry.path().is_dir() && matches_pattern(segment, &name) {
              next.push(entry.path());
            }
          }
        }
      } else {
        next.push(dir.join(segment));
      }
    }
    dirs = next;
  }

  let last = segments[segments.len() - 1];
  let mut files = Vec::new();
  for dir in dirs {
    if last == "**" {
      for entry in WalkDir::new(&dir).min_depth(1).into_iter().flatten() {
        if entry.file_type().is_file() {
          files.push(entry.into_path());
        }
      }
    } else if paths::is_pattern(last) {
      if let Ok(entries) = std::fs::read_dir(&dir) {
        for entry in entries.flatten() {
          let name = entry.file_name().to_string_lossy().into_owned();
          if entry.path().is_file() && matches_pattern(last, &name) {
            files.push(entry.path());
          }
        }
      }
    } else {
      let candidate = dir.join(last);
      if candidate.is_file() {
        files.push(candidate);
      }
    }
  }
  files.into_iter().map(|p| paths::clean(&p)).collect()
}

/// Wildcard match supporting `*`, `?` and `[...]` character sets.
pub fn matches_pattern(pattern: &str, name: &str) -> bool {
  let pattern: Vec<char> = pattern.chars().collect();
  let name: Vec<char> = name.chars().collect();
  match_impl(&pattern, &name)
}

fn match_impl(pattern: &[char], name: &[char]) -> bool {
  match pattern.first() {
    None => name.is_empty(),
    Some('*') => {
      for skip in 0..=name.len() {
        if match_impl(&pattern[1..], &name[skip..]) {
          return true;
        }
      }
      false
    }
    Some('?') => !name.is_empty() && match_impl(&pattern[1..], &name[1..]),
    Some('[') => {
      let Some(end) = pattern.iter().position(|&c| c == ']') else {
        return !name.is_empty() && name[0] == '[' && match_impl(&pattern[1..], &name[1..]);
      };
      let Some(&first) = name.first() else {
        return false;
      };
      let set = &pattern[1..end];
      let mut matched = false;
      let mut index = 0;
      while index < set.len() {
        if index + 2 < set.len() && set[index + 1] == '-' {
          if set[index] <= first && first <= set[index + 2] {
            matched = true;
          }
          index += 3;
        } else {
          if set[index] == first {
            matched = true;
          }
          index += 1;
        }
      }
      matched && match_impl(&pattern[end + 1..], &name[1..])
    }
    Some(&c) => !name.is_empty() && name[0] == c && match_impl(&pattern[1..], &name[1..]),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::fs;
  use tempfile::TempDir;

  #[test]
  fn pattern_matching_basics() {
    assert!(matches_pattern("*.src", "main.src"));
    assert!(!matches_pattern("*.src", "main.obj"));
    assert!(matches_pattern("a?.src", "ab.src"));
    assert!(matches_pattern("[a-c]x", "bx"));
    assert!(!matches_pattern("[a-c]x", "dx"));
    assert!(matches_pattern("*", "anything"));
  }

  #[test]
  fn expansion_separates_literals_from_patterns() {
    let temp = TempDir::new().unwrap();
    fs::write(temp.path().join("a.src"), "").unwrap();
    fs::write(temp.path().join("b.src"), "").unwrap();
    fs::write(temp.path().join("c.other"), "").unwrap();

    let files = expand_patterns(temp.path(), &["*.src".into()], &[], "");
    assert_eq!(files.len(), 2);
    assert!(files.iter().all(|f| f.extension().unwrap() == "src"));
  }

  #[test]
  fn recursive_patterns_walk_subdirectories() {
    let temp = TempDir::new().unwrap();
    fs::create_dir_all(temp.path().join("sub/deep")).unwrap();
    fs::write(temp.path().join("top.src"), "").unwrap();
    fs::write(temp.path().join("sub/mid.src"), "").unwrap();
    fs::write(temp.path().join("sub/deep/low.src"), "").unwrap();

    let files = expand_patterns(temp.path(), &["**/*.src".into()], &[], "");
    assert_eq!(files.len(), 3);
  }

  #[test]
  fn exclude_patterns_filter_by_name() {
    let temp = TempDir::new().unwrap();
    fs::write(temp.path().join("keep.src"), "").unwrap();
    fs::write(temp.path().join("drop.src"), "").unwrap();

    let files = expand_patterns(temp.path(), &["*.src".into()], &["drop.*".into()], "");
    assert_eq!(files.len(), 1);
    assert!(files[0].ends_with("keep.src"));
  }
}
