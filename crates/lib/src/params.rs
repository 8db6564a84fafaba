//! Parameters of one resolution request.

use std::path::{Path, PathBuf};

use crate::profiles::ConfigMap;

/// How to treat undeclared properties and items.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PropertyChecking {
  /// Undeclared properties abort the resolution.
  Strict,
  /// Undeclared properties are logged as warnings.
  #[default]
  Loose,
}

/// Everything a [`crate::Session`] needs to resolve one configuration.
#[derive(Debug)]
pub struct SetupParameters {
  pub project_file: PathBuf,
  pub build_root: PathBuf,
  pub settings_dir: PathBuf,
  /// The profile products default to when they do not multiplex.
  pub profile: String,
  pub build_variant: String,
  /// Command-line property overrides: `project`, product names, and module
  /// names each map to a property map. Overrides win over profile defaults,
  /// which win over description-file defaults.
  pub overridden_values: ConfigMap,
  pub property_checking: PropertyChecking,
  /// Extra search paths; each contributes a `modules/` subdirectory.
  pub search_paths: Vec<PathBuf>,
}

impl SetupParameters {
  pub fn new(project_file: impl Into<PathBuf>, profile: impl Into<String>) -> Self {
    let project_file = project_file.into();
    let build_root = project_file
      .parent()
      .map(|dir| dir.join("build"))
      .unwrap_or_else(|| PathBuf::from("build"));
    Self {
      project_file,
      build_root,
      settings_dir: PathBuf::from("."),
      profile: profile.into(),
      build_variant: "debug".into(),
      overridden_values: ConfigMap::new(),
      property_checking: PropertyChecking::default(),
      search_paths: Vec::new(),
    }
  }

  /// Identifier of this configuration, e.g. `debug-release`.
  pub fn configuration_id(&self) -> String {
    format!("{}-{}", self.profile, self.build_variant)
  }

  /// The build directory derived from the build root and configuration.
  pub fn build_directory(&self) -> PathBuf {
    self.build_root.join(self.configuration_id())
  }

  pub fn project_dir(&self) -> &Path {
    self.project_file.parent().unwrap_or_else(|| Path::new("."))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn build_directory_includes_profile_and_variant() {
    let mut params = SetupParameters::new("/src/p.weft.lua", "qt");
    params.build_variant = "release".into();
    assert_eq!(params.build_directory(), PathBuf::from("/src/build/qt-release"));
  }
}
