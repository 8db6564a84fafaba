//! Profile storage.
//!
//! A profile is a named bag of default module property values stored as a
//! TOML file under `<settings dir>/profiles/<name>.toml`. Top-level tables
//! are keyed by full module name; an optional `inherits` key chains
//! profiles, with the inheriting profile winning on collisions.
//!
//! ```toml
//! inherits = "base"
//!
//! [cc]
//! warningLevel = "all"
//! ```

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::consts::BASE_MODULE_NAME;
use crate::error::LoadError;
use crate::item::value::{VariantMap, VariantValue, merge_variant_maps};

/// Expanded build configuration: full module name to property map.
pub type ConfigMap = VariantMap;

pub struct Settings {
  base_dir: PathBuf,
}

impl Settings {
  pub fn new(base_dir: impl Into<PathBuf>) -> Self {
    Self {
      base_dir: base_dir.into(),
    }
  }

  fn profile_path(&self, name: &str) -> PathBuf {
    self.base_dir.join("profiles").join(format!("{}.toml", name))
  }

  pub fn profile_exists(&self, name: &str) -> bool {
    self.profile_path(name).is_file()
  }

  /// Names of all stored profiles.
  pub fn profile_names(&self) -> Result<Vec<String>, LoadError> {
    let dir = self.base_dir.join("profiles");
    if !dir.is_dir() {
      return Ok(Vec::new());
    }
    let entries = std::fs::read_dir(&dir).map_err(|source| LoadError::Io {
      path: dir.clone(),
      source,
    })?;
    let mut names = Vec::new();
    for entry in entries {
      let entry = entry.map_err(|source| LoadError::Io {
        path: dir.clone(),
        source,
      })?;
      let file_name = entry.file_name().to_string_lossy().into_owned();
      if let Some(name) = file_name.strip_suffix(".toml") {
        names.push(name.to_owned());
      }
    }
    names.sort();
    Ok(names)
  }

  /// Load a profile, follow its `inherits` chain, and return the flattened
  /// build configuration with `weft.profile` and `weft.buildVariant` set.
  pub fn expanded_build_configuration(
    &self,
    profile_name: &str,
    build_variant: &str,
  ) -> Result<ConfigMap, LoadError> {
    let mut config = ConfigMap::new();
    let mut visited = BTreeSet::new();
    self.expand_into(profile_name, &mut config, &mut visited)?;

    let base = config
      .entry(BASE_MODULE_NAME)
      .or_insert_with(|| VariantValue::Object(VariantMap::new()));
    if let VariantValue::Object(base) = base {
      base.insert("profile".into(), VariantValue::String(profile_name.into()));
      base.insert(
        "buildVariant".into(),
        VariantValue::String(build_variant.into()),
      );
    }
    debug!(profile = profile_name, variant = build_variant, "expanded build configuration");
    Ok(config)
  }

  fn expand_into(
    &self,
    name: &str,
    config: &mut ConfigMap,
    visited: &mut BTreeSet<String>,
  ) -> Result<(), LoadError> {
    if !visited.insert(name.to_owned()) {
      return Err(LoadError::Cycle {
        message: format!("profile '{}' inherits itself", name),
        location: crate::error::CodeLocation::file_only(self.profile_path(name)),
      });
    }
    let path = self.profile_path(name);
    if !path.is_file() {
      return Err(LoadError::MissingProfile { name: name.into() });
    }
    let text = std::fs::read_to_string(&path).map_err(|source| LoadError::Io {
      path: path.clone(),
      source,
    })?;
    let table: toml::Value = toml::from_str(&text).map_err(|e: toml::de::Error| LoadError::Parse {
      message: e.to_string(),
      location: crate::error::CodeLocation::file_only(&path),
    })?;
    let toml::Value::Table(table) = table else {
      return Err(LoadError::Parse {
        message: "profile must be a table".into(),
        location: crate::error::CodeLocation::file_only(&path),
      });
    };

    // Parents first, so this profile's own entries win.
    if let Some(toml::Value::String(parent)) = table.get("inherits") {
      self.expand_into(parent, config, visited)?;
    }

    let mut own = ConfigMap::new();
    for (key, value) in &table {
      if key == "inherits" {
        continue;
      }
      own.insert(key.clone(), toml_to_variant(value));
    }
    merge_variant_maps(config, &own);
    Ok(())
  }
}

fn toml_to_variant(value: &toml::Value) -> VariantValue {
  match value {
    toml::Value::String(s) => VariantValue::String(s.clone()),
    toml::Value::Integer(i) => VariantValue::from(*i),
    toml::Value::Float(f) => serde_json::Number::from_f64(*f)
      .map(VariantValue::Number)
      .unwrap_or(VariantValue::Null),
    toml::Value::Boolean(b) => VariantValue::Bool(*b),
    toml::Value::Datetime(dt) => VariantValue::String(dt.to_string()),
    toml::Value::Array(items) => VariantValue::Array(items.iter().map(toml_to_variant).collect()),
    toml::Value::Table(table) => {
      let mut map = VariantMap::new();
      for (key, value) in table {
        map.insert(key.clone(), toml_to_variant(value));
      }
      VariantValue::Object(map)
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::fs;
  use tempfile::TempDir;

  fn write_profile(dir: &Path, name: &str, body: &str) {
    let profiles = dir.join("profiles");
    fs::create_dir_all(&profiles).unwrap();
    fs::write(profiles.join(format!("{}.toml", name)), body).unwrap();
  }

  #[test]
  fn missing_profile_is_an_error() {
    let temp = TempDir::new().unwrap();
    let settings = Settings::new(temp.path());
    assert!(!settings.profile_exists("debug"));
    let err = settings.expanded_build_configuration("debug", "debug");
    assert!(matches!(err, Err(LoadError::MissingProfile { .. })));
  }

  #[test]
  fn configuration_contains_base_module_entries() {
    let temp = TempDir::new().unwrap();
    write_profile(temp.path(), "debug", "[cc]\nwarningLevel = \"all\"\n");
    let settings = Settings::new(temp.path());

    let config = settings.expanded_build_configuration("debug", "debug").unwrap();
    assert_eq!(
      config["weft"]["profile"],
      VariantValue::String("debug".into())
    );
    assert_eq!(
      config["cc"]["warningLevel"],
      VariantValue::String("all".into())
    );
  }

  #[test]
  fn inheritance_lets_the_child_win() {
    let temp = TempDir::new().unwrap();
    write_profile(temp.path(), "base", "[cc]\nwarningLevel = \"all\"\nopt = \"none\"\n");
    write_profile(temp.path(), "debug", "inherits = \"base\"\n[cc]\nopt = \"debug\"\n");
    let settings = Settings::new(temp.path());

    let config = settings.expanded_build_configuration("debug", "debug").unwrap();
    assert_eq!(config["cc"]["warningLevel"], VariantValue::String("all".into()));
    assert_eq!(config["cc"]["opt"], VariantValue::String("debug".into()));
  }

  #[test]
  fn inheritance_cycles_fail() {
    let temp = TempDir::new().unwrap();
    write_profile(temp.path(), "a", "inherits = \"b\"\n");
    write_profile(temp.path(), "b", "inherits = \"a\"\n");
    let settings = Settings::new(temp.path());

    let err = settings.expanded_build_configuration("a", "debug");
    assert!(matches!(err, Err(LoadError::Cycle { .. })));
  }
}
