//! Resolved graph types.
//!
//! Everything here is created once by the project resolver and never mutated
//! afterwards; the graph is the sole input contract of the build-execution
//! engine and serializes to JSON as a structural snapshot. Script values
//! stay callable in-memory through their shared registry handles but
//! serialize as their source location only.

use std::cell::{Ref, RefCell};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::rc::Rc;

use serde::{Serialize, Serializer};

use crate::error::CodeLocation;
use crate::item::value::{Thunk, VariantMap, VariantValue};
use crate::profiles::ConfigMap;

/// Labels classifying an artifact's role.
pub type FileTags = BTreeSet<String>;

/// Index of a product in [`ResolvedProject::products`].
pub type ProductId = usize;

/// A property map shared between a product and the artifacts that did not
/// override it. Sharing is observable: exported configuration is copied only
/// into maps that do not alias the product's own map.
#[derive(Clone, Debug, Default)]
pub struct PropertyMap(Rc<RefCell<VariantMap>>);

impl PropertyMap {
  pub fn new(map: VariantMap) -> Self {
    Self(Rc::new(RefCell::new(map)))
  }

  pub fn value(&self) -> Ref<'_, VariantMap> {
    self.0.borrow()
  }

  pub fn set(&self, map: VariantMap) {
    *self.0.borrow_mut() = map;
  }

  pub fn shares_with(&self, other: &PropertyMap) -> bool {
    Rc::ptr_eq(&self.0, &other.0)
  }

  /// Look up `modules.<module>.<name>`.
  pub fn module_property(&self, module: &str, name: &str) -> Option<VariantValue> {
    let map = self.0.borrow();
    map
      .get("modules")?
      .as_object()?
      .get(module)?
      .as_object()?
      .get(name)
      .cloned()
  }

  /// Insert `config` under `modules.<module>`.
  pub fn insert_module_config(&self, module: &str, config: &VariantMap) {
    let mut map = self.0.borrow_mut();
    let modules = map
      .entry("modules")
      .or_insert_with(|| VariantValue::Object(VariantMap::new()));
    if let VariantValue::Object(modules) = modules {
      modules.insert(module.to_owned(), VariantValue::Object(config.clone()));
    }
  }
}

impl Serialize for PropertyMap {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    self.0.borrow().serialize(serializer)
  }
}

/// A captured expression (prepare script, outputArtifacts script, artifact
/// file path). `constant` is set instead of `thunk` when the description
/// gave a literal value.
#[derive(Clone, Debug, Default, Serialize)]
pub struct ScriptValue {
  pub location: CodeLocation,
  pub constant: Option<VariantValue>,
  #[serde(skip)]
  pub thunk: Option<Thunk>,
}

impl ScriptValue {
  pub fn is_set(&self) -> bool {
    self.thunk.is_some() || self.constant.is_some()
  }
}

#[derive(Clone, Debug, Serialize)]
pub struct ResolvedModule {
  pub name: String,
  pub module_dependencies: Vec<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct SourceArtifact {
  pub file_path: PathBuf,
  pub file_tags: FileTags,
  pub override_file_tags: bool,
  pub properties: PropertyMap,
}

/// Wildcard patterns of a group, kept so the engine can re-expand them when
/// checking for source changes.
#[derive(Clone, Debug, Serialize)]
pub struct SourceWildcards {
  pub patterns: Vec<String>,
  pub exclude_patterns: Vec<String>,
  pub prefix: String,
  pub files: Vec<SourceArtifact>,
}

#[derive(Clone, Debug, Serialize)]
pub struct ResolvedGroup {
  pub name: String,
  pub enabled: bool,
  pub location: CodeLocation,
  pub prefix: String,
  pub files: Vec<SourceArtifact>,
  pub wildcards: Option<SourceWildcards>,
  pub file_tags: FileTags,
  pub override_tags: bool,
  pub properties: PropertyMap,
}

impl ResolvedGroup {
  pub fn all_files(&self) -> impl Iterator<Item = &SourceArtifact> {
    self
      .files
      .iter()
      .chain(self.wildcards.iter().flat_map(|w| w.files.iter()))
  }

  pub fn all_files_mut(&mut self) -> impl Iterator<Item = &mut SourceArtifact> {
    self
      .files
      .iter_mut()
      .chain(self.wildcards.iter_mut().flat_map(|w| w.files.iter_mut()))
  }
}

/// One property binding of a rule artifact, collected by walking the
/// Artifact item's prototype chain (first occurrence of a dotted path wins).
#[derive(Clone, Debug, Serialize)]
pub struct ArtifactBinding {
  pub name: Vec<String>,
  pub value: ScriptValue,
}

#[derive(Clone, Debug, Serialize)]
pub struct RuleArtifact {
  pub file_path: ScriptValue,
  pub file_tags: FileTags,
  pub always_updated: bool,
  pub location: CodeLocation,
  pub bindings: Vec<ArtifactBinding>,
}

/// A declarative transformation from input tags to output artifacts.
/// Exactly one of `artifacts` (static) or `output_artifacts` (script) is
/// populated; the latter requires `output_file_tags`.
#[derive(Clone, Debug, Serialize)]
pub struct Rule {
  pub name: String,
  pub module: Option<String>,
  pub location: CodeLocation,
  pub multiplex: bool,
  pub inputs: FileTags,
  pub inputs_from_dependencies: FileTags,
  pub auxiliary_inputs: FileTags,
  pub excluded_auxiliary_inputs: FileTags,
  pub explicitly_depends_on: FileTags,
  pub prepare: ScriptValue,
  pub output_artifacts: ScriptValue,
  pub output_file_tags: FileTags,
  pub artifacts: Vec<RuleArtifact>,
}

#[derive(Clone, Debug, Serialize)]
pub struct ResolvedTransformer {
  pub module: Option<String>,
  pub inputs: Vec<PathBuf>,
  pub outputs: Vec<SourceArtifact>,
  pub transform: ScriptValue,
  pub explicitly_depends_on: FileTags,
}

#[derive(Clone, Debug, Serialize)]
pub struct ResolvedScanner {
  pub module: Option<String>,
  pub inputs: FileTags,
  pub recursive: bool,
  pub search_paths: ScriptValue,
  pub scan: ScriptValue,
}

#[derive(Clone, Debug, Serialize)]
pub struct FileTagger {
  pub patterns: Vec<String>,
  pub file_tags: FileTags,
}

/// Properties applied to artifacts matching a file-tag filter
/// (`Group { fileTagsFilter: ... }`).
#[derive(Clone, Debug, Serialize)]
pub struct ArtifactProperties {
  pub file_tags_filter: FileTags,
  pub properties: PropertyMap,
  pub location: CodeLocation,
}

/// One buildable unit, resolved for exactly one profile.
#[derive(Clone, Debug, Default, Serialize)]
pub struct ResolvedProduct {
  pub name: String,
  pub target_name: String,
  pub profile: String,
  pub multiplexed: bool,
  pub enabled: bool,
  pub location: CodeLocation,
  pub file_tags: FileTags,
  pub source_directory: PathBuf,
  pub destination_directory: PathBuf,
  pub build_directory: PathBuf,
  pub product_properties: VariantMap,
  pub module_properties: PropertyMap,
  pub modules: Vec<ResolvedModule>,
  pub groups: Vec<ResolvedGroup>,
  pub rules: Vec<Rule>,
  pub transformers: Vec<ResolvedTransformer>,
  pub scanners: Vec<ResolvedScanner>,
  pub file_taggers: Vec<FileTagger>,
  pub artifact_properties: Vec<ArtifactProperties>,
  pub dependencies: BTreeSet<ProductId>,
}

impl ResolvedProduct {
  /// Products multiplexed over several profiles are disambiguated with a
  /// profile suffix.
  pub fn unique_name(&self) -> String {
    if self.multiplexed {
      format!("{}-{}", self.name, self.profile)
    } else {
      self.name.clone()
    }
  }

  pub fn all_files(&self) -> impl Iterator<Item = &SourceArtifact> {
    self.groups.iter().flat_map(|g| g.all_files())
  }

  pub fn all_enabled_files(&self) -> impl Iterator<Item = &SourceArtifact> {
    self
      .groups
      .iter()
      .filter(|g| g.enabled)
      .flat_map(|g| g.all_files())
  }

  /// Tags the product's file taggers assign to a file name.
  pub fn file_tags_for_file_name(&self, file_name: &str) -> FileTags {
    let mut tags = FileTags::new();
    for tagger in &self.file_taggers {
      if tagger
        .patterns
        .iter()
        .any(|p| crate::resolver::groups::matches_pattern(p, file_name))
      {
        tags.extend(tagger.file_tags.iter().cloned());
      }
    }
    tags
  }
}

/// A project node: name, own properties, its products (by id) and nested
/// sub-projects.
#[derive(Clone, Debug, Default, Serialize)]
pub struct ProjectNode {
  pub name: String,
  pub enabled: bool,
  pub location: CodeLocation,
  pub properties: VariantMap,
  pub products: Vec<ProductId>,
  pub sub_projects: Vec<ProjectNode>,
}

/// The immutable handoff artifact of a resolution.
#[derive(Debug, Serialize)]
pub struct ResolvedProject {
  pub build_directory: PathBuf,
  pub profile_configs: BTreeMap<String, ConfigMap>,
  pub build_system_files: BTreeSet<PathBuf>,
  pub products: Vec<ResolvedProduct>,
  pub root: ProjectNode,
}

impl ResolvedProject {
  pub fn product(&self, id: ProductId) -> &ResolvedProduct {
    &self.products[id]
  }

  pub fn product_by_name(&self, unique_name: &str) -> Option<&ResolvedProduct> {
    self.products.iter().find(|p| p.unique_name() == unique_name)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn unique_name_suffixes_only_multiplexed_products() {
    let mut product = ResolvedProduct {
      name: "app".into(),
      profile: "debug".into(),
      ..ResolvedProduct::default()
    };
    assert_eq!(product.unique_name(), "app");
    product.multiplexed = true;
    assert_eq!(product.unique_name(), "app-debug");
  }

  #[test]
  fn property_map_sharing_is_by_handle() {
    let a = PropertyMap::new(VariantMap::new());
    let b = a.clone();
    let c = PropertyMap::new(VariantMap::new());
    assert!(a.shares_with(&b));
    assert!(!a.shares_with(&c));
  }

  #[test]
  fn module_config_insertion_is_visible_through_lookup() {
    let map = PropertyMap::new(VariantMap::new());
    let mut exported = VariantMap::new();
    exported.insert("a".into(), VariantValue::from(1));
    map.insert_module_config("x", &exported);
    assert_eq!(map.module_property("x", "a"), Some(VariantValue::from(1)));
  }
}
