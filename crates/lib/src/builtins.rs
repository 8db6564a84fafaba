//! Built-in declarations for the description language.
//!
//! Every item type declares a fixed set of typed properties and a set of
//! allowed child types. The tables drive type coercion of profile defaults
//! and overrides, list-concatenation semantics, and the undeclared-property
//! check at the end of each project walk.

use crate::item::ItemType;
use crate::item::value::PropertyType;

use PropertyType::*;

/// Declared type of a built-in property of `item_type`, if any.
pub fn declared_type(item_type: ItemType, name: &str) -> Option<PropertyType> {
  // `condition` gates every item type.
  if name == "condition" {
    return Some(Bool);
  }
  let ptype = match (item_type, name) {
    (ItemType::Project, "name") => String,
    (ItemType::Project, "minimumWeftVersion") => String,
    (ItemType::Project, "references") => StringList,
    (ItemType::Project, "searchPaths") => PathList,
    (ItemType::Project, "profile") => String,
    (ItemType::Project, "sourceDirectory") => Path,
    (ItemType::Project, "buildDirectory") => Path,

    (ItemType::SubProject, "filePath") => Path,
    (ItemType::SubProject, "inheritProperties") => Bool,

    (ItemType::Product, "name") => String,
    (ItemType::Product, "targetName") => String,
    (ItemType::Product, "type") => StringList,
    (ItemType::Product, "profiles") => StringList,
    (ItemType::Product, "profile") => String,
    (ItemType::Product, "multiplexed") => Bool,
    (ItemType::Product, "files") => StringList,
    (ItemType::Product, "excludeFiles") => StringList,
    (ItemType::Product, "destinationDirectory") => Path,
    (ItemType::Product, "sourceDirectory") => Path,
    (ItemType::Product, "buildDirectory") => Path,
    (ItemType::Product, "searchPaths") => PathList,

    (ItemType::Depends, "name") => String,
    (ItemType::Depends, "submodules") => StringList,
    (ItemType::Depends, "productTypes") => StringList,
    (ItemType::Depends, "profiles") => StringList,
    (ItemType::Depends, "required") => Bool,
    (ItemType::Depends, "limitToSubProject") => Bool,

    (ItemType::Group, "name") => String,
    (ItemType::Group, "files") => StringList,
    (ItemType::Group, "excludeFiles") => StringList,
    (ItemType::Group, "fileTagsFilter") => StringList,
    (ItemType::Group, "fileTags") => StringList,
    (ItemType::Group, "prefix") => String,
    (ItemType::Group, "overrideTags") => Bool,

    (ItemType::Rule, "name") => String,
    (ItemType::Rule, "multiplex") => Bool,
    (ItemType::Rule, "inputs") => StringList,
    (ItemType::Rule, "inputsFromDependencies") => StringList,
    (ItemType::Rule, "auxiliaryInputs") => StringList,
    (ItemType::Rule, "excludedAuxiliaryInputs") => StringList,
    (ItemType::Rule, "explicitlyDependsOn") => StringList,
    (ItemType::Rule, "outputFileTags") => StringList,
    (ItemType::Rule, "prepare") => Variant,
    (ItemType::Rule, "outputArtifacts") => Variant,

    (ItemType::Artifact, "filePath") => Variant,
    (ItemType::Artifact, "fileTags") => StringList,
    (ItemType::Artifact, "alwaysUpdated") => Bool,

    (ItemType::FileTagger, "patterns") => StringList,
    (ItemType::FileTagger, "fileTags") => StringList,

    (ItemType::Transformer, "inputs") => PathList,
    (ItemType::Transformer, "prepare") => Variant,
    (ItemType::Transformer, "explicitlyDependsOn") => StringList,

    (ItemType::Scanner, "inputs") => StringList,
    (ItemType::Scanner, "recursive") => Bool,
    (ItemType::Scanner, "searchPaths") => Variant,
    (ItemType::Scanner, "scan") => Variant,

    (ItemType::Module, "name") => String,
    (ItemType::Module, "present") => Bool,
    (ItemType::Module, "validate") => Variant,
    (ItemType::Module, "additionalProductTypes") => StringList,

    (ItemType::Probe, "configure") => Variant,

    _ => return None,
  };
  Some(ptype)
}

/// Item types whose property bags are open: any property name is accepted
/// without a declaration.
pub fn accepts_any_property(item_type: ItemType) -> bool {
  matches!(
    item_type,
    ItemType::Plain
      | ItemType::Properties
      | ItemType::PropertyOptions
      | ItemType::Probe
      | ItemType::Export
  )
}

/// Whether `child` may appear under `parent`.
pub fn is_child_type_allowed(parent: ItemType, child: ItemType) -> bool {
  match parent {
    ItemType::Plain => true,
    ItemType::Project => matches!(
      child,
      ItemType::Project
        | ItemType::SubProject
        | ItemType::Product
        | ItemType::PropertyOptions
        | ItemType::FileTagger
        | ItemType::Rule
    ),
    ItemType::SubProject => matches!(child, ItemType::Properties | ItemType::Project),
    ItemType::Product => matches!(
      child,
      ItemType::Depends
        | ItemType::Group
        | ItemType::Export
        | ItemType::Probe
        | ItemType::Rule
        | ItemType::FileTagger
        | ItemType::Transformer
        | ItemType::PropertyOptions
    ),
    ItemType::Export => matches!(
      child,
      ItemType::Depends | ItemType::Rule | ItemType::FileTagger | ItemType::Probe
    ),
    ItemType::Module => matches!(
      child,
      ItemType::Depends
        | ItemType::Rule
        | ItemType::FileTagger
        | ItemType::Transformer
        | ItemType::Scanner
        | ItemType::Probe
        | ItemType::PropertyOptions
    ),
    ItemType::Rule | ItemType::Transformer => matches!(child, ItemType::Artifact),
    ItemType::Properties
    | ItemType::PropertyOptions
    | ItemType::Depends
    | ItemType::Group
    | ItemType::Probe
    | ItemType::Artifact
    | ItemType::FileTagger
    | ItemType::Scanner => false,
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn condition_is_declared_everywhere() {
    assert_eq!(declared_type(ItemType::Group, "condition"), Some(Bool));
    assert_eq!(declared_type(ItemType::Module, "condition"), Some(Bool));
  }

  #[test]
  fn list_properties_are_list_typed() {
    assert!(declared_type(ItemType::Product, "files").unwrap().is_list());
    assert!(declared_type(ItemType::Project, "searchPaths").unwrap().is_list());
    assert!(!declared_type(ItemType::Product, "name").unwrap().is_list());
  }

  #[test]
  fn rule_children_must_be_artifacts() {
    assert!(is_child_type_allowed(ItemType::Rule, ItemType::Artifact));
    assert!(!is_child_type_allowed(ItemType::Rule, ItemType::Group));
  }
}
