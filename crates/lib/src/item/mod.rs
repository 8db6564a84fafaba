//! The item tree both resolution passes operate on.
//!
//! Items live in an arena ([`ItemPool`]) and are addressed by [`ItemId`];
//! identity is the handle, never value equality, because two items with the
//! same properties can sit at different positions (and therefore different
//! scopes) in the tree. Inheritance is an explicit prototype link walked by
//! [`ItemPool::property`]; there is no other lookup mechanism.

pub mod value;

use std::collections::BTreeMap;

use crate::error::CodeLocation;
use value::{PropertyType, Value};

/// Handle of an item inside one [`ItemPool`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ItemId(u32);

/// The built-in item types of the description language. `Plain` is used for
/// synthetic scope items and module-instance slots.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ItemType {
  Plain,
  Project,
  SubProject,
  Product,
  Properties,
  PropertyOptions,
  Depends,
  Group,
  Export,
  Probe,
  Rule,
  Artifact,
  FileTagger,
  Transformer,
  Scanner,
  Module,
}

impl ItemType {
  pub fn from_name(name: &str) -> Option<Self> {
    Some(match name {
      "Project" => ItemType::Project,
      "SubProject" => ItemType::SubProject,
      "Product" => ItemType::Product,
      "Properties" => ItemType::Properties,
      "PropertyOptions" => ItemType::PropertyOptions,
      "Depends" => ItemType::Depends,
      "Group" => ItemType::Group,
      "Export" => ItemType::Export,
      "Probe" => ItemType::Probe,
      "Rule" => ItemType::Rule,
      "Artifact" => ItemType::Artifact,
      "FileTagger" => ItemType::FileTagger,
      "Transformer" => ItemType::Transformer,
      "Scanner" => ItemType::Scanner,
      "Module" => ItemType::Module,
      _ => return None,
    })
  }

  pub fn name(self) -> &'static str {
    match self {
      ItemType::Plain => "",
      ItemType::Project => "Project",
      ItemType::SubProject => "SubProject",
      ItemType::Product => "Product",
      ItemType::Properties => "Properties",
      ItemType::PropertyOptions => "PropertyOptions",
      ItemType::Depends => "Depends",
      ItemType::Group => "Group",
      ItemType::Export => "Export",
      ItemType::Probe => "Probe",
      ItemType::Rule => "Rule",
      ItemType::Artifact => "Artifact",
      ItemType::FileTagger => "FileTagger",
      ItemType::Transformer => "Transformer",
      ItemType::Scanner => "Scanner",
      ItemType::Module => "Module",
    }
  }
}

/// A module attached to an item: the dotted name split into segments plus
/// the instance item holding the module's configuration.
#[derive(Clone, Debug)]
pub struct ModuleRef {
  pub name: Vec<String>,
  pub item: ItemId,
}

/// Join dotted module-name segments back into the full name.
pub fn full_module_name(name: &[String]) -> String {
  name.join(".")
}

/// One node of the description tree.
#[derive(Debug, Default)]
pub struct Item {
  pub item_type: ItemType,
  pub id: Option<String>,
  pub properties: BTreeMap<String, Value>,
  /// Locally declared property types (module/project custom properties and
  /// `path()`/`paths()` wrapped defaults).
  pub decls: BTreeMap<String, PropertyType>,
  pub children: Vec<ItemId>,
  pub prototype: Option<ItemId>,
  /// Lexical scope used by expression evaluation, not inheritance.
  pub scope: Option<ItemId>,
  pub location: CodeLocation,
  pub is_module_instance: bool,
  /// Modules attached directly to this item. Attachment is explicit and is
  /// never inherited through the prototype link.
  pub modules: Vec<ModuleRef>,
}

impl Default for ItemType {
  fn default() -> Self {
    ItemType::Plain
  }
}

/// Arena of items for one resolution. Mutation is only legal while the
/// loader runs; the resolver treats the pool as read-only.
#[derive(Debug, Default)]
pub struct ItemPool {
  items: Vec<Item>,
}

impl ItemPool {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn create(&mut self, item_type: ItemType, location: CodeLocation) -> ItemId {
    let id = ItemId(self.items.len() as u32);
    self.items.push(Item {
      item_type,
      location,
      ..Item::default()
    });
    id
  }

  pub fn get(&self, id: ItemId) -> &Item {
    &self.items[id.0 as usize]
  }

  pub fn get_mut(&mut self, id: ItemId) -> &mut Item {
    &mut self.items[id.0 as usize]
  }

  /// Nearest definition of `name`, walking the prototype chain. Returns the
  /// defining item alongside the value; absence at the root means the
  /// property is undeclared here.
  pub fn property(&self, id: ItemId, name: &str) -> Option<(ItemId, &Value)> {
    let mut current = Some(id);
    while let Some(item_id) = current {
      let item = self.get(item_id);
      if let Some(value) = item.properties.get(name) {
        return Some((item_id, value));
      }
      current = item.prototype;
    }
    None
  }

  pub fn has_property(&self, id: ItemId, name: &str) -> bool {
    self.property(id, name).is_some()
  }

  pub fn local_property(&self, id: ItemId, name: &str) -> Option<&Value> {
    self.get(id).properties.get(name)
  }

  pub fn set_property(&mut self, id: ItemId, name: impl Into<String>, value: Value) {
    self.get_mut(id).properties.insert(name.into(), value);
  }

  pub fn remove_property(&mut self, id: ItemId, name: &str) -> Option<Value> {
    self.get_mut(id).properties.remove(name)
  }

  /// Declared type of `name` for `id`: local declarations first (walking the
  /// prototype chain), then the built-in declarations of the item's type.
  pub fn declared_type(&self, id: ItemId, name: &str) -> Option<PropertyType> {
    let mut current = Some(id);
    let mut item_type = None;
    while let Some(item_id) = current {
      let item = self.get(item_id);
      if let Some(ptype) = item.decls.get(name) {
        return Some(*ptype);
      }
      item_type.get_or_insert(item.item_type);
      current = item.prototype;
    }
    crate::builtins::declared_type(item_type.unwrap_or(ItemType::Plain), name)
  }

  pub fn set_declared_type(&mut self, id: ItemId, name: impl Into<String>, ptype: PropertyType) {
    self.get_mut(id).decls.insert(name.into(), ptype);
  }

  pub fn add_child(&mut self, parent: ItemId, child: ItemId) {
    self.get_mut(parent).children.push(child);
  }

  pub fn set_children(&mut self, parent: ItemId, children: Vec<ItemId>) {
    self.get_mut(parent).children = children;
  }

  pub fn set_prototype(&mut self, id: ItemId, prototype: ItemId) {
    self.get_mut(id).prototype = Some(prototype);
  }

  pub fn set_scope(&mut self, id: ItemId, scope: ItemId) {
    self.get_mut(id).scope = Some(scope);
  }

  pub fn set_scope_for_descendants(&mut self, id: ItemId, scope: ItemId) {
    let children = self.get(id).children.clone();
    for child in children {
      self.set_scope(child, scope);
      self.set_scope_for_descendants(child, scope);
    }
  }

  pub fn find_child(&self, id: ItemId, item_type: ItemType) -> Option<ItemId> {
    self
      .get(id)
      .children
      .iter()
      .copied()
      .find(|&c| self.get(c).item_type == item_type)
  }

  /// Get or create the nested item stored under `name`, used for
  /// module-instance slots and Export merging.
  pub fn item_property(&mut self, id: ItemId, name: &str) -> ItemId {
    if let Some(Value::Item(existing)) = self.get(id).properties.get(name) {
      return *existing;
    }
    let location = self.get(id).location.clone();
    let nested = self.create(ItemType::Plain, location);
    self.set_property(id, name, Value::Item(nested));
    nested
  }

  /// Deep-clone an item and its children. Values are shared clones (lazy
  /// expressions stay shared through their registry handle), which matches
  /// product multiplexing: the clones only ever diverge through properties
  /// set after the clone.
  pub fn clone_subtree(&mut self, id: ItemId) -> ItemId {
    let source = self.get(id);
    let cloned = Item {
      item_type: source.item_type,
      id: source.id.clone(),
      properties: source.properties.clone(),
      decls: source.decls.clone(),
      children: Vec::new(),
      prototype: source.prototype,
      scope: source.scope,
      location: source.location.clone(),
      is_module_instance: source.is_module_instance,
      modules: source.modules.clone(),
    };
    let new_id = ItemId(self.items.len() as u32);
    self.items.push(cloned);
    let children = self.get(id).children.clone();
    for child in children {
      let new_child = self.clone_subtree(child);
      self.add_child(new_id, new_child);
    }
    new_id
  }

  /// All items in the subtree (including `root`) that carry an `id`.
  pub fn collect_items_with_id(&self, root: ItemId) -> Vec<ItemId> {
    let mut result = Vec::new();
    self.collect_ids_impl(root, &mut result);
    result
  }

  fn collect_ids_impl(&self, id: ItemId, result: &mut Vec<ItemId>) {
    if self.get(id).id.is_some() {
      result.push(id);
    }
    for &child in &self.get(id).children {
      self.collect_ids_impl(child, result);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::value::{Value, VariantValue};
  use super::*;

  fn loc() -> CodeLocation {
    CodeLocation::file_only("/test.weft.lua")
  }

  #[test]
  fn property_lookup_walks_prototype_chain() {
    let mut pool = ItemPool::new();
    let root = pool.create(ItemType::Module, loc());
    let middle = pool.create(ItemType::Module, loc());
    let leaf = pool.create(ItemType::Module, loc());
    pool.set_prototype(middle, root);
    pool.set_prototype(leaf, middle);
    pool.set_property(root, "a", Value::Variant(VariantValue::from(1)));

    // Prototype transparency: same value found directly and through the chain.
    let (def, value) = pool.property(leaf, "a").unwrap();
    assert_eq!(def, root);
    assert!(matches!(value, Value::Variant(v) if v == &VariantValue::from(1)));

    // An intervening redefinition shadows the root.
    pool.set_property(middle, "a", Value::Variant(VariantValue::from(2)));
    let (def, _) = pool.property(leaf, "a").unwrap();
    assert_eq!(def, middle);

    assert!(pool.property(leaf, "missing").is_none());
  }

  #[test]
  fn clone_subtree_copies_children_and_properties() {
    let mut pool = ItemPool::new();
    let product = pool.create(ItemType::Product, loc());
    let group = pool.create(ItemType::Group, loc());
    pool.add_child(product, group);
    pool.set_property(product, "name", Value::Variant("app".into()));

    let clone = pool.clone_subtree(product);
    assert_ne!(clone, product);
    assert_eq!(pool.get(clone).children.len(), 1);
    assert_ne!(pool.get(clone).children[0], group);
    assert!(pool.has_property(clone, "name"));
    // The clone is independent of the original.
    pool.set_property(clone, "profile", Value::Variant("debug".into()));
    assert!(!pool.has_property(product, "profile"));
  }

  #[test]
  fn item_property_creates_nested_slot_once() {
    let mut pool = ItemPool::new();
    let item = pool.create(ItemType::Product, loc());
    let first = pool.item_property(item, "cc");
    let second = pool.item_property(item, "cc");
    assert_eq!(first, second);
  }
}
