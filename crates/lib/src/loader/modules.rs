//! Module search, loading and instantiation.
//!
//! A `Depends` item names either a module by dotted name (searched as one
//! directory per name segment below the `modules/` subdirectory of each
//! search path, case-correct) or a set of target product types. Module
//! definitions are cached per (file, profile); instantiation builds an
//! isomorphic instance subtree whose prototype chain reaches the cached
//! definition.

use std::path::{Path, PathBuf};

use tracing::{debug, trace};

use super::{Dependency, ModuleLoader, ProductContext};
use crate::consts::{BASE_MODULE_NAME, DESC_FILE_SUFFIX};
use crate::error::{CodeLocation, LoadError};
use crate::item::value::{
  Builtin, PropertyType, Value, VariantValue, convert_to_property_type,
};
use crate::item::{ItemId, ItemType, ModuleRef, full_module_name};

impl ModuleLoader<'_> {
  /// Resolve all `Depends` children of `item` and attach the resulting
  /// modules. Duplicate dotted names collapse to the first-loaded instance.
  pub(crate) fn resolve_dependencies(
    &self,
    product_ctx: &mut ProductContext,
    item: ItemId,
    product_deps: &mut Vec<Dependency>,
  ) -> Result<(), LoadError> {
    self.load_base_module(product_ctx, item, product_deps)?;

    let children = self.pool.borrow().get(item).children.clone();
    let mut loaded: Vec<ModuleRef> = Vec::new();
    for child in children {
      if self.pool.borrow().get(child).item_type == ItemType::Depends {
        self.resolve_depends_item(product_ctx, item, child, &mut loaded, product_deps)?;
      }
    }

    let mut seen = std::collections::HashSet::new();
    for module in loaded {
      let full_name = full_module_name(&module.name);
      if !seen.insert(full_name) {
        continue;
      }
      self.pool.borrow_mut().get_mut(item).modules.push(module.clone());
      self.resolve_probes(module.item)?;
    }
    Ok(())
  }

  /// Attach the base module if it is not attached yet.
  pub(crate) fn load_base_module(
    &self,
    product_ctx: &mut ProductContext,
    item: ItemId,
    product_deps: &mut Vec<Dependency>,
  ) -> Result<(), LoadError> {
    let already_attached = self
      .pool
      .borrow()
      .get(item)
      .modules
      .iter()
      .any(|m| m.name.len() == 1 && m.name[0] == BASE_MODULE_NAME);
    if already_attached {
      return Ok(());
    }
    let name = vec![BASE_MODULE_NAME.to_owned()];
    let location = self.pool.borrow().get(item).location.clone();
    let module = self
      .load_module(product_ctx, item, &location, "", &name, true, product_deps)?
      .ok_or_else(|| {
        LoadError::invalid("cannot load the base weft module", location.clone())
      })?;
    self
      .pool
      .borrow_mut()
      .get_mut(item)
      .modules
      .push(ModuleRef { name, item: module });
    Ok(())
  }

  fn resolve_depends_item(
    &self,
    product_ctx: &mut ProductContext,
    item: ItemId,
    depends_item: ItemId,
    module_results: &mut Vec<ModuleRef>,
    product_deps: &mut Vec<Dependency>,
  ) -> Result<(), LoadError> {
    self.check_cancelation()?;
    if !self.check_item_condition(depends_item)? {
      trace!("Depends item disabled, ignoring");
      return Ok(());
    }
    let location = self.pool.borrow().get(depends_item).location.clone();
    let product_types = self.evaluator.string_list_value(depends_item, "productTypes")?;
    let name = self.evaluator.string_value(depends_item, "name")?;
    let submodules = self.evaluator.string_list_value(depends_item, "submodules")?;

    if let Some(product_types) = product_types {
      if name.is_some() {
        return Err(LoadError::invalid(
          "the 'productTypes' and 'name' properties are mutually exclusive",
          location,
        ));
      }
      if submodules.is_some() {
        return Err(LoadError::invalid(
          "the 'productTypes' and 'submodules' properties are mutually exclusive",
          location,
        ));
      }
      if product_types.is_empty() {
        trace!("ignoring Depends item with empty productTypes list");
        return Ok(());
      }
      product_deps.push(Dependency {
        name: String::new(),
        profile: "*".into(),
        product_types,
        limit_to_subproject: self
          .evaluator
          .bool_value(depends_item, "limitToSubProject", false)?,
        location,
      });
      return Ok(());
    }

    let name = name.unwrap_or_default();
    let submodules = submodules.unwrap_or_default();
    if submodules.is_empty() && self.pool.borrow().has_property(depends_item, "submodules") {
      trace!("ignoring Depends item with empty submodules list");
      return Ok(());
    }
    let depends_id = self.pool.borrow().get(depends_item).id.clone().unwrap_or_default();
    if submodules.len() > 1 && !depends_id.is_empty() {
      return Err(LoadError::invalid(
        "a Depends item with more than one module cannot have an id",
        location,
      ));
    }

    let name_parts: Vec<String> = name.split('.').map(str::to_owned).collect();
    let mut module_names: Vec<Vec<String>> = Vec::new();
    if submodules.is_empty() {
      module_names.push(name_parts);
    } else {
      for submodule in &submodules {
        let mut full = name_parts.clone();
        full.extend(submodule.split('.').map(str::to_owned));
        module_names.push(full);
      }
    }

    let required = self.evaluator.bool_value(depends_item, "required", true)?;
    let limit_to_subproject = self
      .evaluator
      .bool_value(depends_item, "limitToSubProject", false)?;
    for module_name in module_names {
      // A name with empty segments ("foo..bar") cannot be a module, but it
      // could still be a product name.
      let module_item = if module_name.iter().any(String::is_empty) {
        None
      } else {
        self.load_module(
          product_ctx,
          item,
          &location,
          &depends_id,
          &module_name,
          required,
          product_deps,
        )?
      };
      if let Some(module_item) = module_item {
        debug!(module = %full_module_name(&module_name), "module loaded");
        module_results.push(ModuleRef {
          name: module_name,
          item: module_item,
        });
        continue;
      }
      // Deferred: the name may denote a sibling product. Without an explicit
      // profiles list this becomes a wildcard-profile intent.
      let profiles = self
        .evaluator
        .string_list_value(depends_item, "profiles")?
        .unwrap_or_default();
      if profiles.is_empty() {
        product_deps.push(Dependency {
          name: full_module_name(&module_name),
          profile: "*".into(),
          product_types: Vec::new(),
          limit_to_subproject,
          location: location.clone(),
        });
        continue;
      }
      for profile in profiles {
        product_deps.push(Dependency {
          name: full_module_name(&module_name),
          profile,
          product_types: Vec::new(),
          limit_to_subproject,
          location: location.clone(),
        });
      }
    }
    Ok(())
  }

  /// Get or create the nested instance slot for a dotted module name, one
  /// plain item per segment.
  pub(crate) fn module_instance_item(&self, item: ItemId, name: &[String]) -> ItemId {
    let mut instance = item;
    for segment in name {
      self
        .valid_item_names
        .borrow_mut()
        .entry(instance)
        .or_default()
        .insert(segment.clone());
      instance = self.pool.borrow_mut().item_property(instance, segment);
    }
    instance
  }

  #[allow(clippy::too_many_arguments)]
  pub(crate) fn load_module(
    &self,
    product_ctx: &mut ProductContext,
    item: ItemId,
    depends_location: &CodeLocation,
    module_id: &str,
    module_name: &[String],
    required: bool,
    product_deps: &mut Vec<Dependency>,
  ) -> Result<Option<ItemId>, LoadError> {
    trace!(module = %full_module_name(module_name), id = module_id, "loading module");
    let slot_name: Vec<String>;
    let slot = if module_id.is_empty() {
      self.module_instance_item(item, module_name)
    } else {
      slot_name = vec![module_id.to_owned()];
      self.module_instance_item(item, &slot_name)
    };
    if self.pool.borrow().get(slot).item_type != ItemType::Plain {
      // Already instantiated through another Depends item.
      return Ok(Some(slot));
    }

    let Some(prototype) = self.search_and_load_module_file(
      product_ctx,
      depends_location,
      module_name,
      required,
      product_deps,
    )?
    else {
      return Ok(None);
    };
    self.instantiate_module(product_ctx, item, slot, prototype, module_name)?;
    self.check_validate(slot, module_name)?;
    Ok(Some(slot))
  }

  /// It is not necessarily an error if a required module is not found,
  /// because the dependency could refer to a product instead.
  fn search_and_load_module_file(
    &self,
    product_ctx: &mut ProductContext,
    depends_location: &CodeLocation,
    module_name: &[String],
    required: bool,
    product_deps: &mut Vec<Dependency>,
  ) -> Result<Option<ItemId>, LoadError> {
    let full_name = full_module_name(module_name);
    let is_base = module_name.len() == 1 && module_name[0] == BASE_MODULE_NAME;
    let mut tried_to_load = false;

    for search_path in self.module_search_paths(product_ctx) {
      let Some(dir) = self.find_existing_module_path(&search_path, module_name) else {
        continue;
      };
      for file_path in self.module_files_in(&dir) {
        tried_to_load = true;
        if let Some(module) =
          self.load_module_file(product_ctx, &full_name, is_base, &file_path, product_deps)?
        {
          return Ok(Some(module));
        }
      }
    }

    // No description file for the base module: synthesize the built-in
    // prototype so small projects resolve without a module tree on disk.
    if is_base {
      let pseudo_path = PathBuf::from("<builtin>/weft");
      let cache_key = (pseudo_path.clone(), product_ctx.profile.clone());
      if let Some(cached) = self.module_cache.borrow().get(&cache_key) {
        return Ok(*cached);
      }
      let prototype = self.synthesize_base_prototype();
      for error in self.apply_profile_defaults(product_ctx, &full_name, prototype)? {
        self.handle_property_error(error)?;
      }
      self.module_cache.borrow_mut().insert(cache_key, Some(prototype));
      return Ok(Some(prototype));
    }

    if !required {
      trace!(module = %full_name, "non-required module not found, creating dummy for presence check");
      let mut pool = self.pool.borrow_mut();
      let dummy = pool.create(ItemType::Module, depends_location.clone());
      pool.set_property(dummy, "present", Value::Variant(false.into()));
      return Ok(Some(dummy));
    }
    if tried_to_load {
      return Err(LoadError::MissingModule {
        name: full_name,
        location: depends_location.clone(),
      });
    }
    Ok(None)
  }

  /// Walk the dotted name below a search path, requiring a case-correct
  /// directory entry for every segment.
  fn find_existing_module_path(&self, search_path: &Path, module_name: &[String]) -> Option<PathBuf> {
    let mut dir = search_path.to_path_buf();
    for segment in module_name {
      if !self.dir_entries(&dir).iter().any(|entry| entry == segment) {
        return None;
      }
      dir = dir.join(segment);
    }
    Some(dir)
  }

  /// Description files of one module directory, cached for the lifetime of
  /// the resolution.
  fn module_files_in(&self, dir: &Path) -> Vec<PathBuf> {
    if let Some(files) = self.module_dir_files.borrow().get(dir) {
      return files.clone();
    }
    let files: Vec<PathBuf> = self
      .dir_entries(dir)
      .iter()
      .filter(|name| name.ends_with(DESC_FILE_SUFFIX))
      .map(|name| dir.join(name))
      .collect();
    self
      .module_dir_files
      .borrow_mut()
      .insert(dir.to_path_buf(), files.clone());
    files
  }

  /// Load one module description file, apply profile defaults, and check its
  /// condition. The result (including "disabled") is cached per
  /// (file, profile) so repeated loads are O(1).
  fn load_module_file(
    &self,
    product_ctx: &mut ProductContext,
    full_name: &str,
    is_base: bool,
    file_path: &Path,
    product_deps: &mut Vec<Dependency>,
  ) -> Result<Option<ItemId>, LoadError> {
    self.check_cancelation()?;
    let cache_key = (file_path.to_path_buf(), product_ctx.profile.clone());
    if let Some(cached) = self.module_cache.borrow().get(&cache_key) {
      trace!(file = %file_path.display(), "module file cache hit");
      return Ok(*cached);
    }
    trace!(module = full_name, file = %file_path.display(), "trying to load module");

    let module = self.reader.read_file(file_path)?;
    if self.pool.borrow().get(module).item_type != ItemType::Module {
      let location = self.pool.borrow().get(module).location.clone();
      return Err(LoadError::invalid(
        format!("expected Module item in '{}'", file_path.display()),
        location,
      ));
    }
    if !is_base {
      self.resolve_dependencies(product_ctx, module, product_deps)?;
    }
    let unknown = self.apply_profile_defaults(product_ctx, full_name, module)?;

    // The condition may depend on properties set from the profile, so it is
    // checked last.
    if !self.evaluator.bool_value(module, "condition", true)? {
      trace!(module = full_name, "module condition is false");
      self.module_cache.borrow_mut().insert(cache_key, None);
      return Ok(None);
    }
    for error in unknown {
      self.handle_property_error(error)?;
    }
    self.module_cache.borrow_mut().insert(cache_key, Some(module));
    Ok(Some(module))
  }

  /// Module properties defined in the profile become default values on the
  /// definition. Unknown names are collected, not raised, because a disabled
  /// module must not report them.
  fn apply_profile_defaults(
    &self,
    product_ctx: &ProductContext,
    full_name: &str,
    module: ItemId,
  ) -> Result<Vec<LoadError>, LoadError> {
    let Some(VariantValue::Object(defaults)) = product_ctx.module_config.get(full_name).cloned()
    else {
      return Ok(Vec::new());
    };
    let mut unknown = Vec::new();
    for (key, value) in &defaults {
      let (has_property, declared) = {
        let pool = self.pool.borrow();
        (pool.has_property(module, key), pool.declared_type(module, key))
      };
      if !has_property && declared.is_none() {
        unknown.push(LoadError::UndeclaredProperty {
          name: format!("{}.{}", full_name, key),
          location: self.pool.borrow().get(module).location.clone(),
        });
        continue;
      }
      let ptype = declared.unwrap_or(PropertyType::Variant);
      let converted = convert_to_property_type(value, ptype, full_name, key)?;
      self
        .pool
        .borrow_mut()
        .set_property(module, key.clone(), Value::Variant(converted));
    }
    Ok(unknown)
  }

  /// The built-in base-module definition used when no `weft` module file
  /// exists on the search paths.
  fn synthesize_base_prototype(&self) -> ItemId {
    let mut pool = self.pool.borrow_mut();
    let location = CodeLocation::file_only("<builtin>/weft");
    let prototype = pool.create(ItemType::Module, location);
    let defaults: [(&str, PropertyType, VariantValue); 4] = [
      ("buildVariant", PropertyType::String, "debug".into()),
      ("profile", PropertyType::String, VariantValue::Null),
      ("install", PropertyType::Bool, false.into()),
      (
        "hostOS",
        PropertyType::StringList,
        VariantValue::Array(host_os().into_iter().map(Into::into).collect()),
      ),
    ];
    for (name, ptype, value) in defaults {
      pool.set_declared_type(prototype, name, ptype);
      pool.set_property(prototype, name, Value::Variant(value));
    }
    pool.set_declared_type(prototype, "getEnv", PropertyType::Variant);
    pool.set_property(prototype, "getEnv", Value::Builtin(Builtin::GetEnv));
    prototype
  }

  /// Create a module instance: prototype link to the cached definition,
  /// private copies of every nested declaration, re-established id
  /// shortcuts, recursively instantiated dependencies, and finally the
  /// command-line overrides.
  fn instantiate_module(
    &self,
    product_ctx: &mut ProductContext,
    instance_scope: ItemId,
    instance: ItemId,
    prototype: ItemId,
    module_name: &[String],
  ) -> Result<(), LoadError> {
    let full_name = full_module_name(module_name);
    let module_scope = {
      let mut pool = self.pool.borrow_mut();
      pool.set_property(prototype, "name", Value::Variant(full_name.clone().into()));

      let proto_location = pool.get(prototype).location.clone();
      let proto_type = pool.get(prototype).item_type;
      let inst = pool.get_mut(instance);
      inst.prototype = Some(prototype);
      inst.location = proto_location.clone();
      inst.item_type = proto_type;
      inst.is_module_instance = true;

      // The module scope chains to the depending item and carries the
      // project/product shortcuts.
      let module_scope = pool.create(ItemType::Plain, proto_location);
      pool.set_scope(module_scope, instance_scope);
      if let Some(project) = pool.local_property(product_ctx.project_scope, "project").cloned() {
        pool.set_property(module_scope, "project", project);
      }
      if let Some(product) = pool.local_property(product_ctx.scope, "product").cloned() {
        pool.set_property(module_scope, "product", product);
      }
      pool.set_scope(instance, module_scope);
      module_scope
    };

    let mut prototype_instance_map = std::collections::HashMap::new();
    prototype_instance_map.insert(prototype, instance);
    self.create_child_instances(product_ctx, instance, prototype, &mut prototype_instance_map);

    // Re-establish id shortcuts inside the new instance scope.
    let with_ids = self.pool.borrow().collect_items_with_id(prototype);
    for id_proto in with_ids {
      let Some(&id_instance) = prototype_instance_map.get(&id_proto) else {
        continue;
      };
      let id = self.pool.borrow().get(id_proto).id.clone().unwrap_or_default();
      self
        .pool
        .borrow_mut()
        .set_property(module_scope, id, Value::Item(id_instance));
    }

    // Instantiate the module's own dependencies.
    let prototype_modules = self.pool.borrow().get(prototype).modules.clone();
    for module in prototype_modules {
      let dep_instance = self.module_instance_item(instance, &module.name);
      self.instantiate_module(product_ctx, instance, dep_instance, module.item, &module.name)?;
      self
        .pool
        .borrow_mut()
        .get_mut(instance)
        .modules
        .push(ModuleRef {
          name: module.name,
          item: dep_instance,
        });
    }

    // Command-line overrides, checked and coerced like profile defaults but
    // with the highest precedence.
    let Some(VariantValue::Object(overrides)) =
      self.params.overridden_values.get(&full_name).cloned()
    else {
      return Ok(());
    };
    for (key, value) in &overrides {
      let declared = self.pool.borrow().declared_type(instance, key);
      let Some(ptype) = declared else {
        let location = self.pool.borrow().get(instance).location.clone();
        self.handle_property_error(LoadError::UndeclaredProperty {
          name: format!("{}.{}", full_name, key),
          location,
        })?;
        continue;
      };
      let converted = convert_to_property_type(value, ptype, &full_name, key)?;
      self
        .pool
        .borrow_mut()
        .set_property(instance, key.clone(), Value::Variant(converted));
    }
    Ok(())
  }

  /// Recursively instantiate every child of the prototype so each product
  /// gets private mutable copies of nested declarations.
  fn create_child_instances(
    &self,
    product_ctx: &ProductContext,
    instance: ItemId,
    prototype: ItemId,
    map: &mut std::collections::HashMap<ItemId, ItemId>,
  ) {
    let children = self.pool.borrow().get(prototype).children.clone();
    for child_prototype in children {
      let child_instance = {
        let mut pool = self.pool.borrow_mut();
        let location = pool.get(child_prototype).location.clone();
        let child_type = pool.get(child_prototype).item_type;
        let child_id = pool.get(child_prototype).id.clone();
        let child = pool.create(child_type, location);
        pool.get_mut(child).id = child_id;
        pool.set_prototype(child, child_prototype);
        pool.set_scope(child, product_ctx.scope);
        pool.add_child(instance, child);
        child
      };
      map.insert(child_prototype, child_instance);
      self.create_child_instances(product_ctx, child_instance, child_prototype, map);
    }
  }

  /// Run the module's `validate` expression. An explicit false or a script
  /// failure rejects the module.
  fn check_validate(&self, instance: ItemId, module_name: &[String]) -> Result<(), LoadError> {
    let has_validate = self.pool.borrow().property(instance, "validate").is_some();
    if !has_validate {
      return Ok(());
    }
    let location = self.pool.borrow().get(instance).location.clone();
    let full_name = full_module_name(module_name);
    match self.evaluator.evaluate(instance, "validate") {
      Ok(outcome) => {
        if outcome.value == Some(VariantValue::Bool(false)) {
          return Err(LoadError::Validation {
            name: full_name,
            location,
          });
        }
        Ok(())
      }
      Err(LoadError::Evaluation { message, location }) => Err(LoadError::Validation {
        name: format!("{}: {}", full_name, message),
        location,
      }),
      Err(other) => Err(other),
    }
  }
}

fn host_os() -> Vec<String> {
  let mut names = Vec::new();
  if cfg!(unix) {
    names.push("unix".to_owned());
  }
  if cfg!(target_os = "linux") {
    names.push("linux".to_owned());
  }
  if cfg!(target_os = "macos") {
    names.extend(["darwin".to_owned(), "macos".to_owned()]);
  }
  if cfg!(target_os = "freebsd") {
    names.extend(["bsd".to_owned(), "freebsd".to_owned()]);
  }
  if cfg!(windows) {
    names.push("windows".to_owned());
  }
  names
}
