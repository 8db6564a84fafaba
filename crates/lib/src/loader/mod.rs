//! The module/dependency loader (pass one).
//!
//! Takes the raw item tree of the top-level description file and produces an
//! annotated tree: products multiplexed across their profiles, every module
//! instantiated and attached, `Depends` edges resolved either to module
//! instances or to per-product dependency intents, Export items merged, and
//! Probes run. The project resolver walks the result.

mod exports;
mod modules;
mod multiplex;
mod probes;

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use tracing::{debug, warn};

use crate::builtins;
use crate::consts::{DESC_FILE_SUFFIX, MODULE_SEARCH_SUBDIR, WEFT_VERSION};
use crate::error::{CodeLocation, LoadError};
use crate::evaluator::Evaluator;
use crate::item::value::{Value, VariantValue, convert_to_property_type, merge_variant_maps};
use crate::item::{ItemId, ItemPool, ItemType};
use crate::lua::Reader;
use crate::params::{PropertyChecking, SetupParameters};
use crate::profiles::{ConfigMap, Settings};
use crate::progress::ProgressObserver;
use crate::util::paths;

/// A dependency of one product on another, not yet bound to a concrete
/// product. The same dotted name can denote either a module or a sibling
/// product, so unresolved module names are deferred here and only become
/// errors if the resolver cannot bind them either.
#[derive(Clone, Debug)]
pub struct Dependency {
  pub name: String,
  /// A concrete profile, or `*` to match every profile.
  pub profile: String,
  /// Set instead of `name` for `productTypes` dependencies.
  pub product_types: Vec<String>,
  pub limit_to_subproject: bool,
  pub location: CodeLocation,
}

impl Dependency {
  pub fn unique_name(&self) -> String {
    if self.profile == "*" {
      self.name.clone()
    } else {
      format!("{}-{}", self.name, self.profile)
    }
  }
}

/// Dependency intents collected for one product item.
#[derive(Clone, Debug, Default)]
pub struct ProductInfo {
  pub used_products: Vec<Dependency>,
  /// Dependencies declared by the product's merged Export item; these become
  /// visible to consumers of the product.
  pub used_products_from_exports: Vec<Dependency>,
}

/// Output of the loader pass.
pub struct LoadResult {
  pub root: ItemId,
  pub product_infos: HashMap<ItemId, ProductInfo>,
  pub profile_configs: BTreeMap<String, ConfigMap>,
  pub files_read: std::collections::BTreeSet<PathBuf>,
  pub disabled_items: HashSet<ItemId>,
}

/// Scope and search-path state of the project currently being walked.
pub(crate) struct ProjectContext {
  pub scope: ItemId,
  pub build_directory: PathBuf,
  pub extra_search_paths: Vec<PathBuf>,
  pub local_module_search_path: PathBuf,
}

/// Per-product state threaded through dependency resolution.
pub(crate) struct ProductContext {
  pub item: ItemId,
  pub scope: ItemId,
  pub project_scope: ItemId,
  pub profile: String,
  pub module_config: ConfigMap,
  pub extra_search_paths: Vec<PathBuf>,
  pub local_module_search_path: PathBuf,
}

pub struct ModuleLoader<'a> {
  pub(crate) pool: Rc<RefCell<ItemPool>>,
  pub(crate) reader: &'a Reader,
  pub(crate) evaluator: &'a Evaluator,
  pub(crate) settings: Settings,
  pub(crate) params: &'a SetupParameters,
  pub(crate) progress: &'a dyn ProgressObserver,
  engine_version: semver::Version,
  global_search_paths: Vec<PathBuf>,
  // Per-resolution caches; a new loader starts cold.
  pub(crate) dir_entries: RefCell<HashMap<PathBuf, Vec<String>>>,
  pub(crate) module_dir_files: RefCell<HashMap<PathBuf, Vec<PathBuf>>>,
  pub(crate) module_cache: RefCell<HashMap<(PathBuf, String), Option<ItemId>>>,
  pub(crate) probes_resolved: RefCell<HashSet<ItemId>>,
  pub(crate) disabled_items: RefCell<HashSet<ItemId>>,
  pub(crate) valid_item_names: RefCell<HashMap<ItemId, HashSet<String>>>,
  profile_configs: RefCell<BTreeMap<String, ConfigMap>>,
  product_infos: RefCell<HashMap<ItemId, ProductInfo>>,
}

impl<'a> ModuleLoader<'a> {
  pub fn new(
    pool: Rc<RefCell<ItemPool>>,
    reader: &'a Reader,
    evaluator: &'a Evaluator,
    params: &'a SetupParameters,
    progress: &'a dyn ProgressObserver,
  ) -> Self {
    let global_search_paths = params
      .search_paths
      .iter()
      .map(|p| p.join(MODULE_SEARCH_SUBDIR))
      .collect();
    Self {
      pool,
      reader,
      evaluator,
      settings: Settings::new(&params.settings_dir),
      params,
      progress,
      engine_version: semver::Version::parse(WEFT_VERSION)
        .expect("crate version is a valid semver string"),
      global_search_paths,
      dir_entries: RefCell::new(HashMap::new()),
      module_dir_files: RefCell::new(HashMap::new()),
      module_cache: RefCell::new(HashMap::new()),
      probes_resolved: RefCell::new(HashSet::new()),
      disabled_items: RefCell::new(HashSet::new()),
      valid_item_names: RefCell::new(HashMap::new()),
      profile_configs: RefCell::new(BTreeMap::new()),
      product_infos: RefCell::new(HashMap::new()),
    }
  }

  /// Run the loader pass over the top-level project file.
  pub fn load(&self) -> Result<LoadResult, LoadError> {
    debug!(file = %self.params.project_file.display(), "loading project");
    let mut root = self.reader.read_file(&self.params.project_file)?;
    if self.pool.borrow().get(root).item_type != ItemType::Project {
      root = self.wrap_with_project(root);
    }

    let project_dir = {
      let pool = self.pool.borrow();
      paths::location_dir(&pool.get(root).location)
    };
    let build_directory = self.params.build_directory();
    {
      let mut pool = self.pool.borrow_mut();
      pool.set_property(
        root,
        "sourceDirectory",
        Value::Variant(project_dir.display().to_string().into()),
      );
      pool.set_property(
        root,
        "buildDirectory",
        Value::Variant(build_directory.display().to_string().into()),
      );
      pool.set_property(root, "profile", Value::Variant(self.params.profile.clone().into()));
    }

    let mut referenced = HashSet::new();
    referenced.insert(paths::canonicalize(&self.params.project_file)?);
    self.handle_project(root, &referenced)?;
    self.check_property_declarations(root)?;

    Ok(LoadResult {
      root,
      product_infos: self.product_infos.take(),
      profile_configs: self.profile_configs.take(),
      files_read: self.reader.files_read(),
      disabled_items: self.disabled_items.borrow().clone(),
    })
  }

  fn wrap_with_project(&self, item: ItemId) -> ItemId {
    let mut pool = self.pool.borrow_mut();
    let location = pool.get(item).location.clone();
    let project = pool.create(ItemType::Project, location);
    pool.add_child(project, item);
    project
  }

  pub(crate) fn handle_project(
    &self,
    item: ItemId,
    referenced_file_paths: &HashSet<PathBuf>,
  ) -> Result<(), LoadError> {
    if !self.check_item_condition(item)? {
      return Ok(());
    }
    let (location, project_dir, file) = {
      let pool = self.pool.borrow();
      let location = pool.get(item).location.clone();
      (location.clone(), paths::location_dir(&location), location.file.clone())
    };

    // The project scope: expressions see the project item as `project`, plus
    // the id shortcuts of the defining file.
    let scope = {
      let mut pool = self.pool.borrow_mut();
      let scope = pool.create(ItemType::Plain, location.clone());
      pool.set_property(scope, "project", Value::Item(item));
      scope
    };
    if let Some(file_scope) = self.reader.file_scope(&file) {
      self.pool.borrow_mut().set_scope(scope, file_scope);
    }

    let mut dummy_ctx = ProductContext {
      item,
      scope,
      project_scope: scope,
      profile: self.params.profile.clone(),
      module_config: self.build_config_for_profile(&self.params.profile)?,
      extra_search_paths: Vec::new(),
      local_module_search_path: project_dir.join(MODULE_SEARCH_SUBDIR),
    };
    let mut dummy_deps = Vec::new();
    self.load_base_module(&mut dummy_ctx, item, &mut dummy_deps)?;
    self.override_item_properties(item, "project")?;

    let (extra_search_paths, _) = self.read_search_paths(item)?;
    let project_ctx = ProjectContext {
      scope,
      build_directory: self.params.build_directory(),
      extra_search_paths,
      local_module_search_path: project_dir.join(MODULE_SEARCH_SUBDIR),
    };
    dummy_ctx.extra_search_paths = project_ctx.extra_search_paths.clone();

    // Engine version gate.
    if let Some(min_version) = self.evaluator.string_value(item, "minimumWeftVersion")? {
      let required =
        semver::Version::parse(&min_version).map_err(|_| LoadError::InvalidVersion {
          value: min_version.clone(),
          location: location.clone(),
        })?;
      if self.engine_version < required {
        return Err(LoadError::VersionMismatch {
          required: required.to_string(),
          actual: self.engine_version.to_string(),
        });
      }
    }

    // Scope assignment must precede multiplexing so that clones inherit it.
    let children = self.pool.borrow().get(item).children.clone();
    for &child in &children {
      self.pool.borrow_mut().set_scope(child, scope);
    }
    for &child in &children {
      if self.pool.borrow().get(child).item_type == ItemType::Product {
        for clone in self.multiplex_product(&mut dummy_ctx, child)? {
          self.pool.borrow_mut().add_child(item, clone);
        }
      }
    }

    let children = self.pool.borrow().get(item).children.clone();
    for child in children {
      let child_type = self.pool.borrow().get(child).item_type;
      match child_type {
        ItemType::Product => self.handle_product(&project_ctx, child)?,
        ItemType::SubProject => self.handle_sub_project(&project_ctx, child, referenced_file_paths)?,
        ItemType::Project => {
          self.copy_properties(item, child);
          self.handle_project(child, referenced_file_paths)?;
        }
        _ => {}
      }
    }

    self.expand_references(item, &project_ctx, &mut dummy_ctx, referenced_file_paths)?;
    self.check_item_types(item)?;
    Ok(())
  }

  /// Load every entry of the project's `references` list. A referenced
  /// directory must contain exactly one description file.
  fn expand_references(
    &self,
    item: ItemId,
    project_ctx: &ProjectContext,
    dummy_ctx: &mut ProductContext,
    referenced_file_paths: &HashSet<PathBuf>,
  ) -> Result<(), LoadError> {
    let refs = self
      .evaluator
      .string_list_value(item, "references")?
      .unwrap_or_default();
    if refs.is_empty() {
      return Ok(());
    }
    let (location, project_dir) = {
      let pool = self.pool.borrow();
      let location = pool.get(item).location.clone();
      (location.clone(), paths::location_dir(&location))
    };

    let mut loaded = Vec::new();
    for reference in refs {
      let mut ref_path = paths::resolve(&project_dir, &reference);
      if ref_path.is_dir() {
        ref_path = self.single_description_file_in(&ref_path, &location)?;
      }
      let canonical = paths::canonicalize(&ref_path)?;
      if referenced_file_paths.contains(&canonical) {
        return Err(LoadError::Cycle {
          message: format!("while referencing file '{}'", reference),
          location,
        });
      }
      let sub_item = self.reader.read_file(&canonical)?;
      {
        let mut pool = self.pool.borrow_mut();
        pool.set_scope(sub_item, project_ctx.scope);
        pool.add_child(item, sub_item);
      }
      loaded.push((sub_item, canonical));
      if self.pool.borrow().get(sub_item).item_type == ItemType::Product {
        for clone in self.multiplex_product(dummy_ctx, sub_item)? {
          self.pool.borrow_mut().add_child(item, clone);
          loaded.push((clone, ref_path.clone()));
        }
      }
    }
    for (sub_item, file_path) in loaded {
      let sub_item_type = self.pool.borrow().get(sub_item).item_type;
      match sub_item_type {
        ItemType::Product => self.handle_product(project_ctx, sub_item)?,
        ItemType::Project => {
          self.copy_properties(item, sub_item);
          let mut nested = referenced_file_paths.clone();
          nested.insert(file_path);
          self.handle_project(sub_item, &nested)?;
        }
        other => {
          let location = self.pool.borrow().get(sub_item).location.clone();
          return Err(LoadError::invalid(
            format!(
              "the top-level item of a referenced file must be a Product or a Project, but it is '{}'",
              other.name()
            ),
            location,
          ));
        }
      }
    }
    Ok(())
  }

  fn single_description_file_in(
    &self,
    dir: &Path,
    location: &CodeLocation,
  ) -> Result<PathBuf, LoadError> {
    let mut found = None;
    for name in self.dir_entries(dir) {
      if !name.ends_with(DESC_FILE_SUFFIX) {
        continue;
      }
      if found.is_some() {
        return Err(LoadError::invalid(
          format!(
            "referenced directory '{}' contains more than one description file",
            dir.display()
          ),
          location.clone(),
        ));
      }
      found = Some(dir.join(name));
    }
    found.ok_or_else(|| {
      LoadError::invalid(
        format!(
          "referenced directory '{}' does not contain a description file",
          dir.display()
        ),
        location.clone(),
      )
    })
  }

  pub(crate) fn handle_sub_project(
    &self,
    project_ctx: &ProjectContext,
    item: ItemId,
    referenced_file_paths: &HashSet<PathBuf>,
  ) -> Result<(), LoadError> {
    debug!("handling SubProject");
    let properties_item = self.pool.borrow().find_child(item, ItemType::Properties);
    if let Some(properties_item) = properties_item
      && !self.check_item_condition(properties_item)?
    {
      return Ok(());
    }

    let (location, dir) = {
      let pool = self.pool.borrow();
      let location = pool.get(item).location.clone();
      (location.clone(), paths::location_dir(&location))
    };
    let Some(file_path) = self.evaluator.string_value(item, "filePath")? else {
      return Err(LoadError::invalid("SubProject.filePath must be set", location));
    };
    let sub_project_file = paths::resolve(&dir, &file_path);
    let canonical = paths::canonicalize(&sub_project_file)?;
    if referenced_file_paths.contains(&canonical) {
      return Err(LoadError::Cycle {
        message: format!("while loading subproject file '{}'", file_path),
        location,
      });
    }

    let mut loaded = self.reader.read_file(&canonical)?;
    if self.pool.borrow().get(loaded).item_type == ItemType::Product {
      loaded = self.wrap_with_project(loaded);
    }
    if self.pool.borrow().get(loaded).item_type != ItemType::Project {
      let loaded_location = self.pool.borrow().get(loaded).location.clone();
      return Err(LoadError::invalid(
        format!(
          "expected Project item, but encountered '{}'",
          self.pool.borrow().get(loaded).item_type.name()
        ),
        loaded_location,
      ));
    }

    let parent_project = {
      let pool = self.pool.borrow();
      let Value::Item(parent) = pool
        .local_property(project_ctx.scope, "project")
        .cloned()
        .expect("project scope always names its project")
      else {
        unreachable!("project scope entry is an item");
      };
      parent
    };
    let inherit = self.evaluator.bool_value(item, "inheritProperties", true)?;
    if inherit {
      self.copy_properties(parent_project, loaded);
    }
    if let Some(properties_item) = properties_item {
      let overrides = self.pool.borrow().get(properties_item).properties.clone();
      let mut pool = self.pool.borrow_mut();
      for (name, value) in overrides {
        pool.set_property(loaded, name, value);
      }
    }

    {
      let mut pool = self.pool.borrow_mut();
      pool.add_child(item, loaded);
      pool.set_scope(item, project_ctx.scope);
    }
    let mut nested = referenced_file_paths.clone();
    nested.insert(canonical);
    self.handle_project(loaded, &nested)
  }

  pub(crate) fn handle_product(
    &self,
    project_ctx: &ProjectContext,
    item: ItemId,
  ) -> Result<(), LoadError> {
    self.check_cancelation()?;
    let location = self.pool.borrow().get(item).location.clone();
    debug!(location = %location, "handling product");

    // Build and source directories for the product itself.
    let name = self
      .evaluator
      .string_value(item, "name")?
      .unwrap_or_default();
    let profile = self
      .evaluator
      .string_value(item, "profile")?
      .expect("multiplexing always pins a profile");
    let product_dir = paths::location_dir(&location);
    {
      let mut pool = self.pool.borrow_mut();
      let build_dir = project_ctx
        .build_directory
        .join(format!("{}-{}", name, profile));
      pool.set_property(
        item,
        "buildDirectory",
        Value::Variant(build_dir.display().to_string().into()),
      );
      pool.set_property(
        item,
        "sourceDirectory",
        Value::Variant(product_dir.display().to_string().into()),
      );
    }

    let module_config = self.build_config_for_profile(&profile)?;
    let (extra_search_paths, paths_set) = self.read_search_paths(item)?;
    let scope = {
      let mut pool = self.pool.borrow_mut();
      let scope = pool.create(ItemType::Plain, location.clone());
      pool.set_property(scope, "product", Value::Item(item));
      pool.set_scope(scope, project_ctx.scope);
      pool.set_scope_for_descendants(item, scope);
      scope
    };

    let mut product_ctx = ProductContext {
      item,
      scope,
      project_scope: project_ctx.scope,
      profile,
      module_config,
      extra_search_paths: if paths_set {
        extra_search_paths
      } else {
        project_ctx.extra_search_paths.clone()
      },
      local_module_search_path: project_ctx.local_module_search_path.clone(),
    };

    let mut info = ProductInfo::default();
    self.resolve_dependencies(&mut product_ctx, item, &mut info.used_products)?;
    self.check_item_condition(item)?;

    let mut export_items = Vec::new();
    let children = self.pool.borrow().get(item).children.clone();
    for child in children {
      let child_type = self.pool.borrow().get(child).item_type;
      match child_type {
        ItemType::Group => self.handle_group(&mut product_ctx, child)?,
        ItemType::Export => export_items.push(child),
        ItemType::Probe => self.resolve_probe(item, child)?,
        _ => {}
      }
    }

    self.merge_export_items(&mut product_ctx, export_items, &mut info)?;
    self.product_infos.borrow_mut().insert(item, info);
    Ok(())
  }

  /// Groups see the product's modules so that per-group module property
  /// overrides inherit from the product's instances.
  fn handle_group(&self, product_ctx: &mut ProductContext, item: ItemId) -> Result<(), LoadError> {
    self.check_cancelation()?;
    self.propagate_modules_from_product(product_ctx, item);
    self.check_item_condition(item)?;
    Ok(())
  }

  pub(crate) fn propagate_modules_from_product(
    &self,
    product_ctx: &ProductContext,
    item: ItemId,
  ) {
    let product_modules = self.pool.borrow().get(product_ctx.item).modules.clone();
    for module in product_modules {
      let target = self.module_instance_item(item, &module.name);
      let mut pool = self.pool.borrow_mut();
      let instance = pool.get_mut(target);
      instance.prototype = Some(module.item);
      instance.is_module_instance = true;
      let source = pool.get(module.item);
      let scope = source.scope;
      let modules = source.modules.clone();
      let target_item = pool.get_mut(target);
      target_item.scope = scope;
      target_item.modules = modules;
      pool.get_mut(item).modules.push(crate::item::ModuleRef {
        name: module.name.clone(),
        item: target,
      });
    }
  }

  /// Copy the custom property declarations of a parent project into a child
  /// project, plus the handful of built-in properties that inherit.
  pub(crate) fn copy_properties(&self, source: ItemId, target: ItemId) {
    const INHERITED_BUILTINS: [&str; 4] = [
      "searchPaths",
      "profile",
      "buildDirectory",
      "sourceDirectory",
    ];
    let mut pool = self.pool.borrow_mut();
    let source_decls = pool.get(source).decls.clone();
    for (name, ptype) in source_decls {
      if builtins::declared_type(ItemType::Project, &name).is_some() {
        continue;
      }
      if pool.local_property(target, &name).is_some() {
        continue;
      }
      if let Some(value) = pool.local_property(source, &name).cloned() {
        pool.set_declared_type(target, name.clone(), ptype);
        pool.set_property(target, name, value);
      }
    }
    for name in INHERITED_BUILTINS {
      if pool.local_property(target, name).is_none()
        && let Some(value) = pool.local_property(source, name).cloned()
      {
        pool.set_property(target, name, value);
      }
    }
  }

  /// Apply command-line overrides for `key` (the project, a product name, or
  /// a module name) to an item.
  pub(crate) fn override_item_properties(&self, item: ItemId, key: &str) -> Result<(), LoadError> {
    let Some(VariantValue::Object(overrides)) = self.params.overridden_values.get(key).cloned()
    else {
      return Ok(());
    };
    for (name, value) in &overrides {
      let declared = self.pool.borrow().declared_type(item, name);
      let Some(ptype) = declared else {
        let location = self.pool.borrow().get(item).location.clone();
        self.handle_property_error(LoadError::UndeclaredProperty {
          name: format!("{}.{}", key, name),
          location,
        })?;
        continue;
      };
      let converted = convert_to_property_type(value, ptype, key, name)?;
      self
        .pool
        .borrow_mut()
        .set_property(item, name.clone(), Value::Variant(converted));
    }
    Ok(())
  }

  /// Expanded build configuration for a profile, computed once per profile
  /// and reused by every product on it. Command-line overrides win.
  pub(crate) fn build_config_for_profile(&self, profile: &str) -> Result<ConfigMap, LoadError> {
    if let Some(config) = self.profile_configs.borrow().get(profile) {
      return Ok(config.clone());
    }
    let mut config = self
      .settings
      .expanded_build_configuration(profile, &self.params.build_variant)?;
    merge_variant_maps(&mut config, &self.params.overridden_values);
    self
      .profile_configs
      .borrow_mut()
      .insert(profile.to_owned(), config.clone());
    Ok(config)
  }

  /// Evaluate an item's `searchPaths`, resolved against its defining file.
  pub(crate) fn read_search_paths(&self, item: ItemId) -> Result<(Vec<PathBuf>, bool), LoadError> {
    let Some(list) = self.evaluator.string_list_value(item, "searchPaths")? else {
      return Ok((Vec::new(), false));
    };
    let dir = {
      let pool = self.pool.borrow();
      paths::location_dir(&pool.get(item).location)
    };
    let resolved = list.iter().map(|p| paths::resolve(&dir, p)).collect();
    Ok((resolved, true))
  }

  /// Module search paths for a product: project-local first, then item-level
  /// extra paths, then the globally configured ones.
  pub(crate) fn module_search_paths(&self, product_ctx: &ProductContext) -> Vec<PathBuf> {
    let mut search_paths = vec![product_ctx.local_module_search_path.clone()];
    for path in &product_ctx.extra_search_paths {
      search_paths.push(path.join(MODULE_SEARCH_SUBDIR));
    }
    search_paths.extend(self.global_search_paths.iter().cloned());
    search_paths
  }

  pub(crate) fn check_item_condition(&self, item: ItemId) -> Result<bool, LoadError> {
    if self.evaluator.bool_value(item, "condition", true)? {
      return Ok(true);
    }
    self.disabled_items.borrow_mut().insert(item);
    Ok(false)
  }

  pub(crate) fn check_cancelation(&self) -> Result<(), LoadError> {
    if self.progress.canceled() {
      return Err(LoadError::Canceled {
        configuration: self.params.configuration_id(),
      });
    }
    Ok(())
  }

  /// Cached directory listing, used both for case-correct module lookups and
  /// reference expansion.
  pub(crate) fn dir_entries(&self, dir: &Path) -> Vec<String> {
    if let Some(entries) = self.dir_entries.borrow().get(dir) {
      return entries.clone();
    }
    let mut entries: Vec<String> = std::fs::read_dir(dir)
      .map(|it| {
        it.filter_map(|e| e.ok())
          .map(|e| e.file_name().to_string_lossy().into_owned())
          .collect()
      })
      .unwrap_or_default();
    entries.sort();
    self
      .dir_entries
      .borrow_mut()
      .insert(dir.to_path_buf(), entries.clone());
    entries
  }

  /// Fatal in strict mode, a warning otherwise. This is the one place where
  /// partial tolerance is allowed.
  pub(crate) fn handle_property_error(&self, error: LoadError) -> Result<(), LoadError> {
    match self.params.property_checking {
      PropertyChecking::Strict => Err(error),
      PropertyChecking::Loose => {
        warn!("{}", error);
        Ok(())
      }
    }
  }

  /// Validate the child-type constraints of the whole subtree.
  pub(crate) fn check_item_types(&self, item: ItemId) -> Result<(), LoadError> {
    let (item_type, children, modules) = {
      let pool = self.pool.borrow();
      let it = pool.get(item);
      (
        it.item_type,
        it.children.clone(),
        it.modules.iter().map(|m| m.item).collect::<Vec<_>>(),
      )
    };
    for child in children {
      let (child_type, location) = {
        let pool = self.pool.borrow();
        let c = pool.get(child);
        (c.item_type, c.location.clone())
      };
      if child_type != ItemType::Plain && !builtins::is_child_type_allowed(item_type, child_type) {
        return Err(LoadError::UnknownItemType {
          type_name: child_type.name().to_owned(),
          location,
        });
      }
      self.check_item_types(child)?;
    }
    for module in modules {
      self.check_item_types(module)?;
    }
    Ok(())
  }

  /// The strictness-gated undeclared-property walk, run once after the whole
  /// tree is loaded.
  fn check_property_declarations(&self, root: ItemId) -> Result<(), LoadError> {
    let mut errors = Vec::new();
    let mut visited = HashSet::new();
    self.declaration_check_impl(root, &mut errors, &mut visited);
    for error in errors {
      self.handle_property_error(error)?;
    }
    Ok(())
  }

  fn declaration_check_impl(
    &self,
    item: ItemId,
    errors: &mut Vec<LoadError>,
    visited: &mut HashSet<ItemId>,
  ) {
    if !visited.insert(item) || self.disabled_items.borrow().contains(&item) {
      return;
    }
    let (item_type, is_module_instance, properties, children, modules, location) = {
      let pool = self.pool.borrow();
      let it = pool.get(item);
      (
        it.item_type,
        it.is_module_instance,
        it.properties.clone(),
        it.children.clone(),
        it.modules.iter().map(|m| m.item).collect::<Vec<_>>(),
        it.location.clone(),
      )
    };
    if item_type == ItemType::SubProject {
      return;
    }
    for (name, value) in &properties {
      match value {
        Value::Item(target) => {
          let target_is_instance = self.pool.borrow().get(*target).is_module_instance;
          let known = target_is_instance
            || self
              .valid_item_names
              .borrow()
              .get(&item)
              .is_some_and(|names| names.contains(name));
          if !known && !builtins::accepts_any_property(item_type) {
            errors.push(LoadError::UndeclaredProperty {
              name: format!("{} (did you forget to add a Depends item?)", name),
              location: location.clone(),
            });
            continue;
          }
          self.declaration_check_impl(*target, errors, visited);
        }
        Value::Builtin(_) => {}
        Value::Thunk(_) | Value::Variant(_) => {
          if builtins::accepts_any_property(item_type) || is_module_instance {
            if is_module_instance && self.pool.borrow().declared_type(item, name).is_none() {
              errors.push(LoadError::UndeclaredProperty {
                name: name.clone(),
                location: location.clone(),
              });
            }
            continue;
          }
          if self.pool.borrow().declared_type(item, name).is_none() {
            errors.push(LoadError::UndeclaredProperty {
              name: name.clone(),
              location: location.clone(),
            });
          }
        }
      }
    }
    for child in children {
      self.declaration_check_impl(child, errors, visited);
    }
    for module in modules {
      self.declaration_check_impl(module, errors, visited);
    }
  }
}
