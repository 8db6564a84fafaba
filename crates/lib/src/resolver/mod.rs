//! The project resolver (pass two).
//!
//! Walks the loader's annotated tree and builds the final resolved graph:
//! products with their modules, groups, artifacts, rules, transformers and
//! scanners, fully evaluated property maps, and cross-product export
//! propagation. Per product the states progress one-way:
//! unvisited, multiplexed, dependencies resolved, properties evaluated,
//! finalized; a product whose condition fails stops after multiplexing and
//! contributes nothing further.

pub(crate) mod dependencies;
pub mod groups;
mod properties;
mod rules;

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::rc::Rc;

use tracing::debug;

use crate::consts::{INSTALLABLE_TAG, UNKNOWN_FILE_TAG};
use crate::error::{CodeLocation, LoadError};
use crate::evaluator::Evaluator;
use crate::graph::{
  FileTagger, FileTags, ProductId, ProjectNode, PropertyMap, ResolvedModule, ResolvedProduct,
  ResolvedProject, Rule,
};
use crate::item::value::{Value, VariantMap, VariantValue};
use crate::item::{ItemId, ItemPool, ItemType, ModuleRef, full_module_name};
use crate::loader::LoadResult;
use crate::params::SetupParameters;
use crate::progress::ProgressObserver;
use crate::util::paths;

/// Captured Export configuration of one product, keyed by product id.
pub(crate) struct ExportsContext {
  pub item: ItemId,
  /// Direct Export properties, evaluated with the exporting product.
  pub module_values: VariantMap,
  pub rules: Vec<Rule>,
  pub file_taggers: Vec<FileTagger>,
}

/// Scratch state while resolving one product.
pub(crate) struct ProductState {
  pub id: ProductId,
  pub source_directory: PathBuf,
  pub build_directory: PathBuf,
  pub source_artifact_locations: HashMap<PathBuf, CodeLocation>,
  pub artifact_properties_per_filter: HashMap<Vec<String>, (usize, CodeLocation)>,
  pub additional_file_tags: FileTags,
}

pub struct ProjectResolver<'a> {
  pub(crate) pool: Rc<RefCell<ItemPool>>,
  pub(crate) evaluator: &'a Evaluator,
  pub(crate) params: &'a SetupParameters,
  progress: &'a dyn ProgressObserver,
  pub(crate) load: LoadResult,
  pub(crate) products: Vec<ResolvedProduct>,
  pub(crate) product_items: Vec<ItemId>,
  /// Project-tree path of each product, for `limitToSubProject` filtering.
  pub(crate) product_paths: Vec<Vec<usize>>,
  pub(crate) products_by_name: HashMap<(String, String), ProductId>,
  pub(crate) products_by_type: HashMap<String, Vec<ProductId>>,
  pub(crate) exports: HashMap<ProductId, ExportsContext>,
  pub(crate) disable_cached_evaluation: Cell<bool>,
}

/// Resolve the loader's output into the final project graph.
pub fn resolve(
  load: LoadResult,
  pool: Rc<RefCell<ItemPool>>,
  evaluator: &Evaluator,
  params: &SetupParameters,
  progress: &dyn ProgressObserver,
) -> Result<ResolvedProject, LoadError> {
  let mut resolver = ProjectResolver {
    pool,
    evaluator,
    params,
    progress,
    load,
    products: Vec::new(),
    product_items: Vec::new(),
    product_paths: Vec::new(),
    products_by_name: HashMap::new(),
    products_by_type: HashMap::new(),
    exports: HashMap::new(),
    disable_cached_evaluation: Cell::new(false),
  };
  progress.set_maximum(resolver.load.product_infos.len());

  let root_item = resolver.load.root;
  let mut root = resolver.resolve_project(root_item, &[])?;
  make_subproject_names_unique(&mut root);
  resolver.resolve_product_dependencies()?;
  resolver.finish_products();
  resolver.check_duplicate_product_names()?;
  resolver.verify_acyclic()?;

  Ok(ResolvedProject {
    build_directory: params.build_directory(),
    profile_configs: std::mem::take(&mut resolver.load.profile_configs),
    build_system_files: std::mem::take(&mut resolver.load.files_read),
    products: resolver.products,
    root,
  })
}

impl ProjectResolver<'_> {
  pub(crate) fn check_cancelation(&self) -> Result<(), LoadError> {
    if self.progress.canceled() {
      return Err(LoadError::Canceled {
        configuration: self.params.configuration_id(),
      });
    }
    Ok(())
  }

  fn resolve_project(
    &mut self,
    item: ItemId,
    project_path: &[usize],
  ) -> Result<ProjectNode, LoadError> {
    self.check_cancelation()?;
    let location = self.pool.borrow().get(item).location.clone();
    let mut name = self
      .evaluator
      .string_value(item, "name")?
      .unwrap_or_default();
    if name.is_empty() {
      name = paths::complete_base_name(&location.file);
    }
    let enabled = !self.load.disabled_items.contains(&item)
      && self.evaluator.bool_value(item, "condition", true)?;

    let mut node = ProjectNode {
      name,
      enabled,
      location,
      properties: VariantMap::new(),
      products: Vec::new(),
      sub_projects: Vec::new(),
    };
    if !enabled {
      return Ok(node);
    }
    debug!(project = %node.name, "resolving project");
    self.evaluate_properties(item, item, None, &mut node.properties, true)?;
    node.properties.remove("modules");

    let mut project_rules = Vec::new();
    let mut project_taggers = Vec::new();
    let children = self.pool.borrow().get(item).children.clone();
    for child in children {
      let child_type = self.pool.borrow().get(child).item_type;
      match child_type {
        ItemType::Project => {
          let mut child_path = project_path.to_vec();
          child_path.push(node.sub_projects.len());
          let sub = self.resolve_project(child, &child_path)?;
          node.sub_projects.push(sub);
        }
        ItemType::SubProject => {
          let mut child_path = project_path.to_vec();
          child_path.push(node.sub_projects.len());
          if let Some(sub) = self.resolve_sub_project(child, &child_path)? {
            node.sub_projects.push(sub);
          }
        }
        ItemType::Product => {
          let id = self.resolve_product(child, project_path)?;
          node.products.push(id);
        }
        ItemType::Rule => {
          if let Some(rule) = self.resolve_rule(child, None)? {
            project_rules.push(rule);
          }
        }
        ItemType::FileTagger => project_taggers.push(self.resolve_file_tagger(child)?),
        _ => {}
      }
    }

    // Project-level rules and taggers are inherited by every product of
    // this project.
    for &id in &node.products {
      self.products[id].rules.extend(project_rules.iter().cloned());
      self.products[id]
        .file_taggers
        .extend(project_taggers.iter().cloned());
    }
    Ok(node)
  }

  fn resolve_sub_project(
    &mut self,
    item: ItemId,
    project_path: &[usize],
  ) -> Result<Option<ProjectNode>, LoadError> {
    let project_child = self.pool.borrow().find_child(item, ItemType::Project);
    if let Some(project_item) = project_child {
      return self.resolve_project(project_item, project_path).map(Some);
    }
    // No Project child means the subproject was disabled during loading.
    let mut node = ProjectNode {
      enabled: false,
      location: self.pool.borrow().get(item).location.clone(),
      ..ProjectNode::default()
    };
    if let Some(properties_item) = self.pool.borrow().find_child(item, ItemType::Properties) {
      node.name = self
        .evaluator
        .string_value(properties_item, "name")?
        .unwrap_or_default();
    }
    Ok(Some(node))
  }

  fn resolve_product(
    &mut self,
    item: ItemId,
    project_path: &[usize],
  ) -> Result<ProductId, LoadError> {
    self.check_cancelation()?;
    let location = self.pool.borrow().get(item).location.clone();
    let name = self
      .evaluator
      .string_value(item, "name")?
      .unwrap_or_default();
    let profile = self
      .evaluator
      .string_value(item, "profile")?
      .expect("the loader pins a profile on every product");
    let multiplexed = self.evaluator.bool_value(item, "multiplexed", false)?;
    let enabled = self.evaluator.bool_value(item, "condition", true)?;
    debug!(product = %name, profile = %profile, enabled, "resolving product");

    let id = self.products.len();
    self.products.push(ResolvedProduct {
      name: name.clone(),
      profile: profile.clone(),
      multiplexed,
      enabled,
      location,
      ..ResolvedProduct::default()
    });
    self.product_items.push(item);
    self.product_paths.push(project_path.to_vec());
    self
      .products_by_name
      .insert((name.clone(), profile.clone()), id);

    if !enabled {
      // Disabled products stop here and contribute no artifacts.
      self.progress.increment();
      return Ok(id);
    }

    let modules = self.pool.borrow().get(item).modules.clone();
    if modules
      .iter()
      .any(|m| m.name.len() == 1 && m.name[0] == name)
    {
      let location = self.products[id].location.clone();
      return Err(LoadError::duplicate(
        format!("the product name '{}' collides with a module name", name),
        location,
      ));
    }

    let source_directory = PathBuf::from(
      self
        .evaluator
        .string_value(item, "sourceDirectory")?
        .unwrap_or_default(),
    );
    let build_directory = PathBuf::from(
      self
        .evaluator
        .string_value(item, "buildDirectory")?
        .unwrap_or_default(),
    );
    let destination_directory = match self.evaluator.string_value(item, "destinationDirectory")? {
      Some(dir) if !dir.is_empty() => paths::resolve(&self.params.build_directory(), &dir),
      _ => build_directory.clone(),
    };

    let mut config = self.create_product_config(item)?;
    let modules_value = config
      .remove("modules")
      .unwrap_or_else(|| VariantValue::Object(VariantMap::new()));
    config.insert(
      "destinationDirectory".into(),
      destination_directory.display().to_string().into(),
    );
    let mut module_properties = VariantMap::new();
    module_properties.insert("modules".into(), modules_value);

    {
      let product = &mut self.products[id];
      product.target_name = self
        .evaluator
        .string_value(item, "targetName")?
        .unwrap_or_else(|| name.clone());
      product.file_tags = self.evaluator.file_tags_value(item, "type")?.0;
      product.source_directory = source_directory.clone();
      product.build_directory = build_directory.clone();
      product.destination_directory = destination_directory;
      product.product_properties = config;
      product.module_properties = PropertyMap::new(module_properties);
    }

    let mut state = ProductState {
      id,
      source_directory,
      build_directory,
      source_artifact_locations: HashMap::new(),
      artifact_properties_per_filter: HashMap::new(),
      additional_file_tags: FileTags::new(),
    };

    // A product-level `files` property acts as an anonymous group.
    if let Some(fake_group) = self.make_fake_group(item, &name) {
      self.resolve_group(fake_group, &mut state)?;
    }

    let children = self.pool.borrow().get(item).children.clone();
    for child in children {
      let child_type = self.pool.borrow().get(child).item_type;
      match child_type {
        ItemType::Group => self.resolve_group(child, &mut state)?,
        ItemType::Rule => {
          if let Some(rule) = self.resolve_rule(child, None)? {
            self.products[id].rules.push(rule);
          }
        }
        ItemType::FileTagger => {
          let tagger = self.resolve_file_tagger(child)?;
          self.products[id].file_taggers.push(tagger);
        }
        ItemType::Transformer => {
          if let Some(transformer) = self.resolve_transformer(child, &state, None)? {
            self.products[id].transformers.push(transformer);
          }
        }
        ItemType::Export => self.resolve_export(child, &state)?,
        _ => {}
      }
    }

    self.resolve_modules(item, &mut state)?;
    self.products[id]
      .file_tags
      .extend(state.additional_file_tags.iter().cloned());

    for tag in self.products[id].file_tags.clone() {
      self.products_by_type.entry(tag).or_default().push(id);
    }

    // Transformer outputs pick up matching artifact properties.
    let artifact_properties = self.products[id].artifact_properties.clone();
    for transformer in &mut self.products[id].transformers {
      for artifact in &mut transformer.outputs {
        for properties in &artifact_properties {
          if !artifact.file_tags.is_disjoint(&properties.file_tags_filter) {
            artifact.properties = properties.properties.clone();
          }
        }
      }
    }

    self.progress.increment();
    Ok(id)
  }

  /// Synthesize the anonymous group for a product-level `files` property.
  fn make_fake_group(&self, item: ItemId, product_name: &str) -> Option<ItemId> {
    let mut pool = self.pool.borrow_mut();
    let files = pool.property(item, "files").map(|(_, v)| v.clone())?;
    let exclude_files = pool.property(item, "excludeFiles").map(|(_, v)| v.clone());
    let location = pool.get(item).location.clone();
    let group = pool.create(ItemType::Group, location);
    pool.set_scope(group, item);
    pool.set_property(group, "name", Value::Variant(product_name.into()));
    pool.set_property(group, "files", files);
    if let Some(exclude_files) = exclude_files {
      pool.set_property(group, "excludeFiles", exclude_files);
    }
    pool.set_property(group, "overrideTags", Value::Variant(false.into()));
    Some(group)
  }

  /// Breadth-first module resolution: the product might set properties on a
  /// module whose own dependencies must then be evaluated in that context.
  fn resolve_modules(&mut self, item: ItemId, state: &mut ProductState) -> Result<(), LoadError> {
    let mut queue: std::collections::VecDeque<ModuleRef> =
      self.pool.borrow().get(item).modules.clone().into();
    let mut seen = HashSet::new();
    while let Some(module) = queue.pop_front() {
      self.check_cancelation()?;
      let full_name = full_module_name(&module.name);
      if !seen.insert(full_name.clone()) {
        continue;
      }
      queue.extend(self.pool.borrow().get(module.item).modules.clone());
      if !self.evaluator.bool_value(module.item, "present", true)? {
        continue;
      }

      let (additional_types, _) = self
        .evaluator
        .file_tags_value(module.item, "additionalProductTypes")?;
      state.additional_file_tags.extend(additional_types);

      let module_dependencies = self
        .pool
        .borrow()
        .get(module.item)
        .modules
        .iter()
        .map(|m| full_module_name(&m.name))
        .collect();

      let children = self.pool.borrow().get(module.item).children.clone();
      for child in children {
        let child_type = self.pool.borrow().get(child).item_type;
        match child_type {
          ItemType::Rule => {
            if let Some(rule) = self.resolve_rule(child, Some(&full_name))? {
              self.products[state.id].rules.push(rule);
            }
          }
          ItemType::FileTagger => {
            let tagger = self.resolve_file_tagger(child)?;
            self.products[state.id].file_taggers.push(tagger);
          }
          ItemType::Transformer => {
            if let Some(transformer) = self.resolve_transformer(child, state, Some(&full_name))? {
              self.products[state.id].transformers.push(transformer);
            }
          }
          ItemType::Scanner => {
            if let Some(scanner) = self.resolve_scanner(child, Some(&full_name))? {
              self.products[state.id].scanners.push(scanner);
            }
          }
          _ => {}
        }
      }

      self.products[state.id].modules.push(ResolvedModule {
        name: full_name,
        module_dependencies,
      });
    }
    self.products[state.id]
      .modules
      .sort_by(|a, b| a.name.cmp(&b.name));
    Ok(())
  }

  /// Final per-product pass: apply file taggers, match artifact properties,
  /// and let a positive `weft.install` imply the `installable` tag.
  fn finish_products(&mut self) {
    for product in &mut self.products {
      if !product.enabled {
        continue;
      }
      let taggers = product.file_taggers.clone();
      let artifact_properties = product.artifact_properties.clone();
      for group in &mut product.groups {
        if !group.enabled {
          continue;
        }
        for artifact in group.all_files_mut() {
          if !artifact.override_file_tags || artifact.file_tags.is_empty() {
            let file_name = artifact
              .file_path
              .file_name()
              .map(|n| n.to_string_lossy().into_owned())
              .unwrap_or_default();
            for tagger in &taggers {
              if tagger
                .patterns
                .iter()
                .any(|p| groups::matches_pattern(p, &file_name))
              {
                artifact.file_tags.extend(tagger.file_tags.iter().cloned());
              }
            }
            if artifact.file_tags.is_empty() {
              artifact.file_tags.insert(UNKNOWN_FILE_TAG.to_owned());
            }
          }
          for properties in &artifact_properties {
            if !artifact.file_tags.is_disjoint(&properties.file_tags_filter) {
              artifact.properties = properties.properties.clone();
            }
          }
          if artifact.properties.module_property(crate::consts::BASE_MODULE_NAME, "install")
            == Some(VariantValue::Bool(true))
          {
            artifact.file_tags.insert(INSTALLABLE_TAG.to_owned());
          }
        }
      }
    }
  }

  fn check_duplicate_product_names(&self) -> Result<(), LoadError> {
    let mut seen: HashMap<String, &ResolvedProduct> = HashMap::new();
    for product in &self.products {
      let unique_name = product.unique_name();
      if let Some(first) = seen.get(unique_name.as_str()) {
        return Err(LoadError::duplicate(
          format!(
            "duplicate product name '{}' (first product defined at {})",
            unique_name, first.location
          ),
          product.location.clone(),
        ));
      }
      seen.insert(unique_name, product);
    }
    Ok(())
  }

  /// The final inter-product dependency graph must be a DAG.
  fn verify_acyclic(&self) -> Result<(), LoadError> {
    use petgraph::algo::toposort;
    use petgraph::graph::DiGraph;

    let mut graph = DiGraph::<ProductId, ()>::new();
    let nodes: Vec<_> = (0..self.products.len()).map(|id| graph.add_node(id)).collect();
    for (id, product) in self.products.iter().enumerate() {
      for &dependency in &product.dependencies {
        graph.add_edge(nodes[dependency], nodes[id], ());
      }
    }
    toposort(&graph, None).map_err(|cycle| {
      let product = &self.products[graph[cycle.node_id()]];
      LoadError::Cycle {
        message: format!(
          "cyclic dependency involving product '{}'",
          product.unique_name()
        ),
        location: product.location.clone(),
      }
    })?;
    Ok(())
  }
}

/// Sibling sub-projects with identical names are disambiguated with
/// underscore suffixes.
fn make_subproject_names_unique(node: &mut ProjectNode) {
  let mut seen = HashSet::new();
  for sub in &mut node.sub_projects {
    while !seen.insert(sub.name.clone()) {
      sub.name.push('_');
    }
    make_subproject_names_unique(sub);
  }
}
