//! Cross-product dependency resolution.
//!
//! Dependency intents (`productTypes` queries and wildcard-profile names)
//! are bound to concrete products by scanning the already-resolved set. The
//! binding runs to a fixed point because resolving one product's
//! dependencies can surface further exported dependencies transitively. For
//! every resolved edge the dependency's merged Export configuration is
//! re-evaluated in the depending product's own context and copied into its
//! module-property map and into every artifact property map that does not
//! share that map instance.

use std::collections::HashSet;

use tracing::debug;

use super::ProjectResolver;
use crate::error::LoadError;
use crate::graph::ProductId;
use crate::item::ItemId;
use crate::item::value::{Value, VariantMap, merge_variant_maps};
use crate::loader::Dependency;

impl ProjectResolver<'_> {
  pub(crate) fn resolve_product_dependencies(&mut self) -> Result<(), LoadError> {
    // Phase one: expand intents until no product gains a new dependency.
    loop {
      let mut added = false;
      for id in 0..self.products.len() {
        if !self.products[id].enabled {
          continue;
        }
        for used in self.get_product_dependencies(id)? {
          if self.add_used_products(id, used) {
            added = true;
          }
        }
      }
      if !added {
        break;
      }
    }

    // Phase two: wire the edges and propagate exported configuration.
    for id in 0..self.products.len() {
      if !self.products[id].enabled {
        continue;
      }
      let mut used_list = self.get_product_dependencies(id)?;
      used_list.sort_unstable();
      used_list.dedup();
      for used in used_list {
        self.products[id].dependencies.insert(used);
        self.propagate_exports(id, used)?;
      }
    }
    Ok(())
  }

  /// Resolve the current dependency intents of one product into product
  /// ids. Type- and wildcard-intents are consumed and replaced by the
  /// concrete dependencies they matched.
  fn get_product_dependencies(&mut self, id: ProductId) -> Result<Vec<ProductId>, LoadError> {
    let item = self.product_items[id];
    let intents = match self.load.product_infos.get_mut(&item) {
      Some(info) => std::mem::take(&mut info.used_products),
      None => return Ok(Vec::new()),
    };
    let consumer_path = self.product_paths[id].clone();

    let mut used = Vec::new();
    let mut kept = Vec::new();
    for dependency in intents {
      if !dependency.product_types.is_empty() {
        for tag in &dependency.product_types {
          let candidates = self.products_by_type.get(tag).cloned().unwrap_or_default();
          for candidate in candidates {
            if candidate == id || !self.products[candidate].enabled {
              continue;
            }
            if dependency.limit_to_subproject
              && !self.product_paths[candidate].starts_with(&consumer_path)
            {
              continue;
            }
            used.push(candidate);
            kept.push(Dependency {
              name: self.products[candidate].name.clone(),
              profile: self.products[candidate].profile.clone(),
              product_types: Vec::new(),
              limit_to_subproject: false,
              location: dependency.location.clone(),
            });
          }
        }
        continue;
      }

      if dependency.profile == "*" {
        let mut matched = false;
        for candidate in 0..self.products.len() {
          if candidate == id
            || self.products[candidate].name != dependency.name
            || !self.products[candidate].enabled
          {
            continue;
          }
          if dependency.limit_to_subproject
            && !self.product_paths[candidate].starts_with(&consumer_path)
          {
            continue;
          }
          used.push(candidate);
          matched = true;
          kept.push(Dependency {
            name: dependency.name.clone(),
            profile: self.products[candidate].profile.clone(),
            product_types: Vec::new(),
            limit_to_subproject: false,
            location: dependency.location.clone(),
          });
        }
        if !matched {
          // The deferred name matched neither a module nor any product.
          return Err(LoadError::MissingModule {
            name: dependency.name.clone(),
            location: dependency.location.clone(),
          });
        }
        continue;
      }

      let key = (dependency.name.clone(), dependency.profile.clone());
      match self.products_by_name.get(&key) {
        Some(&candidate) => {
          used.push(candidate);
          kept.push(dependency);
        }
        None => {
          return Err(LoadError::MissingModule {
            name: format!("{} (profile '{}')", dependency.name, dependency.profile),
            location: dependency.location.clone(),
          });
        }
      }
    }

    if let Some(info) = self.load.product_infos.get_mut(&item) {
      info.used_products = kept;
    }
    Ok(used)
  }

  /// Make the export-declared dependencies of `used` visible to `consumer`.
  /// Returns whether anything new was added.
  fn add_used_products(&mut self, consumer: ProductId, used: ProductId) -> bool {
    let used_item = self.product_items[used];
    let from_exports = self
      .load
      .product_infos
      .get(&used_item)
      .map(|info| info.used_products_from_exports.clone())
      .unwrap_or_default();
    if from_exports.is_empty() {
      return false;
    }
    let consumer_item = self.product_items[consumer];
    let Some(info) = self.load.product_infos.get_mut(&consumer_item) else {
      return false;
    };
    let existing: HashSet<String> = info
      .used_products
      .iter()
      .map(Dependency::unique_name)
      .collect();
    let mut added = false;
    for dependency in from_exports {
      if !existing.contains(&dependency.unique_name()) {
        info.used_products.push(dependency);
        added = true;
      }
    }
    added
  }

  /// Re-evaluate the dependency's Export configuration using the consumer's
  /// own context and copy it into the consumer's property maps.
  fn propagate_exports(&mut self, consumer: ProductId, used: ProductId) -> Result<(), LoadError> {
    let Some(context) = self.exports.get(&used) else {
      return Ok(());
    };
    let export_item = context.item;
    let export_rules = context.rules.clone();
    let export_taggers = context.file_taggers.clone();
    let exporting_values = context.module_values.clone();

    self.products[consumer].rules.extend(export_rules);
    self.products[consumer].file_taggers.extend(export_taggers);

    // Expressions like "import this path into my evaluation scope" must see
    // the consumer, so the export item's `product` references are swapped
    // for the duration of the evaluation and caching is disabled.
    let consumer_item = self.product_items[consumer];
    let saved = self.replace_product(export_item, consumer_item);
    self.evaluator.set_caching_enabled(false);
    self.disable_cached_evaluation.set(true);
    let evaluated = (|| {
      let mut exported = self.evaluate_module_values(export_item, true)?;
      let mut direct = VariantMap::new();
      self.evaluate_properties(export_item, export_item, None, &mut direct, true)?;
      for (key, value) in direct {
        exported.insert(key, value);
      }
      Ok::<VariantMap, LoadError>(exported)
    })();
    self.disable_cached_evaluation.set(false);
    self.evaluator.set_caching_enabled(true);
    self.restore_product(saved);
    let mut exported = evaluated?;

    // Direct Export properties keep the exporting product's evaluation.
    merge_variant_maps(&mut exported, &exporting_values);

    let has_content = exported.iter().any(|(key, value)| {
      key != "modules"
        || value
          .as_object()
          .is_some_and(|modules| !modules.is_empty())
    });
    if !has_content {
      return Ok(());
    }

    let used_name = self.products[used].unique_name();
    debug!(consumer = %self.products[consumer].unique_name(), exported = %used_name, "propagating exported configuration");
    let product_map = self.products[consumer].module_properties.clone();
    product_map.insert_module_config(&used_name, &exported);
    for group in &mut self.products[consumer].groups {
      for artifact in group.all_files_mut() {
        if !artifact.properties.shares_with(&product_map) {
          artifact.properties.insert_module_config(&used_name, &exported);
        }
      }
    }
    Ok(())
  }

  /// Swap every reachable `product` scope entry of the export item for the
  /// consumer, remembering the original values.
  fn replace_product(&self, item: ItemId, consumer_item: ItemId) -> Vec<(ItemId, Value)> {
    let mut seen = HashSet::new();
    let mut saved = Vec::new();
    self.replace_product_impl(item, consumer_item, &mut seen, &mut saved);
    saved
  }

  fn replace_product_impl(
    &self,
    item: ItemId,
    consumer_item: ItemId,
    seen: &mut HashSet<ItemId>,
    saved: &mut Vec<(ItemId, Value)>,
  ) {
    if !seen.insert(item) {
      return;
    }
    let old = self.pool.borrow().local_property(item, "product").cloned();
    if let Some(old) = old {
      saved.push((item, old));
      self
        .pool
        .borrow_mut()
        .set_property(item, "product", Value::Item(consumer_item));
    }
    let (scope, modules, children) = {
      let pool = self.pool.borrow();
      let it = pool.get(item);
      (
        it.scope,
        it.modules.iter().map(|m| m.item).collect::<Vec<_>>(),
        it.children.clone(),
      )
    };
    if let Some(scope) = scope {
      self.replace_product_impl(scope, consumer_item, seen, saved);
    }
    for module in modules {
      self.replace_product_impl(module, consumer_item, seen, saved);
    }
    for child in children {
      self.replace_product_impl(child, consumer_item, seen, saved);
    }
  }

  fn restore_product(&self, saved: Vec<(ItemId, Value)>) {
    let mut pool = self.pool.borrow_mut();
    for (item, value) in saved {
      pool.set_property(item, "product", value);
    }
  }
}
