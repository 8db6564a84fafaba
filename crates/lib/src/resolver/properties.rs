//! Property evaluation with precedence and caching.
//!
//! A product's module properties are evaluated breadth-first over its
//! modules. Scalar properties are first-found-wins along the prototype
//! chain; list-typed properties concatenate contributions from every layer,
//! because higher layers commonly add to inherited lists rather than
//! replace them. Non-list evaluations are memoized per (module full name,
//! property name) within one product; the memo is skipped for list types,
//! and the evaluator itself never caches product-referencing expressions.
//!
//! Path-typed values resolve to absolute, cleaned paths against the
//! directory of the file that defined them, at the moment of evaluation.

use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap, VecDeque};

use crate::error::LoadError;
use crate::item::value::{PropertyType, Value, VariantMap, VariantValue};
use crate::item::{ItemId, ModuleRef, full_module_name};
use crate::util::paths;

use super::ProjectResolver;

pub(crate) struct GlobalEntry {
  value: VariantValue,
  /// True when the entry came from a literal or from a property the module
  /// instance sets itself; such entries win even over own properties.
  strong: bool,
}

type Memo = RefCell<HashMap<String, GlobalEntry>>;

impl ProjectResolver<'_> {
  /// Evaluate the full `modules` map of an item (product, group, or merged
  /// Export item). With `lookup_prototype` false only locally set
  /// definitions contribute, which is how the direct property assignments of
  /// an Export item are captured.
  pub(crate) fn evaluate_module_values(
    &self,
    item: ItemId,
    lookup_prototype: bool,
  ) -> Result<VariantMap, LoadError> {
    let memo: Memo = RefCell::new(HashMap::new());
    let mut info: HashMap<ItemId, (String, VariantMap)> = HashMap::new();

    // Breadth-first, so that a product's own setting of a module property is
    // evaluated (and memoized) before the module's dependencies read it.
    let mut queue: VecDeque<ModuleRef> = self.pool.borrow().get(item).modules.clone().into();
    while let Some(module) = queue.pop_front() {
      self.check_cancelation()?;
      if info.contains_key(&module.item) {
        continue;
      }
      let full_name = full_module_name(&module.name);
      let own_properties = self.own_properties_set(module.item);
      let mut map = VariantMap::new();
      self.evaluate_properties(
        module.item,
        module.item,
        Some((&full_name, &own_properties, &memo)),
        &mut map,
        lookup_prototype,
      )?;
      queue.extend(self.pool.borrow().get(module.item).modules.clone());
      info.insert(module.item, (full_name, map));
    }

    let mut modules = VariantMap::new();
    self.gather_module_values(item, &info, &mut modules);
    let mut result = VariantMap::new();
    result.insert("modules".into(), VariantValue::Object(modules));
    Ok(result)
  }

  fn gather_module_values(
    &self,
    item: ItemId,
    info: &HashMap<ItemId, (String, VariantMap)>,
    out: &mut VariantMap,
  ) {
    let modules = self.pool.borrow().get(item).modules.clone();
    for module in modules {
      let Some((full_name, properties)) = info.get(&module.item) else {
        continue;
      };
      let mut nested = VariantMap::new();
      self.gather_module_values(module.item, info, &mut nested);
      let mut map = properties.clone();
      map.insert("modules".into(), VariantValue::Object(nested));
      out.insert(full_name.clone(), VariantValue::Object(map));
    }
  }

  /// The product's own configuration: its module values plus its evaluated
  /// own properties.
  pub(crate) fn create_product_config(&self, item: ItemId) -> Result<VariantMap, LoadError> {
    let mut config = self.evaluate_module_values(item, true)?;
    self.evaluate_properties(item, item, None, &mut config, true)?;
    Ok(config)
  }

  /// Evaluate the properties visible on `context`, iterating the given
  /// container level and optionally recursing into its prototype chain.
  pub(crate) fn evaluate_properties(
    &self,
    context: ItemId,
    container: ItemId,
    memo: Option<(&str, &BTreeSet<String>, &Memo)>,
    result: &mut VariantMap,
    lookup_prototype: bool,
  ) -> Result<(), LoadError> {
    self.check_cancelation()?;
    let (properties, container_dir, prototype) = {
      let pool = self.pool.borrow();
      let it = pool.get(container);
      (
        it.properties.clone(),
        paths::location_dir(&it.location),
        it.prototype,
      )
    };

    for (key, value) in &properties {
      let ptype = self.pool.borrow().declared_type(context, key);
      let is_list = ptype.is_some_and(PropertyType::is_list);
      if !is_list && result.contains_key(key) {
        continue;
      }

      let (evaluated, strong) = match value {
        Value::Item(_) | Value::Builtin(_) => continue,
        Value::Variant(v) => (v.clone(), true),
        Value::Thunk(thunk) => {
          // Values shadowed for every product by another instance of the
          // same module are shared through the memo.
          if let Some((module_name, own_properties, memo)) = memo
            && !is_list
          {
            let full_key = format!("{}.{}", module_name, key);
            if let Some(entry) = memo.borrow().get(&full_key)
              && (!own_properties.contains(key) || entry.strong)
            {
              result.insert(key.clone(), entry.value.clone());
              continue;
            }
          }
          let cache_name = if is_list { None } else { Some(key.as_str()) };
          let bypass = self.disable_cached_evaluation.get()
            && matches!(ptype, Some(PropertyType::Path | PropertyType::PathList));
          if bypass {
            self.evaluator.set_caching_enabled(false);
          }
          let outcome = self.evaluator.evaluate_value(context, cache_name, value);
          if bypass {
            self.evaluator.set_caching_enabled(true);
          }
          let outcome = outcome?;
          let strong = memo
            .map(|(_, own, _)| own.contains(key))
            .unwrap_or(false);
          let dir = &thunk.dir;
          let converted = convert_value(outcome.value.unwrap_or(VariantValue::Null), ptype, dir);
          (converted, strong)
        }
      };

      let evaluated = match value {
        // Literals resolve against the defining file too.
        Value::Variant(_) => convert_value(evaluated, ptype, &container_dir),
        _ => evaluated,
      };

      if is_list {
        append_list(result, key, &evaluated);
        continue;
      }
      if let Some((module_name, _, memo)) = memo {
        memo.borrow_mut().insert(
          format!("{}.{}", module_name, key),
          GlobalEntry {
            value: evaluated.clone(),
            strong,
          },
        );
      }
      result.insert(key.clone(), evaluated);
    }

    if lookup_prototype && let Some(prototype) = prototype {
      self.evaluate_properties(context, prototype, memo, result, true)?;
    }
    Ok(())
  }

  /// Property names set locally anywhere along the module-instance part of
  /// the chain (group instance, product instance, ...).
  fn own_properties_set(&self, item: ItemId) -> BTreeSet<String> {
    let pool = self.pool.borrow();
    let mut names = BTreeSet::new();
    let mut current = Some(item);
    while let Some(id) = current {
      let it = pool.get(id);
      names.extend(it.properties.keys().cloned());
      current = it.prototype.filter(|&p| pool.get(p).is_module_instance);
    }
    names
  }
}

/// Coerce an evaluated value according to its declared type: paths become
/// absolute and cleaned, single strings become one-element lists.
fn convert_value(
  value: VariantValue,
  ptype: Option<PropertyType>,
  dir: &std::path::Path,
) -> VariantValue {
  match ptype {
    Some(PropertyType::Path) => match value {
      VariantValue::String(s) if !s.is_empty() => {
        VariantValue::String(paths::resolve(dir, &s).display().to_string())
      }
      other => other,
    },
    Some(PropertyType::PathList) => {
      let entries = match value {
        VariantValue::String(s) => vec![VariantValue::String(s)],
        VariantValue::Array(items) => items,
        other => return other,
      };
      VariantValue::Array(
        entries
          .into_iter()
          .map(|entry| match entry {
            VariantValue::String(s) if !s.is_empty() => {
              VariantValue::String(paths::resolve(dir, &s).display().to_string())
            }
            other => other,
          })
          .collect(),
      )
    }
    Some(PropertyType::StringList) => match value {
      VariantValue::String(s) => VariantValue::Array(vec![VariantValue::String(s)]),
      other => other,
    },
    _ => value,
  }
}

/// Concatenate a layer's list contribution onto what more specific layers
/// already produced.
fn append_list(result: &mut VariantMap, key: &str, value: &VariantValue) {
  let additions: Vec<VariantValue> = match value {
    VariantValue::Null => return,
    VariantValue::Array(items) => items.clone(),
    other => vec![other.clone()],
  };
  match result.get_mut(key) {
    Some(VariantValue::Array(existing)) => existing.extend(additions),
    _ => {
      result.insert(key.to_owned(), VariantValue::Array(additions));
    }
  }
}
