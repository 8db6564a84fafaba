//! Probe resolution.
//!
//! A Probe's `configure` expression runs exactly once per probe item, with
//! every other declared property pre-bound into a mutable bindings table.
//! Properties whose value changed during the run are persisted back onto
//! the probe.

use tracing::debug;

use super::ModuleLoader;
use crate::error::LoadError;
use crate::item::value::{Value, VariantMap};
use crate::item::{ItemId, ItemType};

impl ModuleLoader<'_> {
  /// Apply probe resolution to every Probe nested anywhere under an item
  /// (used for module instances after attachment).
  pub(crate) fn resolve_probes(&self, item: ItemId) -> Result<(), LoadError> {
    let children = self.pool.borrow().get(item).children.clone();
    for child in children {
      if self.pool.borrow().get(child).item_type == ItemType::Probe {
        self.resolve_probe(item, child)?;
      } else {
        self.resolve_probes(child)?;
      }
    }
    Ok(())
  }

  pub(crate) fn resolve_probe(&self, _parent: ItemId, probe: ItemId) -> Result<(), LoadError> {
    if !self.probes_resolved.borrow_mut().insert(probe) {
      return Ok(());
    }
    let location = self.pool.borrow().get(probe).location.clone();
    let configure = {
      let pool = self.pool.borrow();
      pool.property(probe, "configure").map(|(_, v)| v.clone())
    };
    let Some(Value::Thunk(configure)) = configure else {
      return Err(LoadError::invalid("Probe.configure must be set", location));
    };

    // Bind every other property of the probe's chain into the table.
    let names: Vec<String> = {
      let pool = self.pool.borrow();
      let mut names = Vec::new();
      let mut current = Some(probe);
      while let Some(item) = current {
        for name in pool.get(item).properties.keys() {
          if name != "configure" && !names.contains(name) {
            names.push(name.clone());
          }
        }
        current = pool.get(item).prototype;
      }
      names
    };
    let mut bindings = VariantMap::new();
    for name in &names {
      let outcome = self.evaluator.evaluate(probe, name)?;
      bindings.insert(
        name.clone(),
        outcome.value.unwrap_or(serde_json::Value::Null),
      );
    }

    debug!(location = %location, "running probe");
    let updated = self.evaluator.call_configure(&configure, &bindings)?;
    for (name, new_value) in updated {
      if bindings.get(&name) != Some(&new_value) {
        self
          .pool
          .borrow_mut()
          .set_property(probe, name, Value::Variant(new_value));
      }
    }
    Ok(())
  }
}
