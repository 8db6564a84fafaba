//! Product multiplexing.
//!
//! A product with N profiles becomes N product items, each pinned to one
//! profile through a synthetic `profile` property. This runs before
//! dependency resolution because profile selection affects module defaults.

use tracing::debug;

use super::{ModuleLoader, ProductContext};
use crate::consts::BASE_MODULE_NAME;
use crate::error::LoadError;
use crate::item::ItemId;
use crate::item::value::Value;
use crate::util::paths;

impl ModuleLoader<'_> {
  /// Evaluate a product's `profiles` list and splice in one clone per
  /// additional profile. Returns the clones; the original item is pinned to
  /// the first profile.
  pub(crate) fn multiplex_product(
    &self,
    dummy_ctx: &mut ProductContext,
    product_item: ItemId,
  ) -> Result<Vec<ItemId>, LoadError> {
    // Temporarily attach the base module so that evaluating `name` and
    // `profiles` can read base-module properties. Restored below because
    // the real attachment happens per profile during dependency resolution.
    let saved_base = {
      let pool = self.pool.borrow();
      pool.local_property(product_item, BASE_MODULE_NAME).cloned()
    };
    let mut dummy_deps = Vec::new();
    self.load_base_module(dummy_ctx, product_item, &mut dummy_deps)?;

    let location = self.pool.borrow().get(product_item).location.clone();
    let mut name = self
      .evaluator
      .string_value(product_item, "name")?
      .unwrap_or_default();
    if name.is_empty() {
      name = paths::complete_base_name(&location.file);
      self
        .pool
        .borrow_mut()
        .set_property(product_item, "name", Value::Variant(name.clone().into()));
    }
    // Overriding must happen before multiplexing so that `profiles` itself
    // is overridable.
    self.override_item_properties(product_item, &name)?;

    let profiles_set = self.pool.borrow().has_property(product_item, "profiles");
    let profiles = match self.evaluator.string_list_value(product_item, "profiles")? {
      Some(profiles) => {
        if profiles.is_empty() {
          return Err(LoadError::invalid(
            "the 'profiles' property cannot be an empty list",
            location,
          ));
        }
        profiles
      }
      None => {
        if profiles_set {
          return Err(LoadError::invalid(
            "the 'profiles' property cannot be an empty list",
            location,
          ));
        }
        vec![self.params.profile.clone()]
      }
    };
    for (index, profile) in profiles.iter().enumerate() {
      if profiles[..index].contains(profile) {
        return Err(LoadError::duplicate(
          format!(
            "the profile '{}' appears in the 'profiles' list twice, which is not allowed",
            profile
          ),
          location,
        ));
      }
      if !self.settings.profile_exists(profile) {
        return Err(LoadError::MissingProfile {
          name: profile.clone(),
        });
      }
    }

    // Unload the temporary base module again.
    {
      let mut pool = self.pool.borrow_mut();
      match saved_base {
        Some(value) => pool.set_property(product_item, BASE_MODULE_NAME, value),
        None => {
          pool.remove_property(product_item, BASE_MODULE_NAME);
        }
      }
      pool.get_mut(product_item).modules.clear();
    }
    self.valid_item_names.borrow_mut().remove(&product_item);

    let multiplexed = profiles.len() > 1;
    {
      let mut pool = self.pool.borrow_mut();
      pool.set_property(
        product_item,
        "profile",
        Value::Variant(profiles[0].clone().into()),
      );
      if multiplexed {
        pool.set_property(product_item, "multiplexed", Value::Variant(true.into()));
      }
    }

    let mut clones = Vec::new();
    for profile in &profiles[1..] {
      let clone = self.pool.borrow_mut().clone_subtree(product_item);
      self
        .pool
        .borrow_mut()
        .set_property(clone, "profile", Value::Variant(profile.clone().into()));
      debug!(product = %name, profile = %profile, "multiplexed product");
      clones.push(clone);
    }
    Ok(clones)
  }
}
