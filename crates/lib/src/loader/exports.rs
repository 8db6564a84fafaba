//! Export-item merging.
//!
//! A product may declare at most one effective Export item per source file.
//! All Export items are deep-merged into one synthetic Export item that is
//! re-attached to the product; its own `Depends` items are then resolved to
//! populate the dependencies visible to consumers of the product.

use std::collections::HashSet;

use super::{ModuleLoader, ProductContext, ProductInfo};
use crate::error::LoadError;
use crate::item::value::Value;
use crate::item::{ItemId, ItemType};

impl ModuleLoader<'_> {
  pub(crate) fn merge_export_items(
    &self,
    product_ctx: &mut ProductContext,
    export_items: Vec<ItemId>,
    info: &mut ProductInfo,
  ) -> Result<(), LoadError> {
    let merged = {
      let mut pool = self.pool.borrow_mut();
      let location = pool.get(product_ctx.item).location.clone();
      pool.create(ItemType::Export, location)
    };

    let mut files_with_export = HashSet::new();
    for export_item in &export_items {
      self.check_cancelation()?;
      let (location, children, properties) = {
        let pool = self.pool.borrow();
        let it = pool.get(*export_item);
        (it.location.clone(), it.children.clone(), it.properties.clone())
      };
      if !files_with_export.insert(location.file.clone()) {
        return Err(LoadError::duplicate(
          "multiple Export items in one product are prohibited",
          location,
        ));
      }
      {
        let mut pool = self.pool.borrow_mut();
        pool.get_mut(merged).location = location;
        for child in children {
          pool.add_child(merged, child);
        }
        for (name, value) in properties {
          merge_property(&mut pool, merged, &name, value);
        }
      }
    }

    // Replace the original Export children with the merged one.
    {
      let mut pool = self.pool.borrow_mut();
      let remaining: Vec<ItemId> = pool
        .get(product_ctx.item)
        .children
        .iter()
        .copied()
        .filter(|child| !export_items.contains(child))
        .collect();
      pool.set_children(product_ctx.item, remaining);
      pool.add_child(product_ctx.item, merged);
      pool.set_scope(merged, product_ctx.scope);
      pool.set_scope_for_descendants(merged, product_ctx.scope);
    }

    self.resolve_dependencies(product_ctx, merged, &mut info.used_products_from_exports)
  }
}

/// Deep-merge one property into the merged Export item: nested item-valued
/// properties merge recursively, scalar collisions are last-write-wins in
/// child declaration order.
fn merge_property(
  pool: &mut crate::item::ItemPool,
  dst: ItemId,
  name: &str,
  value: Value,
) {
  if let Value::Item(source_item) = value {
    let nested = pool.item_property(dst, name);
    let source_properties = pool.get(source_item).properties.clone();
    for (nested_name, nested_value) in source_properties {
      merge_property(pool, nested, &nested_name, nested_value);
    }
    return;
  }
  pool.set_property(dst, name, value);
}
