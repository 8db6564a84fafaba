//! Memoizing property evaluation.
//!
//! Expressions are Lua functions captured at load time. Each receives one
//! argument, a scope proxy: name lookup walks the item's own prototype chain
//! first, then the lexical scope chain (product scope, project scope, file
//! id scope). Results are memoized per (item, property).
//!
//! Evaluation is idempotent per item unless caching is disabled: the
//! resolver switches the cache off while re-evaluating exported
//! configuration in a consumer's context. Independently of that switch, any
//! evaluation that dereferenced the `product` scope entry is never cached,
//! so one product's values cannot leak into another's cache entries.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::rc::Rc;

use mlua::prelude::*;

use crate::error::LoadError;
use crate::item::value::{Builtin, Thunk, Value, VariantMap, VariantValue, variant_to_string_list};
use crate::item::{ItemId, ItemPool};
use crate::lua::globals::lua_to_variant;

/// Result of evaluating one property.
#[derive(Debug)]
pub struct EvalOutcome {
  /// The evaluated value; `None` when the property is not set anywhere in
  /// the chain (or is not representable as a variant).
  pub value: Option<VariantValue>,
  /// Whether the property was explicitly set to a non-null value.
  pub was_set: bool,
  /// Whether the evaluation dereferenced the owning product.
  pub used_product: bool,
}

pub struct Evaluator {
  shared: Rc<EvalShared>,
}

struct EvalShared {
  lua: Lua,
  pool: Rc<RefCell<ItemPool>>,
  cache: RefCell<HashMap<(ItemId, String), VariantValue>>,
  caching_enabled: Cell<bool>,
  product_touched: Cell<bool>,
  in_flight: RefCell<HashSet<(ItemId, String)>>,
}

/// Scope handle passed to expression functions.
struct ScopeProxy {
  item: ItemId,
  shared: Rc<EvalShared>,
}

impl LuaUserData for ScopeProxy {
  fn add_methods<M: LuaUserDataMethods<Self>>(methods: &mut M) {
    methods.add_meta_method(LuaMetaMethod::Index, |lua, this, key: String| {
      if key == "product" {
        this.shared.product_touched.set(true);
      }
      let Some((context, value)) = resolve_in_scope(&this.shared, this.item, &key) else {
        return Ok(LuaValue::Nil);
      };
      match value {
        Value::Item(id) => {
          let proxy = ScopeProxy {
            item: id,
            shared: this.shared.clone(),
          };
          Ok(LuaValue::UserData(lua.create_userdata(proxy)?))
        }
        Value::Variant(v) => variant_to_lua(lua, &v),
        Value::Thunk(thunk) => {
          let variant = evaluate_thunk(&this.shared, context, Some(&key), &thunk)
            .map_err(LuaError::external)?;
          variant_to_lua(lua, &variant)
        }
        Value::Builtin(Builtin::GetEnv) => {
          let getter = lua.create_function(|_, name: String| Ok(std::env::var(&name).ok()))?;
          Ok(LuaValue::Function(getter))
        }
      }
    });
  }
}

fn variant_to_lua(lua: &Lua, value: &VariantValue) -> LuaResult<LuaValue> {
  if value.is_null() {
    return Ok(LuaValue::Nil);
  }
  lua.to_value(value)
}

/// Look `key` up for `start`: own prototype chain first, then the lexical
/// scope chain. Returns the item the evaluation context should be.
fn resolve_in_scope(shared: &Rc<EvalShared>, start: ItemId, key: &str) -> Option<(ItemId, Value)> {
  let pool = shared.pool.borrow();
  if let Some((_, value)) = pool.property(start, key) {
    return Some((start, value.clone()));
  }
  let mut scope = pool.get(start).scope;
  while let Some(scope_item) = scope {
    if let Some((_, value)) = pool.property(scope_item, key) {
      return Some((scope_item, value.clone()));
    }
    scope = pool.get(scope_item).scope;
  }
  None
}

fn evaluate_thunk(
  shared: &Rc<EvalShared>,
  context: ItemId,
  cache_name: Option<&str>,
  thunk: &Thunk,
) -> Result<VariantValue, LoadError> {
  let cache_key = cache_name.map(|name| (context, name.to_owned()));

  if shared.caching_enabled.get()
    && let Some(key) = &cache_key
    && let Some(hit) = shared.cache.borrow().get(key)
  {
    return Ok(hit.clone());
  }

  if let Some(key) = &cache_key
    && !shared.in_flight.borrow_mut().insert(key.clone())
  {
    return Err(LoadError::Evaluation {
      message: format!("property '{}' depends on itself", key.1),
      location: thunk.location.clone(),
    });
  }

  let saved = shared.product_touched.replace(false);
  let call_result = (|| -> LuaResult<LuaValue> {
    let func: LuaFunction = shared.lua.registry_value(&thunk.key)?;
    let proxy = ScopeProxy {
      item: context,
      shared: shared.clone(),
    };
    func.call::<LuaValue>(proxy)
  })();

  if let Some(key) = &cache_key {
    shared.in_flight.borrow_mut().remove(key);
  }

  let used_product = shared.product_touched.get();
  shared.product_touched.set(saved || used_product);

  let lua_value = call_result.map_err(|e| LoadError::Evaluation {
    message: e.to_string(),
    location: thunk.location.clone(),
  })?;
  let variant = lua_to_variant(&lua_value).map_err(|e| LoadError::Evaluation {
    message: e.to_string(),
    location: thunk.location.clone(),
  })?;

  if shared.caching_enabled.get()
    && !used_product
    && let Some(key) = cache_key
  {
    shared.cache.borrow_mut().insert(key, variant.clone());
  }
  Ok(variant)
}

impl Evaluator {
  pub fn new(lua: Lua, pool: Rc<RefCell<ItemPool>>) -> Self {
    Self {
      shared: Rc::new(EvalShared {
        lua,
        pool,
        cache: RefCell::new(HashMap::new()),
        caching_enabled: Cell::new(true),
        product_touched: Cell::new(false),
        in_flight: RefCell::new(HashSet::new()),
      }),
    }
  }

  /// Switch result memoization on or off.
  pub fn set_caching_enabled(&self, enabled: bool) {
    self.shared.caching_enabled.set(enabled);
  }

  /// Evaluate `name` on `item` through the prototype chain.
  pub fn evaluate(&self, item: ItemId, name: &str) -> Result<EvalOutcome, LoadError> {
    let found = {
      let pool = self.shared.pool.borrow();
      pool.property(item, name).map(|(_, value)| value.clone())
    };
    match found {
      Some(value) => self.evaluate_value(item, Some(name), &value),
      None => Ok(EvalOutcome {
        value: None,
        was_set: false,
        used_product: false,
      }),
    }
  }

  /// Evaluate a specific value in the context of `item`. Used by the
  /// resolver to evaluate one prototype level's own definition when
  /// concatenating list-typed properties.
  pub fn evaluate_value(
    &self,
    item: ItemId,
    cache_name: Option<&str>,
    value: &Value,
  ) -> Result<EvalOutcome, LoadError> {
    let saved = self.shared.product_touched.replace(false);
    let result = match value {
      Value::Variant(v) => Ok(Some(v.clone())),
      Value::Thunk(thunk) => evaluate_thunk(&self.shared, item, cache_name, thunk).map(Some),
      Value::Item(_) | Value::Builtin(_) => Ok(None),
    };
    let used_product = self.shared.product_touched.get();
    self.shared.product_touched.set(saved || used_product);
    let value = result?;
    let was_set = matches!(&value, Some(v) if !v.is_null());
    Ok(EvalOutcome {
      value,
      was_set,
      used_product,
    })
  }

  pub fn bool_value(&self, item: ItemId, name: &str, default: bool) -> Result<bool, LoadError> {
    match self.evaluate(item, name)?.value {
      None | Some(VariantValue::Null) => Ok(default),
      Some(VariantValue::Bool(b)) => Ok(b),
      Some(other) => Err(LoadError::TypeConversion {
        name: name.to_owned(),
        value: other.to_string(),
      }),
    }
  }

  pub fn string_value(&self, item: ItemId, name: &str) -> Result<Option<String>, LoadError> {
    match self.evaluate(item, name)?.value {
      None | Some(VariantValue::Null) => Ok(None),
      Some(VariantValue::String(s)) => Ok(Some(s)),
      Some(VariantValue::Number(n)) => Ok(Some(n.to_string())),
      Some(other) => Err(LoadError::TypeConversion {
        name: name.to_owned(),
        value: other.to_string(),
      }),
    }
  }

  /// Evaluate a string list. `None` means the property is not set at all;
  /// a single string is accepted as a one-element list.
  pub fn string_list_value(
    &self,
    item: ItemId,
    name: &str,
  ) -> Result<Option<Vec<String>>, LoadError> {
    match self.evaluate(item, name)?.value {
      None | Some(VariantValue::Null) => Ok(None),
      Some(value) => variant_to_string_list(&value)
        .map(Some)
        .ok_or_else(|| LoadError::TypeConversion {
          name: name.to_owned(),
          value: value.to_string(),
        }),
    }
  }

  /// Evaluate a set of file tags, reporting whether the property was
  /// explicitly set.
  pub fn file_tags_value(
    &self,
    item: ItemId,
    name: &str,
  ) -> Result<(BTreeSet<String>, bool), LoadError> {
    let outcome = self.evaluate(item, name)?;
    let was_set = outcome.was_set;
    match outcome.value {
      None | Some(VariantValue::Null) => Ok((BTreeSet::new(), false)),
      Some(value) => {
        let list = variant_to_string_list(&value).ok_or_else(|| LoadError::TypeConversion {
          name: name.to_owned(),
          value: value.to_string(),
        })?;
        Ok((list.into_iter().collect(), was_set))
      }
    }
  }

  /// Run a Probe `configure` expression with its bindings table and read the
  /// (possibly mutated) bindings back.
  pub fn call_configure(
    &self,
    thunk: &Thunk,
    bindings: &VariantMap,
  ) -> Result<VariantMap, LoadError> {
    let located = |e: LuaError| LoadError::Evaluation {
      message: e.to_string(),
      location: thunk.location.clone(),
    };
    let table = self.shared.lua.create_table().map_err(located)?;
    for (name, value) in bindings {
      let lua_value = variant_to_lua(&self.shared.lua, value).map_err(located)?;
      table.set(name.as_str(), lua_value).map_err(located)?;
    }
    let func: LuaFunction = self.shared.lua.registry_value(&thunk.key).map_err(located)?;
    func.call::<()>(&table).map_err(located)?;

    let mut updated = VariantMap::new();
    for name in bindings.keys() {
      let value: LuaValue = table.get(name.as_str()).map_err(located)?;
      updated.insert(name.clone(), lua_to_variant(&value).map_err(located)?);
    }
    Ok(updated)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::CodeLocation;
  use crate::item::ItemType;
  use crate::item::value::Value;
  use crate::lua::globals::{CtorState, ItemHandle};

  struct Fixture {
    lua: Lua,
    pool: Rc<RefCell<ItemPool>>,
    evaluator: Evaluator,
  }

  fn fixture() -> Fixture {
    let pool = Rc::new(RefCell::new(ItemPool::new()));
    let state = Rc::new(RefCell::new(CtorState::new(pool.clone())));
    let lua = crate::lua::runtime::create_runtime(state).unwrap();
    let evaluator = Evaluator::new(lua.clone(), pool.clone());
    Fixture {
      lua,
      pool,
      evaluator,
    }
  }

  fn item_from(fixture: &Fixture, source: &str) -> ItemId {
    let value: LuaValue = fixture.lua.load(source).eval().unwrap();
    let LuaValue::UserData(ud) = value else {
      panic!("expected item");
    };
    let id = ud.borrow::<ItemHandle>().unwrap().0;
    id
  }

  #[test]
  fn literal_properties_evaluate_directly() {
    let f = fixture();
    let item = item_from(&f, r#"return Product { name = "app" }"#);
    assert_eq!(f.evaluator.string_value(item, "name").unwrap().as_deref(), Some("app"));
    assert_eq!(f.evaluator.string_value(item, "missing").unwrap(), None);
  }

  #[test]
  fn expressions_see_sibling_properties() {
    let f = fixture();
    let item = item_from(
      &f,
      r#"return Product {
           name = "app",
           targetName = function(s) return s.name .. "-bin" end,
         }"#,
    );
    assert_eq!(
      f.evaluator.string_value(item, "targetName").unwrap().as_deref(),
      Some("app-bin")
    );
  }

  #[test]
  fn expressions_see_the_lexical_scope_chain() {
    let f = fixture();
    let item = item_from(
      &f,
      r#"return Group { fileTags = function(s) return { s.kind } end }"#,
    );
    let scope = {
      let mut pool = f.pool.borrow_mut();
      let scope = pool.create(ItemType::Plain, CodeLocation::default());
      pool.set_property(scope, "kind", Value::Variant("src".into()));
      scope
    };
    f.pool.borrow_mut().set_scope(item, scope);
    let (tags, was_set) = f.evaluator.file_tags_value(item, "fileTags").unwrap();
    assert!(was_set);
    assert!(tags.contains("src"));
  }

  #[test]
  fn results_are_memoized_per_item() {
    let f = fixture();
    let item = item_from(
      &f,
      r#"
        __count = 0
        return Product {
          name = function(s) __count = __count + 1; return "n" end,
        }
      "#,
    );
    f.evaluator.string_value(item, "name").unwrap();
    f.evaluator.string_value(item, "name").unwrap();
    let count: i64 = f.lua.load("return __count").eval().unwrap();
    assert_eq!(count, 1);
  }

  #[test]
  fn product_references_disable_memoization() {
    let f = fixture();
    let item = item_from(
      &f,
      r#"
        __count = 0
        return Group {
          prefix = function(s) __count = __count + 1; return s.product.name end,
        }
      "#,
    );
    let (scope, product) = {
      let mut pool = f.pool.borrow_mut();
      let product = pool.create(ItemType::Product, CodeLocation::default());
      pool.set_property(product, "name", Value::Variant("app".into()));
      let scope = pool.create(ItemType::Plain, CodeLocation::default());
      pool.set_property(scope, "product", Value::Item(product));
      (scope, product)
    };
    f.pool.borrow_mut().set_scope(item, scope);

    let first = f.evaluator.evaluate(item, "prefix").unwrap();
    assert!(first.used_product);
    f.evaluator.evaluate(item, "prefix").unwrap();
    let count: i64 = f.lua.load("return __count").eval().unwrap();
    assert_eq!(count, 2, "product-referencing evaluations must not be cached");

    // Swapping the product is visible to the next evaluation.
    f.pool
      .borrow_mut()
      .set_property(product, "name", Value::Variant("other".into()));
    let third = f.evaluator.evaluate(item, "prefix").unwrap();
    assert_eq!(third.value, Some("other".into()));
  }

  #[test]
  fn self_referencing_property_is_an_error() {
    let f = fixture();
    let item = item_from(
      &f,
      r#"return Product { name = function(s) return s.name end }"#,
    );
    let err = f.evaluator.string_value(item, "name");
    assert!(matches!(err, Err(LoadError::Evaluation { .. })));
  }
}
