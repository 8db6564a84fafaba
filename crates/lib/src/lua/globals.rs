//! Item constructors and typed-default wrappers.
//!
//! A description file builds its item tree by calling the global
//! constructors (`Project {}`, `Product {}`, ...). Each constructor is a thin
//! Lua wrapper that forwards to a Rust callback together with
//! `debug.getinfo` of the call site, so every item carries its source
//! location. Positional table entries become children, named entries become
//! properties; function values are captured as lazy expressions.

use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;

use mlua::prelude::*;

use crate::error::CodeLocation;
use crate::item::value::{PropertyType, Thunk, Value, VariantMap, VariantValue, infer_type};
use crate::item::{ItemId, ItemPool, ItemType};

/// Lua wrappers for the constructors. `debug.getinfo(2)` points at the
/// caller, i.e. the line in the description file the item was declared on.
const BOOTSTRAP: &str = r#"
-- The debug library may not be loaded; locations then fall back to the
-- file currently being read.
local getinfo = (type(debug) == "table" and debug.getinfo) or function() return nil end

local function ctor(ty)
  return function(t)
    return __weft_item(ty, t or {}, getinfo(2, "Sl"))
  end
end

Project = ctor("Project")
SubProject = ctor("SubProject")
Product = ctor("Product")
Properties = ctor("Properties")
PropertyOptions = ctor("PropertyOptions")
Depends = ctor("Depends")
Group = ctor("Group")
Export = ctor("Export")
Probe = ctor("Probe")
Rule = ctor("Rule")
Artifact = ctor("Artifact")
FileTagger = ctor("FileTagger")
Transformer = ctor("Transformer")
Scanner = ctor("Scanner")
Module = ctor("Module")

-- An anonymous property bag, used to set module properties on an item:
--   Group { cc = props { flags = { "-g" } } }
props = ctor("Props")

function path(v) return __weft_typed("path", v) end
function paths(v) return __weft_typed("pathList", v) end
"#;

/// State the constructors share with the reader: the item pool and the stack
/// of files currently being executed (for fallback locations and the
/// defining directory of lazy expressions).
pub struct CtorState {
  pub pool: Rc<RefCell<ItemPool>>,
  pub file_stack: Vec<PathBuf>,
}

impl CtorState {
  pub fn new(pool: Rc<RefCell<ItemPool>>) -> Self {
    Self {
      pool,
      file_stack: Vec::new(),
    }
  }
}

/// Handle to a constructed item, passed around inside Lua.
#[derive(Clone, Copy)]
pub struct ItemHandle(pub ItemId);

impl LuaUserData for ItemHandle {}

/// A default value wrapped by `path()` / `paths()` to force its declared
/// property type.
pub struct TypedDefault {
  pub ptype: PropertyType,
  pub value: LuaValue,
}

impl LuaUserData for TypedDefault {}

/// Register the constructor globals in the runtime.
pub fn register_globals(lua: &Lua, state: Rc<RefCell<CtorState>>) -> LuaResult<()> {
  let ctor_state = state.clone();
  let make_item = lua.create_function(
    move |lua, (type_name, table, info): (String, LuaTable, Option<LuaTable>)| {
      build_item(lua, &ctor_state, &type_name, &table, info.as_ref())
    },
  )?;
  lua.globals().set("__weft_item", make_item)?;

  let make_typed = lua.create_function(|_, (type_name, value): (String, LuaValue)| {
    let ptype = PropertyType::from_name(&type_name)
      .ok_or_else(|| LuaError::external(format!("unknown property type '{}'", type_name)))?;
    Ok(TypedDefault { ptype, value })
  })?;
  lua.globals().set("__weft_typed", make_typed)?;

  lua.load(BOOTSTRAP).exec()?;
  Ok(())
}

fn build_item(
  lua: &Lua,
  state: &Rc<RefCell<CtorState>>,
  type_name: &str,
  table: &LuaTable,
  info: Option<&LuaTable>,
) -> LuaResult<ItemHandle> {
  let item_type = if type_name == "Props" {
    ItemType::Plain
  } else {
    ItemType::from_name(type_name)
      .ok_or_else(|| LuaError::external(format!("unexpected item type '{}'", type_name)))?
  };

  let (pool, location, dir) = {
    let state = state.borrow();
    let current_file = state.file_stack.last().cloned();
    let location = location_from_info(info, current_file.as_deref().map(PathBuf::from));
    let dir = current_file
      .as_deref()
      .and_then(|f| f.parent().map(PathBuf::from))
      .unwrap_or_else(|| PathBuf::from("."));
    (state.pool.clone(), location, dir)
  };

  let mut pool = pool.borrow_mut();
  let item = pool.create(item_type, location.clone());

  // Positional entries are children, in declaration order.
  let mut index = 1;
  loop {
    let entry: LuaValue = table.raw_get(index)?;
    if entry.is_nil() {
      break;
    }
    match entry {
      LuaValue::UserData(ud) if ud.is::<ItemHandle>() => {
        let handle = ud.borrow::<ItemHandle>()?;
        pool.add_child(item, handle.0);
      }
      other => {
        return Err(LuaError::external(format!(
          "child entries of a {} item must be items, got {}",
          type_name,
          other.type_name()
        )));
      }
    }
    index += 1;
  }

  // Named entries are properties.
  let implicit_decls = matches!(item_type, ItemType::Module | ItemType::Project);
  for pair in table.clone().pairs::<LuaValue, LuaValue>() {
    let (key, raw) = pair?;
    let LuaValue::String(key) = key else {
      continue;
    };
    let name = key.to_str()?.to_string();
    if name == "id" {
      if let LuaValue::String(id) = raw {
        pool.get_mut(item).id = Some(id.to_str()?.to_string());
        continue;
      }
      return Err(LuaError::external("item id must be a string"));
    }
    let (value, wrapper_type) = convert_property_value(lua, raw, &dir, &location)?;
    if let Some(ptype) = wrapper_type {
      pool.set_declared_type(item, name.clone(), ptype);
    } else if implicit_decls {
      let inferred = match &value {
        Value::Variant(v) => infer_type(v),
        _ => PropertyType::Variant,
      };
      pool.set_declared_type(item, name.clone(), inferred);
    }
    pool.set_property(item, name, value);
  }

  Ok(ItemHandle(item))
}

fn location_from_info(info: Option<&LuaTable>, fallback_file: Option<PathBuf>) -> CodeLocation {
  let mut file = fallback_file;
  let mut line = 0u32;
  if let Some(info) = info {
    if let Ok(Some(source)) = info.get::<Option<String>>("source")
      && let Some(stripped) = source.strip_prefix('@')
    {
      file = Some(PathBuf::from(stripped));
    }
    if let Ok(Some(current)) = info.get::<Option<i64>>("currentline")
      && current > 0
    {
      line = current as u32;
    }
  }
  match file {
    Some(file) => CodeLocation::new(file, line),
    None => CodeLocation::default(),
  }
}

fn convert_property_value(
  lua: &Lua,
  raw: LuaValue,
  dir: &std::path::Path,
  location: &CodeLocation,
) -> LuaResult<(Value, Option<PropertyType>)> {
  match raw {
    LuaValue::Function(f) => {
      let key = lua.create_registry_value(f)?;
      Ok((
        Value::Thunk(Thunk {
          key: Rc::new(key),
          dir: dir.to_path_buf(),
          location: location.clone(),
        }),
        None,
      ))
    }
    LuaValue::UserData(ud) => {
      if ud.is::<ItemHandle>() {
        let handle = ud.borrow::<ItemHandle>()?;
        return Ok((Value::Item(handle.0), None));
      }
      if ud.is::<TypedDefault>() {
        let typed = ud.borrow::<TypedDefault>()?;
        let ptype = typed.ptype;
        return match typed.value.clone() {
          LuaValue::Function(f) => {
            let key = lua.create_registry_value(f)?;
            Ok((
              Value::Thunk(Thunk {
                key: Rc::new(key),
                dir: dir.to_path_buf(),
                location: location.clone(),
              }),
              Some(ptype),
            ))
          }
          other => Ok((Value::Variant(lua_to_variant(&other)?), Some(ptype))),
        };
      }
      Err(LuaError::external("unsupported property value"))
    }
    other => {
      let variant = lua_to_variant(&other)?;
      Ok((Value::Variant(variant), None))
    }
  }
}

/// Convert a plain Lua value to a variant. Tables with a non-empty array
/// part become arrays; tables with only named keys become objects; empty
/// tables become empty arrays.
pub fn lua_to_variant(value: &LuaValue) -> LuaResult<VariantValue> {
  match value {
    LuaValue::Nil => Ok(VariantValue::Null),
    // The serde null sentinel round-trips as null.
    LuaValue::LightUserData(_) => Ok(VariantValue::Null),
    LuaValue::Boolean(b) => Ok(VariantValue::Bool(*b)),
    LuaValue::Integer(i) => Ok(VariantValue::from(*i)),
    LuaValue::Number(n) => serde_json::Number::from_f64(*n)
      .map(VariantValue::Number)
      .ok_or_else(|| LuaError::external("cannot represent NaN or infinity as a property value")),
    LuaValue::String(s) => Ok(VariantValue::String(s.to_str()?.to_string())),
    LuaValue::Table(table) => {
      let len = table.raw_len();
      if len > 0 {
        let mut items = Vec::with_capacity(len);
        for index in 1..=len {
          let entry: LuaValue = table.raw_get(index)?;
          items.push(lua_to_variant(&entry)?);
        }
        return Ok(VariantValue::Array(items));
      }
      let mut map = VariantMap::new();
      for pair in table.clone().pairs::<LuaValue, LuaValue>() {
        let (key, entry) = pair?;
        let LuaValue::String(key) = key else {
          return Err(LuaError::external("table keys in property values must be strings"));
        };
        map.insert(key.to_str()?.to_string(), lua_to_variant(&entry)?);
      }
      if map.is_empty() {
        Ok(VariantValue::Array(Vec::new()))
      } else {
        Ok(VariantValue::Object(map))
      }
    }
    other => Err(LuaError::external(format!(
      "cannot convert a Lua {} to a property value",
      other.type_name()
    ))),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn runtime() -> (Lua, Rc<RefCell<ItemPool>>) {
    let pool = Rc::new(RefCell::new(ItemPool::new()));
    let state = Rc::new(RefCell::new(CtorState::new(pool.clone())));
    let lua = super::super::runtime::create_runtime(state).unwrap();
    (lua, pool)
  }

  #[test]
  fn constructor_builds_item_with_properties_and_children() {
    let (lua, pool) = runtime();
    let value: LuaValue = lua
      .load(
        r#"
        return Product {
          name = "app",
          files = { "main.src" },
          Depends { name = "cc" },
        }
      "#,
      )
      .eval()
      .unwrap();
    let LuaValue::UserData(ud) = value else {
      panic!("expected an item handle");
    };
    let id = ud.borrow::<ItemHandle>().unwrap().0;
    let pool = pool.borrow();
    let item = pool.get(id);
    assert_eq!(item.item_type, ItemType::Product);
    assert_eq!(item.children.len(), 1);
    assert_eq!(pool.get(item.children[0]).item_type, ItemType::Depends);
    assert!(matches!(
      item.properties.get("name"),
      Some(Value::Variant(VariantValue::String(s))) if s == "app"
    ));
  }

  #[test]
  fn function_properties_become_thunks() {
    let (lua, pool) = runtime();
    let value: LuaValue = lua
      .load("return Product { condition = function(s) return true end }")
      .eval()
      .unwrap();
    let LuaValue::UserData(ud) = value else {
      panic!("expected an item handle");
    };
    let id = ud.borrow::<ItemHandle>().unwrap().0;
    let pool = pool.borrow();
    assert!(matches!(
      pool.get(id).properties.get("condition"),
      Some(Value::Thunk(_))
    ));
  }

  #[test]
  fn module_properties_get_implicit_declarations() {
    let (lua, pool) = runtime();
    let value: LuaValue = lua
      .load(r#"return Module { warningLevel = "all", extraFlags = {} }"#)
      .eval()
      .unwrap();
    let LuaValue::UserData(ud) = value else {
      panic!("expected an item handle");
    };
    let id = ud.borrow::<ItemHandle>().unwrap().0;
    let pool = pool.borrow();
    assert_eq!(pool.declared_type(id, "warningLevel"), Some(PropertyType::String));
    assert_eq!(pool.declared_type(id, "extraFlags"), Some(PropertyType::StringList));
  }

  #[test]
  fn path_wrapper_forces_path_type() {
    let (lua, pool) = runtime();
    let value: LuaValue = lua
      .load(r#"return Module { includeDir = path("include") }"#)
      .eval()
      .unwrap();
    let LuaValue::UserData(ud) = value else {
      panic!("expected an item handle");
    };
    let id = ud.borrow::<ItemHandle>().unwrap().0;
    let pool = pool.borrow();
    assert_eq!(pool.declared_type(id, "includeDir"), Some(PropertyType::Path));
  }
}
