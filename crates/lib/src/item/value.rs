//! Property values and their declared types.
//!
//! A property value is either a plain variant (JSON-shaped data known at
//! load time), a lazy expression captured as a Lua function in the registry,
//! a reference to a nested item (module instances live in these slots), or a
//! built-in function reference.

use std::fmt;
use std::path::PathBuf;
use std::rc::Rc;

use mlua::RegistryKey;

use crate::error::{CodeLocation, LoadError};
use crate::item::ItemId;

/// Evaluated property payload.
pub type VariantValue = serde_json::Value;
/// Map of evaluated properties / build configuration.
pub type VariantMap = serde_json::Map<String, serde_json::Value>;

/// A lazy expression: an unevaluated Lua function plus the directory of the
/// file that declared it (path-typed results resolve against that directory)
/// and its source location.
#[derive(Clone)]
pub struct Thunk {
  pub key: Rc<RegistryKey>,
  pub dir: PathBuf,
  pub location: CodeLocation,
}

impl fmt::Debug for Thunk {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Thunk")
      .field("location", &self.location)
      .finish_non_exhaustive()
  }
}

/// Built-in function references exposed through the base module.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Builtin {
  GetEnv,
}

/// One property value on an item.
#[derive(Clone, Debug)]
pub enum Value {
  Variant(VariantValue),
  Thunk(Thunk),
  Item(ItemId),
  Builtin(Builtin),
}

/// Declared type of a property. Drives list-concatenation semantics, path
/// resolution, and the coercion of profile defaults and user overrides.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PropertyType {
  Bool,
  Integer,
  String,
  StringList,
  Path,
  PathList,
  Variant,
}

impl PropertyType {
  pub fn is_list(self) -> bool {
    matches!(self, PropertyType::StringList | PropertyType::PathList)
  }

  pub fn from_name(name: &str) -> Option<Self> {
    match name {
      "bool" => Some(PropertyType::Bool),
      "integer" => Some(PropertyType::Integer),
      "string" => Some(PropertyType::String),
      "stringList" => Some(PropertyType::StringList),
      "path" => Some(PropertyType::Path),
      "pathList" => Some(PropertyType::PathList),
      "variant" => Some(PropertyType::Variant),
      _ => None,
    }
  }
}

/// Infer a declaration type from a default value, used for properties set in
/// `Module {}` and `Project {}` bodies without an explicit wrapper.
pub fn infer_type(value: &VariantValue) -> PropertyType {
  match value {
    VariantValue::Bool(_) => PropertyType::Bool,
    VariantValue::Number(n) if n.is_i64() || n.is_u64() => PropertyType::Integer,
    VariantValue::String(_) => PropertyType::String,
    VariantValue::Array(items) if items.iter().all(|v| v.is_string()) => PropertyType::StringList,
    _ => PropertyType::Variant,
  }
}

/// Coerce an externally provided value (profile default or command-line
/// override) to a declared property type.
///
/// String lists accept the `a,b,c` shorthand. Incompatible values fail with
/// a [`LoadError::TypeConversion`] naming the full dotted property.
pub fn convert_to_property_type(
  value: &VariantValue,
  ptype: PropertyType,
  name_prefix: &str,
  key: &str,
) -> Result<VariantValue, LoadError> {
  let full_name = if name_prefix.is_empty() {
    key.to_owned()
  } else {
    format!("{}.{}", name_prefix, key)
  };
  let mismatch = || LoadError::TypeConversion {
    name: full_name.clone(),
    value: value.to_string(),
  };

  if value.is_null() {
    return Ok(VariantValue::Null);
  }
  match ptype {
    PropertyType::Variant => Ok(value.clone()),
    PropertyType::Bool => match value {
      VariantValue::Bool(_) => Ok(value.clone()),
      _ => Err(mismatch()),
    },
    PropertyType::Integer => match value {
      VariantValue::Number(n) if n.is_i64() || n.is_u64() => Ok(value.clone()),
      VariantValue::String(s) => s
        .parse::<i64>()
        .map(VariantValue::from)
        .map_err(|_| mismatch()),
      _ => Err(mismatch()),
    },
    PropertyType::String | PropertyType::Path => match value {
      VariantValue::String(_) => Ok(value.clone()),
      VariantValue::Number(n) => Ok(VariantValue::String(n.to_string())),
      VariantValue::Bool(b) => Ok(VariantValue::String(b.to_string())),
      _ => Err(mismatch()),
    },
    PropertyType::StringList | PropertyType::PathList => match value {
      // The `foo,bar,baz` string-list shorthand.
      VariantValue::String(s) => Ok(VariantValue::Array(
        s.split(',').map(|p| VariantValue::String(p.to_owned())).collect(),
      )),
      VariantValue::Array(items) => {
        if items.iter().all(|v| v.is_string()) {
          Ok(value.clone())
        } else {
          Err(mismatch())
        }
      }
      _ => Err(mismatch()),
    },
  }
}

/// Merge `src` into `dst`, recursing into nested objects. Scalar collisions
/// are won by `src`.
pub fn merge_variant_maps(dst: &mut VariantMap, src: &VariantMap) {
  for (key, value) in src {
    match (dst.get_mut(key), value) {
      (Some(VariantValue::Object(dst_obj)), VariantValue::Object(src_obj)) => {
        merge_variant_maps(dst_obj, src_obj);
      }
      _ => {
        dst.insert(key.clone(), value.clone());
      }
    }
  }
}

pub fn variant_to_string_list(value: &VariantValue) -> Option<Vec<String>> {
  match value {
    VariantValue::String(s) => Some(vec![s.clone()]),
    VariantValue::Array(items) => items
      .iter()
      .map(|v| v.as_str().map(str::to_owned))
      .collect(),
    _ => None,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn string_list_accepts_comma_shorthand() {
    let v = convert_to_property_type(&json!("a,b"), PropertyType::StringList, "cc", "flags").unwrap();
    assert_eq!(v, json!(["a", "b"]));
  }

  #[test]
  fn bool_rejects_strings() {
    let err = convert_to_property_type(&json!("yes"), PropertyType::Bool, "weft", "install");
    assert!(matches!(err, Err(LoadError::TypeConversion { .. })));
  }

  #[test]
  fn merge_recurses_into_objects() {
    let mut dst = json!({"a": {"x": 1, "y": 2}, "s": "old"})
      .as_object()
      .cloned()
      .unwrap();
    let src = json!({"a": {"y": 3}, "s": "new"}).as_object().cloned().unwrap();
    merge_variant_maps(&mut dst, &src);
    assert_eq!(dst.get("s"), Some(&json!("new")));
    assert_eq!(dst.get("a"), Some(&json!({"x": 1, "y": 3})));
  }

  #[test]
  fn inference_picks_list_for_string_arrays() {
    assert_eq!(infer_type(&json!(["a"])), PropertyType::StringList);
    assert_eq!(infer_type(&json!(true)), PropertyType::Bool);
    assert_eq!(infer_type(&json!({"k": 1})), PropertyType::Variant);
  }
}
