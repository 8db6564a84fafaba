//! Description-file reader.
//!
//! Executes a `*.weft.lua` file in the shared runtime and returns the root
//! item of the tree it declares. Every physical file read during one
//! resolution is recorded so the build engine can track the build-system
//! files; items carrying an `id` are collected into a per-file scope item
//! that expression evaluation chains into.

use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use mlua::prelude::*;
use tracing::debug;

use super::globals::{CtorState, ItemHandle};
use crate::error::{CodeLocation, LoadError};
use crate::item::value::Value;
use crate::item::{ItemId, ItemPool, ItemType};
use crate::util::paths;

pub struct Reader {
  lua: Lua,
  pool: Rc<RefCell<ItemPool>>,
  state: Rc<RefCell<CtorState>>,
  files_read: RefCell<BTreeSet<PathBuf>>,
  file_scopes: RefCell<HashMap<PathBuf, ItemId>>,
}

impl Reader {
  pub fn new(lua: Lua, pool: Rc<RefCell<ItemPool>>, state: Rc<RefCell<CtorState>>) -> Self {
    Self {
      lua,
      pool,
      state,
      files_read: RefCell::new(BTreeSet::new()),
      file_scopes: RefCell::new(HashMap::new()),
    }
  }

  /// Load a description file and return its root item.
  pub fn read_file(&self, path: &Path) -> Result<ItemId, LoadError> {
    let canonical = paths::canonicalize(path)?;
    debug!(file = %canonical.display(), "reading description file");

    self.state.borrow_mut().file_stack.push(canonical.clone());
    let result = self.execute_file(&canonical);
    self.state.borrow_mut().file_stack.pop();
    let root = result?;

    self.files_read.borrow_mut().insert(canonical.clone());
    self.build_file_scope(&canonical, root);
    Ok(root)
  }

  fn execute_file(&self, path: &Path) -> Result<ItemId, LoadError> {
    let source = std::fs::read_to_string(path).map_err(|source| LoadError::Io {
      path: path.to_path_buf(),
      source,
    })?;
    let chunk_name = format!("@{}", path.display());
    let value: LuaValue = self
      .lua
      .load(&source)
      .set_name(chunk_name)
      .eval()
      .map_err(|e| LoadError::Parse {
        message: e.to_string(),
        location: CodeLocation::file_only(path),
      })?;
    match value {
      LuaValue::UserData(ud) if ud.is::<ItemHandle>() => {
        let handle = ud.borrow::<ItemHandle>().map_err(|e| LoadError::Parse {
          message: e.to_string(),
          location: CodeLocation::file_only(path),
        })?;
        Ok(handle.0)
      }
      _ => Err(LoadError::Parse {
        message: "description file must return an item".into(),
        location: CodeLocation::file_only(path),
      }),
    }
  }

  /// Collect `id` shortcuts of the file into a scope item so expressions can
  /// refer to sibling items by id.
  fn build_file_scope(&self, file: &Path, root: ItemId) {
    let mut pool = self.pool.borrow_mut();
    let with_ids = pool.collect_items_with_id(root);
    let scope = self.file_scopes.borrow().get(file).copied();
    let scope = match scope {
      Some(existing) => existing,
      None => {
        let scope = pool.create(ItemType::Plain, CodeLocation::file_only(file));
        self.file_scopes.borrow_mut().insert(file.to_path_buf(), scope);
        scope
      }
    };
    for item in with_ids {
      let id = pool.get(item).id.clone().unwrap_or_default();
      pool.set_property(scope, id, Value::Item(item));
    }
  }

  pub fn file_scope(&self, file: &Path) -> Option<ItemId> {
    self.file_scopes.borrow().get(file).copied()
  }

  pub fn files_read(&self) -> BTreeSet<PathBuf> {
    self.files_read.borrow().clone()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::fs;
  use tempfile::TempDir;

  fn reader() -> (Reader, Rc<RefCell<ItemPool>>) {
    let pool = Rc::new(RefCell::new(ItemPool::new()));
    let state = Rc::new(RefCell::new(CtorState::new(pool.clone())));
    let lua = super::super::runtime::create_runtime(state.clone()).unwrap();
    (Reader::new(lua, pool.clone(), state), pool)
  }

  #[test]
  fn read_file_returns_root_item() {
    let temp = TempDir::new().unwrap();
    let file = temp.path().join("p.weft.lua");
    fs::write(&file, "return Project { name = \"top\" }").unwrap();

    let (reader, pool) = reader();
    let root = reader.read_file(&file).unwrap();
    assert_eq!(pool.borrow().get(root).item_type, ItemType::Project);
    assert_eq!(reader.files_read().len(), 1);
  }

  #[test]
  fn non_item_result_is_a_parse_error() {
    let temp = TempDir::new().unwrap();
    let file = temp.path().join("p.weft.lua");
    fs::write(&file, "return 42").unwrap();

    let (reader, _) = reader();
    let err = reader.read_file(&file);
    assert!(matches!(err, Err(LoadError::Parse { .. })));
  }

  #[test]
  fn items_with_ids_land_in_the_file_scope() {
    let temp = TempDir::new().unwrap();
    let file = temp.path().join("p.weft.lua");
    fs::write(
      &file,
      r#"
      return Project {
        Product { id = "app", name = "app" },
      }
    "#,
    )
    .unwrap();

    let (reader, pool) = reader();
    reader.read_file(&file).unwrap();
    let canonical = dunce::canonicalize(&file).unwrap();
    let scope = reader.file_scope(&canonical).unwrap();
    assert!(pool.borrow().has_property(scope, "app"));
  }
}
