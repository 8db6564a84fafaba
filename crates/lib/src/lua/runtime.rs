//! Lua runtime creation.

use std::cell::RefCell;
use std::rc::Rc;

use mlua::prelude::*;

use super::globals::{self, CtorState};

/// Create a new Lua runtime with the item constructors registered.
///
/// The runtime is shared by the reader (which executes description files)
/// and the evaluator (which calls captured property expressions).
pub fn create_runtime(state: Rc<RefCell<CtorState>>) -> LuaResult<Lua> {
  let lua = Lua::new();
  globals::register_globals(&lua, state)?;
  Ok(lua)
}
