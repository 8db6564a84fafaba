//! One resolution session.
//!
//! A session owns one item pool, one Lua runtime, one reader and one
//! evaluator. Multiple sessions may run concurrently because nothing is
//! shared between them; within a session, resolution is a single
//! synchronous traversal.

use std::cell::RefCell;
use std::rc::Rc;

use tracing::info;

use crate::error::{CodeLocation, LoadError};
use crate::evaluator::Evaluator;
use crate::graph::ResolvedProject;
use crate::item::ItemPool;
use crate::loader::ModuleLoader;
use crate::lua::globals::CtorState;
use crate::lua::{Reader, runtime};
use crate::params::SetupParameters;
use crate::progress::ProgressObserver;
use crate::resolver;

pub struct Session {
  pool: Rc<RefCell<ItemPool>>,
  reader: Reader,
  evaluator: Evaluator,
  params: SetupParameters,
}

impl Session {
  pub fn new(params: SetupParameters) -> Result<Self, LoadError> {
    let pool = Rc::new(RefCell::new(ItemPool::new()));
    let state = Rc::new(RefCell::new(CtorState::new(pool.clone())));
    let lua = runtime::create_runtime(state.clone()).map_err(|e| LoadError::Parse {
      message: e.to_string(),
      location: CodeLocation::default(),
    })?;
    let reader = Reader::new(lua.clone(), pool.clone(), state);
    let evaluator = Evaluator::new(lua, pool.clone());
    Ok(Self {
      pool,
      reader,
      evaluator,
      params,
    })
  }

  pub fn params(&self) -> &SetupParameters {
    &self.params
  }

  /// Run both resolution passes and hand back the resolved graph.
  pub fn resolve(&self, progress: &dyn ProgressObserver) -> Result<ResolvedProject, LoadError> {
    info!(
      project = %self.params.project_file.display(),
      configuration = %self.params.configuration_id(),
      "resolving project"
    );
    let loader = ModuleLoader::new(
      self.pool.clone(),
      &self.reader,
      &self.evaluator,
      &self.params,
      progress,
    );
    let load_result = loader.load()?;
    let project = resolver::resolve(
      load_result,
      self.pool.clone(),
      &self.evaluator,
      &self.params,
      progress,
    )?;
    info!(products = project.products.len(), "project resolved");
    Ok(project)
  }
}

/// Convenience entry point: create a session and resolve once.
pub fn resolve_project(
  params: SetupParameters,
  progress: &dyn ProgressObserver,
) -> Result<ResolvedProject, LoadError> {
  Session::new(params)?.resolve(progress)
}
