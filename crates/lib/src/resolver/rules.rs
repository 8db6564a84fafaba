//! Rule, transformer, scanner, file-tagger and Export resolution.

use std::collections::HashSet;

use tracing::trace;

use super::{ExportsContext, ProductState, ProjectResolver};
use crate::consts::UNKNOWN_FILE_TAG;
use crate::error::LoadError;
use crate::graph::{
  ArtifactBinding, FileTagger, ResolvedScanner, ResolvedTransformer, Rule, RuleArtifact,
  ScriptValue, SourceArtifact,
};
use crate::item::value::{Value, VariantMap};
use crate::item::{ItemId, ItemType};
use crate::util::paths;

impl ProjectResolver<'_> {
  /// Capture a property as a script value without evaluating it.
  pub(crate) fn script_value(&self, item: ItemId, name: &str) -> ScriptValue {
    let pool = self.pool.borrow();
    match pool.property(item, name) {
      Some((_, Value::Thunk(thunk))) => ScriptValue {
        location: thunk.location.clone(),
        constant: None,
        thunk: Some(thunk.clone()),
      },
      Some((definer, Value::Variant(value))) if !value.is_null() => ScriptValue {
        location: pool.get(definer).location.clone(),
        constant: Some(value.clone()),
        thunk: None,
      },
      _ => ScriptValue::default(),
    }
  }

  /// Resolve one Rule item. Returns `None` when its condition is false.
  pub(crate) fn resolve_rule(
    &self,
    item: ItemId,
    module: Option<&str>,
  ) -> Result<Option<Rule>, LoadError> {
    self.check_cancelation()?;
    if !self.evaluator.bool_value(item, "condition", true)? {
      trace!("rule condition is false");
      return Ok(None);
    }
    let location = self.pool.borrow().get(item).location.clone();

    let mut artifacts = Vec::new();
    let children = self.pool.borrow().get(item).children.clone();
    for child in children {
      let (child_type, child_location) = {
        let pool = self.pool.borrow();
        (pool.get(child).item_type, pool.get(child).location.clone())
      };
      if child_type != ItemType::Artifact {
        return Err(LoadError::invalid(
          "a Rule can only have children of type Artifact",
          child_location,
        ));
      }
      artifacts.push(self.resolve_rule_artifact(child)?);
    }

    let output_artifacts = self.script_value(item, "outputArtifacts");
    let mut output_file_tags = Default::default();
    if output_artifacts.is_set() {
      if !artifacts.is_empty() {
        return Err(LoadError::invalid(
          "the Rule.outputArtifacts script is not allowed in rules that contain Artifact items",
          location,
        ));
      }
      let (tags, _) = self.evaluator.file_tags_value(item, "outputFileTags")?;
      if tags.is_empty() {
        return Err(LoadError::invalid(
          "Rule.outputFileTags must be specified if Rule.outputArtifacts is specified",
          location,
        ));
      }
      output_file_tags = tags;
    }

    Ok(Some(Rule {
      name: self.evaluator.string_value(item, "name")?.unwrap_or_default(),
      module: module.map(str::to_owned),
      location,
      multiplex: self.evaluator.bool_value(item, "multiplex", false)?,
      inputs: self.evaluator.file_tags_value(item, "inputs")?.0,
      inputs_from_dependencies: self
        .evaluator
        .file_tags_value(item, "inputsFromDependencies")?
        .0,
      auxiliary_inputs: self.evaluator.file_tags_value(item, "auxiliaryInputs")?.0,
      excluded_auxiliary_inputs: self
        .evaluator
        .file_tags_value(item, "excludedAuxiliaryInputs")?
        .0,
      explicitly_depends_on: self
        .evaluator
        .file_tags_value(item, "explicitlyDependsOn")?
        .0,
      prepare: self.script_value(item, "prepare"),
      output_artifacts,
      output_file_tags,
      artifacts,
    }))
  }

  /// Resolve a static Artifact child of a rule, collecting every property
  /// binding along the Artifact item's prototype chain exactly once (first
  /// occurrence of a dotted path wins).
  fn resolve_rule_artifact(&self, item: ItemId) -> Result<RuleArtifact, LoadError> {
    let location = self.pool.borrow().get(item).location.clone();
    let mut bindings = Vec::new();
    let mut seen = HashSet::new();
    let mut level = Some(item);
    while let Some(current) = level {
      let (properties, prototype) = {
        let pool = self.pool.borrow();
        (pool.get(current).properties.clone(), pool.get(current).prototype)
      };
      for (name, value) in &properties {
        if let Value::Item(target) = value {
          self.resolve_artifact_bindings(*target, vec![name.clone()], &mut seen, &mut bindings);
        }
      }
      level = prototype;
    }

    Ok(RuleArtifact {
      file_path: self.script_value(item, "filePath"),
      file_tags: self.evaluator.file_tags_value(item, "fileTags")?.0,
      always_updated: self.evaluator.bool_value(item, "alwaysUpdated", true)?,
      location,
      bindings,
    })
  }

  fn resolve_artifact_bindings(
    &self,
    item: ItemId,
    prefix: Vec<String>,
    seen: &mut HashSet<Vec<String>>,
    bindings: &mut Vec<ArtifactBinding>,
  ) {
    let properties = self.pool.borrow().get(item).properties.clone();
    for (name, value) in properties {
      let mut path = prefix.clone();
      path.push(name);
      match value {
        Value::Item(target) => {
          self.resolve_artifact_bindings(target, path, seen, bindings);
        }
        Value::Thunk(thunk) => {
          if !seen.insert(path.clone()) {
            continue;
          }
          bindings.push(ArtifactBinding {
            name: path,
            value: ScriptValue {
              location: thunk.location.clone(),
              constant: None,
              thunk: Some(thunk),
            },
          });
        }
        Value::Variant(variant) => {
          if variant.is_null() || !seen.insert(path.clone()) {
            continue;
          }
          bindings.push(ArtifactBinding {
            name: path,
            value: ScriptValue {
              location: self.pool.borrow().get(item).location.clone(),
              constant: Some(variant),
              thunk: None,
            },
          });
        }
        Value::Builtin(_) => {}
      }
    }
  }

  pub(crate) fn resolve_file_tagger(&self, item: ItemId) -> Result<FileTagger, LoadError> {
    self.check_cancelation()?;
    let location = self.pool.borrow().get(item).location.clone();
    let patterns = self
      .evaluator
      .string_list_value(item, "patterns")?
      .unwrap_or_default();
    if patterns.is_empty() {
      return Err(LoadError::invalid(
        "FileTagger.patterns must be a non-empty list",
        location,
      ));
    }
    if patterns.iter().any(String::is_empty) {
      return Err(LoadError::invalid(
        "a FileTagger pattern must not be empty",
        location,
      ));
    }
    let (file_tags, _) = self.evaluator.file_tags_value(item, "fileTags")?;
    if file_tags.is_empty() {
      return Err(LoadError::invalid(
        "FileTagger.fileTags must not be empty",
        location,
      ));
    }
    Ok(FileTagger {
      patterns,
      file_tags,
    })
  }

  /// Resolve a Transformer item. Returns `None` when its condition is false.
  pub(crate) fn resolve_transformer(
    &self,
    item: ItemId,
    state: &ProductState,
    module: Option<&str>,
  ) -> Result<Option<ResolvedTransformer>, LoadError> {
    self.check_cancelation()?;
    if !self.evaluator.bool_value(item, "condition", true)? {
      trace!("transformer condition is false");
      return Ok(None);
    }
    let inputs = self
      .evaluator
      .string_list_value(item, "inputs")?
      .unwrap_or_default()
      .iter()
      .map(|input| paths::resolve(&state.source_directory, input))
      .collect();

    let mut outputs = Vec::new();
    let children = self.pool.borrow().get(item).children.clone();
    for child in children {
      let (child_type, child_location) = {
        let pool = self.pool.borrow();
        (pool.get(child).item_type, pool.get(child).location.clone())
      };
      if child_type != ItemType::Artifact {
        return Err(LoadError::invalid(
          format!("Transformer: wrong child type '{}'", child_type.name()),
          child_location,
        ));
      }
      let Some(file_path) = self.evaluator.string_value(child, "filePath")? else {
        return Err(LoadError::invalid(
          "Artifact.filePath must not be empty",
          child_location,
        ));
      };
      let (mut file_tags, _) = self.evaluator.file_tags_value(child, "fileTags")?;
      if file_tags.is_empty() {
        file_tags.insert(UNKNOWN_FILE_TAG.to_owned());
      }
      outputs.push(SourceArtifact {
        file_path: paths::resolve(&state.build_directory, &file_path),
        file_tags,
        override_file_tags: false,
        properties: self.products[state.id].module_properties.clone(),
      });
    }

    Ok(Some(ResolvedTransformer {
      module: module.map(str::to_owned),
      inputs,
      outputs,
      transform: self.script_value(item, "prepare"),
      explicitly_depends_on: self
        .evaluator
        .file_tags_value(item, "explicitlyDependsOn")?
        .0,
    }))
  }

  /// Resolve a Scanner item. Returns `None` when its condition is false.
  pub(crate) fn resolve_scanner(
    &self,
    item: ItemId,
    module: Option<&str>,
  ) -> Result<Option<ResolvedScanner>, LoadError> {
    self.check_cancelation()?;
    if !self.evaluator.bool_value(item, "condition", true)? {
      trace!("scanner condition is false");
      return Ok(None);
    }
    Ok(Some(ResolvedScanner {
      module: module.map(str::to_owned),
      inputs: self.evaluator.file_tags_value(item, "inputs")?.0,
      recursive: self.evaluator.bool_value(item, "recursive", false)?,
      search_paths: self.script_value(item, "searchPaths"),
      scan: self.script_value(item, "scan"),
    }))
  }

  /// Capture the merged Export item of a product: its direct property
  /// assignments (evaluated with the exporting product), its rules, and its
  /// file taggers. Consumers re-evaluate the rest in their own context.
  pub(crate) fn resolve_export(
    &mut self,
    item: ItemId,
    state: &ProductState,
  ) -> Result<(), LoadError> {
    self.check_cancelation()?;
    let mut module_values = self.evaluate_module_values(item, false)?;
    let mut direct = VariantMap::new();
    self.evaluate_properties(item, item, None, &mut direct, false)?;
    for (key, value) in direct {
      module_values.insert(key, value);
    }

    let mut rules = Vec::new();
    let mut file_taggers = Vec::new();
    let children = self.pool.borrow().get(item).children.clone();
    for child in children {
      match self.pool.borrow().get(child).item_type {
        ItemType::Rule => {
          if let Some(rule) = self.resolve_rule(child, None)? {
            rules.push(rule);
          }
        }
        ItemType::FileTagger => file_taggers.push(self.resolve_file_tagger(child)?),
        _ => {}
      }
    }

    // Modules the Export item depends on contribute their rules and file
    // taggers to the exported interface as well.
    let mut queue: std::collections::VecDeque<crate::item::ModuleRef> =
      self.pool.borrow().get(item).modules.clone().into();
    let mut seen = HashSet::new();
    while let Some(module) = queue.pop_front() {
      let full_name = crate::item::full_module_name(&module.name);
      if !seen.insert(full_name.clone()) {
        continue;
      }
      queue.extend(self.pool.borrow().get(module.item).modules.clone());
      if !self.evaluator.bool_value(module.item, "present", true)? {
        continue;
      }
      let module_children = self.pool.borrow().get(module.item).children.clone();
      for child in module_children {
        match self.pool.borrow().get(child).item_type {
          ItemType::Rule => {
            if let Some(rule) = self.resolve_rule(child, Some(&full_name))? {
              rules.push(rule);
            }
          }
          ItemType::FileTagger => file_taggers.push(self.resolve_file_tagger(child)?),
          _ => {}
        }
      }
    }

    self.exports.insert(
      state.id,
      ExportsContext {
        item,
        module_values,
        rules,
        file_taggers,
      },
    );
    Ok(())
  }
}
