//! The `weft resolve` command.

use std::path::PathBuf;

use anyhow::{Context, Result, anyhow, bail};
use owo_colors::OwoColorize;
use weft_lib::{NullProgress, PropertyChecking, SetupParameters, resolve_project};

pub struct ResolveOptions {
  pub project: PathBuf,
  pub profile: String,
  pub variant: String,
  pub settings_dir: Option<PathBuf>,
  pub build_root: Option<PathBuf>,
  pub overrides: Vec<String>,
  pub strict: bool,
  pub output: Option<PathBuf>,
  pub verbose: bool,
}

pub fn cmd_resolve(options: ResolveOptions) -> Result<()> {
  let project_file = find_project_file(&options.project)?;
  let mut params = SetupParameters::new(&project_file, &options.profile);
  params.build_variant = options.variant.clone();
  if let Some(settings_dir) = &options.settings_dir {
    params.settings_dir = settings_dir.clone();
  } else {
    params.settings_dir = params.project_dir().to_path_buf();
  }
  if let Some(build_root) = &options.build_root {
    params.build_root = build_root.clone();
  }
  if options.strict {
    params.property_checking = PropertyChecking::Strict;
  }
  for entry in &options.overrides {
    apply_override(&mut params, entry)?;
  }

  eprintln!(
    "{} resolving {} for configuration {}",
    "::".cyan().bold(),
    project_file.display(),
    params.configuration_id()
  );

  let project = match resolve_project(params, &NullProgress) {
    Ok(project) => project,
    Err(e) => {
      eprintln!("{} {}", "error:".red().bold(), e);
      std::process::exit(1);
    }
  };

  let enabled = project.products.iter().filter(|p| p.enabled).count();
  eprintln!(
    "{} resolved {} product(s), {} enabled",
    "✓".green(),
    project.products.len(),
    enabled
  );
  if options.verbose {
    for product in &project.products {
      let files = product.all_enabled_files().count();
      eprintln!(
        "  {} {} [{}] ({} file(s))",
        "•".cyan(),
        product.unique_name(),
        product.profile,
        files
      );
    }
  }

  let json = serde_json::to_string_pretty(&project).context("serializing resolved project")?;
  match &options.output {
    Some(path) => {
      std::fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;
      eprintln!("{} wrote {}", "✓".green(), path.display());
    }
    None => println!("{}", json),
  }
  Ok(())
}

/// Accept either a description file or a directory containing exactly one.
fn find_project_file(path: &PathBuf) -> Result<PathBuf> {
  if path.is_file() {
    return Ok(path.clone());
  }
  if path.is_dir() {
    let mut candidates = Vec::new();
    for entry in std::fs::read_dir(path)? {
      let entry = entry?;
      let name = entry.file_name().to_string_lossy().into_owned();
      if name.ends_with(".weft.lua") {
        candidates.push(entry.path());
      }
    }
    match candidates.len() {
      1 => return Ok(candidates.remove(0)),
      0 => bail!("no project file found in '{}'", path.display()),
      _ => bail!("more than one project file found in '{}'", path.display()),
    }
  }
  bail!("project file '{}' does not exist", path.display())
}

/// Parse a `module.property=value` override. Values are JSON where they
/// parse as JSON, plain strings otherwise.
fn apply_override(params: &mut SetupParameters, entry: &str) -> Result<()> {
  let (key, raw_value) = entry
    .split_once('=')
    .ok_or_else(|| anyhow!("override '{}' must have the form key=value", entry))?;
  let Some((prefix, property)) = key.rsplit_once('.') else {
    bail!("override key '{}' must name a property as prefix.property", key);
  };
  let value: serde_json::Value = serde_json::from_str(raw_value)
    .unwrap_or_else(|_| serde_json::Value::String(raw_value.to_owned()));

  let mut target = &mut params.overridden_values;
  for segment in prefix.split('.') {
    let entry = target
      .entry(segment)
      .or_insert_with(|| serde_json::Value::Object(Default::default()));
    let serde_json::Value::Object(next) = entry else {
      bail!("override key '{}' conflicts with an earlier override", key);
    };
    target = next;
  }
  target.insert(property.to_owned(), value);
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn overrides_build_nested_maps() {
    let mut params = SetupParameters::new("/tmp/p.weft.lua", "default");
    apply_override(&mut params, "cc.warningLevel=all").unwrap();
    apply_override(&mut params, "weft.install=true").unwrap();
    assert_eq!(
      params.overridden_values["cc"]["warningLevel"],
      serde_json::json!("all")
    );
    assert_eq!(params.overridden_values["weft"]["install"], serde_json::json!(true));
  }

  #[test]
  fn malformed_overrides_are_rejected() {
    let mut params = SetupParameters::new("/tmp/p.weft.lua", "default");
    assert!(apply_override(&mut params, "novalue").is_err());
    assert!(apply_override(&mut params, "noprefix=1").is_err());
  }
}
