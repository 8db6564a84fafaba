//! End-to-end resolution tests: a temporary description tree is written to
//! disk, resolved, and the resulting graph inspected.

use std::cell::Cell;
use std::fs;
use std::path::PathBuf;

use serde_json::json;
use weft_lib::error::LoadError;
use weft_lib::graph::ResolvedProject;
use weft_lib::item::value::VariantValue;
use weft_lib::params::PropertyChecking;
use weft_lib::progress::{NullProgress, ProgressObserver};
use weft_lib::{SetupParameters, resolve_project};

struct Workspace {
  temp: tempfile::TempDir,
}

impl Workspace {
  fn new() -> Self {
    let workspace = Self {
      temp: tempfile::TempDir::new().unwrap(),
    };
    workspace.write_profile("debug", "");
    workspace.write_profile("release", "");
    workspace
  }

  fn write(&self, relative: &str, content: &str) -> PathBuf {
    let path = self.temp.path().join(relative);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(&path, content).unwrap();
    path
  }

  fn write_profile(&self, name: &str, body: &str) {
    self.write(&format!("settings/profiles/{}.toml", name), body);
  }

  fn params(&self, project_relative: &str) -> SetupParameters {
    let mut params = SetupParameters::new(self.temp.path().join(project_relative), "debug");
    params.settings_dir = self.temp.path().join("settings");
    params.build_root = self.temp.path().join("build");
    params
  }

  fn resolve(&self, project_relative: &str) -> Result<ResolvedProject, LoadError> {
    resolve_project(self.params(project_relative), &NullProgress)
  }
}

#[test]
fn minimal_product_resolves_to_tagged_artifacts() {
  let workspace = Workspace::new();
  workspace.write("main.src", "");
  workspace.write(
    "p.weft.lua",
    r#"
    return Project {
      Product {
        name = "app",
        type = { "application" },
        files = { "main.src" },
        FileTagger { patterns = { "*.src" }, fileTags = { "src" } },
        Rule {
          inputs = { "src" },
          Artifact {
            filePath = function(s) return "out.obj" end,
            fileTags = { "obj" },
          },
          prepare = function(s) return {} end,
        },
      },
    }
  "#,
  );
  let mut params = workspace.params("p.weft.lua");
  params.overridden_values = json!({"weft": {"install": true}})
    .as_object()
    .cloned()
    .unwrap();
  let project = resolve_project(params, &NullProgress).unwrap();

  assert_eq!(project.products.len(), 1);
  let product = &project.products[0];
  assert!(product.enabled);
  assert_eq!(product.unique_name(), "app");
  assert!(product.file_tags.contains("application"));
  assert_eq!(product.rules.len(), 1);
  assert_eq!(product.rules[0].artifacts.len(), 1);

  let artifacts: Vec<_> = product.all_enabled_files().collect();
  assert_eq!(artifacts.len(), 1);
  assert!(artifacts[0].file_path.ends_with("main.src"));
  assert!(artifacts[0].file_tags.contains("src"));
  // A positive weft.install implies the installable tag.
  assert!(artifacts[0].file_tags.contains("installable"));
}

#[test]
fn disabled_product_contributes_no_artifacts() {
  let workspace = Workspace::new();
  workspace.write("main.src", "");
  workspace.write(
    "p.weft.lua",
    r#"
    return Project {
      Product {
        name = "app",
        condition = function(s) return false end,
        files = { "main.src" },
      },
    }
  "#,
  );
  let project = workspace.resolve("p.weft.lua").unwrap();
  assert_eq!(project.products.len(), 1);
  assert!(!project.products[0].enabled);
  assert_eq!(project.products[0].all_files().count(), 0);
}

#[test]
fn multiplexing_yields_one_product_per_profile() {
  let workspace = Workspace::new();
  workspace.write(
    "p.weft.lua",
    r#"
    return Project {
      Product {
        name = "app",
        profiles = { "debug", "release" },
        targetName = "the-app",
      },
    }
  "#,
  );
  let project = workspace.resolve("p.weft.lua").unwrap();
  assert_eq!(project.products.len(), 2);
  let mut names: Vec<String> = project.products.iter().map(|p| p.unique_name()).collect();
  names.sort();
  assert_eq!(names, ["app-debug", "app-release"]);
  // All other declared properties are identical at clone time.
  assert!(project.products.iter().all(|p| p.target_name == "the-app"));
  let mut profiles: Vec<&str> = project.products.iter().map(|p| p.profile.as_str()).collect();
  profiles.sort();
  assert_eq!(profiles, ["debug", "release"]);
}

#[test]
fn duplicate_profiles_are_rejected() {
  let workspace = Workspace::new();
  workspace.write(
    "p.weft.lua",
    r#"
    return Project {
      Product { name = "app", profiles = { "debug", "debug" } },
    }
  "#,
  );
  let err = workspace.resolve("p.weft.lua");
  assert!(matches!(err, Err(LoadError::DuplicateDefinition { .. })));
}

#[test]
fn unknown_profile_is_an_error() {
  let workspace = Workspace::new();
  workspace.write(
    "p.weft.lua",
    r#"
    return Project {
      Product { name = "app", profiles = { "nonexistent" } },
    }
  "#,
  );
  let err = workspace.resolve("p.weft.lua");
  assert!(matches!(err, Err(LoadError::MissingProfile { name }) if name == "nonexistent"));
}

#[test]
fn scalar_precedence_is_override_then_profile_then_default() {
  let workspace = Workspace::new();
  workspace.write(
    "modules/cc/cc.weft.lua",
    r#"return Module { warningLevel = "none" }"#,
  );
  workspace.write(
    "p.weft.lua",
    r#"
    return Project {
      Product { name = "app", Depends { name = "cc" } },
    }
  "#,
  );

  // Description-file default.
  let project = workspace.resolve("p.weft.lua").unwrap();
  assert_eq!(
    project.products[0].module_properties.module_property("cc", "warningLevel"),
    Some(json!("none"))
  );

  // Profile default wins over the file default.
  workspace.write_profile("debug", "[cc]\nwarningLevel = \"all\"\n");
  let project = workspace.resolve("p.weft.lua").unwrap();
  assert_eq!(
    project.products[0].module_properties.module_property("cc", "warningLevel"),
    Some(json!("all"))
  );

  // A command-line override wins over both.
  let mut params = workspace.params("p.weft.lua");
  params.overridden_values = json!({"cc": {"warningLevel": "max"}})
    .as_object()
    .cloned()
    .unwrap();
  let project = resolve_project(params, &NullProgress).unwrap();
  assert_eq!(
    project.products[0].module_properties.module_property("cc", "warningLevel"),
    Some(json!("max"))
  );
}

#[test]
fn list_properties_accumulate_across_layers() {
  let workspace = Workspace::new();
  workspace.write(
    "modules/cc/cc.weft.lua",
    r#"return Module { flags = { "-base" } }"#,
  );
  workspace.write(
    "p.weft.lua",
    r#"
    return Project {
      Product {
        name = "app",
        Depends { name = "cc" },
        cc = props { flags = { "-product" } },
      },
    }
  "#,
  );
  let project = workspace.resolve("p.weft.lua").unwrap();
  assert_eq!(
    project.products[0].module_properties.module_property("cc", "flags"),
    Some(json!(["-product", "-base"]))
  );
}

#[test]
fn incompatible_override_value_fails() {
  let workspace = Workspace::new();
  workspace.write(
    "modules/cc/cc.weft.lua",
    r#"return Module { optimize = false }"#,
  );
  workspace.write(
    "p.weft.lua",
    r#"return Project { Product { name = "app", Depends { name = "cc" } } }"#,
  );
  let mut params = workspace.params("p.weft.lua");
  params.overridden_values = json!({"cc": {"optimize": "definitely"}})
    .as_object()
    .cloned()
    .unwrap();
  let err = resolve_project(params, &NullProgress);
  assert!(matches!(err, Err(LoadError::TypeConversion { .. })));
}

#[test]
fn export_properties_reach_consumers() {
  let workspace = Workspace::new();
  workspace.write(
    "p.weft.lua",
    r#"
    return Project {
      Product {
        name = "x",
        Export { a = 1 },
      },
      Product {
        name = "y",
        Depends { name = "x" },
      },
    }
  "#,
  );
  let project = workspace.resolve("p.weft.lua").unwrap();
  let y = project.product_by_name("y").unwrap();
  assert_eq!(
    y.module_properties.module_property("x", "a"),
    Some(VariantValue::from(1))
  );
  let x_id = project
    .products
    .iter()
    .position(|p| p.name == "x")
    .unwrap();
  assert!(y.dependencies.contains(&x_id));
}

#[test]
fn export_module_rules_and_taggers_reach_consumers() {
  let workspace = Workspace::new();
  workspace.write(
    "modules/m/m.weft.lua",
    r#"
    return Module {
      Rule {
        inputs = { "src" },
        outputFileTags = { "obj" },
        outputArtifacts = function(s) return {} end,
      },
      FileTagger { patterns = { "*.src" }, fileTags = { "src" } },
    }
  "#,
  );
  workspace.write(
    "p.weft.lua",
    r#"
    return Project {
      Product {
        name = "x",
        Export { Depends { name = "m" } },
      },
      Product {
        name = "y",
        Depends { name = "x" },
      },
    }
  "#,
  );
  let project = workspace.resolve("p.weft.lua").unwrap();
  let y = project.product_by_name("y").unwrap();
  assert!(y.rules.iter().any(|r| r.module.as_deref() == Some("m")));
  assert!(y.file_taggers.iter().any(|t| t.patterns == ["*.src"]));
}

#[test]
fn reference_cycles_are_detected() {
  let workspace = Workspace::new();
  workspace.write(
    "a.weft.lua",
    r#"return Project { references = { "b.weft.lua" } }"#,
  );
  workspace.write(
    "b.weft.lua",
    r#"return Project { references = { "a.weft.lua" } }"#,
  );
  let err = workspace.resolve("a.weft.lua");
  assert!(matches!(err, Err(LoadError::Cycle { .. })));
}

#[test]
fn referenced_directory_must_contain_exactly_one_description_file() {
  let workspace = Workspace::new();
  workspace.write("sub/one.weft.lua", r#"return Product { name = "one" }"#);
  workspace.write("sub/two.weft.lua", r#"return Product { name = "two" }"#);
  workspace.write("p.weft.lua", r#"return Project { references = { "sub" } }"#);
  let err = workspace.resolve("p.weft.lua");
  assert!(matches!(err, Err(LoadError::Invalid { .. })));

  fs::remove_file(workspace.temp.path().join("sub/two.weft.lua")).unwrap();
  let project = workspace.resolve("p.weft.lua").unwrap();
  assert_eq!(project.products.len(), 1);
  assert_eq!(project.products[0].name, "one");
}

#[test]
fn module_definitions_are_cached_per_profile() {
  let workspace = Workspace::new();
  let log_path = workspace.temp.path().join("parse.log");
  workspace.write(
    "modules/cc/cc.weft.lua",
    &format!(
      r#"
      local f = io.open("{}", "a")
      f:write("parsed\n")
      f:close()
      return Module {{ warningLevel = "none" }}
      "#,
      log_path.display()
    ),
  );
  workspace.write(
    "p.weft.lua",
    r#"
    return Project {
      Product { name = "a", Depends { name = "cc" } },
      Product { name = "b", Depends { name = "cc" } },
    }
  "#,
  );
  workspace.resolve("p.weft.lua").unwrap();
  let log = fs::read_to_string(&log_path).unwrap();
  assert_eq!(log.lines().count(), 1, "same (file, profile) must not re-parse");
}

#[test]
fn version_requirement_is_enforced() {
  let workspace = Workspace::new();
  workspace.write(
    "p.weft.lua",
    r#"return Project { minimumWeftVersion = "99.0.0" }"#,
  );
  let err = workspace.resolve("p.weft.lua");
  assert!(matches!(err, Err(LoadError::VersionMismatch { .. })));

  workspace.write(
    "q.weft.lua",
    r#"return Project { minimumWeftVersion = "not-a-version" }"#,
  );
  let err = workspace.resolve("q.weft.lua");
  assert!(matches!(err, Err(LoadError::InvalidVersion { .. })));
}

#[test]
fn multiple_export_items_are_rejected() {
  let workspace = Workspace::new();
  workspace.write(
    "p.weft.lua",
    r#"
    return Project {
      Product {
        name = "app",
        Export { a = 1 },
        Export { b = 2 },
      },
    }
  "#,
  );
  let err = workspace.resolve("p.weft.lua");
  assert!(matches!(err, Err(LoadError::DuplicateDefinition { .. })));
}

#[test]
fn missing_source_files_are_aggregated() {
  let workspace = Workspace::new();
  workspace.write(
    "p.weft.lua",
    r#"
    return Project {
      Product { name = "app", files = { "a.src", "b.src" } },
    }
  "#,
  );
  let err = workspace.resolve("p.weft.lua");
  let Err(LoadError::Aggregate(errors)) = err else {
    panic!("expected an aggregated failure");
  };
  assert_eq!(errors.len(), 2);
  assert!(errors.iter().all(|e| matches!(e, LoadError::MissingFile { .. })));
}

#[test]
fn duplicate_source_files_are_rejected() {
  let workspace = Workspace::new();
  workspace.write("main.src", "");
  workspace.write(
    "p.weft.lua",
    r#"
    return Project {
      Product {
        name = "app",
        Group { files = { "main.src" }, fileTags = { "src" } },
        Group { files = { "main.src" }, fileTags = { "src" } },
      },
    }
  "#,
  );
  let err = workspace.resolve("p.weft.lua");
  let Err(LoadError::Aggregate(errors)) = err else {
    panic!("expected an aggregated failure");
  };
  assert!(errors
    .iter()
    .any(|e| matches!(e, LoadError::DuplicateDefinition { .. })));
}

#[test]
fn product_name_must_not_collide_with_a_module_name() {
  let workspace = Workspace::new();
  workspace.write("modules/cc/cc.weft.lua", "return Module {}");
  workspace.write(
    "p.weft.lua",
    r#"
    return Project {
      Product { name = "cc", Depends { name = "cc" } },
    }
  "#,
  );
  let err = workspace.resolve("p.weft.lua");
  assert!(matches!(err, Err(LoadError::DuplicateDefinition { .. })));
}

#[test]
fn non_required_missing_module_becomes_presence_dummy() {
  let workspace = Workspace::new();
  workspace.write(
    "p.weft.lua",
    r#"
    return Project {
      Product {
        name = "app",
        Depends { name = "maybe", required = false },
        targetName = function(s)
          if s.maybe.present then return "with" else return "without" end
        end,
      },
    }
  "#,
  );
  let project = workspace.resolve("p.weft.lua").unwrap();
  assert_eq!(project.products[0].target_name, "without");
  // The dummy contributes no resolved module.
  assert!(project.products[0].modules.iter().all(|m| m.name != "maybe"));
}

#[test]
fn unresolvable_required_dependency_fails_late() {
  let workspace = Workspace::new();
  workspace.write(
    "p.weft.lua",
    r#"
    return Project {
      Product { name = "app", Depends { name = "nosuchthing" } },
    }
  "#,
  );
  let err = workspace.resolve("p.weft.lua");
  assert!(matches!(err, Err(LoadError::MissingModule { name, .. }) if name == "nosuchthing"));
}

#[test]
fn product_type_dependencies_bind_to_matching_products() {
  let workspace = Workspace::new();
  workspace.write(
    "p.weft.lua",
    r#"
    return Project {
      Product { name = "lib1", type = { "lib" } },
      Product { name = "app", Depends { productTypes = { "lib" } } },
    }
  "#,
  );
  let project = workspace.resolve("p.weft.lua").unwrap();
  let app = project.product_by_name("app").unwrap();
  let lib_id = project
    .products
    .iter()
    .position(|p| p.name == "lib1")
    .unwrap();
  assert!(app.dependencies.contains(&lib_id));
}

#[test]
fn wildcard_groups_expand_patterns() {
  let workspace = Workspace::new();
  workspace.write("src/a.src", "");
  workspace.write("src/deep/b.src", "");
  workspace.write("src/skip.tmp", "");
  workspace.write(
    "p.weft.lua",
    r#"
    return Project {
      Product {
        name = "app",
        Group { files = { "src/**/*.src" }, fileTags = { "src" } },
      },
    }
  "#,
  );
  let project = workspace.resolve("p.weft.lua").unwrap();
  let product = &project.products[0];
  let group = &product.groups[0];
  let wildcards = group.wildcards.as_ref().unwrap();
  assert_eq!(wildcards.files.len(), 2);
  assert!(wildcards.files.iter().all(|f| f.file_tags.contains("src")));
}

#[test]
fn probe_results_are_persisted_and_visible() {
  let workspace = Workspace::new();
  workspace.write(
    "p.weft.lua",
    r#"
    return Project {
      Product {
        name = "app",
        Probe {
          id = "check",
          found = false,
          configure = function(p) p.found = true end,
        },
        targetName = function(s)
          if s.check.found then return "found" else return "missing" end
        end,
      },
    }
  "#,
  );
  let project = workspace.resolve("p.weft.lua").unwrap();
  assert_eq!(project.products[0].target_name, "found");
}

#[test]
fn subprojects_are_loaded_and_can_be_disabled() {
  let workspace = Workspace::new();
  workspace.write(
    "sub/sub.weft.lua",
    r#"return Project { name = "subproject", Product { name = "tool" } }"#,
  );
  workspace.write(
    "p.weft.lua",
    r#"
    return Project {
      SubProject { filePath = "sub/sub.weft.lua" },
    }
  "#,
  );
  let project = workspace.resolve("p.weft.lua").unwrap();
  assert_eq!(project.products.len(), 1);
  assert_eq!(project.root.sub_projects.len(), 1);
  assert_eq!(project.root.sub_projects[0].name, "subproject");

  workspace.write(
    "q.weft.lua",
    r#"
    return Project {
      SubProject {
        filePath = "sub/sub.weft.lua",
        Properties { condition = function(s) return false end },
      },
    }
  "#,
  );
  let project = workspace.resolve("q.weft.lua").unwrap();
  assert_eq!(project.products.len(), 0);
}

#[test]
fn undeclared_properties_respect_the_strictness_mode() {
  let workspace = Workspace::new();
  workspace.write(
    "p.weft.lua",
    r#"return Project { Product { name = "app", bogus = 1 } }"#,
  );

  let mut params = workspace.params("p.weft.lua");
  params.property_checking = PropertyChecking::Strict;
  let err = resolve_project(params, &NullProgress);
  assert!(matches!(err, Err(LoadError::UndeclaredProperty { .. })));

  // The default mode downgrades the error to a warning.
  assert!(workspace.resolve("p.weft.lua").is_ok());
}

#[test]
fn path_properties_resolve_against_the_defining_file() {
  let workspace = Workspace::new();
  workspace.write(
    "modules/cc/cc.weft.lua",
    r#"return Module { includeDir = path("include") }"#,
  );
  workspace.write(
    "p.weft.lua",
    r#"return Project { Product { name = "app", Depends { name = "cc" } } }"#,
  );
  let project = workspace.resolve("p.weft.lua").unwrap();
  let value = project.products[0]
    .module_properties
    .module_property("cc", "includeDir")
    .unwrap();
  let expected = dunce::canonicalize(workspace.temp.path())
    .unwrap()
    .join("modules/cc/include");
  assert_eq!(value, json!(expected.display().to_string()));
}

#[test]
fn group_property_snapshots_do_not_leak_into_the_product() {
  let workspace = Workspace::new();
  workspace.write("a.src", "");
  workspace.write(
    "modules/cc/cc.weft.lua",
    r#"return Module { warningLevel = "none" }"#,
  );
  workspace.write(
    "p.weft.lua",
    r#"
    return Project {
      Product {
        name = "app",
        Depends { name = "cc" },
        Group {
          files = { "a.src" },
          fileTags = { "src" },
          cc = props { warningLevel = "loud" },
        },
      },
    }
  "#,
  );
  let project = workspace.resolve("p.weft.lua").unwrap();
  let product = &project.products[0];
  assert_eq!(
    product.module_properties.module_property("cc", "warningLevel"),
    Some(json!("none"))
  );
  let group = &product.groups[0];
  assert!(!group.properties.shares_with(&product.module_properties));
  assert_eq!(
    group.properties.module_property("cc", "warningLevel"),
    Some(json!("loud"))
  );
}

struct CancelImmediately;

impl ProgressObserver for CancelImmediately {
  fn canceled(&self) -> bool {
    true
  }
}

#[test]
fn cancellation_aborts_resolution() {
  let workspace = Workspace::new();
  workspace.write(
    "p.weft.lua",
    r#"return Project { Product { name = "app" } }"#,
  );
  let err = resolve_project(workspace.params("p.weft.lua"), &CancelImmediately);
  assert!(matches!(err, Err(LoadError::Canceled { .. })));
}

struct CountingProgress {
  maximum: Cell<usize>,
  increments: Cell<usize>,
}

impl ProgressObserver for CountingProgress {
  fn set_maximum(&self, maximum: usize) {
    self.maximum.set(maximum);
  }

  fn increment(&self) {
    self.increments.set(self.increments.get() + 1);
  }
}

#[test]
fn progress_is_reported_per_product() {
  let workspace = Workspace::new();
  workspace.write(
    "p.weft.lua",
    r#"
    return Project {
      Product { name = "a" },
      Product { name = "b" },
    }
  "#,
  );
  let progress = CountingProgress {
    maximum: Cell::new(0),
    increments: Cell::new(0),
  };
  resolve_project(workspace.params("p.weft.lua"), &progress).unwrap();
  assert_eq!(progress.maximum.get(), 2);
  assert_eq!(progress.increments.get(), 2);
}

#[test]
fn resolved_graph_serializes_to_json() {
  let workspace = Workspace::new();
  workspace.write("main.src", "");
  workspace.write(
    "p.weft.lua",
    r#"
    return Project {
      Product { name = "app", files = { "main.src" } },
    }
  "#,
  );
  let project = workspace.resolve("p.weft.lua").unwrap();
  let text = serde_json::to_string_pretty(&project).unwrap();
  assert!(text.contains("\"app\""));
  assert!(text.contains("main.src"));
}
