use std::fs;

use assert_cmd::Command;
use predicates::prelude::*;

fn write_workspace(temp: &tempfile::TempDir) {
  fs::create_dir_all(temp.path().join("settings/profiles")).unwrap();
  fs::write(temp.path().join("settings/profiles/default.toml"), "").unwrap();
  fs::write(temp.path().join("main.src"), "").unwrap();
  fs::write(
    temp.path().join("p.weft.lua"),
    r#"
    return Project {
      Product { name = "app", files = { "main.src" } },
    }
  "#,
  )
  .unwrap();
}

#[test]
fn resolve_writes_the_graph_as_json() {
  let temp = tempfile::TempDir::new().unwrap();
  write_workspace(&temp);
  let output = temp.path().join("graph.json");

  Command::cargo_bin("weft")
    .unwrap()
    .args([
      "resolve",
      temp.path().join("p.weft.lua").to_str().unwrap(),
      "--settings-dir",
      temp.path().join("settings").to_str().unwrap(),
      "--output",
      output.to_str().unwrap(),
    ])
    .assert()
    .success();

  let graph: serde_json::Value = serde_json::from_str(&fs::read_to_string(&output).unwrap()).unwrap();
  assert_eq!(graph["products"][0]["name"], "app");
}

#[test]
fn resolve_reports_errors_for_missing_projects() {
  let temp = tempfile::TempDir::new().unwrap();
  Command::cargo_bin("weft")
    .unwrap()
    .args(["resolve", temp.path().join("nope.weft.lua").to_str().unwrap()])
    .assert()
    .failure();
}

#[test]
fn profiles_lists_stored_profiles() {
  let temp = tempfile::TempDir::new().unwrap();
  write_workspace(&temp);

  Command::cargo_bin("weft")
    .unwrap()
    .args([
      "profiles",
      "--settings-dir",
      temp.path().join("settings").to_str().unwrap(),
    ])
    .assert()
    .success()
    .stdout(predicate::str::contains("default"));
}
