//! The `weft profiles` command.

use std::path::Path;

use anyhow::Result;
use owo_colors::OwoColorize;
use weft_lib::Settings;

pub fn cmd_profiles(settings_dir: &Path) -> Result<()> {
  let settings = Settings::new(settings_dir);
  let names = settings
    .profile_names()
    .map_err(|e| anyhow::anyhow!("{}", e))?;
  if names.is_empty() {
    eprintln!("{} no profiles in {}", "•".cyan(), settings_dir.display());
    return Ok(());
  }
  for name in names {
    println!("{}", name);
  }
  Ok(())
}
