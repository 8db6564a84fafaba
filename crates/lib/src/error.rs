//! Error types for project resolution.
//!
//! Resolution either completes with a fully valid graph or fails with one
//! [`LoadError`]. Structural and type errors abort immediately and carry the
//! source location they were detected at; per-group file errors are
//! aggregated into a single [`LoadError::Aggregate`] so the user sees every
//! missing or duplicate file at once.

use std::fmt;
use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

/// A position in a description file. A line of zero means "file only".
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CodeLocation {
  pub file: PathBuf,
  pub line: u32,
}

impl CodeLocation {
  pub fn new(file: impl Into<PathBuf>, line: u32) -> Self {
    Self {
      file: file.into(),
      line,
    }
  }

  /// File-only location, used when no line information is available.
  pub fn file_only(file: impl Into<PathBuf>) -> Self {
    Self::new(file, 0)
  }

  pub fn is_valid(&self) -> bool {
    !self.file.as_os_str().is_empty()
  }
}

impl fmt::Display for CodeLocation {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if self.line > 0 {
      write!(f, "{}:{}", self.file.display(), self.line)
    } else {
      write!(f, "{}", self.file.display())
    }
  }
}

fn join_errors(errors: &[LoadError]) -> String {
  let lines: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
  lines.join("\n")
}

/// Errors that can occur while loading and resolving a project.
#[derive(Debug, Error)]
pub enum LoadError {
  /// A description file could not be read or executed.
  #[error("parse error in {location}: {message}")]
  Parse {
    message: String,
    location: CodeLocation,
  },

  /// A property expression failed at evaluation time.
  #[error("script error at {location}: {message}")]
  Evaluation {
    message: String,
    location: CodeLocation,
  },

  /// `minimumWeftVersion` is not a valid version string.
  #[error("invalid version string '{value}' at {location}")]
  InvalidVersion {
    value: String,
    location: CodeLocation,
  },

  /// The project requires a newer engine.
  #[error("the project requires at least weft version {required}, but this is weft {actual}")]
  VersionMismatch { required: String, actual: String },

  /// A file or reference cycle.
  #[error("cycle detected: {message} ({location})")]
  Cycle {
    message: String,
    location: CodeLocation,
  },

  /// An item of an unexpected type, or an item where it is not allowed.
  #[error("unexpected item type '{type_name}' at {location}")]
  UnknownItemType {
    type_name: String,
    location: CodeLocation,
  },

  /// A property or item that no declaration covers. Fatal or downgraded to
  /// a warning depending on the configured property-checking mode.
  #[error("property '{name}' is not declared ({location})")]
  UndeclaredProperty {
    name: String,
    location: CodeLocation,
  },

  /// A module that was found on disk but could not be loaded.
  #[error("module {name} could not be loaded ({location})")]
  MissingModule {
    name: String,
    location: CodeLocation,
  },

  /// An override or profile value that cannot be coerced to the declared type.
  #[error("value '{value}' of property '{name}' has incompatible type")]
  TypeConversion { name: String, value: String },

  /// Duplicate Export items, source files, profile entries or names.
  #[error("{message} ({location})")]
  DuplicateDefinition {
    message: String,
    location: CodeLocation,
  },

  /// A profile referenced by name that the settings store does not contain.
  #[error("profile '{name}' does not exist")]
  MissingProfile { name: String },

  /// A module's own `validate` expression signalled failure.
  #[error("validation of module '{name}' failed ({location})")]
  Validation {
    name: String,
    location: CodeLocation,
  },

  /// A declared source file that does not exist on disk.
  #[error("file '{path}' does not exist ({location})")]
  MissingFile {
    path: PathBuf,
    location: CodeLocation,
  },

  /// The resolution was canceled through the progress observer.
  #[error("project resolving canceled for configuration {configuration}")]
  Canceled { configuration: String },

  /// Any other structural violation of the description language.
  #[error("{message} ({location})")]
  Invalid {
    message: String,
    location: CodeLocation,
  },

  #[error("i/o error on '{path}': {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  /// Several located errors reported as one failure.
  #[error("{}", join_errors(.0))]
  Aggregate(Vec<LoadError>),
}

impl LoadError {
  pub fn invalid(message: impl Into<String>, location: CodeLocation) -> Self {
    LoadError::Invalid {
      message: message.into(),
      location,
    }
  }

  pub fn duplicate(message: impl Into<String>, location: CodeLocation) -> Self {
    LoadError::DuplicateDefinition {
      message: message.into(),
      location,
    }
  }
}

pub type Result<T> = std::result::Result<T, LoadError>;

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn location_display_with_and_without_line() {
    let with_line = CodeLocation::new("/tmp/p.weft.lua", 12);
    assert_eq!(with_line.to_string(), "/tmp/p.weft.lua:12");
    let file_only = CodeLocation::file_only("/tmp/p.weft.lua");
    assert_eq!(file_only.to_string(), "/tmp/p.weft.lua");
  }

  #[test]
  fn aggregate_joins_messages() {
    let err = LoadError::Aggregate(vec![
      LoadError::MissingFile {
        path: "/a".into(),
        location: CodeLocation::file_only("/tmp/p.weft.lua"),
      },
      LoadError::MissingFile {
        path: "/b".into(),
        location: CodeLocation::file_only("/tmp/p.weft.lua"),
      },
    ]);
    let text = err.to_string();
    assert!(text.contains("/a"));
    assert!(text.contains("/b"));
  }
}
