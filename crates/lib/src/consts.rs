//! Shared constants.

/// Suffix of project/module description files.
pub const DESC_FILE_SUFFIX: &str = ".weft.lua";

/// Subdirectory of a search path that holds module descriptions.
pub const MODULE_SEARCH_SUBDIR: &str = "modules";

/// Name of the base module attached to every product and module instance.
pub const BASE_MODULE_NAME: &str = "weft";

/// File tag given to artifacts that could not be tagged any other way.
pub const UNKNOWN_FILE_TAG: &str = "unknown-file-tag";

/// File tag implied by a true `weft.install` property.
pub const INSTALLABLE_TAG: &str = "installable";

/// Version of the running engine, checked against `minimumWeftVersion`.
pub const WEFT_VERSION: &str = env!("CARGO_PKG_VERSION");
