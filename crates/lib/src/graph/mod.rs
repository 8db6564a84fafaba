//! The resolved project graph handed to the build-execution engine.

pub mod types;

pub use types::{
  ArtifactBinding, ArtifactProperties, FileTagger, FileTags, ProductId, ProjectNode, PropertyMap,
  ResolvedGroup, ResolvedModule, ResolvedProduct, ResolvedProject, ResolvedScanner,
  ResolvedTransformer, Rule, RuleArtifact, ScriptValue, SourceArtifact, SourceWildcards,
};
