mod profiles;
mod resolve;

pub use profiles::cmd_profiles;
pub use resolve::{ResolveOptions, cmd_resolve};
