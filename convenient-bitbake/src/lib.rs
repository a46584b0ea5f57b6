//! BitBake-facing text formats
//!
//! Readers and writers for the files and command outputs a layered Yocto
//! build has to look at from the outside:
//! - `conf`/`.inc` assignments, edited in place without touching other lines
//! - the resolved variable dump of `bitbake -e`
//! - dependency graphs from `bitbake -g` and `bitbake-layers show-recipes`

use std::path::PathBuf;

pub mod bitbake_env;
pub mod conf;
pub mod dependency_report;

pub use bitbake_env::BitbakeEnv;
pub use conf::{Assignment, ConfFile, ConfLine};
pub use dependency_report::{
    parse_dot, parse_dot_file, parse_show_recipes, parse_show_recipes_file, CombinedReport,
    DependencyMap, PackageInfo, PackageLayers,
};

/// Errors from reading or editing BitBake files.
#[derive(Debug, thiserror::Error)]
pub enum ConfError {
    #[error("IO error at {0:?}: {1}")]
    Io(PathBuf, String),

    #[error("Key {0} is not assigned in {1:?}")]
    KeyNotFound(String, PathBuf),

    #[error("Key {0} is assigned {1} times in {2:?}, refusing to pick one")]
    AmbiguousKey(String, usize, PathBuf),

    #[error("Variable {0} is missing from the bitbake environment")]
    MissingVariable(String),

    #[error("Configuration was not read from a file, nowhere to save it")]
    NoPath,
}
