//! Git identity handling for repo-based checkouts
//!
//! `repo init` refuses to run without `user.name` and `user.email`, so a
//! build host needs an identity before the first manifest is initialised.
//! The identity is cached in two small files so it only has to be entered
//! once, and applied to the global git configuration with libgit2.

use std::path::{Path, PathBuf};

use git2::Config;
use tracing::{debug, info};

const NAME_FILE: &str = "git-user-name";
const EMAIL_FILE: &str = "git-user-email";

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("IO error at {0:?}: {1}")]
    Io(PathBuf, String),

    #[error("Git configuration error: {0}")]
    Git(#[from] git2::Error),

    #[error("Git {0} must not be empty")]
    Empty(&'static str),

    #[error("Git email {0:?} does not look like an email address")]
    InvalidEmail(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitIdentity {
    pub name: String,
    pub email: String,
}

impl GitIdentity {
    pub fn new(name: &str, email: &str) -> Result<GitIdentity, IdentityError> {
        let name = name.trim();
        let email = email.trim();
        if name.is_empty() {
            return Err(IdentityError::Empty("user name"));
        }
        if email.is_empty() {
            return Err(IdentityError::Empty("user email"));
        }
        if !email.contains('@') {
            return Err(IdentityError::InvalidEmail(email.to_string()));
        }
        Ok(GitIdentity {
            name: name.to_string(),
            email: email.to_string(),
        })
    }

    /// Load a cached identity. Returns `Ok(None)` when nothing is cached yet.
    pub fn load(cache_dir: &Path) -> Result<Option<GitIdentity>, IdentityError> {
        let name_path = cache_dir.join(NAME_FILE);
        let email_path = cache_dir.join(EMAIL_FILE);
        if !name_path.exists() || !email_path.exists() {
            debug!("No cached git identity in {:?}", cache_dir);
            return Ok(None);
        }
        let name = read_trimmed(&name_path)?;
        let email = read_trimmed(&email_path)?;
        GitIdentity::new(&name, &email).map(Some)
    }

    pub fn save(&self, cache_dir: &Path) -> Result<(), IdentityError> {
        std::fs::create_dir_all(cache_dir)
            .map_err(|e| IdentityError::Io(cache_dir.to_path_buf(), e.to_string()))?;
        for (file, value) in [(NAME_FILE, &self.name), (EMAIL_FILE, &self.email)] {
            let path = cache_dir.join(file);
            std::fs::write(&path, format!("{}\n", value))
                .map_err(|e| IdentityError::Io(path.clone(), e.to_string()))?;
        }
        debug!("Cached git identity in {:?}", cache_dir);
        Ok(())
    }

    /// Read `user.name` and `user.email` from a git configuration.
    pub fn from_config(config: &Config) -> Option<GitIdentity> {
        let name = config.get_string("user.name").ok()?;
        let email = config.get_string("user.email").ok()?;
        GitIdentity::new(&name, &email).ok()
    }

    pub fn apply_to(&self, config: &mut Config) -> Result<(), IdentityError> {
        config.set_str("user.name", &self.name)?;
        config.set_str("user.email", &self.email)?;
        Ok(())
    }

    /// Write the identity into the user's global git configuration,
    /// creating `~/.gitconfig` under `home` if there is none yet.
    pub fn apply_global(&self, home: &Path) -> Result<(), IdentityError> {
        let path = Config::find_global().unwrap_or_else(|_| home.join(".gitconfig"));
        let mut config = Config::open(&path)?;
        self.apply_to(&mut config)?;
        info!(
            "Configured git identity {} <{}> in {:?}",
            self.name, self.email, path
        );
        Ok(())
    }
}

fn read_trimmed(path: &Path) -> Result<String, IdentityError> {
    std::fs::read_to_string(path)
        .map(|s| s.trim().to_string())
        .map_err(|e| IdentityError::Io(path.to_path_buf(), e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tracing_test::traced_test;

    #[test]
    fn rejects_incomplete_identities() {
        assert!(matches!(
            GitIdentity::new("  ", "dev@example.com"),
            Err(IdentityError::Empty(_))
        ));
        assert!(matches!(
            GitIdentity::new("Dev", ""),
            Err(IdentityError::Empty(_))
        ));
        assert!(matches!(
            GitIdentity::new("Dev", "dev.example.com"),
            Err(IdentityError::InvalidEmail(_))
        ));
    }

    #[test]
    #[traced_test]
    fn cache_round_trip() {
        let temp = TempDir::new().unwrap();
        let cache = temp.path().join("config/layer-build");
        assert_eq!(GitIdentity::load(&cache).unwrap(), None);

        let identity = GitIdentity::new(" Build Bot ", "bot@example.com\n").unwrap();
        identity.save(&cache).unwrap();

        let loaded = GitIdentity::load(&cache).unwrap().unwrap();
        assert_eq!(loaded.name, "Build Bot");
        assert_eq!(loaded.email, "bot@example.com");
    }

    #[test]
    fn half_written_cache_counts_as_missing() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join(NAME_FILE), "Build Bot\n").unwrap();
        assert_eq!(GitIdentity::load(temp.path()).unwrap(), None);
    }

    #[test]
    fn applies_to_a_config_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("gitconfig");
        std::fs::write(&path, "").unwrap();

        let identity = GitIdentity::new("Build Bot", "bot@example.com").unwrap();
        let mut config = Config::open(&path).unwrap();
        identity.apply_to(&mut config).unwrap();

        let reopened = Config::open(&path).unwrap();
        assert_eq!(GitIdentity::from_config(&reopened), Some(identity));
    }
}
