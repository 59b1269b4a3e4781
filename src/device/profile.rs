//! Object-store client profiles
//!
//! A profile file describes how to reach an object store:
//!
//! ```text
//! # comment
//! backend = posix
//! base_path = /var/lib/stordev/objects
//! host = s3.example.com:443
//! use_https = true
//! access_key = ...
//! secret_key = ...
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("cannot read profile {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("profile {path} line {line}: expected \"key = value\"")]
    Syntax { path: PathBuf, line: usize },

    #[error("profile {path}: invalid value for {key}: {value}")]
    InvalidValue {
        path: PathBuf,
        key: String,
        value: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectStoreProfile {
    /// Where the profile was loaded from
    pub path: PathBuf,
    /// Client backend, e.g. `posix` or `s3`
    pub backend: String,
    pub host: Option<String>,
    pub base_path: Option<PathBuf>,
    pub use_https: bool,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    /// Settings this crate does not interpret, passed on to connectors
    pub extra: BTreeMap<String, String>,
}

impl ObjectStoreProfile {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ProfileError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ProfileError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content, path)
    }

    pub fn parse(content: &str, path: &Path) -> Result<Self, ProfileError> {
        let mut profile = ObjectStoreProfile {
            path: path.to_path_buf(),
            backend: "s3".to_string(),
            host: None,
            base_path: None,
            use_https: true,
            access_key: None,
            secret_key: None,
            extra: BTreeMap::new(),
        };

        for (index, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line.split_once('=').ok_or_else(|| ProfileError::Syntax {
                path: path.to_path_buf(),
                line: index + 1,
            })?;
            let key = key.trim();
            let value = value.trim().trim_matches('"');

            match key {
                "backend" => profile.backend = value.to_string(),
                "host" => profile.host = Some(value.to_string()),
                "base_path" => profile.base_path = Some(PathBuf::from(value)),
                "use_https" => {
                    profile.use_https = parse_bool(value).ok_or_else(|| ProfileError::InvalidValue {
                        path: path.to_path_buf(),
                        key: key.to_string(),
                        value: value.to_string(),
                    })?
                }
                "access_key" => profile.access_key = Some(value.to_string()),
                "secret_key" => profile.secret_key = Some(value.to_string()),
                _ => {
                    profile.extra.insert(key.to_string(), value.to_string());
                }
            }
        }

        Ok(profile)
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" => Some(true),
        "false" | "no" | "0" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_profile() {
        let content = r#"
# local test store
backend = posix
base_path = "/srv/objects"
use_https = false
max_redirects = 3
"#;
        let profile = ObjectStoreProfile::parse(content, Path::new("test.profile")).unwrap();
        assert_eq!(profile.backend, "posix");
        assert_eq!(profile.base_path, Some(PathBuf::from("/srv/objects")));
        assert!(!profile.use_https);
        assert_eq!(profile.extra.get("max_redirects").map(String::as_str), Some("3"));
    }

    #[test]
    fn test_defaults() {
        let profile = ObjectStoreProfile::parse("host = s3.local", Path::new("p")).unwrap();
        assert_eq!(profile.backend, "s3");
        assert!(profile.use_https);
    }

    #[test]
    fn test_syntax_error() {
        let err = ObjectStoreProfile::parse("backend posix", Path::new("p")).unwrap_err();
        assert!(matches!(err, ProfileError::Syntax { line: 1, .. }));
    }

    #[test]
    fn test_bad_bool() {
        let err = ObjectStoreProfile::parse("use_https = maybe", Path::new("p")).unwrap_err();
        assert!(matches!(err, ProfileError::InvalidValue { .. }));
    }
}
