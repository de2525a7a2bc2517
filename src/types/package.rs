//! Package identity: `(name, version, revision)`.

use std::fmt;
use std::str::FromStr;

use semver::Version;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{Name, NameError};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PkgIdError {
    #[error("package ID {0:?} is missing the '@version' part")]
    MissingVersion(String),

    #[error(transparent)]
    Name(#[from] NameError),

    #[error("bad version in package ID {0:?}: {1}")]
    BadVersion(String, String),

    #[error("bad revision in package ID {0:?}: {1}")]
    BadRevision(String, String),
}

/// Identifies one publication of a package: `name@1.2.3~0`.
///
/// The revision distinguishes re-publications of the same `(name, version)`
/// with updated metadata; an otherwise-equal pair orders by descending
/// revision, so `Ord` here is plain ascending and callers sort descending.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PkgId {
    pub name: Name,
    pub version: Version,
    pub revision: u32,
}

impl PkgId {
    pub fn new(name: Name, version: Version, revision: u32) -> Self {
        Self {
            name,
            version,
            revision,
        }
    }

    /// Directory name of this publication under the store: `1.2.3~0`.
    pub fn dir_name(&self) -> String {
        format!("{}~{}", self.version, self.revision)
    }
}

impl fmt::Display for PkgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}~{}", self.name, self.version, self.revision)
    }
}

impl FromStr for PkgId {
    type Err = PkgIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name_str, rest) = s
            .split_once('@')
            .ok_or_else(|| PkgIdError::MissingVersion(s.to_string()))?;
        let name = Name::new(name_str)?;

        let (version_str, revision) = match rest.rsplit_once('~') {
            Some((v, r)) => {
                let rev = r
                    .parse::<u32>()
                    .map_err(|e| PkgIdError::BadRevision(s.to_string(), e.to_string()))?;
                (v, rev)
            }
            None => (rest, 0),
        };

        let version = Version::parse(version_str)
            .map_err(|e| PkgIdError::BadVersion(s.to_string(), e.to_string()))?;

        Ok(Self {
            name,
            version,
            revision,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display() {
        let id: PkgId = "zlib@1.2.13~2".parse().unwrap();
        assert_eq!(id.name, "zlib");
        assert_eq!(id.version, Version::new(1, 2, 13));
        assert_eq!(id.revision, 2);
        assert_eq!(id.to_string(), "zlib@1.2.13~2");
        assert_eq!(id.dir_name(), "1.2.13~2");
    }

    #[test]
    fn revision_defaults_to_zero() {
        let id: PkgId = "fmt@10.1.0".parse().unwrap();
        assert_eq!(id.revision, 0);
    }

    #[test]
    fn rejects_malformed() {
        assert!(matches!(
            "fmt".parse::<PkgId>(),
            Err(PkgIdError::MissingVersion(_))
        ));
        assert!(matches!(
            "fmt@not-a-version".parse::<PkgId>(),
            Err(PkgIdError::BadVersion(..))
        ));
        assert!(matches!(
            "fmt@1.0.0~x".parse::<PkgId>(),
            Err(PkgIdError::BadRevision(..))
        ));
    }
}
