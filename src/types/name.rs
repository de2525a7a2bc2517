//! Package and library names.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NameError {
    #[error("name cannot be empty")]
    Empty,

    #[error("invalid character {1:?} in name {0:?}: names match [a-z0-9][a-z0-9_.-]*")]
    InvalidChar(String, char),

    #[error("name {0:?} must start with a lowercase letter or digit")]
    BadLeader(String),
}

/// A package or library name.
///
/// Non-empty, case-sensitive, matching `[a-z0-9][a-z0-9_.-]*`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Name(String);

impl Name {
    pub fn new(s: impl Into<String>) -> Result<Self, NameError> {
        let s = s.into();
        let mut chars = s.chars();
        match chars.next() {
            None => return Err(NameError::Empty),
            Some(c) if !c.is_ascii_lowercase() && !c.is_ascii_digit() => {
                return Err(NameError::BadLeader(s))
            }
            Some(_) => {}
        }
        for c in chars.clone() {
            let ok = c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '_' | '.' | '-');
            if !ok {
                return Err(NameError::InvalidChar(s, c));
            }
        }
        Ok(Self(s))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Name {
    type Err = NameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for Name {
    type Error = NameError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<Name> for String {
    fn from(n: Name) -> String {
        n.0
    }
}

impl AsRef<str> for Name {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl PartialEq<str> for Name {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for Name {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_typical_names() {
        for ok in ["zlib", "fmt", "boost.asio", "my_lib", "sdl2-image", "7zip"] {
            assert!(Name::new(ok).is_ok(), "{ok} should be valid");
        }
    }

    #[test]
    fn rejects_bad_names() {
        assert_eq!(Name::new(""), Err(NameError::Empty));
        assert!(matches!(Name::new("Zlib"), Err(NameError::BadLeader(_))));
        assert!(matches!(Name::new("-dash"), Err(NameError::BadLeader(_))));
        assert!(matches!(
            Name::new("has space"),
            Err(NameError::InvalidChar(_, ' '))
        ));
        assert!(matches!(
            Name::new("upperCase"),
            Err(NameError::InvalidChar(_, 'C'))
        ));
    }

    #[test]
    fn ordering_is_lexicographic() {
        let mut names: Vec<Name> = ["zlib", "abc", "fmt"]
            .iter()
            .map(|s| Name::new(*s).unwrap())
            .collect();
        names.sort();
        assert_eq!(names[0], "abc");
        assert_eq!(names[2], "zlib");
    }
}
