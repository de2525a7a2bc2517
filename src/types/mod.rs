//! Core metadata types: names, versions, version ranges, package IDs.

mod name;
mod package;
mod version;

pub use name::{Name, NameError};
pub use package::{PkgId, PkgIdError};
pub use version::{parse_lenient_version, RangeError, VersionRange};

pub use semver::Version;
