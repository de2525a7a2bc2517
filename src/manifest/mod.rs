//! Package and library manifests.
//!
//! A package manifest describes one publication: its identity, the libraries
//! it provides, and the dependency expressions attached to each library.
//! Manifests are read from a permissive JSON dialect (see [`json`]) and
//! serialized back as plain JSON, which the dialect accepts unchanged.

pub mod json;

use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use semver::Version;
use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::types::{Name, PkgId, VersionRange};

pub use json::WalkError;

#[derive(Error, Debug)]
pub enum ManifestError {
    #[error(transparent)]
    Walk(#[from] WalkError),

    #[error("could not read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("duplicate library {0:?} in package manifest")]
    DuplicateLibrary(Name),

    #[error("library reference {0:?} must be written as \"pkg/lib\" or \"lib\"")]
    BadLibRef(String),
}

/// Dependency classification: when the dependency is needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DepKind {
    Lib,
    Test,
    App,
}

impl DepKind {
    pub const KNOWN: &'static [&'static str] = &["lib", "test", "app"];

    pub fn as_str(self) -> &'static str {
        match self {
            DepKind::Lib => "lib",
            DepKind::Test => "test",
            DepKind::App => "app",
        }
    }

    fn from_known(s: &str) -> Self {
        match s {
            "test" => DepKind::Test,
            "app" => DepKind::App,
            _ => DepKind::Lib,
        }
    }
}

impl fmt::Display for DepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One dependency requirement: a package name, the admissible version range,
/// the libraries to pull in from that package, and the dependency kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyExpr {
    pub name: Name,
    pub range: VersionRange,
    pub using: BTreeSet<Name>,
    pub kind: DepKind,
}

impl DependencyExpr {
    /// Parse a CLI-style requirement: `name`, `name@^1.2`, or `name ^1.2`.
    pub fn parse_requirement(s: &str) -> Result<Self, ManifestError> {
        let (name_str, range_str) = match s.split_once(['@', ' ']) {
            Some((n, r)) => (n.trim(), Some(r.trim())),
            None => (s.trim(), None),
        };
        let name = Name::new(name_str).map_err(|e| json::invalid("requirement", e))?;
        let range = match range_str {
            Some(r) if !r.is_empty() => {
                VersionRange::parse(r).map_err(|e| json::invalid("requirement", e))?
            }
            _ => VersionRange::any(),
        };
        Ok(Self {
            name,
            range,
            using: BTreeSet::new(),
            kind: DepKind::Lib,
        })
    }
}

impl fmt::Display for DependencyExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.name, self.range)
    }
}

/// A `pkg/lib` pair naming a library inside some package. The short form
/// `"lib"` refers to a library of the same-named package.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LibRef {
    pub pkg: Name,
    pub lib: Name,
}

impl LibRef {
    pub fn parse(s: &str) -> Result<Self, ManifestError> {
        let make = |p: &str, l: &str| -> Result<Self, ManifestError> {
            let pkg = Name::new(p).map_err(|_| ManifestError::BadLibRef(s.to_string()))?;
            let lib = Name::new(l).map_err(|_| ManifestError::BadLibRef(s.to_string()))?;
            Ok(Self { pkg, lib })
        };
        match s.split_once('/') {
            Some((p, l)) => make(p, l),
            None => make(s, s),
        }
    }
}

impl fmt::Display for LibRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.pkg, self.lib)
    }
}

/// A library inside a package: where it lives, what it uses, its sources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibraryManifest {
    pub name: Name,
    /// Library root directory, relative to the package root.
    pub path: String,
    /// Libraries whose public headers and archives this library consumes.
    pub uses: Vec<LibRef>,
    /// Link-time-only uses: archives at link, no include grant.
    pub links: Vec<LibRef>,
    /// Optional source globs relative to the library root; empty means the
    /// standard `src/` + `include/` layout.
    pub source_globs: Vec<String>,
    pub dependencies: Vec<DependencyExpr>,
}

/// The manifest of one package publication.
#[derive(Debug, Clone, PartialEq)]
pub struct PackageManifest {
    pub id: PkgId,
    pub libraries: Vec<LibraryManifest>,
    /// Opaque metadata carried through unparsed.
    pub meta: Map<String, Value>,
}

const PKG_KEYS: &[&str] = &["name", "version", "revision", "libraries", "meta"];
const LIB_KEYS: &[&str] = &[
    "name",
    "path",
    "uses",
    "links",
    "sources",
    "dependencies",
];
const DEP_KEYS: &[&str] = &["name", "versions", "using", "kind"];

impl PackageManifest {
    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        let text = std::fs::read_to_string(path).map_err(|source| ManifestError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, ManifestError> {
        let root = json::parse_text(text)?;
        Self::from_value(&root)
    }

    fn from_value(root: &Value) -> Result<Self, ManifestError> {
        let map = json::mapping(root, "$")?;
        json::check_keys(map, PKG_KEYS, "$")?;

        let name_str = json::string(json::required(map, "name", "$")?, "$.name")?;
        let name = Name::new(name_str).map_err(|e| json::invalid("$.name", e))?;

        let version_str = json::string(json::required(map, "version", "$")?, "$.version")?;
        let version =
            Version::from_str(version_str).map_err(|e| json::invalid("$.version", e))?;

        let revision = match map.get("revision") {
            Some(v) => u32::try_from(json::integer(v, "$.revision")?)
                .map_err(|e| json::invalid("$.revision", e))?,
            None => 0,
        };

        let mut libraries = Vec::new();
        if let Some(libs) = map.get("libraries") {
            for (i, lib) in json::array(libs, "$.libraries")?.iter().enumerate() {
                let path = format!("$.libraries[{i}]");
                libraries.push(parse_library(lib, &path)?);
            }
        }

        let mut seen = BTreeSet::new();
        for lib in &libraries {
            if !seen.insert(lib.name.clone()) {
                return Err(ManifestError::DuplicateLibrary(lib.name.clone()));
            }
        }

        let meta = match map.get("meta") {
            Some(v) => json::mapping(v, "$.meta")?.clone(),
            None => Map::new(),
        };

        Ok(Self {
            id: PkgId::new(name, version, revision),
            libraries,
            meta,
        })
    }

    /// Serialize as strict JSON (valid input for the permissive parser).
    pub fn to_json_string(&self) -> String {
        let libraries: Vec<Value> = self
            .libraries
            .iter()
            .map(|lib| {
                json!({
                    "name": lib.name.as_str(),
                    "path": lib.path,
                    "uses": lib.uses.iter().map(|u| u.to_string()).collect::<Vec<_>>(),
                    "links": lib.links.iter().map(|u| u.to_string()).collect::<Vec<_>>(),
                    "sources": lib.source_globs,
                    "dependencies": lib
                        .dependencies
                        .iter()
                        .map(|d| {
                            json!({
                                "name": d.name.as_str(),
                                "versions": d.range.to_string(),
                                "using": d.using.iter().map(Name::as_str).collect::<Vec<_>>(),
                                "kind": d.kind.as_str(),
                            })
                        })
                        .collect::<Vec<_>>(),
                })
            })
            .collect();

        let doc = json!({
            "name": self.id.name.as_str(),
            "version": self.id.version.to_string(),
            "revision": self.id.revision,
            "libraries": libraries,
            "meta": Value::Object(self.meta.clone()),
        });
        serde_json::to_string_pretty(&doc).expect("manifest serialization cannot fail")
    }

    /// All dependency expressions across libraries, filtered by kind.
    pub fn dependencies_of_kind(&self, kinds: &[DepKind]) -> Vec<&DependencyExpr> {
        self.libraries
            .iter()
            .flat_map(|l| l.dependencies.iter())
            .filter(|d| kinds.contains(&d.kind))
            .collect()
    }

    /// Whether the package provides a library with the given name.
    pub fn provides_library(&self, lib: &Name) -> bool {
        self.libraries.iter().any(|l| &l.name == lib)
    }
}

fn parse_library(v: &Value, path: &str) -> Result<LibraryManifest, ManifestError> {
    let map = json::mapping(v, path)?;
    json::check_keys(map, LIB_KEYS, path)?;

    let name_str = json::string(json::required(map, "name", path)?, &format!("{path}.name"))?;
    let name = Name::new(name_str).map_err(|e| json::invalid(&format!("{path}.name"), e))?;

    let lib_path = match map.get("path") {
        Some(v) => json::string(v, &format!("{path}.path"))?.to_string(),
        None => ".".to_string(),
    };

    let uses = parse_lib_refs(map.get("uses"), &format!("{path}.uses"))?;
    let links = parse_lib_refs(map.get("links"), &format!("{path}.links"))?;

    let mut source_globs = Vec::new();
    if let Some(v) = map.get("sources") {
        let p = format!("{path}.sources");
        for (i, g) in json::array(v, &p)?.iter().enumerate() {
            source_globs.push(json::string(g, &format!("{p}[{i}]"))?.to_string());
        }
    }

    let mut dependencies = Vec::new();
    if let Some(v) = map.get("dependencies") {
        let p = format!("{path}.dependencies");
        for (i, d) in json::array(v, &p)?.iter().enumerate() {
            dependencies.push(parse_dependency(d, &format!("{p}[{i}]"))?);
        }
    }

    Ok(LibraryManifest {
        name,
        path: lib_path,
        uses,
        links,
        source_globs,
        dependencies,
    })
}

fn parse_lib_refs(v: Option<&Value>, path: &str) -> Result<Vec<LibRef>, ManifestError> {
    let Some(v) = v else { return Ok(Vec::new()) };
    let mut refs = Vec::new();
    for (i, r) in json::array(v, path)?.iter().enumerate() {
        let p = format!("{path}[{i}]");
        let s = json::string(r, &p)?;
        refs.push(LibRef::parse(s).map_err(|e| json::invalid(&p, e))?);
    }
    Ok(refs)
}

fn parse_dependency(v: &Value, path: &str) -> Result<DependencyExpr, ManifestError> {
    let map = json::mapping(v, path)?;
    json::check_keys(map, DEP_KEYS, path)?;

    let name_str = json::string(json::required(map, "name", path)?, &format!("{path}.name"))?;
    let name = Name::new(name_str).map_err(|e| json::invalid(&format!("{path}.name"), e))?;

    let range = match map.get("versions") {
        Some(v) => {
            let p = format!("{path}.versions");
            VersionRange::parse(json::string(v, &p)?).map_err(|e| json::invalid(&p, e))?
        }
        None => VersionRange::any(),
    };

    let mut using = BTreeSet::new();
    if let Some(v) = map.get("using") {
        let p = format!("{path}.using");
        for (i, u) in json::array(v, &p)?.iter().enumerate() {
            let up = format!("{p}[{i}]");
            let s = json::string(u, &up)?;
            using.insert(Name::new(s).map_err(|e| json::invalid(&up, e))?);
        }
    }

    let kind = match map.get("kind") {
        Some(v) => DepKind::from_known(json::variant(
            v,
            DepKind::KNOWN,
            &format!("{path}.kind"),
        )?),
        None => DepKind::Lib,
    };

    Ok(DependencyExpr {
        name,
        range,
        using,
        kind,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        name: 'imgtool',
        version: "2.1.0",
        revision: 1,
        libraries: [
            {
                name: 'imgtool',
                uses: ['zlib/zlib'],
                dependencies: [
                    { name: 'zlib', versions: '^1.2', using: ['zlib'] },
                    { name: 'catch2', versions: '^3', kind: 'test' },
                ],
            },
            { name: 'imgtool-extras', path: 'extras', links: ['imgtool/imgtool'] },
        ],
        meta: { homepage: 'https://example.com/imgtool' },
    }"#;

    #[test]
    fn parses_full_manifest() {
        let man = PackageManifest::parse(SAMPLE).unwrap();
        assert_eq!(man.id.to_string(), "imgtool@2.1.0~1");
        assert_eq!(man.libraries.len(), 2);

        let main = &man.libraries[0];
        assert_eq!(main.uses[0].to_string(), "zlib/zlib");
        assert_eq!(main.dependencies.len(), 2);
        assert_eq!(main.dependencies[1].kind, DepKind::Test);
        assert!(main.dependencies[0].using.contains(&Name::new("zlib").unwrap()));

        assert_eq!(man.libraries[1].path, "extras");
        assert!(man.meta.contains_key("homepage"));
    }

    #[test]
    fn round_trip_is_structurally_equal() {
        let man = PackageManifest::parse(SAMPLE).unwrap();
        let text = man.to_json_string();
        let back = PackageManifest::parse(&text).unwrap();
        assert_eq!(man, back);
    }

    #[test]
    fn duplicate_library_rejected() {
        let err = PackageManifest::parse(
            "{ name: 'x', version: '1.0.0', libraries: [{name: 'a'}, {name: 'a'}] }",
        )
        .unwrap_err();
        assert!(matches!(err, ManifestError::DuplicateLibrary(_)));
    }

    #[test]
    fn unknown_key_reports_did_you_mean() {
        let err =
            PackageManifest::parse("{ name: 'x', version: '1.0.0', librarys: [] }").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("librarys"), "{msg}");
        assert!(msg.contains("libraries"), "{msg}");
    }

    #[test]
    fn bad_kind_reports_did_you_mean() {
        let err = PackageManifest::parse(
            "{ name: 'x', version: '1.0.0', libraries: [{ name: 'x', dependencies: [{ name: 'y', kind: 'tst' }] }] }",
        )
        .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("tst"), "{msg}");
        assert!(msg.contains("test"), "{msg}");
    }

    #[test]
    fn requirement_parsing() {
        let r = DependencyExpr::parse_requirement("zlib@^1.2").unwrap();
        assert_eq!(r.name, "zlib");
        assert!(r.range.contains(&Version::new(1, 2, 13)));

        let r = DependencyExpr::parse_requirement("fmt").unwrap();
        assert_eq!(r.range, VersionRange::any());

        let r = DependencyExpr::parse_requirement("bar <1.3").unwrap();
        assert!(!r.range.contains(&Version::new(1, 3, 0)));
    }
}
