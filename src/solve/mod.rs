//! Version-constrained dependency resolution.
//!
//! Deterministic backtracking search over an index snapshot. The open
//! requirement with the fewest remaining candidates is decided first (ties
//! break on name order), candidates are tried in `(version desc, revision
//! desc, priority desc)` order, and range intersections propagate onto
//! shared names. The first complete assignment found is therefore the
//! lexicographically-latest-compatible solution.
//!
//! On failure the solver reports the minimal unsatisfiable core of the root
//! requirements, found by re-solving shrunken subsets, together with
//! did-you-mean suggestions for names absent from the index.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use thiserror::Error;
use tracing::debug;

use crate::dym::did_you_mean;
use crate::index::Universe;
use crate::manifest::{DepKind, DependencyExpr, PackageManifest};
use crate::types::{Name, PkgId, VersionRange};

#[derive(Error, Debug)]
pub enum SolveError {
    #[error("{0}")]
    Unsat(UnsatReport),
}

/// Failure report: the minimal subset of root requirements that cannot be
/// jointly satisfied, and suggestions for unknown names.
#[derive(Debug)]
pub struct UnsatReport {
    pub core: Vec<DependencyExpr>,
    pub unknown: Vec<(Name, Option<String>)>,
}

impl fmt::Display for UnsatReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "no solution for requirements:")?;
        for req in &self.core {
            write!(f, " {{{req}}}")?;
        }
        for (name, suggestion) in &self.unknown {
            write!(f, "; {name:?} is not a known package")?;
            if let Some(s) = suggestion {
                write!(f, " (did you mean {s:?}?)")?;
            }
        }
        Ok(())
    }
}

/// One selected publication in a resolved set.
#[derive(Debug, Clone)]
pub struct ResolvedPkg {
    pub id: PkgId,
    pub remote_url: String,
    pub manifest: PackageManifest,
    pub archive_sha256: String,
}

/// Closed, constraint-satisfying `name -> publication` map.
#[derive(Debug, Clone, Default)]
pub struct Resolved {
    pub packages: BTreeMap<Name, ResolvedPkg>,
}

impl Resolved {
    pub fn ids(&self) -> impl Iterator<Item = &PkgId> {
        self.packages.values().map(|p| &p.id)
    }
}

/// Search state. Cloned per decision; backtracking is a return.
#[derive(Clone)]
struct State {
    /// name -> index into the universe's candidate list for that name.
    assignment: BTreeMap<Name, usize>,
    /// Accumulated range intersection per name.
    constraints: BTreeMap<Name, VersionRange>,
    /// Names with a constraint but no assignment yet.
    open: BTreeSet<Name>,
}

/// Scratch shared across the whole search.
struct Search<'u> {
    universe: &'u Universe,
    decisions: usize,
}

/// Resolve `roots` against the snapshot. The solver only reads the snapshot
/// and owns no state visible outside this call.
pub fn solve(universe: &Universe, roots: &[DependencyExpr]) -> Result<Resolved, SolveError> {
    match try_solve(universe, roots) {
        Some(resolved) => Ok(resolved),
        None => {
            let core = minimal_core(universe, roots);
            let unknown = unknown_names(universe, roots);
            Err(SolveError::Unsat(UnsatReport { core, unknown }))
        }
    }
}

fn try_solve(universe: &Universe, roots: &[DependencyExpr]) -> Option<Resolved> {
    let mut state = State {
        assignment: BTreeMap::new(),
        constraints: BTreeMap::new(),
        open: BTreeSet::new(),
    };
    let mut search = Search {
        universe,
        decisions: 0,
    };

    for req in roots {
        if !merge_requirement(&mut state, req) {
            return None;
        }
    }

    let assignment = search_from(&mut search, &state)?;
    debug!(decisions = search.decisions, "solve complete");

    let mut resolved = Resolved::default();
    for (name, idx) in assignment {
        let cand = &universe.candidates(&name)[idx];
        resolved.packages.insert(
            name,
            ResolvedPkg {
                id: cand.id.clone(),
                remote_url: cand.remote_url.clone(),
                manifest: cand.manifest.clone(),
                archive_sha256: cand.archive_sha256.clone(),
            },
        );
    }
    Some(resolved)
}

/// Intersect `req` into the state. False means the state became unsatisfiable
/// (an already-assigned package falls outside the narrowed range, or the
/// intersection is empty).
fn merge_requirement(state: &mut State, req: &DependencyExpr) -> bool {
    let merged = match state.constraints.get(&req.name) {
        Some(existing) => existing.intersect(&req.range),
        None => req.range.clone(),
    };
    if merged.is_empty() {
        return false;
    }
    state.constraints.insert(req.name.clone(), merged);

    if !state.assignment.contains_key(&req.name) {
        state.open.insert(req.name.clone());
    }
    true
}

/// Candidate indices for `name` admitted by the current constraint, in the
/// universe's `(version desc, revision desc, priority desc)` order.
fn admitted(universe: &Universe, state: &State, name: &Name) -> Vec<usize> {
    let range = state
        .constraints
        .get(name)
        .expect("open names always carry a constraint");
    universe
        .candidates(name)
        .iter()
        .enumerate()
        .filter(|(_, c)| range.contains(&c.id.version))
        .map(|(i, _)| i)
        .collect()
}

fn search_from(search: &mut Search<'_>, state: &State) -> Option<BTreeMap<Name, usize>> {
    if state.open.is_empty() {
        return Some(state.assignment.clone());
    }

    // Smallest-domain-first; BTreeSet iteration breaks ties by name order.
    let (name, candidates) = state
        .open
        .iter()
        .map(|n| (n.clone(), admitted(search.universe, state, n)))
        .min_by_key(|(n, c)| (c.len(), n.clone()))
        .expect("open set is non-empty");

    if candidates.is_empty() {
        return None;
    }

    for idx in candidates {
        search.decisions += 1;
        let cand = &search.universe.candidates(&name)[idx];

        let mut next = state.clone();
        next.open.remove(&name);
        next.assignment.insert(name.clone(), idx);

        // Selecting a candidate imposes all of its library dependencies.
        let mut consistent = true;
        for dep in cand.manifest.dependencies_of_kind(&[DepKind::Lib]) {
            if !merge_requirement(&mut next, dep) {
                consistent = false;
                break;
            }
            if let Some(&assigned) = next.assignment.get(&dep.name) {
                let version = &search.universe.candidates(&dep.name)[assigned].id.version;
                if !next.constraints[&dep.name].contains(version) {
                    consistent = false;
                    break;
                }
            }
        }
        if !consistent {
            continue;
        }

        if let Some(solution) = search_from(search, &next) {
            return Some(solution);
        }
    }
    None
}

/// Shrink the root set to a minimal subset that is still unsatisfiable.
/// Linear delta-shrink: drop each root in turn and keep the drop whenever
/// the remainder stays unsatisfiable.
fn minimal_core(universe: &Universe, roots: &[DependencyExpr]) -> Vec<DependencyExpr> {
    let mut core: Vec<DependencyExpr> = roots.to_vec();
    let mut i = 0;
    while i < core.len() {
        let mut without: Vec<DependencyExpr> = core.clone();
        without.remove(i);
        if without.is_empty() {
            break;
        }
        if try_solve(universe, &without).is_none() {
            core = without;
        } else {
            i += 1;
        }
    }
    core
}

fn unknown_names(universe: &Universe, roots: &[DependencyExpr]) -> Vec<(Name, Option<String>)> {
    // Names reachable from the roots that have no candidates at all.
    let mut seen = BTreeSet::new();
    let mut queue: Vec<Name> = roots.iter().map(|r| r.name.clone()).collect();
    let mut unknown = Vec::new();

    while let Some(name) = queue.pop() {
        if !seen.insert(name.clone()) {
            continue;
        }
        let cands = universe.candidates(&name);
        if cands.is_empty() {
            let suggestion =
                did_you_mean(name.as_str(), universe.known_names()).map(str::to_string);
            unknown.push((name, suggestion));
            continue;
        }
        for cand in cands {
            for dep in cand.manifest.dependencies_of_kind(&[DepKind::Lib]) {
                queue.push(dep.name.clone());
            }
        }
    }
    unknown
}
