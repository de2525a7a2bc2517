//! Error taxonomy and exit codes.
//!
//! Library modules return typed errors and never print; operations attach
//! context with `anyhow` as errors travel up; only the command entry point
//! formats anything. [`classify`] walks a chain and buckets it into the
//! user-facing taxonomy, which fixes the process exit code.

use thiserror::Error;

use crate::build::{ExecError, PlanError};
use crate::cancel::Cancelled;
use crate::fetch::FetchError;
use crate::index::migrate::MigrateError;
use crate::index::IndexError;
use crate::manifest::ManifestError;
use crate::project::ProjectError;
use crate::repo::RepoError;
use crate::sdist::SdistError;
use crate::solve::SolveError;
use crate::store::StoreError;
use crate::toolchain::ToolchainError;
use crate::types::{NameError, PkgIdError, RangeError};

/// Compilation or linking reported failure; diagnostics were already shown.
#[derive(Error, Debug)]
#[error("{failed} build step(s) failed")]
pub struct BuildFailed {
    pub failed: usize,
}

/// One or more test binaries exited non-zero.
#[derive(Error, Debug)]
#[error("{failed} test(s) failed")]
pub struct TestsFailed {
    pub failed: usize,
}

/// A user mistake with no more specific typed error.
#[derive(Error, Debug)]
#[error("{0}")]
pub struct UserError(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    UserInput,
    Resolution,
    Integrity,
    Transport,
    BuildFailure,
    TestFailure,
    Cancelled,
    Internal,
}

impl Category {
    /// Process exit code for this category. Internal errors are bugs and
    /// exit with EX_SOFTWARE, outside the documented range.
    pub fn exit_code(self) -> i32 {
        match self {
            Category::UserInput | Category::Resolution => 1,
            Category::BuildFailure | Category::TestFailure => 2,
            Category::Integrity | Category::Transport => 3,
            Category::Cancelled => 130,
            Category::Internal => 70,
        }
    }
}

/// Bucket an error chain. The outermost recognizable layer wins, except
/// cancellation, which dominates everything it wrapped.
pub fn classify(err: &anyhow::Error) -> Category {
    for cause in err.chain() {
        if cause.is::<Cancelled>() {
            return Category::Cancelled;
        }
    }

    for cause in err.chain() {
        if let Some(cat) = classify_one(cause) {
            return cat;
        }
    }
    Category::Internal
}

fn classify_one(cause: &(dyn std::error::Error + 'static)) -> Option<Category> {
    if cause.is::<TestsFailed>() {
        return Some(Category::TestFailure);
    }
    if cause.is::<BuildFailed>() {
        return Some(Category::BuildFailure);
    }
    if cause.is::<SolveError>() {
        return Some(Category::Resolution);
    }
    if cause.is::<UserError>()
        || cause.is::<NameError>()
        || cause.is::<RangeError>()
        || cause.is::<PkgIdError>()
        || cause.is::<ManifestError>()
        || cause.is::<ProjectError>()
        || cause.is::<ToolchainError>()
    {
        return Some(Category::UserInput);
    }
    if let Some(e) = cause.downcast_ref::<PlanError>() {
        return Some(match e {
            PlanError::Io(_) => Category::Transport,
            PlanError::MissingPackage(_) => Category::Internal,
            _ => Category::UserInput,
        });
    }
    if let Some(e) = cause.downcast_ref::<FetchError>() {
        return Some(match e {
            FetchError::HashMismatch { .. } | FetchError::Archive(_) => Category::Integrity,
            FetchError::BadUrl(_) => Category::UserInput,
            FetchError::Cancelled(_) => Category::Cancelled,
            _ => Category::Transport,
        });
    }
    if let Some(e) = cause.downcast_ref::<IndexError>() {
        return Some(match e {
            IndexError::CacheAbsent { .. } | IndexError::UnknownRemote { .. } => {
                Category::UserInput
            }
            IndexError::Fetch { .. } | IndexError::Io(_) => Category::Transport,
            _ => Category::Integrity,
        });
    }
    if let Some(e) = cause.downcast_ref::<StoreError>() {
        return Some(match e {
            StoreError::Cancelled(_) => Category::Cancelled,
            // The populate callback's failure is the interesting one.
            StoreError::Populate { source, .. } => classify(source),
            StoreError::Io(_) => Category::Transport,
        });
    }
    if let Some(e) = cause.downcast_ref::<SdistError>() {
        return Some(match e {
            SdistError::Io(_) => Category::Transport,
            SdistError::PathEscape(_) => Category::Integrity,
            _ => Category::UserInput,
        });
    }
    if let Some(e) = cause.downcast_ref::<RepoError>() {
        return Some(match e {
            RepoError::Io(_) => Category::Transport,
            RepoError::Sqlite(_) | RepoError::Migrate(_) | RepoError::Sdist(_) => {
                Category::Integrity
            }
            _ => Category::UserInput,
        });
    }
    if let Some(e) = cause.downcast_ref::<ExecError>() {
        return Some(match e {
            ExecError::Io(_) => Category::Transport,
            ExecError::Cache(_) => Category::Integrity,
        });
    }
    if cause.is::<MigrateError>() {
        return Some(Category::Integrity);
    }
    if cause.is::<std::io::Error>() {
        return Some(Category::Transport);
    }
    None
}
