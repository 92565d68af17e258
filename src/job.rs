//! Jobs: the classification of a forest node and what evaluating it yields.
//!
//! A node is one of three things, decided in this order: a set of leaf
//! derivations (a derivation value, or an attribute set marked
//! `recurseForDerivations` containing derivations), an attribute set to be
//! expanded, or a list to be expanded. Evaluating a job yields either
//! [`Drv`] records (leaves, streamed to stdout) or the node's immediate
//! children as accessors (fed back into the ready queue).

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::accessor::Accessor;
use crate::error::{DrvStreamError, Result};

/// Immutable snapshot of a leaf derivation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Drv {
    pub name: String,
    pub system: String,
    #[serde(rename = "drvPath")]
    pub drv_path: String,
    pub outputs: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Value>,
}

impl Drv {
    /// Validate a derivation snapshot coming out of the evaluator.
    ///
    /// A derivation whose `system` query answers `"unknown"` (or nothing at
    /// all) has no `system` attribute and cannot be scheduled anywhere.
    pub fn validate(self) -> Result<Self> {
        if self.system.is_empty() || self.system == "unknown" {
            return Err(DrvStreamError::Type(
                "derivation must have a 'system' attribute".into(),
            ));
        }
        Ok(self)
    }
}

/// A classified forest node.
#[derive(Debug, Clone, PartialEq)]
pub enum Job {
    /// One or more leaf derivations rooted at this node.
    Drvs(Vec<Drv>),
    /// An attribute set; holds the attribute names in lexicographic order.
    Attrs(Vec<String>),
    /// A list of the given length.
    List(usize),
}

/// What evaluating a [`Job`] produces.
#[derive(Debug, Clone, PartialEq)]
pub enum JobEvalResult {
    Drv(Drv),
    Children(Vec<Accessor>),
}

impl Job {
    /// Evaluate the job. `Drvs` yields its derivations (registering a GC
    /// root for each when a roots directory is configured); `Attrs` and
    /// `List` yield a single children listing.
    pub fn eval(self, gc_roots_dir: Option<&Path>) -> Result<Vec<JobEvalResult>> {
        match self {
            Self::Drvs(drvs) => {
                if let Some(dir) = gc_roots_dir {
                    for drv in &drvs {
                        add_gc_root(dir, &drv.drv_path)?;
                    }
                }
                Ok(drvs.into_iter().map(JobEvalResult::Drv).collect())
            }
            Self::Attrs(names) => {
                let children = names.into_iter().map(Accessor::Name).collect();
                Ok(vec![JobEvalResult::Children(children)])
            }
            Self::List(len) => {
                let children = (0..len as u64).map(Accessor::Index).collect();
                Ok(vec![JobEvalResult::Children(children)])
            }
        }
    }
}

/// Register an indirect GC root for a derivation: a symlink named after the
/// drv path's basename, pointing at the drv path. Existing entries are left
/// untouched, so repeated runs over the same roots directory are cheap.
///
/// The roots directory is expected to live somewhere the store scans for
/// roots (the usual arrangement for CI evaluators).
fn add_gc_root(dir: &Path, drv_path: &str) -> Result<()> {
    let basename = Path::new(drv_path)
        .file_name()
        .ok_or_else(|| DrvStreamError::Eval(format!("malformed drv path: {}", drv_path)))?;
    let root = dir.join(basename);

    if root.symlink_metadata().is_ok() {
        return Ok(());
    }

    debug!(root = %root.display(), target = drv_path, "registering gc root");
    match std::os::unix::fs::symlink(drv_path, &root) {
        Ok(()) => Ok(()),
        // Another worker registered the same derivation concurrently.
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(e.into()),
    }
}
