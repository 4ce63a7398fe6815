//! Revisions and validity windows.

use std::fmt;

/// Point in the runtime's definition history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Revision(pub u64);

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// Closed interval of revisions a specialization is valid for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorldRange {
    pub min: Revision,
    pub max: Revision,
}

impl WorldRange {
    pub fn new(min: u64, max: u64) -> Self {
        Self {
            min: Revision(min),
            max: Revision(max),
        }
    }

    /// Valid from `min` onwards with no known end.
    pub fn open(min: u64) -> Self {
        Self::new(min, u64::MAX)
    }

    pub fn contains(&self, rev: Revision) -> bool {
        self.min <= rev && rev <= self.max
    }

    pub fn is_empty(&self) -> bool {
        self.min > self.max
    }
}

impl fmt::Display for WorldRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.max.0 == u64::MAX {
            write!(f, "[{}, ∞]", self.min)
        } else {
            write!(f, "[{}, {}]", self.min, self.max)
        }
    }
}

/// The two compilation passes, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompilePass {
    /// Definitions already committed by the running program.
    Finalized,
    /// Definitions still being inferred.
    InProgress,
}

/// Revision counters sampled when a session is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Revisions {
    pub finalized: Revision,
    pub in_progress: Option<Revision>,
}

impl Revisions {
    pub fn new(finalized: u64) -> Self {
        Self {
            finalized: Revision(finalized),
            in_progress: None,
        }
    }

    pub fn with_in_progress(mut self, rev: u64) -> Self {
        self.in_progress = Some(Revision(rev));
        self
    }

    /// Passes to run, finalized first; the in-progress pass only when such
    /// a revision exists.
    pub fn passes(&self) -> impl Iterator<Item = (CompilePass, Revision)> {
        std::iter::once((CompilePass::Finalized, self.finalized)).chain(
            self.in_progress
                .map(|rev| (CompilePass::InProgress, rev)),
        )
    }
}
