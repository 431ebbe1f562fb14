//! Three-way workspace consistency check.
//!
//! A workspace is described by three facts that a crash can leave out of
//! sync: the execution record holds its path, the directory exists, and git
//! lists it as a worktree. [`reconcile`] decides from those facts alone what,
//! if anything, must be repaired; the manager then performs the repair.

use serde::Serialize;

/// Observed state of one workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkspaceFacts {
    pub recorded: bool,
    pub exists_on_disk: bool,
    pub registered: bool,
}

/// The one missing fact to restore from the other two.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Repair {
    /// Directory and registration agree; write the path back to the record.
    RecordPath,
    /// Record and registration agree; prune the stale registration and
    /// check the branch out again at the recorded path.
    RecreateDirectory,
    /// Record and directory agree; re-link the worktree with git.
    Reregister,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Reconciliation {
    Valid,
    Repaired { repair: Repair },
    Invalid { reason: String },
}

impl Reconciliation {
    pub fn is_usable(&self) -> bool {
        !matches!(self, Reconciliation::Invalid { .. })
    }
}

impl std::fmt::Display for Reconciliation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Reconciliation::Valid => write!(f, "valid"),
            Reconciliation::Repaired { repair } => write!(f, "repaired ({:?})", repair),
            Reconciliation::Invalid { reason } => write!(f, "invalid: {}", reason),
        }
    }
}

/// Decide the outcome for a set of facts. At least two facts must hold for
/// the third to be repaired.
pub fn reconcile(facts: WorkspaceFacts) -> Reconciliation {
    match (facts.recorded, facts.exists_on_disk, facts.registered) {
        (true, true, true) => Reconciliation::Valid,
        (false, true, true) => Reconciliation::Repaired {
            repair: Repair::RecordPath,
        },
        (true, false, true) => Reconciliation::Repaired {
            repair: Repair::RecreateDirectory,
        },
        (true, true, false) => Reconciliation::Repaired {
            repair: Repair::Reregister,
        },
        (false, false, false) => Reconciliation::Invalid {
            reason: "no workspace exists for this execution".to_string(),
        },
        _ => Reconciliation::Invalid {
            reason: format!(
                "only one of three facts holds (recorded={}, on_disk={}, registered={})",
                facts.recorded, facts.exists_on_disk, facts.registered
            ),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn facts(recorded: bool, exists_on_disk: bool, registered: bool) -> WorkspaceFacts {
        WorkspaceFacts {
            recorded,
            exists_on_disk,
            registered,
        }
    }

    #[test]
    fn test_all_facts_agree() {
        assert_eq!(reconcile(facts(true, true, true)), Reconciliation::Valid);
    }

    #[test]
    fn test_each_single_missing_fact_is_repaired() {
        assert_eq!(
            reconcile(facts(false, true, true)),
            Reconciliation::Repaired {
                repair: Repair::RecordPath
            }
        );
        assert_eq!(
            reconcile(facts(true, false, true)),
            Reconciliation::Repaired {
                repair: Repair::RecreateDirectory
            }
        );
        assert_eq!(
            reconcile(facts(true, true, false)),
            Reconciliation::Repaired {
                repair: Repair::Reregister
            }
        );
    }

    #[test]
    fn test_single_fact_is_invalid() {
        for f in [
            facts(true, false, false),
            facts(false, true, false),
            facts(false, false, true),
        ] {
            let outcome = reconcile(f);
            assert!(!outcome.is_usable(), "{:?} should be invalid", f);
        }
    }

    #[test]
    fn test_nothing_is_invalid() {
        let outcome = reconcile(facts(false, false, false));
        assert!(matches!(outcome, Reconciliation::Invalid { .. }));
        assert!(outcome.to_string().starts_with("invalid"));
    }

    #[test]
    fn test_serializes_tagged() {
        let json = serde_json::to_value(Reconciliation::Repaired {
            repair: Repair::RecordPath,
        })
        .unwrap();
        assert_eq!(json["outcome"], "repaired");
        assert_eq!(json["repair"], "record_path");
    }
}
