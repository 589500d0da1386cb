//! Mutant identity, status, and the in-session store.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable mutant descriptor produced by a mutation catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutantSpec {
    /// Stable identifier, deterministic for identical source.
    pub id: String,
    /// Mutated source file, relative to the project directory.
    pub file: PathBuf,
    /// One-based source line of the mutation.
    pub line: u32,
    /// Zero-based source column of the mutation.
    #[serde(default)]
    pub column: u32,
    /// Operator kind that produced this mutant.
    pub operator: String,
    /// Applied change, e.g. `replace == with !=`.
    pub description: String,
    /// Marked by the catalog as not to be executed.
    #[serde(default)]
    pub skip: bool,
}

/// Lifecycle status of one mutant within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutantStatus {
    /// Known but not yet executed.
    Untested,
    /// Dispatched to a worker, no terminal outcome yet.
    Running,
    /// Terminal: at least one candidate test failed.
    Killed,
    /// Terminal: every candidate test passed, or none covered the mutant.
    Survived,
    /// Terminal: execution exceeded its timeout and was terminated.
    Timeout,
    /// Terminal: the worker died abnormally or could not run.
    Suspicious,
    /// Terminal: excluded from execution by policy.
    Skipped,
}

impl MutantStatus {
    /// True if status is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Killed | Self::Survived | Self::Timeout | Self::Suspicious | Self::Skipped
        )
    }

    /// Stable lowercase name, matching the serialized form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Untested => "untested",
            Self::Running => "running",
            Self::Killed => "killed",
            Self::Survived => "survived",
            Self::Timeout => "timeout",
            Self::Suspicious => "suspicious",
            Self::Skipped => "skipped",
        }
    }
}

/// Finalized result of executing (or deliberately not executing) one mutant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outcome {
    /// Terminal status.
    pub status: MutantStatus,
    /// Wall-clock duration of the execution in milliseconds.
    pub duration_ms: u64,
    /// Number of candidate tests selected for this mutant.
    pub tests_considered: usize,
    /// Tail of the captured harness output, when informative.
    #[serde(default)]
    pub output_excerpt: Option<String>,
    /// Signal that terminated the worker, when it died abnormally.
    #[serde(default)]
    pub signal: Option<i32>,
}

impl Outcome {
    /// Outcome for a mutant excluded from execution.
    pub fn skipped() -> Self {
        Self {
            status: MutantStatus::Skipped,
            duration_ms: 0,
            tests_considered: 0,
            output_excerpt: None,
            signal: None,
        }
    }

    /// Outcome for a mutant with no covering tests.
    pub fn survived_no_tests() -> Self {
        Self {
            status: MutantStatus::Survived,
            duration_ms: 0,
            tests_considered: 0,
            output_excerpt: None,
            signal: None,
        }
    }
}

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A mutant id was registered twice.
    #[error("duplicate mutant id: {id}")]
    DuplicateId {
        /// Offending id.
        id: String,
    },
    /// An operation referenced an unregistered mutant.
    #[error("unknown mutant id: {id}")]
    UnknownMutant {
        /// Offending id.
        id: String,
    },
    /// A status change violated the monotonic transition rule.
    #[error("invalid status transition for {id}: {from:?} -> {to:?}")]
    InvalidTransition {
        /// Mutant id.
        id: String,
        /// Status before the attempted change.
        from: MutantStatus,
        /// Attempted new status.
        to: MutantStatus,
    },
    /// A finalize call carried a non-terminal status.
    #[error("outcome for {id} has non-terminal status {status:?}")]
    NonTerminalOutcome {
        /// Mutant id.
        id: String,
        /// Offending status.
        status: MutantStatus,
    },
}

/// One mutant's registered spec plus its current state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutantEntry {
    /// Descriptor from the catalog.
    pub spec: MutantSpec,
    /// Current status.
    pub status: MutantStatus,
    /// Terminal outcome, present once the status is terminal.
    pub outcome: Option<Outcome>,
}

/// In-memory registry of the session's mutants, iterable in generation order.
///
/// Status transitions are monotonic: `Untested -> Running -> terminal`, or
/// `Untested -> terminal` for cached and policy-skipped mutants. A terminal
/// status never changes.
#[derive(Debug, Default)]
pub struct MutantStore {
    entries: BTreeMap<String, MutantEntry>,
    order: Vec<String>,
}

impl MutantStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a mutant in generation order.
    pub fn insert(&mut self, spec: MutantSpec) -> Result<(), StoreError> {
        if self.entries.contains_key(&spec.id) {
            return Err(StoreError::DuplicateId { id: spec.id });
        }
        self.order.push(spec.id.clone());
        self.entries.insert(
            spec.id.clone(),
            MutantEntry {
                spec,
                status: MutantStatus::Untested,
                outcome: None,
            },
        );
        Ok(())
    }

    /// Mark a mutant as dispatched.
    pub fn mark_running(&mut self, id: &str) -> Result<(), StoreError> {
        let entry = self.entry_mut(id)?;
        if entry.status != MutantStatus::Untested {
            return Err(StoreError::InvalidTransition {
                id: id.to_string(),
                from: entry.status,
                to: MutantStatus::Running,
            });
        }
        entry.status = MutantStatus::Running;
        Ok(())
    }

    /// Record a terminal outcome.
    pub fn finalize(&mut self, id: &str, outcome: Outcome) -> Result<(), StoreError> {
        if !outcome.status.is_terminal() {
            return Err(StoreError::NonTerminalOutcome {
                id: id.to_string(),
                status: outcome.status,
            });
        }
        let entry = self.entry_mut(id)?;
        if entry.status.is_terminal() {
            return Err(StoreError::InvalidTransition {
                id: id.to_string(),
                from: entry.status,
                to: outcome.status,
            });
        }
        entry.status = outcome.status;
        entry.outcome = Some(outcome);
        Ok(())
    }

    /// Entry by id.
    pub fn get(&self, id: &str) -> Option<&MutantEntry> {
        self.entries.get(id)
    }

    /// True if the id is registered.
    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// Entries in the order the catalog generated them.
    pub fn iter_in_generation_order(&self) -> impl Iterator<Item = &MutantEntry> {
        self.order.iter().filter_map(|id| self.entries.get(id))
    }

    /// Number of registered mutants.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no mutants are registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Registered mutants grouped by source file, preserving generation order
    /// within each file.
    pub fn ids_by_file(&self) -> BTreeMap<PathBuf, Vec<String>> {
        let mut by_file: BTreeMap<PathBuf, Vec<String>> = BTreeMap::new();
        for id in &self.order {
            if let Some(entry) = self.entries.get(id) {
                by_file
                    .entry(entry.spec.file.clone())
                    .or_default()
                    .push(id.clone());
            }
        }
        by_file
    }

    fn entry_mut(&mut self, id: &str) -> Result<&mut MutantEntry, StoreError> {
        self.entries
            .get_mut(id)
            .ok_or_else(|| StoreError::UnknownMutant { id: id.to_string() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(id: &str, file: &str, line: u32) -> MutantSpec {
        MutantSpec {
            id: id.to_string(),
            file: PathBuf::from(file),
            line,
            column: 0,
            operator: "binary_operator".to_string(),
            description: "replace == with !=".to_string(),
            skip: false,
        }
    }

    fn killed_outcome() -> Outcome {
        Outcome {
            status: MutantStatus::Killed,
            duration_ms: 12,
            tests_considered: 3,
            output_excerpt: None,
            signal: None,
        }
    }

    #[test]
    fn insert_preserves_generation_order() {
        let mut store = MutantStore::new();
        store
            .insert(spec("m_z", "src/z.py", 1))
            .expect("first insert should work");
        store
            .insert(spec("m_a", "src/a.py", 2))
            .expect("second insert should work");

        let ids: Vec<&str> = store
            .iter_in_generation_order()
            .map(|e| e.spec.id.as_str())
            .collect();
        assert_eq!(ids, vec!["m_z", "m_a"]);
    }

    #[test]
    fn duplicate_id_is_rejected() {
        let mut store = MutantStore::new();
        store
            .insert(spec("m1", "src/a.py", 1))
            .expect("first insert should work");
        let err = store
            .insert(spec("m1", "src/a.py", 2))
            .expect_err("duplicate insert should fail");
        assert!(matches!(err, StoreError::DuplicateId { id } if id == "m1"));
    }

    #[test]
    fn transitions_are_monotonic() {
        let mut store = MutantStore::new();
        store
            .insert(spec("m1", "src/a.py", 1))
            .expect("insert should work");

        store.mark_running("m1").expect("running should be allowed");
        let err = store
            .mark_running("m1")
            .expect_err("second running mark should fail");
        assert!(matches!(err, StoreError::InvalidTransition { .. }));

        store
            .finalize("m1", killed_outcome())
            .expect("finalize from running should work");
        let err = store
            .finalize("m1", killed_outcome())
            .expect_err("re-finalizing a terminal mutant should fail");
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
    }

    #[test]
    fn finalize_straight_from_untested_is_allowed() {
        let mut store = MutantStore::new();
        store
            .insert(spec("m1", "src/a.py", 1))
            .expect("insert should work");
        store
            .finalize("m1", Outcome::skipped())
            .expect("skip without running should work");
        assert_eq!(
            store.get("m1").expect("entry should exist").status,
            MutantStatus::Skipped
        );
    }

    #[test]
    fn finalize_rejects_non_terminal_status() {
        let mut store = MutantStore::new();
        store
            .insert(spec("m1", "src/a.py", 1))
            .expect("insert should work");
        let outcome = Outcome {
            status: MutantStatus::Running,
            duration_ms: 0,
            tests_considered: 0,
            output_excerpt: None,
            signal: None,
        };
        let err = store
            .finalize("m1", outcome)
            .expect_err("non-terminal finalize should fail");
        assert!(matches!(err, StoreError::NonTerminalOutcome { .. }));
    }

    #[test]
    fn ids_by_file_groups_in_generation_order() {
        let mut store = MutantStore::new();
        store
            .insert(spec("m1", "src/b.py", 1))
            .expect("insert should work");
        store
            .insert(spec("m2", "src/a.py", 1))
            .expect("insert should work");
        store
            .insert(spec("m3", "src/b.py", 9))
            .expect("insert should work");

        let by_file = store.ids_by_file();
        assert_eq!(
            by_file.get(&PathBuf::from("src/b.py")),
            Some(&vec!["m1".to_string(), "m3".to_string()])
        );
        assert_eq!(
            by_file.get(&PathBuf::from("src/a.py")),
            Some(&vec!["m2".to_string()])
        );
    }
}
