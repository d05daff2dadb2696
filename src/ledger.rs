use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::{
    error::HarnessError,
    utils::{read_json, write_json_pretty},
};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerState {
    #[default]
    NotStarted,
    Done,
    Errored,
}

/// Which entries of a model's run finished, keyed by entry id. Replaces
/// scanning result files to decide what to regenerate.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CompletionLedger {
    #[serde(skip)]
    path: PathBuf,
    pub entries: IndexMap<String, LedgerState>,
}

impl CompletionLedger {
    /// Loads the ledger at `path`, or starts an empty one.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, HarnessError> {
        let path = path.as_ref().to_path_buf();
        let mut ledger: CompletionLedger = if path.exists() {
            read_json(&path)?
        } else {
            CompletionLedger::default()
        };
        ledger.path = path;
        Ok(ledger)
    }

    pub fn state(&self, entry_id: &str) -> LedgerState {
        self.entries.get(entry_id).copied().unwrap_or_default()
    }

    pub fn mark(&mut self, entry_id: &str, state: LedgerState) {
        self.entries.insert(entry_id.to_string(), state);
    }

    /// Done entries are skipped unless overwriting. Errored entries run again
    /// because this is a new run.
    pub fn should_run(&self, entry_id: &str, allow_overwrite: bool) -> bool {
        allow_overwrite || self.state(entry_id) != LedgerState::Done
    }

    pub fn save(&self) -> Result<(), HarnessError> {
        write_json_pretty(&self.path, self)
    }
}
