use std::fmt;

use parking_lot::Mutex;

use crate::{
    commands::{CommandScheduler, CommandStatus},
    error::Result,
    types::ids::CommandId,
};

/// Identifies one tentative change.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Revision(u64);

/// How a tentative change ended.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Resolution {
    Confirmed,
    RolledBack,
    /// A newer tentative change replaced this one first; nothing was
    /// touched.
    Superseded,
}

struct Pending<T> {
    revision: Revision,
    snapshot: T,
}

struct CellState<T> {
    current: T,
    pending: Option<Pending<T>>,
    next_revision: u64,
}

/// Value shown to a client while a mutation is in flight.
///
/// `apply` installs the tentative value and remembers the one it replaced;
/// the mutation's outcome either confirms it (`reconcile`) or restores the
/// remembered value (`revert`). Only the latest revision can be resolved,
/// so a late answer for an older change never clobbers a newer one.
pub struct OptimisticCell<T> {
    state: Mutex<CellState<T>>,
}

impl<T: fmt::Debug> fmt::Debug for OptimisticCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("OptimisticCell")
            .field("current", &state.current)
            .field(
                "pending",
                &state.pending.as_ref().map(|pending| pending.revision),
            )
            .finish()
    }
}

impl<T: Clone> OptimisticCell<T> {
    pub fn new(value: T) -> Self {
        Self {
            state: Mutex::new(CellState {
                current: value,
                pending: None,
                next_revision: 1,
            }),
        }
    }

    pub fn get(&self) -> T {
        self.state.lock().current.clone()
    }

    pub fn is_pending(&self) -> bool {
        self.state.lock().pending.is_some()
    }

    /// Shows `tentative` immediately and captures the value it replaces.
    pub fn apply(&self, tentative: T) -> Revision {
        let mut state = self.state.lock();
        let revision = Revision(state.next_revision);
        state.next_revision += 1;
        let snapshot = std::mem::replace(&mut state.current, tentative);
        state.pending = Some(Pending { revision, snapshot });
        revision
    }

    /// Installs the server-confirmed value. Returns false for a stale
    /// revision.
    pub fn reconcile(&self, revision: Revision, confirmed: T) -> bool {
        let mut state = self.state.lock();
        if !state.is_latest(revision) {
            return false;
        }
        state.current = confirmed;
        state.pending = None;
        true
    }

    /// Restores the value captured by `apply`. Returns false for a stale
    /// revision.
    pub fn revert(&self, revision: Revision) -> bool {
        let mut state = self.state.lock();
        if !state.is_latest(revision) {
            return false;
        }
        if let Some(pending) = state.pending.take() {
            state.current = pending.snapshot;
        }
        true
    }

    /// Waits for the mutation command to finish, then confirms the
    /// tentative value on Completed or rolls back on Failed or Aborted.
    pub async fn resolve_with_command(
        &self,
        revision: Revision,
        scheduler: &CommandScheduler,
        command: CommandId,
    ) -> Result<Resolution> {
        let record = scheduler.wait_for_terminal(command).await?;
        let resolution = if record.status == CommandStatus::Completed {
            let tentative = self.get();
            if self.reconcile(revision, tentative) {
                Resolution::Confirmed
            } else {
                Resolution::Superseded
            }
        } else if self.revert(revision) {
            Resolution::RolledBack
        } else {
            Resolution::Superseded
        };

        tracing::debug!(
            target: "optimistic",
            command_id = %command,
            status = %record.status,
            resolution = ?resolution,
            "tentative change resolved"
        );
        Ok(resolution)
    }
}

impl<T> CellState<T> {
    fn is_latest(&self, revision: Revision) -> bool {
        self.pending
            .as_ref()
            .is_some_and(|pending| pending.revision == revision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn revert_restores_the_pre_tentative_value() {
        let monitored = OptimisticCell::new(false);
        let revision = monitored.apply(true);
        assert!(monitored.get());
        assert!(monitored.is_pending());

        assert!(monitored.revert(revision));
        assert!(!monitored.get());
        assert!(!monitored.is_pending());
    }

    #[test]
    fn reconcile_installs_server_state() {
        let tags = OptimisticCell::new(vec!["rock"]);
        let revision = tags.apply(vec!["rock", "jazz"]);
        assert!(tags.reconcile(revision, vec!["jazz", "rock"]));
        assert_eq!(tags.get(), vec!["jazz", "rock"]);
    }

    #[test]
    fn stale_revisions_are_ignored() {
        let monitored = OptimisticCell::new(false);
        let first = monitored.apply(true);
        let second = monitored.apply(false);

        assert!(!monitored.revert(first));
        assert!(!monitored.get());
        assert!(monitored.reconcile(second, false));
        assert!(!monitored.reconcile(second, true));
    }
}
