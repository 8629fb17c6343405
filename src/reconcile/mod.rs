//! Optimistic-concurrency protocol for one edited subject.
//!
//! Local edits are tracked against the last-synced baseline. A remote change
//! arriving while edits are pending moves the session to `Conflicted`; the
//! operator then discards local edits or ignores the remote change. Ignoring
//! keeps the stale baseline, so the next remote change conflicts again.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub mod editor;

pub use editor::SubjectEditor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum EditState {
    Clean,
    Dirty,
    Conflicted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ConflictChoice {
    Discard,
    Ignore,
}

/// Keys to revoke (removed or changed) and entries to grant (added or changed).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Changeset<K, V> {
    pub revoke: Vec<K>,
    pub grant: Vec<(K, V)>,
}

impl<K, V> Changeset<K, V> {
    pub fn is_empty(&self) -> bool {
        self.revoke.is_empty() && self.grant.is_empty()
    }
}

impl<K, V> Default for Changeset<K, V> {
    fn default() -> Self {
        Self {
            revoke: Vec::new(),
            grant: Vec::new(),
        }
    }
}

pub fn diff<K: Ord + Clone, V: PartialEq + Clone>(baseline: &BTreeMap<K, V>, local: &BTreeMap<K, V>) -> Changeset<K, V> {
    let mut changes = Changeset::default();

    for (key, old) in baseline {
        match local.get(key) {
            Some(new) if new == old => {}
            _ => changes.revoke.push(key.clone()),
        }
    }
    for (key, new) in local {
        match baseline.get(key) {
            Some(old) if old == new => {}
            _ => changes.grant.push((key.clone(), new.clone())),
        }
    }

    changes
}

/// The Clean / Dirty / Conflicted state machine over a snapshot type `V`.
#[derive(Debug, Clone)]
pub struct EditSession<V> {
    baseline: V,
    local: V,
    incoming: Option<V>,
    state: EditState,
}

impl<V: Clone + PartialEq> EditSession<V> {
    pub fn new(baseline: V) -> Self {
        Self {
            local: baseline.clone(),
            baseline,
            incoming: None,
            state: EditState::Clean,
        }
    }

    pub fn state(&self) -> EditState {
        self.state
    }

    pub fn baseline(&self) -> &V {
        &self.baseline
    }

    pub fn local(&self) -> &V {
        &self.local
    }

    /// The remote snapshot waiting on a conflict decision.
    pub fn incoming(&self) -> Option<&V> {
        self.incoming.as_ref()
    }

    pub fn edit(&mut self, f: impl FnOnce(&mut V)) -> EditState {
        f(&mut self.local);
        if self.state != EditState::Conflicted {
            self.state = if self.local == self.baseline {
                EditState::Clean
            } else {
                EditState::Dirty
            };
        }
        self.state
    }

    /// Feed a snapshot delivered by the change feed.
    pub fn on_remote_snapshot(&mut self, snapshot: V, is_pending_local_write: bool) -> EditState {
        match self.state {
            EditState::Clean => {
                self.local = snapshot.clone();
                self.baseline = snapshot;
            }
            // Our own writes echoing back are never external; they only move
            // the baseline, so a retried save sends just what is still missing.
            // Without key information the whole snapshot is taken; map
            // sessions use `on_local_echo` to move only the written keys.
            EditState::Dirty if is_pending_local_write => {
                self.baseline = snapshot;
                if self.local == self.baseline {
                    self.state = EditState::Clean;
                }
            }
            EditState::Dirty => {
                if snapshot != self.baseline {
                    tracing::debug!("remote change arrived over pending edits");
                    self.incoming = Some(snapshot);
                    self.state = EditState::Conflicted;
                }
            }
            EditState::Conflicted => {
                self.incoming = Some(snapshot);
            }
        }
        self.state
    }

    pub fn on_conflict(&mut self, choice: ConflictChoice) -> EditState {
        if self.state != EditState::Conflicted {
            return self.state;
        }

        match choice {
            ConflictChoice::Discard => {
                if let Some(incoming) = self.incoming.take() {
                    self.baseline = incoming;
                }
                self.local = self.baseline.clone();
                self.state = EditState::Clean;
            }
            ConflictChoice::Ignore => {
                self.incoming = None;
                self.state = if self.local == self.baseline {
                    EditState::Clean
                } else {
                    EditState::Dirty
                };
            }
        }
        self.state
    }

    /// The local view became the stored state.
    pub fn mark_saved(&mut self) -> EditState {
        self.baseline = self.local.clone();
        self.incoming = None;
        self.state = EditState::Clean;
        self.state
    }

    pub fn discard(&mut self) -> EditState {
        self.local = self.baseline.clone();
        self.incoming = None;
        self.state = EditState::Clean;
        self.state
    }
}

impl<K: Ord + Clone, V: PartialEq + Clone> EditSession<BTreeMap<K, V>> {
    pub fn changeset(&self) -> Changeset<K, V> {
        diff(&self.baseline, &self.local)
    }

    /// Our own write to `touched` echoed back. While dirty only those keys of
    /// the baseline follow `snapshot`; remote changes set aside by an ignored
    /// conflict stay out of it.
    pub fn on_local_echo<'a>(&mut self, touched: impl IntoIterator<Item = &'a K>, snapshot: BTreeMap<K, V>) -> EditState
    where
        K: 'a,
    {
        if self.state != EditState::Dirty {
            return self.on_remote_snapshot(snapshot, true);
        }

        for key in touched {
            match snapshot.get(key) {
                Some(value) => {
                    self.baseline.insert(key.clone(), value.clone());
                }
                None => {
                    self.baseline.remove(key);
                }
            }
        }
        if self.local == self.baseline {
            self.state = EditState::Clean;
        }
        self.state
    }
}
