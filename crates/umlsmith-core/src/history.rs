//! Per-diagram edit history with linear undo/redo.
//!
//! Each diagram owns an append-only log of snapshots and a single cursor pointing at
//! the current one. Undo/redo only move the cursor. Recording an edit while the cursor
//! is behind the tip drops everything after the cursor first, so a redo branch never
//! survives a new edit.
//!
//! Operations on one diagram are serialized by holding the map entry for the whole
//! read-modify-write, including the write-through to disk. Reads and undo/redo of an
//! unknown diagram never create an entry.

use dashmap::mapref::entry::Entry;
use dashmap::mapref::one::RefMut;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::{checked_id, read_json, write_atomic, StoreError};

/// Public view of one history entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandSnapshot {
    pub diagram_id: String,
    pub command_id: String,
    pub actor_id: String,
    pub project_id: String,
    pub timestamp: i64,
    pub payload_before: String,
    pub payload_after: String,
    pub is_current: bool,
}

/// Input to [`HistoryStore::record_edit`].
#[derive(Debug, Clone, Copy)]
pub struct EditRecord<'a> {
    pub diagram_id: &'a str,
    pub actor_id: &'a str,
    pub project_id: &'a str,
    pub command_id: &'a str,
    pub timestamp: i64,
    pub payload_before: &'a str,
    pub payload_after: &'a str,
}

/// Result of a successful undo or redo.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Restored {
    pub diagram_id: String,
    pub command_id: String,
    pub payload: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Snapshot {
    command_id: String,
    actor_id: String,
    project_id: String,
    timestamp: i64,
    payload_before: String,
    payload_after: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct Timeline {
    entries: Vec<Snapshot>,
    cursor: Option<usize>,
}

impl Timeline {
    fn record(&mut self, diagram_id: &str, edit: &EditRecord<'_>) {
        match self.cursor {
            Some(cursor) => self.entries.truncate(cursor + 1),
            None if self.entries.is_empty() => self.entries.push(Snapshot {
                command_id: format!("base-{diagram_id}"),
                actor_id: edit.actor_id.to_string(),
                project_id: edit.project_id.to_string(),
                timestamp: edit.timestamp - 1,
                payload_before: edit.payload_before.to_string(),
                payload_after: edit.payload_before.to_string(),
            }),
            // Log without a cursor (hand-edited file): keep it and append.
            None => {}
        }

        let tip = self.entries.last().map(|s| s.timestamp);
        let timestamp = match tip {
            Some(tip) if edit.timestamp <= tip => tip + 1,
            _ => edit.timestamp,
        };

        self.entries.push(Snapshot {
            command_id: edit.command_id.to_string(),
            actor_id: edit.actor_id.to_string(),
            project_id: edit.project_id.to_string(),
            timestamp,
            payload_before: edit.payload_before.to_string(),
            payload_after: edit.payload_after.to_string(),
        });
        self.cursor = Some(self.entries.len() - 1);
    }

    fn step_back(&mut self) -> Option<&Snapshot> {
        let cursor = self.cursor.filter(|c| *c > 0)?;
        self.cursor = Some(cursor - 1);
        self.entries.get(cursor - 1)
    }

    fn step_forward(&mut self) -> Option<&Snapshot> {
        let cursor = self.cursor.filter(|c| c + 1 < self.entries.len())?;
        self.cursor = Some(cursor + 1);
        self.entries.get(cursor + 1)
    }
}

/// Command history keyed by diagram id, optionally written through to
/// `<root>/history/<diagram>.json`.
#[derive(Debug, Default)]
pub struct HistoryStore {
    timelines: DashMap<String, Timeline>,
    root: Option<PathBuf>,
}

impl HistoryStore {
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn persistent(root: impl Into<PathBuf>) -> Self {
        Self {
            timelines: DashMap::new(),
            root: Some(root.into()),
        }
    }

    fn path(&self, diagram_id: &str) -> Result<Option<PathBuf>, StoreError> {
        let id = checked_id(diagram_id)?;
        Ok(self
            .root
            .as_ref()
            .map(|r| r.join("history").join(format!("{id}.json"))))
    }

    fn load(&self, path: Option<&PathBuf>) -> Result<Timeline, StoreError> {
        match path {
            Some(path) => Ok(read_json::<Timeline>(path)?.unwrap_or_default()),
            None => Ok(Timeline::default()),
        }
    }

    /// Lock the diagram's timeline, loading it from disk on first use. A diagram
    /// with no history only gets an entry when `create` is set.
    fn slot(
        &self,
        diagram_id: &str,
        create: bool,
    ) -> Result<Option<RefMut<'_, String, Timeline>>, StoreError> {
        let path = self.path(diagram_id)?;
        match self.timelines.entry(diagram_id.to_string()) {
            Entry::Occupied(e) => Ok(Some(e.into_ref())),
            Entry::Vacant(e) => {
                let loaded = self.load(path.as_ref())?;
                if !create && loaded.entries.is_empty() {
                    return Ok(None);
                }
                Ok(Some(e.insert(loaded)))
            }
        }
    }

    /// Run `f` against the diagram's timeline under its lock and persist the result.
    /// A failed write rolls the in-memory timeline back.
    fn mutate<R>(
        &self,
        diagram_id: &str,
        create: bool,
        f: impl FnOnce(&mut Timeline) -> R,
    ) -> Result<Option<R>, StoreError> {
        let Some(mut slot) = self.slot(diagram_id, create)? else {
            return Ok(None);
        };
        let before = (*slot).clone();
        let out = f(&mut *slot);
        if *slot == before {
            return Ok(Some(out));
        }
        if let Some(path) = self.path(diagram_id)? {
            let json = serde_json::to_string_pretty(&*slot)?;
            if let Err(e) = write_atomic(&path, &json) {
                *slot = before;
                return Err(e);
            }
        }
        Ok(Some(out))
    }

    /// Record an edit. The first edit of a diagram also synthesizes a baseline snapshot
    /// holding the pre-edit payload so it can be undone.
    pub fn record_edit(&self, edit: EditRecord<'_>) -> Result<(), StoreError> {
        self.mutate(edit.diagram_id, true, |timeline| {
            timeline.record(edit.diagram_id, &edit)
        })?;
        tracing::debug!(
            diagram_id = edit.diagram_id,
            command_id = edit.command_id,
            "recorded edit"
        );
        Ok(())
    }

    /// Move the cursor one step back. `None` when there is nothing to undo.
    pub fn undo(&self, diagram_id: &str) -> Result<Option<Restored>, StoreError> {
        let moved = self.mutate(diagram_id, false, |timeline| {
            timeline
                .step_back()
                .map(|s| restored(diagram_id, s))
        })?;
        Ok(moved.flatten())
    }

    /// Move the cursor one step forward. `None` when already at the tip.
    pub fn redo(&self, diagram_id: &str) -> Result<Option<Restored>, StoreError> {
        let moved = self.mutate(diagram_id, false, |timeline| {
            timeline
                .step_forward()
                .map(|s| restored(diagram_id, s))
        })?;
        Ok(moved.flatten())
    }

    /// All snapshots in timestamp order, with `is_current` derived from the cursor.
    pub fn snapshots(&self, diagram_id: &str) -> Result<Vec<CommandSnapshot>, StoreError> {
        let path = self.path(diagram_id)?;
        if let Some(timeline) = self.timelines.get(diagram_id) {
            return Ok(view(diagram_id, &timeline));
        }
        Ok(view(diagram_id, &self.load(path.as_ref())?))
    }
}

fn view(diagram_id: &str, timeline: &Timeline) -> Vec<CommandSnapshot> {
    timeline
        .entries
        .iter()
        .enumerate()
        .map(|(i, s)| CommandSnapshot {
            diagram_id: diagram_id.to_string(),
            command_id: s.command_id.clone(),
            actor_id: s.actor_id.clone(),
            project_id: s.project_id.clone(),
            timestamp: s.timestamp,
            payload_before: s.payload_before.clone(),
            payload_after: s.payload_after.clone(),
            is_current: timeline.cursor == Some(i),
        })
        .collect()
}

fn restored(diagram_id: &str, snapshot: &Snapshot) -> Restored {
    Restored {
        diagram_id: diagram_id.to_string(),
        command_id: snapshot.command_id.clone(),
        payload: snapshot.payload_after.clone(),
    }
}
