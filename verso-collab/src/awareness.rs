//! Presence ("awareness") tracking for one room.
//!
//! ```text
//! awareness frame ──► AwarenessTracker::apply_update(payload, conn)
//!                          │  higher clock wins, null = tombstone
//!                          ▼
//!                    AwarenessChange { added, updated, removed }
//!                          │
//!                          ▼
//!                    encode_update(changed ids) ──► broadcast
//! ```
//!
//! Every entry remembers which connection last touched it. The reverse
//! index (connection → client ids it controls) is rebuilt from scratch
//! by scanning all entries after every change; it is never patched
//! incrementally. Closing a connection tombstones exactly the ids in its
//! slot of that index.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::{Duration, Instant};

use serde_json::Value;

use crate::connection::ConnectionId;
use crate::protocol::{AwarenessRecord, AwarenessUpdate, ClientId, ProtocolError};

/// Presence entry for one client id.
#[derive(Debug, Clone)]
pub struct AwarenessEntry {
    pub clock: u32,
    /// `None` once removed; the clock is kept to reject stale re-adds.
    pub state: Option<Value>,
    pub last_updated_by: Option<ConnectionId>,
    pub last_updated: Instant,
}

/// Client ids touched by one operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AwarenessChange {
    pub added: Vec<ClientId>,
    /// State replaced or clock renewed
    pub updated: Vec<ClientId>,
    pub removed: Vec<ClientId>,
}

impl AwarenessChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    /// All changed ids, in added/updated/removed order.
    pub fn changed(&self) -> Vec<ClientId> {
        self.added
            .iter()
            .chain(&self.updated)
            .chain(&self.removed)
            .copied()
            .collect()
    }
}

/// Per-room presence map.
#[derive(Debug, Default)]
pub struct AwarenessTracker {
    entries: HashMap<ClientId, AwarenessEntry>,
    controlled: HashMap<ConnectionId, HashSet<ClientId>>,
}

impl AwarenessTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode an awareness payload received from `source` and merge it.
    pub fn apply_update(
        &mut self,
        payload: &[u8],
        source: ConnectionId,
    ) -> Result<AwarenessChange, ProtocolError> {
        let update = AwarenessUpdate::decode(payload)?;
        Ok(self.apply(&update, Some(source)))
    }

    /// Merge already-decoded records.
    ///
    /// A record wins when its clock is higher than the known one, or when
    /// it carries the same clock with a null state for a live entry.
    pub fn apply(&mut self, update: &AwarenessUpdate, source: Option<ConnectionId>) -> AwarenessChange {
        let now = Instant::now();
        let mut change = AwarenessChange::default();

        for record in &update.records {
            let (known_clock, prev_state) = match self.entries.get(&record.client_id) {
                Some(entry) => (entry.clock, entry.state.as_ref()),
                None => (0, None),
            };
            let had_state = prev_state.is_some();
            let accept = known_clock < record.clock
                || (known_clock == record.clock && record.state.is_none() && had_state);
            if !accept {
                continue;
            }

            match (&record.state, had_state) {
                (None, true) => change.removed.push(record.client_id),
                (Some(_), false) => change.added.push(record.client_id),
                (Some(_), true) => change.updated.push(record.client_id),
                // Tombstone for an id we never saw alive: remember the clock only
                (None, false) => {}
            }

            self.entries.insert(
                record.client_id,
                AwarenessEntry {
                    clock: record.clock,
                    state: record.state.clone(),
                    last_updated_by: source,
                    last_updated: now,
                },
            );
        }

        if !change.is_empty() {
            self.rebuild_index();
        }
        change
    }

    /// Tombstone the given ids. Unknown or already removed ids are skipped.
    pub fn remove_states(&mut self, ids: &[ClientId]) -> AwarenessChange {
        let now = Instant::now();
        let mut change = AwarenessChange::default();
        for id in ids {
            if let Some(entry) = self.entries.get_mut(id) {
                if entry.state.take().is_some() {
                    entry.last_updated = now;
                    change.removed.push(*id);
                }
            }
        }
        if !change.is_empty() {
            self.rebuild_index();
        }
        change
    }

    /// Tombstone every id whose last update came from `connection`.
    pub fn remove_controlled_by(&mut self, connection: ConnectionId) -> AwarenessChange {
        let ids: Vec<ClientId> = self
            .controlled
            .get(&connection)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        self.remove_states(&ids)
    }

    /// Tombstone live entries not renewed within `timeout`.
    pub fn remove_outdated(&mut self, timeout: Duration) -> AwarenessChange {
        let outdated: Vec<ClientId> = self
            .entries
            .iter()
            .filter(|(_, e)| e.state.is_some() && e.last_updated.elapsed() >= timeout)
            .map(|(id, _)| *id)
            .collect();
        self.remove_states(&outdated)
    }

    /// Ids currently controlled by `connection`.
    pub fn controlled_by(&self, connection: ConnectionId) -> HashSet<ClientId> {
        self.controlled.get(&connection).cloned().unwrap_or_default()
    }

    /// Live presence states keyed by client id.
    pub fn current_states(&self) -> BTreeMap<ClientId, Value> {
        self.entries
            .iter()
            .filter_map(|(id, e)| e.state.clone().map(|s| (*id, s)))
            .collect()
    }

    pub fn get(&self, client_id: ClientId) -> Option<&AwarenessEntry> {
        self.entries.get(&client_id)
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.values().filter(|e| e.state.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Encode the given ids (tombstones as `null`) for broadcast.
    pub fn encode_update(&self, ids: &[ClientId]) -> Vec<u8> {
        let records = ids
            .iter()
            .filter_map(|id| {
                self.entries.get(id).map(|e| AwarenessRecord {
                    client_id: *id,
                    clock: e.clock,
                    state: e.state.clone(),
                })
            })
            .collect();
        AwarenessUpdate::new(records).encode()
    }

    /// Encode every live entry, or `None` when nobody is present.
    pub fn encode_all(&self) -> Option<Vec<u8>> {
        let ids: Vec<ClientId> = self.current_states().into_keys().collect();
        if ids.is_empty() {
            None
        } else {
            Some(self.encode_update(&ids))
        }
    }

    fn rebuild_index(&mut self) {
        let mut controlled: HashMap<ConnectionId, HashSet<ClientId>> = HashMap::new();
        for (id, entry) in &self.entries {
            if let (Some(conn), Some(_)) = (entry.last_updated_by, &entry.state) {
                controlled.entry(conn).or_default().insert(*id);
            }
        }
        self.controlled = controlled;
    }
}
