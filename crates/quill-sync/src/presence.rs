use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, TimeDelta, Utc};

use quill_types::models::PresenceRecord;
use quill_types::{RoomId, ViewerId};

/// The tracker's table of live presence records, one map per room.
///
/// Every operation takes `now` from the caller, so eviction is a pure function
/// of the timeout and the heartbeat history. A room is evaluated (reaped)
/// whenever it is read; rooms that empty out are dropped.
#[derive(Debug, Clone)]
pub struct PresenceRoster {
    timeout: TimeDelta,
    rooms: HashMap<RoomId, BTreeMap<ViewerId, PresenceRecord>>,
}

impl PresenceRoster {
    pub fn new(timeout: TimeDelta) -> Self {
        Self {
            timeout,
            rooms: HashMap::new(),
        }
    }

    pub fn timeout(&self) -> TimeDelta {
        self.timeout
    }

    /// Register a viewer. Returns `true` if they were not already present.
    pub fn join(&mut self, room_id: RoomId, viewer_id: ViewerId, now: DateTime<Utc>) -> bool {
        self.reap(room_id, now);
        self.touch(room_id, viewer_id, now)
    }

    /// Refresh a viewer's deadline. A heartbeat for an absent viewer
    /// re-registers them; returns `true` in that case.
    pub fn heartbeat(&mut self, room_id: RoomId, viewer_id: ViewerId, now: DateTime<Utc>) -> bool {
        self.reap(room_id, now);
        self.touch(room_id, viewer_id, now)
    }

    /// Remove a viewer right away. Returns `true` if they were present.
    pub fn leave(&mut self, room_id: RoomId, viewer_id: ViewerId) -> bool {
        let Some(room) = self.rooms.get_mut(&room_id) else {
            return false;
        };
        let removed = room.remove(&viewer_id).is_some();
        if room.is_empty() {
            self.rooms.remove(&room_id);
        }
        removed
    }

    /// Evict every record in the room whose last heartbeat is more than the
    /// timeout before `now`. Returns the evicted viewers.
    pub fn reap(&mut self, room_id: RoomId, now: DateTime<Utc>) -> Vec<ViewerId> {
        let Some(room) = self.rooms.get_mut(&room_id) else {
            return Vec::new();
        };

        let timeout = self.timeout;
        let expired: Vec<ViewerId> = room
            .values()
            .filter(|record| now.signed_duration_since(record.last_heartbeat) > timeout)
            .map(|record| record.viewer_id)
            .collect();

        for viewer_id in &expired {
            room.remove(viewer_id);
        }
        if room.is_empty() {
            self.rooms.remove(&room_id);
        }
        expired
    }

    /// Reap every room. Returns the rooms that lost at least one viewer.
    pub fn reap_all(&mut self, now: DateTime<Utc>) -> Vec<(RoomId, Vec<ViewerId>)> {
        let room_ids: Vec<RoomId> = self.rooms.keys().copied().collect();
        room_ids
            .into_iter()
            .filter_map(|room_id| {
                let evicted = self.reap(room_id, now);
                (!evicted.is_empty()).then_some((room_id, evicted))
            })
            .collect()
    }

    /// The room's live set after evaluating deadlines, ordered by viewer id.
    pub fn live_set(&mut self, room_id: RoomId, now: DateTime<Utc>) -> Vec<PresenceRecord> {
        self.reap(room_id, now);
        self.records(room_id)
    }

    /// The room's records as currently stored, without evaluating deadlines.
    pub fn records(&self, room_id: RoomId) -> Vec<PresenceRecord> {
        self.rooms
            .get(&room_id)
            .map(|room| room.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    fn touch(&mut self, room_id: RoomId, viewer_id: ViewerId, now: DateTime<Utc>) -> bool {
        let room = self.rooms.entry(room_id).or_default();
        match room.get_mut(&viewer_id) {
            Some(record) => {
                record.last_heartbeat = record.last_heartbeat.max(now);
                false
            }
            None => {
                room.insert(
                    viewer_id,
                    PresenceRecord {
                        room_id,
                        viewer_id,
                        last_heartbeat: now,
                    },
                );
                true
            }
        }
    }
}
