//! Sync unit state machine
//!
//! The pure, synchronous half of a sync unit: the current value, the
//! serialized mirror of what was last exchanged with the remote, and the
//! phase. Every transition returns an outcome telling the caller which side
//! effect to perform (persist, schedule a write-merge, nothing). No I/O and
//! no runtime happen here.
//!
//! ## Phases
//!
//! ```text
//! LocalOnly --begin_sync--> AwaitingInitialSnapshot --snapshot/error--> Synced
//!     ^                                                                   |
//!     +------------------------------- reset ----------------------------+
//! ```
//!
//! While awaiting the first snapshot, writes are applied locally but never
//! sent: the remote may hold newer data from another device.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::remote::RemoteError;

/// Values a sync unit can hold
pub trait SliceValue: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T> SliceValue for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

/// Binding phase of a sync unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// No subscription; writes go to the local cache only
    LocalOnly,
    /// Subscribed, nothing heard back yet; remote writes are suppressed
    AwaitingInitialSnapshot,
    /// The remote has answered at least once
    Synced,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::LocalOnly => "local-only",
            Phase::AwaitingInitialSnapshot => "awaiting-initial-snapshot",
            Phase::Synced => "synced",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a caller write requires
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
    /// Persist locally only
    LocalOnly,
    /// Persist locally; the remote write was withheld until the first snapshot
    Suppressed,
    /// Persist locally and (re)schedule a write-merge of this value
    Schedule(Value),
    /// Persist locally; the value cannot be serialized so nothing is sent
    Unserializable(String),
}

/// What a remote snapshot did
#[derive(Debug, Clone, PartialEq)]
pub enum SnapshotOutcome {
    /// Not bound; the snapshot is stale and was dropped
    Ignored,
    /// The document does not exist; the local value stands
    NoDocument,
    /// Structurally equal to the last known value; nothing to do
    Unchanged,
    /// Adopted as the new value; persist it and notify
    Adopted,
    /// The snapshot could not be decoded into the slice type
    Undecodable(String),
}

/// The synchronous state of one sync unit
#[derive(Debug, Clone)]
pub struct SyncMachine<T> {
    value: T,
    last_known: Option<Value>,
    phase: Phase,
}

impl<T: SliceValue> SyncMachine<T> {
    /// A machine in `LocalOnly` holding `value`
    pub fn new(value: T) -> Self {
        let last_known = serde_json::to_value(&value).ok();
        Self {
            value,
            last_known,
            phase: Phase::LocalOnly,
        }
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    /// Serialized form of the value last written or adopted
    pub fn last_known(&self) -> Option<&Value> {
        self.last_known.as_ref()
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Replace the value wholesale and fall back to `LocalOnly`
    pub fn reseed(&mut self, value: T) {
        self.last_known = serde_json::to_value(&value).ok();
        self.value = value;
        self.phase = Phase::LocalOnly;
    }

    /// A subscription was opened
    pub fn begin_sync(&mut self) {
        self.phase = Phase::AwaitingInitialSnapshot;
    }

    /// The subscription was torn down
    pub fn reset(&mut self) {
        self.phase = Phase::LocalOnly;
    }

    /// Apply a caller write
    pub fn write(&mut self, value: T) -> WriteOutcome {
        self.value = value;
        self.after_write()
    }

    /// Apply a caller mutation in place
    pub fn update(&mut self, f: impl FnOnce(&mut T)) -> WriteOutcome {
        f(&mut self.value);
        self.after_write()
    }

    fn after_write(&mut self) -> WriteOutcome {
        let serialized = serde_json::to_value(&self.value);
        // The echo of this write must compare equal
        self.last_known = serialized.as_ref().ok().cloned();

        match self.phase {
            Phase::LocalOnly => WriteOutcome::LocalOnly,
            Phase::AwaitingInitialSnapshot => WriteOutcome::Suppressed,
            Phase::Synced => match serialized {
                Ok(value) => WriteOutcome::Schedule(value),
                Err(e) => WriteOutcome::Unserializable(e.to_string()),
            },
        }
    }

    /// Apply a remote snapshot; `None` means the document does not exist
    pub fn on_snapshot(&mut self, snapshot: Option<Value>) -> SnapshotOutcome {
        if self.phase == Phase::LocalOnly {
            return SnapshotOutcome::Ignored;
        }
        self.phase = Phase::Synced;

        let Some(incoming) = snapshot else {
            return SnapshotOutcome::NoDocument;
        };
        if self.last_known.as_ref() == Some(&incoming) {
            return SnapshotOutcome::Unchanged;
        }

        match serde_json::from_value::<T>(incoming.clone()) {
            Ok(value) => {
                self.value = value;
                self.last_known = Some(incoming);
                SnapshotOutcome::Adopted
            }
            Err(e) => SnapshotOutcome::Undecodable(e.to_string()),
        }
    }

    /// Apply a subscription error; returns whether the phase changed
    ///
    /// The value is never touched.
    pub fn on_error(&mut self, _error: &RemoteError) -> bool {
        if self.phase == Phase::AwaitingInitialSnapshot {
            self.phase = Phase::Synced;
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Thresholds {
        low_threshold: u32,
        high_threshold: u32,
    }

    fn thresholds(low: u32, high: u32) -> Thresholds {
        Thresholds {
            low_threshold: low,
            high_threshold: high,
        }
    }

    fn synced(value: Thresholds) -> SyncMachine<Thresholds> {
        let mut machine = SyncMachine::new(value);
        machine.begin_sync();
        machine.on_snapshot(None);
        machine
    }

    #[test]
    fn test_local_only_writes_never_schedule() {
        let mut machine = SyncMachine::new(thresholds(70, 180));
        assert_eq!(machine.write(thresholds(65, 180)), WriteOutcome::LocalOnly);
        assert_eq!(machine.value(), &thresholds(65, 180));
    }

    #[test]
    fn test_writes_suppressed_until_first_snapshot() {
        let mut machine = SyncMachine::new(thresholds(70, 180));
        machine.begin_sync();

        assert_eq!(machine.write(thresholds(60, 180)), WriteOutcome::Suppressed);
        assert_eq!(
            machine.update(|t| t.high_threshold = 200),
            WriteOutcome::Suppressed
        );

        assert_eq!(machine.on_snapshot(None), SnapshotOutcome::NoDocument);
        assert_eq!(machine.phase(), Phase::Synced);
        assert_eq!(
            machine.write(thresholds(61, 200)),
            WriteOutcome::Schedule(json!({"lowThreshold": 61, "highThreshold": 200}))
        );
    }

    #[test]
    fn test_error_counts_as_first_answer() {
        let mut machine = SyncMachine::new(thresholds(70, 180));
        machine.begin_sync();

        assert!(machine.on_error(&RemoteError::unavailable("offline")));
        assert_eq!(machine.phase(), Phase::Synced);
        assert!(!machine.on_error(&RemoteError::unavailable("offline")));
        assert_eq!(machine.value(), &thresholds(70, 180));
    }

    #[test]
    fn test_equal_snapshot_is_a_no_op() {
        let mut machine = synced(thresholds(70, 180));
        let before = machine.last_known().cloned();

        // Key order differs from the serialized form
        let outcome = machine.on_snapshot(Some(json!({"highThreshold": 180, "lowThreshold": 70})));

        assert_eq!(outcome, SnapshotOutcome::Unchanged);
        assert_eq!(machine.last_known().cloned(), before);
        assert_eq!(machine.value(), &thresholds(70, 180));
    }

    #[test]
    fn test_echo_of_own_write_is_recognized() {
        let mut machine = synced(thresholds(70, 180));
        let WriteOutcome::Schedule(sent) = machine.update(|t| t.low_threshold = 65) else {
            panic!("Expected a scheduled write");
        };

        assert_eq!(machine.on_snapshot(Some(sent)), SnapshotOutcome::Unchanged);
        assert_eq!(machine.value().low_threshold, 65);
    }

    #[test]
    fn test_different_snapshot_is_adopted() {
        let mut machine = synced(thresholds(70, 180));
        let incoming = json!({"lowThreshold": 80, "highThreshold": 160});

        assert_eq!(
            machine.on_snapshot(Some(incoming.clone())),
            SnapshotOutcome::Adopted
        );
        assert_eq!(machine.value(), &thresholds(80, 160));
        assert_eq!(machine.last_known(), Some(&incoming));
    }

    #[test]
    fn test_undecodable_snapshot_keeps_value() {
        let mut machine = synced(thresholds(70, 180));

        let outcome = machine.on_snapshot(Some(json!("not thresholds")));
        assert!(matches!(outcome, SnapshotOutcome::Undecodable(_)));
        assert_eq!(machine.value(), &thresholds(70, 180));
    }

    #[test]
    fn test_snapshots_after_reset_are_ignored() {
        let mut machine = synced(thresholds(70, 180));
        machine.reset();

        assert_eq!(
            machine.on_snapshot(Some(json!({"lowThreshold": 1, "highThreshold": 2}))),
            SnapshotOutcome::Ignored
        );
        assert_eq!(machine.phase(), Phase::LocalOnly);
        assert_eq!(machine.value(), &thresholds(70, 180));
    }

    #[test]
    fn test_reseed_replaces_value_and_mirror() {
        let mut machine = synced(thresholds(70, 180));
        machine.reseed(thresholds(90, 190));

        assert_eq!(machine.phase(), Phase::LocalOnly);
        assert_eq!(
            machine.last_known(),
            Some(&json!({"lowThreshold": 90, "highThreshold": 190}))
        );
    }
}
