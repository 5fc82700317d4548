//! The rendezvous session record held by the relay, and the rules for
//! folding pushed snapshots of it into a local copy.
//!
//! Pure data, no I/O.

use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use super::media::{MediaConfig, StreamDirection};

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Opaque, relay-assigned session identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Session state
// ---------------------------------------------------------------------------

/// Relay-side handshake progress. Variants are ordered; a record only moves
/// forward through them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SessionState {
    Idle,
    Listening,
    SynSent,
    SynAcked,
    Streaming,
    Failed,
}

// ---------------------------------------------------------------------------
// SessionConnection
// ---------------------------------------------------------------------------

/// A full snapshot of one rendezvous session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConnection {
    pub id: SessionId,
    pub state: SessionState,
    /// Where the listener's engine receives media. Written once, by the ack.
    #[serde(default)]
    pub return_address: Option<SocketAddr>,
    /// Where the initiator's engine sends from. Written once, by the syn.
    #[serde(default)]
    pub send_address: Option<SocketAddr>,
    pub config: MediaConfig,
}

/// Result of folding a pushed snapshot into the local record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotOutcome {
    /// The snapshot replaced the local record.
    Applied,
    /// The snapshot was identical to the local record.
    Unchanged,
    /// The snapshot reported an earlier state and was discarded.
    Stale,
}

/// A snapshot that cannot be applied without breaking a record invariant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SnapshotRejection {
    #[error("snapshot for session {got} does not match session {expected}")]
    ForeignSession { expected: SessionId, got: SessionId },
    #[error("snapshot would rewrite the {field} address")]
    AddressRewrite { field: &'static str },
}

impl SessionConnection {
    /// Folds a pushed snapshot into this record as a full replace.
    ///
    /// Snapshots reporting an earlier state are stale duplicates and leave the
    /// record untouched. A snapshot for another session, or one that changes
    /// or clears an address already written, is rejected.
    pub fn apply_snapshot(
        &mut self,
        snapshot: SessionConnection,
    ) -> Result<SnapshotOutcome, SnapshotRejection> {
        if snapshot.id != self.id {
            return Err(SnapshotRejection::ForeignSession {
                expected: self.id.clone(),
                got: snapshot.id,
            });
        }
        if snapshot.state < self.state {
            return Ok(SnapshotOutcome::Stale);
        }
        check_write_once("return", self.return_address, snapshot.return_address)?;
        check_write_once("send", self.send_address, snapshot.send_address)?;

        if snapshot == *self {
            return Ok(SnapshotOutcome::Unchanged);
        }
        *self = snapshot;
        Ok(SnapshotOutcome::Applied)
    }

    /// Endpoint the local engine streams toward for the given role.
    pub fn remote_for(&self, direction: StreamDirection) -> Option<SocketAddr> {
        match direction {
            StreamDirection::Send => self.return_address,
            StreamDirection::Return => self.send_address,
        }
    }
}

fn check_write_once(
    field: &'static str,
    current: Option<SocketAddr>,
    incoming: Option<SocketAddr>,
) -> Result<(), SnapshotRejection> {
    match current {
        Some(addr) if incoming != Some(addr) => Err(SnapshotRejection::AddressRewrite { field }),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn config() -> MediaConfig {
        MediaConfig {
            host: "ALSA".into(),
            input_device: "default".into(),
            output_device: "default".into(),
            sample_rate: 48_000,
            buffer_size: 128,
            stereo: false,
            input_channel: 0,
            output_channel: 0,
        }
    }

    fn connection(state: SessionState) -> SessionConnection {
        SessionConnection {
            id: "abc".into(),
            state,
            return_address: None,
            send_address: None,
            config: config(),
        }
    }

    #[test]
    fn stale_snapshot_is_discarded() {
        let mut local = connection(SessionState::SynAcked);
        local.send_address = Some("1.2.3.4:9000".parse().unwrap());
        local.return_address = Some("5.6.7.8:9100".parse().unwrap());

        let mut stale = connection(SessionState::SynSent);
        stale.send_address = local.send_address;

        assert_eq!(local.apply_snapshot(stale), Ok(SnapshotOutcome::Stale));
        assert_eq!(local.state, SessionState::SynAcked);
    }

    #[test]
    fn newer_snapshot_replaces_whole_record() {
        let mut local = connection(SessionState::Listening);
        let mut pushed = connection(SessionState::SynSent);
        pushed.send_address = Some("1.2.3.4:9000".parse().unwrap());
        pushed.config.sample_rate = 44_100;

        assert_eq!(local.apply_snapshot(pushed.clone()), Ok(SnapshotOutcome::Applied));
        assert_eq!(local, pushed);
        assert_eq!(local.apply_snapshot(pushed), Ok(SnapshotOutcome::Unchanged));
    }

    #[test]
    fn written_addresses_cannot_change_or_clear() {
        let mut local = connection(SessionState::SynSent);
        local.send_address = Some("1.2.3.4:9000".parse().unwrap());

        let mut moved = connection(SessionState::SynAcked);
        moved.send_address = Some("9.9.9.9:1".parse().unwrap());
        assert_eq!(
            local.apply_snapshot(moved),
            Err(SnapshotRejection::AddressRewrite { field: "send" })
        );

        let cleared = connection(SessionState::SynAcked);
        assert!(local.apply_snapshot(cleared).is_err());
        assert_eq!(local.state, SessionState::SynSent);
    }

    #[test]
    fn foreign_snapshot_is_rejected() {
        let mut local = connection(SessionState::Listening);
        let mut other = connection(SessionState::SynSent);
        other.id = "xyz".into();
        assert!(matches!(
            local.apply_snapshot(other),
            Err(SnapshotRejection::ForeignSession { .. })
        ));
    }

    #[test]
    fn remote_endpoint_depends_on_direction() {
        let mut conn = connection(SessionState::SynAcked);
        conn.send_address = Some("1.2.3.4:9000".parse().unwrap());
        conn.return_address = Some("5.6.7.8:9100".parse().unwrap());
        assert_eq!(conn.remote_for(StreamDirection::Return), conn.send_address);
        assert_eq!(conn.remote_for(StreamDirection::Send), conn.return_address);
    }

    #[test]
    fn wire_form_uses_relay_field_names() {
        let json = r#"{
            "id": "abc",
            "state": "SynSent",
            "send_address": "1.2.3.4:9000",
            "config": {
                "host": "ALSA", "inputDevice": "default", "outputDevice": "default",
                "sampleRate": 48000, "bufferSize": 128, "stereo": false,
                "inputChannel": 0, "outputChannel": 0
            }
        }"#;
        let conn: SessionConnection = serde_json::from_str(json).unwrap();
        assert_eq!(conn.state, SessionState::SynSent);
        assert_eq!(conn.return_address, None);
        assert_eq!(conn.config, config());
    }

    fn any_state() -> impl Strategy<Value = SessionState> {
        prop::sample::select(vec![
            SessionState::Idle,
            SessionState::Listening,
            SessionState::SynSent,
            SessionState::SynAcked,
            SessionState::Streaming,
        ])
    }

    proptest! {
        #[test]
        fn state_never_regresses(states in prop::collection::vec(any_state(), 1..20)) {
            let mut local = connection(SessionState::Listening);
            let mut high_water = local.state;
            for state in states {
                let _ = local.apply_snapshot(connection(state));
                prop_assert!(local.state >= high_water);
                high_water = local.state;
            }
        }
    }
}
