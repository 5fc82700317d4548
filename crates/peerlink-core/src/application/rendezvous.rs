//! Typed client for the relay's rendezvous calls.
//!
//! Wraps a [`RelayTransport`] and checks every response against the state
//! the call is supposed to produce.

use std::net::SocketAddr;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use crate::domain::media::MediaConfig;
use crate::domain::session::{SessionConnection, SessionId, SessionState};
use crate::error::RelayError;

use super::ports::{RelayCall, RelayTransport, Subscription};

#[derive(Deserialize)]
struct PeerConfig {
    config: MediaConfig,
}

/// Session setup through the relay.
#[derive(Clone)]
pub struct RendezvousClient {
    transport: Arc<dyn RelayTransport>,
}

impl RendezvousClient {
    pub fn new(transport: Arc<dyn RelayTransport>) -> Self {
        Self { transport }
    }

    /// Registers a new session advertising `config`. The relay assigns the id.
    pub async fn create_session(
        &self,
        config: &MediaConfig,
    ) -> Result<SessionConnection, RelayError> {
        let call = RelayCall::Listen;
        let body = serde_json::to_value(config).map_err(|e| unexpected(call, e))?;
        let connection: SessionConnection = decode(call, self.transport.request(call, body).await?)?;
        expect_state(call, &connection, SessionState::Listening)?;
        info!(session_id = %connection.id, "Session created");
        Ok(connection)
    }

    /// Reads the config the listener of `id` advertised.
    pub async fn fetch_peer_config(&self, id: &SessionId) -> Result<MediaConfig, RelayError> {
        let call = RelayCall::Config;
        let value = self.transport.request(call, json!({ "id": id })).await?;
        let PeerConfig { config } = decode(call, value)?;
        debug!(session_id = %id, ?config, "Fetched peer config");
        Ok(config)
    }

    /// Publishes the initiator's local endpoint; the session moves to `SynSent`.
    pub async fn propose_syn(
        &self,
        id: &SessionId,
        send_address: SocketAddr,
    ) -> Result<SessionConnection, RelayError> {
        let call = RelayCall::Syn;
        let body = json!({ "id": id, "send_address": send_address });
        let connection: SessionConnection = decode(call, self.transport.request(call, body).await?)?;
        expect_session(call, &connection, id)?;
        expect_state(call, &connection, SessionState::SynSent)?;
        if connection.send_address != Some(send_address) {
            return Err(unexpected(call, "send_address was not stored"));
        }
        info!(session_id = %id, %send_address, "Syn accepted");
        Ok(connection)
    }

    /// Publishes the listener's local endpoint; the session moves to `SynAcked`.
    pub async fn propose_ack(
        &self,
        id: &SessionId,
        return_address: SocketAddr,
    ) -> Result<SessionConnection, RelayError> {
        let call = RelayCall::Ack;
        let body = json!({ "id": id, "return_address": return_address });
        let connection: SessionConnection = decode(call, self.transport.request(call, body).await?)?;
        expect_session(call, &connection, id)?;
        expect_state(call, &connection, SessionState::SynAcked)?;
        if connection.return_address != Some(return_address) {
            return Err(unexpected(call, "return_address was not stored"));
        }
        info!(session_id = %id, %return_address, "Ack accepted");
        Ok(connection)
    }

    /// Opens the push stream for `id`. Drop the subscription to stop it.
    pub async fn subscribe(&self, id: &SessionId) -> Result<Subscription, RelayError> {
        let subscription = self.transport.subscribe(id).await?;
        debug!(session_id = %id, "Subscribed to session pushes");
        Ok(subscription)
    }
}

fn decode<T: DeserializeOwned>(call: RelayCall, value: serde_json::Value) -> Result<T, RelayError> {
    serde_json::from_value(value).map_err(|e| unexpected(call, e))
}

fn expect_session(
    call: RelayCall,
    connection: &SessionConnection,
    id: &SessionId,
) -> Result<(), RelayError> {
    if connection.id != *id {
        return Err(unexpected(
            call,
            format!("answered for session {} instead of {id}", connection.id),
        ));
    }
    Ok(())
}

fn expect_state(
    call: RelayCall,
    connection: &SessionConnection,
    expected: SessionState,
) -> Result<(), RelayError> {
    if connection.state != expected {
        return Err(unexpected(
            call,
            format!("state is {:?}, expected {expected:?}", connection.state),
        ));
    }
    Ok(())
}

fn unexpected(call: RelayCall, reason: impl ToString) -> RelayError {
    RelayError::Unexpected {
        call: call.name(),
        reason: reason.to_string(),
    }
}
