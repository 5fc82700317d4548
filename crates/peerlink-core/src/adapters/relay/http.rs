//! [`RelayTransport`] over HTTP (requests) and WebSocket (pushes).
//!
//! Calls are `POST {base}/api/{call}/` with JSON bodies. Pushes arrive on
//! `{push}/?id={session}`, one JSON [`SessionConnection`] per text message.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::application::ports::{RelayCall, RelayTransport, Subscription};
use crate::domain::session::{SessionConnection, SessionId};
use crate::error::RelayError;

const SUBSCRIPTION_BUFFER: usize = 16;

pub struct HttpRelay {
    client: reqwest::Client,
    base_url: String,
    push_url: String,
}

impl HttpRelay {
    pub fn new(
        base_url: &str,
        push_url: &str,
        request_timeout: Duration,
    ) -> Result<Self, RelayError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| RelayError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_owned(),
            push_url: push_url.trim_end_matches('/').to_owned(),
        })
    }

    pub fn call_url(&self, call: RelayCall) -> String {
        format!("{}{}", self.base_url, call.path())
    }

    pub fn subscription_url(&self, id: &SessionId) -> String {
        format!("{}/?id={}", self.push_url, id)
    }
}

#[async_trait]
impl RelayTransport for HttpRelay {
    async fn request(
        &self,
        call: RelayCall,
        body: serde_json::Value,
    ) -> Result<serde_json::Value, RelayError> {
        let url = self.call_url(call);
        debug!(%url, "Relay request");
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| RelayError::Transport(e.to_string()))?;

        let status = response.status().as_u16();
        if status >= 300 {
            warn!(call = call.name(), status, "Relay request failed");
            return Err(RelayError::Status {
                call: call.name(),
                status,
            });
        }
        response
            .json()
            .await
            .map_err(|e| RelayError::Unexpected {
                call: call.name(),
                reason: e.to_string(),
            })
    }

    /// The relay is expected to send the current record as soon as the
    /// socket opens; this side forwards whatever arrives.
    async fn subscribe(&self, id: &SessionId) -> Result<Subscription, RelayError> {
        let url = self.subscription_url(id);
        let (ws, _) = connect_async(url.as_str())
            .await
            .map_err(|e| RelayError::Transport(e.to_string()))?;
        info!(%url, "Push channel open");

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let token = CancellationToken::new();
        tokio::spawn(feed(ws, tx, token.clone(), id.clone()));
        Ok(Subscription::new(rx, token))
    }
}

/// Forwards decoded snapshots until the relay closes the socket, the
/// subscription is dropped, or the socket errors.
async fn feed(
    mut ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    tx: mpsc::Sender<SessionConnection>,
    token: CancellationToken,
    id: SessionId,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => {
                if let Err(e) = ws.close(None).await {
                    debug!(session_id = %id, error = %e, "Push channel close failed");
                }
                break;
            }
            msg = ws.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<SessionConnection>(&text) {
                        Ok(snapshot) => {
                            if tx.send(snapshot).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!(session_id = %id, error = %e, "Skipping undecodable push"),
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    info!(session_id = %id, "Relay closed the push channel");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(session_id = %id, error = %e, "Push channel error");
                    break;
                }
            },
        }
    }
}
