//! Duplex control-plane client.
//!
//! One connection at a time. After registration the connection is served by
//! a reader task (applies pushed updates, answers queries) and a writer task
//! (sends replies and heartbeats), joined by an mpsc channel and a
//! per-connection cancellation token.

use futures::stream::{SplitSink, SplitStream};
use futures::{Sink, SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{timeout, timeout_at, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::config::SyncConfig;
use super::protocol::{
    DeleteRulePayload, Envelope, HeartbeatPayload, MessageType, RegisterPayload,
    RegisterResponse, RuleSetPayload, ServiceConfigPayload, UpsertRulePayload,
};
use crate::error::{RuleSetError, SyncError};
use crate::rules::RuleStore;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const OUTBOUND_CAPACITY: usize = 32;

/// Keeps the [`RuleStore`] in step with the control plane.
pub struct SyncClient {
    config: SyncConfig,
    store: Arc<RuleStore>,
    shutdown: CancellationToken,
}

impl SyncClient {
    pub fn new(config: SyncConfig, store: Arc<RuleStore>, shutdown: CancellationToken) -> Self {
        Self {
            config,
            store,
            shutdown,
        }
    }

    /// Connect, sync and serve until shutdown.
    ///
    /// Returns `Ok` on shutdown and `SyncError::Fatal` once the reconnect
    /// limit is reached or the first rule set cannot be installed.
    pub async fn run(&self) -> Result<(), SyncError> {
        let mut failures = 0u32;
        let mut synced_once = false;

        loop {
            if self.shutdown.is_cancelled() {
                return Ok(());
            }

            match self.establish(synced_once).await {
                Ok((ws, heartbeat)) => {
                    failures = 0;
                    synced_once = true;
                    if let Err(e) = self.serve(ws, heartbeat).await {
                        warn!(error = %e, "Control channel lost");
                    }
                    if self.shutdown.is_cancelled() {
                        info!("Control channel closed for shutdown");
                        return Ok(());
                    }
                }
                Err(SyncError::Fatal(reason)) => {
                    error!(reason = %reason, "Control channel cannot continue");
                    return Err(SyncError::Fatal(reason));
                }
                Err(e) => {
                    failures += 1;
                    warn!(
                        attempt = failures,
                        max_attempts = self.config.max_attempts,
                        error = %e,
                        "Control plane connection attempt failed"
                    );
                    if failures >= self.config.max_attempts {
                        error!(failures, "Giving up on control plane");
                        return Err(SyncError::Fatal(format!(
                            "{} consecutive connection failures, last: {}",
                            failures, e
                        )));
                    }
                }
            }

            let delay = self.config.backoff(failures.max(1));
            debug!(delay_ms = delay.as_millis() as u64, "Reconnecting to control plane");
            tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Connect, register and install the full rule set.
    async fn establish(&self, synced_once: bool) -> Result<(WsStream, Duration), SyncError> {
        let mut ws = self.connect().await?;
        let response = self.register(&mut ws).await?;

        let heartbeat = response
            .heartbeat_interval_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(self.config.heartbeat_interval);

        match self.store.replace_all(response.rule_set).await {
            Ok(hash) => {
                info!(
                    namespace = %self.config.namespace,
                    rules_hash = %hash,
                    heartbeat_secs = heartbeat.as_secs_f64(),
                    "Registered with control plane"
                );
                Ok((ws, heartbeat))
            }
            Err(e @ RuleSetError::Components(_)) => Err(SyncError::Fatal(e.to_string())),
            Err(e) if !synced_once => Err(SyncError::Fatal(format!(
                "initial rule set rejected: {}",
                e
            ))),
            Err(e) => {
                let _ = ws.close(None).await;
                Err(SyncError::Registration(format!("rule set rejected: {}", e)))
            }
        }
    }

    async fn connect(&self) -> Result<WsStream, SyncError> {
        let mut request = self
            .config
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| SyncError::Connect(e.to_string()))?;
        if let Some(token) = &self.config.bearer_token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| SyncError::Connect(format!("invalid bearer token: {}", e)))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        debug!(url = %self.config.url, "Connecting to control plane");
        let (ws, _response) = timeout(self.config.register_timeout, connect_async(request))
            .await
            .map_err(|_| SyncError::Connect("connect timed out".to_string()))?
            .map_err(|e| SyncError::Connect(e.to_string()))?;
        Ok(ws)
    }

    async fn register(&self, ws: &mut WsStream) -> Result<RegisterResponse, SyncError> {
        let request = Envelope::request(
            MessageType::Register,
            &RegisterPayload {
                namespace: self.config.namespace.clone(),
                instance_id: self.config.instance_id.clone(),
            },
        )
        .map_err(|e| SyncError::Protocol(e.to_string()))?;
        send_envelope(ws, &request, self.config.write_timeout).await?;

        let deadline = Instant::now() + self.config.register_timeout;
        loop {
            let frame = timeout_at(deadline, ws.next())
                .await
                .map_err(|_| SyncError::Registration("no registration response".to_string()))?;

            match frame {
                Some(Ok(Message::Text(text))) => {
                    let envelope: Envelope = serde_json::from_str(text.as_str())
                        .map_err(|e| SyncError::Protocol(format!("undecodable frame: {}", e)))?;
                    if envelope.message_type != MessageType::Response
                        || envelope.responding_to.as_deref() != Some(request.id.as_str())
                    {
                        debug!(
                            message_type = ?envelope.message_type,
                            "Ignoring frame before registration"
                        );
                        continue;
                    }
                    if !envelope.is_success() {
                        return Err(SyncError::Registration(format!(
                            "rejected with status {}",
                            envelope.status.unwrap_or_default()
                        )));
                    }
                    return envelope
                        .payload_as()
                        .map_err(|e| SyncError::Registration(format!("invalid payload: {}", e)));
                }
                Some(Ok(Message::Close(_))) | None => {
                    return Err(SyncError::Closed("closed during registration".to_string()))
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(SyncError::Closed(e.to_string())),
            }
        }
    }

    async fn serve(&self, ws: WsStream, heartbeat: Duration) -> Result<(), SyncError> {
        let connection = self.shutdown.child_token();
        let (sink, stream) = ws.split();
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);

        let writer = tokio::spawn(write_loop(
            sink,
            outbound_rx,
            Arc::clone(&self.store),
            heartbeat,
            self.config.write_timeout,
            connection.clone(),
        ));
        let reader = tokio::spawn(read_loop(
            stream,
            outbound_tx,
            Arc::clone(&self.store),
            heartbeat * 3,
            connection,
        ));

        let (read_result, write_result) = tokio::join!(reader, writer);
        let read_result =
            read_result.map_err(|e| SyncError::Protocol(format!("reader task failed: {}", e)))?;
        let write_result =
            write_result.map_err(|e| SyncError::Protocol(format!("writer task failed: {}", e)))?;
        read_result.and(write_result)
    }
}

async fn send_envelope<S>(
    sink: &mut S,
    envelope: &Envelope,
    limit: Duration,
) -> Result<(), SyncError>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    let text = serde_json::to_string(envelope).map_err(|e| SyncError::Protocol(e.to_string()))?;
    timeout(limit, sink.send(Message::Text(text.into())))
        .await
        .map_err(|_| SyncError::Closed("write timed out".to_string()))?
        .map_err(|e| SyncError::Closed(e.to_string()))
}

async fn write_loop(
    mut sink: SplitSink<WsStream, Message>,
    mut outbound: mpsc::Receiver<Envelope>,
    store: Arc<RuleStore>,
    heartbeat: Duration,
    write_timeout: Duration,
    connection: CancellationToken,
) -> Result<(), SyncError> {
    let _cancel_on_exit = connection.clone().drop_guard();

    let mut ticker = tokio::time::interval(heartbeat);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = connection.cancelled() => {
                let _ = timeout(write_timeout, sink.send(Message::Close(None))).await;
                return Ok(());
            }
            message = outbound.recv() => match message {
                Some(envelope) => send_envelope(&mut sink, &envelope, write_timeout).await?,
                None => return Ok(()),
            },
            _ = ticker.tick() => {
                let rules_hash = store
                    .rules_hash()
                    .map_err(|e| SyncError::Protocol(e.to_string()))?;
                let envelope = Envelope::request(
                    MessageType::Heartbeat,
                    &HeartbeatPayload { rules_hash },
                )
                .map_err(|e| SyncError::Protocol(e.to_string()))?;
                send_envelope(&mut sink, &envelope, write_timeout).await?;
                debug!("Heartbeat sent");
            }
        }
    }
}

async fn read_loop(
    mut stream: SplitStream<WsStream>,
    outbound: mpsc::Sender<Envelope>,
    store: Arc<RuleStore>,
    idle_timeout: Duration,
    connection: CancellationToken,
) -> Result<(), SyncError> {
    let _cancel_on_exit = connection.clone().drop_guard();

    loop {
        let frame = tokio::select! {
            _ = connection.cancelled() => return Ok(()),
            frame = timeout(idle_timeout, stream.next()) => {
                frame.map_err(|_| SyncError::Idle(idle_timeout))?
            }
        };

        match frame {
            Some(Ok(Message::Text(text))) => {
                let envelope: Envelope = match serde_json::from_str(text.as_str()) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        warn!(error = %e, "Dropping undecodable control frame");
                        continue;
                    }
                };
                if let Some(reply) = handle_envelope(&store, envelope).await {
                    if outbound.send(reply).await.is_err() {
                        return Ok(());
                    }
                }
            }
            Some(Ok(Message::Close(frame))) => {
                return Err(SyncError::Closed(format!("peer closed: {:?}", frame)))
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(SyncError::Closed(e.to_string())),
            None => return Err(SyncError::Closed("stream ended".to_string())),
        }
    }
}

/// Apply one server frame. Returns the reply to send, if any.
async fn handle_envelope(store: &RuleStore, envelope: Envelope) -> Option<Envelope> {
    let outcome = match envelope.message_type {
        MessageType::Response => {
            debug!(
                responding_to = ?envelope.responding_to,
                status = ?envelope.status,
                "Control plane acknowledged"
            );
            return None;
        }
        MessageType::UpsertGenerationRule => match decode::<UpsertRulePayload>(&envelope) {
            Ok(payload) => store.upsert_rule(payload.rule).map(hash_payload),
            Err(e) => Err(e),
        },
        MessageType::DeleteGenerationRule => match decode::<DeleteRulePayload>(&envelope) {
            Ok(payload) => store.delete_rule(&payload.name).map(hash_payload),
            Err(e) => Err(e),
        },
        MessageType::UpsertServiceConfig => match decode::<ServiceConfigPayload>(&envelope) {
            Ok(payload) => store
                .update_service_config(payload.config)
                .await
                .map(hash_payload),
            Err(e) => Err(e),
        },
        MessageType::Reconcile => match decode::<RuleSetPayload>(&envelope) {
            Ok(payload) => store.replace_all(payload.rule_set).await.map(hash_payload),
            Err(e) => Err(e),
        },
        MessageType::GetRulesHash => store.rules_hash().map(hash_payload),
        MessageType::GetRules => store.rules_json().map(|rule_set| json!({ "ruleSet": rule_set })),
        MessageType::Register | MessageType::Heartbeat => Err(RuleSetError::Invalid(format!(
            "{:?} is not accepted from the control plane",
            envelope.message_type
        ))),
    };

    Some(match outcome {
        Ok(payload) => {
            debug!(message_type = ?envelope.message_type, "Control plane request applied");
            Envelope::response(&envelope.id, 200, Some(payload))
        }
        Err(e) => {
            warn!(
                message_type = ?envelope.message_type,
                status = e.status_code(),
                error = %e,
                "Control plane request rejected"
            );
            Envelope::response(
                &envelope.id,
                e.status_code(),
                Some(json!({ "error": e.to_string() })),
            )
        }
    })
}

fn decode<T: serde::de::DeserializeOwned>(envelope: &Envelope) -> Result<T, RuleSetError> {
    envelope
        .payload_as()
        .map_err(|e| RuleSetError::Invalid(format!("invalid payload: {}", e)))
}

fn hash_payload(rules_hash: String) -> Value {
    json!({ "rulesHash": rules_hash })
}
