//! Transaction receiver: the HTTP endpoint the home server pushes room
//! events to.
//!
//! Each transaction is a JSON batch of events. Chat messages from anyone
//! other than the bridge's own users are written to the ICB group as open
//! messages, in batch order. The home server is never told about relay
//! failures; they are logged.

use std::collections::{HashMap, VecDeque};
use std::str::FromStr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::put;
use icb_proto::appservice::{BridgeEvent, TransactionBatch};
use icb_proto::packet::{Packet, split_open_text};
use parking_lot::Mutex;

use crate::link::LinkWriter;

/// How many recent transaction IDs are remembered for retry detection.
const TXN_WINDOW: usize = 256;

/// What to do when a transaction contains an event sent by the bridge's
/// own users.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EchoPolicy {
    /// Stop processing the transaction at that event.
    #[default]
    HaltBatch,
    /// Skip that event and keep going.
    SkipEvent,
}

impl FromStr for EchoPolicy {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "halt-batch" | "halt" => Ok(Self::HaltBatch),
            "skip-event" | "skip" => Ok(Self::SkipEvent),
            _ => Err(()),
        }
    }
}

/// Counts of what happened to the events of one transaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelaySummary {
    /// Open-message packets written to the group.
    pub relayed: usize,
    /// Packets that could not be written.
    pub failed: usize,
    /// Message events dropped for a missing, malformed, or empty body.
    pub dropped: usize,
    /// Events of a type the bridge does not handle.
    pub unknown: usize,
    /// Events sent by the bridge's own users.
    pub echoes: usize,
    /// Whether processing stopped before the end of the batch.
    pub halted: bool,
}

/// Shared state of the transaction receiver.
pub struct BridgeState {
    /// Writer to the ICB group.
    writer: LinkWriter,
    /// User ID prefix of the bridge's own users.
    user_prefix: String,
    /// Token the home server must present; empty disables the check.
    hs_token: String,
    echo_policy: EchoPolicy,
    /// Recently processed transaction IDs, oldest first.
    recent_txns: Mutex<VecDeque<String>>,
    /// Held while a batch is relayed so batches do not interleave.
    relay_lock: tokio::sync::Mutex<()>,
}

impl BridgeState {
    /// Creates receiver state writing to `writer`.
    #[must_use]
    pub fn new(writer: LinkWriter, user_prefix: impl Into<String>) -> Self {
        Self {
            writer,
            user_prefix: user_prefix.into(),
            hs_token: String::new(),
            echo_policy: EchoPolicy::default(),
            recent_txns: Mutex::new(VecDeque::with_capacity(TXN_WINDOW)),
            relay_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Requires the home server to present `hs_token`.
    #[must_use]
    pub fn with_hs_token(mut self, hs_token: impl Into<String>) -> Self {
        self.hs_token = hs_token.into();
        self
    }

    /// Sets the policy for bridge-originated events.
    #[must_use]
    pub const fn with_echo_policy(mut self, echo_policy: EchoPolicy) -> Self {
        self.echo_policy = echo_policy;
        self
    }

    /// Records `txn_id`, returning `false` if it was seen recently.
    fn remember_txn(&self, txn_id: &str) -> bool {
        let mut recent = self.recent_txns.lock();
        if recent.iter().any(|id| id == txn_id) {
            return false;
        }
        if recent.len() == TXN_WINDOW {
            recent.pop_front();
        }
        recent.push_back(txn_id.to_string());
        true
    }

    /// Drops `txn_id` from the window so a retry is relayed again.
    fn forget_txn(&self, txn_id: &str) {
        self.recent_txns.lock().retain(|id| id != txn_id);
    }

    fn is_echo(&self, event: &BridgeEvent) -> bool {
        !self.user_prefix.is_empty() && event.sender_id().starts_with(&self.user_prefix)
    }

    /// Relays the events of one transaction to the group, in order.
    pub async fn relay_batch(&self, batch: &TransactionBatch) -> RelaySummary {
        let _guard = self.relay_lock.lock().await;
        let mut summary = RelaySummary::default();

        for event in &batch.events {
            if self.is_echo(event) {
                summary.echoes += 1;
                match self.echo_policy {
                    EchoPolicy::HaltBatch => {
                        tracing::debug!(
                            event_id = %event.event_id,
                            sender = %event.sender_id(),
                            "bridge-originated event, ignoring rest of transaction"
                        );
                        summary.halted = true;
                        break;
                    }
                    EchoPolicy::SkipEvent => {
                        tracing::debug!(
                            event_id = %event.event_id,
                            sender = %event.sender_id(),
                            "skipping bridge-originated event"
                        );
                        continue;
                    }
                }
            }

            if !event.is_message() {
                tracing::info!(event_id = %event.event_id, "{} unknown event type", event.event_type);
                summary.unknown += 1;
                continue;
            }

            let body = match event.body() {
                Ok(body) => body,
                Err(e) => {
                    tracing::warn!(
                        event_id = %event.event_id,
                        sender = %event.sender_id(),
                        error = %e,
                        "dropping message event"
                    );
                    summary.dropped += 1;
                    continue;
                }
            };

            let chunks = split_open_text(body);
            if chunks.is_empty() {
                tracing::warn!(
                    event_id = %event.event_id,
                    sender = %event.sender_id(),
                    "dropping message event with empty body"
                );
                summary.dropped += 1;
                continue;
            }

            for chunk in chunks {
                match self.writer.write(&Packet::open(&chunk)).await {
                    Ok(()) => summary.relayed += 1,
                    Err(e) => {
                        tracing::error!(
                            event_id = %event.event_id,
                            error = %e,
                            "failed to relay message to group"
                        );
                        summary.failed += 1;
                    }
                }
            }
        }

        summary
    }

    /// Checks the home server's token against the configured `hs_token`.
    fn authorize(&self, headers: &HeaderMap, query_token: Option<&str>) -> Result<(), Response> {
        if self.hs_token.is_empty() {
            return Ok(());
        }
        let bearer = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));

        match bearer.or(query_token) {
            None => Err(matrix_error(
                StatusCode::UNAUTHORIZED,
                "M_UNAUTHORIZED",
                "missing access token",
            )),
            Some(token) if token == self.hs_token => Ok(()),
            Some(_) => Err(matrix_error(
                StatusCode::FORBIDDEN,
                "M_FORBIDDEN",
                "invalid access token",
            )),
        }
    }
}

/// Builds a Matrix-style error response.
fn matrix_error(status: StatusCode, errcode: &str, message: &str) -> Response {
    (
        status,
        axum::Json(serde_json::json!({ "errcode": errcode, "error": message })),
    )
        .into_response()
}

/// axum handler for `PUT /transactions/{txn_id}`.
async fn transaction_handler(
    State(state): State<Arc<BridgeState>>,
    Path(txn_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(rejection) =
        state.authorize(&headers, params.get("access_token").map(String::as_str))
    {
        tracing::warn!(txn_id = %txn_id, "rejected transaction with bad access token");
        return rejection;
    }

    let batch: TransactionBatch = match serde_json::from_slice(&body) {
        Ok(batch) => batch,
        Err(e) => {
            tracing::warn!(txn_id = %txn_id, error = %e, "malformed transaction body");
            return matrix_error(
                StatusCode::BAD_REQUEST,
                "M_NOT_JSON",
                &format!("invalid transaction body: {e}"),
            );
        }
    };

    if state.remember_txn(&txn_id) {
        // Spawned so the batch completes even if the request is dropped.
        let events = batch.events.len();
        let relay = tokio::spawn({
            let state = Arc::clone(&state);
            async move { state.relay_batch(&batch).await }
        });
        match relay.await {
            Ok(summary) => tracing::debug!(
                txn_id = %txn_id,
                events,
                relayed = summary.relayed,
                failed = summary.failed,
                "transaction processed"
            ),
            Err(e) => {
                tracing::error!(txn_id = %txn_id, error = %e, "transaction relay task failed");
                state.forget_txn(&txn_id);
            }
        }
    } else {
        tracing::debug!(txn_id = %txn_id, "duplicate transaction, already relayed");
    }

    (StatusCode::OK, axum::Json(serde_json::json!({}))).into_response()
}

/// Builds the receiver's router.
pub fn router(state: Arc<BridgeState>) -> axum::Router {
    axum::Router::new()
        .route(
            "/transactions/{txn_id}",
            put(transaction_handler).post(transaction_handler),
        )
        .route(
            "/_matrix/app/v1/transactions/{txn_id}",
            put(transaction_handler).post(transaction_handler),
        )
        .with_state(state)
}

/// Starts the transaction receiver on `addr` and returns the bound address
/// and a join handle.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server(
    addr: &str,
    state: Arc<BridgeState>,
) -> Result<(std::net::SocketAddr, tokio::task::JoinHandle<()>), std::io::Error> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "transaction receiver error");
        }
    });

    Ok((bound_addr, handle))
}
