//! The RPC surface of a channel daemon. Method names follow the JSON-RPC interface exposed to
//! game frontends; the transport itself lives outside of this crate.

use crate::manager::ChannelManager;
use serde_json::{json, Value};
use std::sync::Arc;
use tabletop_primitives::{BoardMove, BoardRules, ChannelError, OpenChannel};
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    /// Local input that is already in effect.
    #[error("{0} is already set")]
    AlreadySet(&'static str),

    #[error(transparent)]
    Channel(#[from] ChannelError),
}

impl RpcError {
    /// The JSON-RPC error code. Transient failures get their own code so that clients can
    /// retry them.
    pub fn code(&self) -> i32 {
        match self {
            Self::InvalidParams(_) => -32602,
            Self::AlreadySet(_) => -32000,
            Self::Channel(e) => match e {
                ChannelError::External(_) => -32001,
                ChannelError::Parse(_) | ChannelError::Move(_) => -32010,
                ChannelError::Signature(_)
                | ChannelError::StaleProof { .. }
                | ChannelError::ReinitMismatch => -32011,
                ChannelError::DisputeWindow => -32012,
                ChannelError::Closed | ChannelError::Unknown | ChannelError::NotParticipant(_) => {
                    -32013
                }
                ChannelError::AutoMoveLimit(_) => -32014,
            },
        }
    }

    /// The JSON-RPC error object.
    pub fn to_json(&self) -> Value {
        json!({ "code": self.code(), "message": self.to_string() })
    }
}

/// The [ChannelRpcServer] handles the RPC methods of one channel.
pub struct ChannelRpcServer<R, C> {
    manager: Arc<ChannelManager<R, C>>,
    /// Serializes calls that combine local input with channel updates.
    local: Mutex<()>,
    stop: watch::Sender<bool>,
}

impl<R, C> ChannelRpcServer<R, C>
where
    R: BoardRules,
    C: OpenChannel,
{
    pub fn new(manager: Arc<ChannelManager<R, C>>) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            manager,
            local: Mutex::new(()),
            stop,
        }
    }

    pub fn manager(&self) -> &Arc<ChannelManager<R, C>> {
        &self.manager
    }

    /// Requests the daemon to shut down. Blocked `waitforchange` calls return right away.
    pub fn stop(&self) {
        info!("RPC method called: stop");
        self.manager.stop_updates();
        self.stop.send_replace(true);
    }

    /// Resolves once [Self::stop] was called.
    pub async fn wait_for_stop(&self) {
        let mut rx = self.stop.subscribe();
        // The sender lives as long as `self`, so this only returns once stopped.
        let _ = rx.wait_for(|stopped| *stopped).await;
    }

    pub fn getcurrentstate(&self) -> Value {
        info!("RPC method called: getcurrentstate");
        self.manager.to_json()
    }

    pub async fn waitforchange(&self, known_version: u64) -> Value {
        info!(known_version, "RPC method called: waitforchange");
        let snapshot = self.manager.wait_for_change(known_version).await;
        serde_json::to_value(snapshot.as_ref()).unwrap_or_else(|e| {
            error!(%e, "failed to serialize channel snapshot");
            Value::Null
        })
    }

    /// Files a dispute and returns the transaction id.
    pub async fn filedispute(&self) -> Result<Value, RpcError> {
        info!("RPC method called: filedispute");
        let txid = self.manager.file_dispute().await.map_err(Self::report)?;
        Ok(json!(txid))
    }

    /// Submits a move built from local input.
    pub async fn submit_local_move(&self, mv: BoardMove) -> Result<(), RpcError> {
        info!(?mv, "RPC method called: submit_local_move");
        self.submit(mv).await
    }

    /// Game-specific methods build their moves and submit them through here.
    pub(crate) async fn submit(&self, mv: BoardMove) -> Result<(), RpcError> {
        let _guard = self.local.lock().await;
        self.manager
            .process_local_move(mv)
            .await
            .map_err(Self::report)
    }

    /// Game-specific methods that change local settings hold this while doing so.
    pub(crate) fn local_input(&self) -> &Mutex<()> {
        &self.local
    }

    pub(crate) fn report(e: ChannelError) -> RpcError {
        if e.is_transient() {
            warn!(%e, "channel collaborator unavailable");
        } else {
            error!(%e, "channel operation failed");
        }
        e.into()
    }
}
