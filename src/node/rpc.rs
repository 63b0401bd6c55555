//! Request/response plumbing between writers and the schedule node.
//!
//! Requests travel over a crossbeam channel with a bounded reply channel
//! per call. Callers that must block (participant registration) poll the
//! reply with a shutdown check rather than parking indefinitely.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender};
use thiserror::Error;

use crate::core::{
    DatabaseVersion, ItineraryVersion, ParticipantDescription, ParticipantId, Query, QueryId,
    RouteId,
};

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("shutdown in progress")]
    ShutdownInProgress,
    #[error("schedule node is unreachable")]
    Disconnected,
    #[error("timed out waiting for the schedule node")]
    Timeout,
}

#[derive(Clone, Debug, PartialEq)]
pub enum RpcRequest {
    RegisterParticipant(ParticipantDescription),
    UnregisterParticipant(ParticipantId),
    RegisterQuery(Query),
    RequestChanges {
        query_id: QueryId,
        version: DatabaseVersion,
        full_update: bool,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestChangesResult {
    UnknownQueryId,
    RequestAccepted,
}

/// Responses carry an `error` string; empty means success.
#[derive(Clone, Debug, PartialEq)]
pub enum RpcResponse {
    Registration {
        participant_id: ParticipantId,
        last_itinerary_version: ItineraryVersion,
        last_route_id: RouteId,
        error: String,
    },
    Unregistration {
        confirmation: bool,
        error: String,
    },
    QueryRegistration {
        query_id: QueryId,
        node_version: u64,
        error: String,
    },
    ChangesRequested {
        result: RequestChangesResult,
    },
}

pub struct RpcEnvelope {
    pub request: RpcRequest,
    pub respond: Sender<RpcResponse>,
}

/// Client handle to the node's RPC executor. Cheap to clone; reopened on
/// fail-over by asking the connector for a fresh one.
#[derive(Clone)]
pub struct RpcClient {
    tx: Sender<RpcEnvelope>,
}

impl RpcClient {
    pub fn new(tx: Sender<RpcEnvelope>) -> Self {
        Self { tx }
    }

    pub fn call(&self, request: RpcRequest) -> Result<PendingResponse, RpcError> {
        let (respond, rx) = crossbeam::channel::bounded(1);
        self.tx
            .send(RpcEnvelope { request, respond })
            .map_err(|_| RpcError::Disconnected)?;
        Ok(PendingResponse { rx })
    }
}

/// Produces RPC clients; writers call it again after a fail-over event.
pub trait RpcConnector: Send + Sync {
    fn connect(&self) -> RpcClient;
}

impl<F> RpcConnector for F
where
    F: Fn() -> RpcClient + Send + Sync,
{
    fn connect(&self) -> RpcClient {
        self()
    }
}

pub struct PendingResponse {
    rx: Receiver<RpcResponse>,
}

impl PendingResponse {
    /// Block until the node responds, polling `shutdown` at `poll_interval`.
    pub fn wait(
        &self,
        shutdown: &Arc<AtomicBool>,
        poll_interval: Duration,
    ) -> Result<RpcResponse, RpcError> {
        loop {
            match self.rx.recv_timeout(poll_interval) {
                Ok(response) => return Ok(response),
                Err(RecvTimeoutError::Timeout) => {
                    if shutdown.load(Ordering::Acquire) {
                        return Err(RpcError::ShutdownInProgress);
                    }
                }
                Err(RecvTimeoutError::Disconnected) => return Err(RpcError::Disconnected),
            }
        }
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<RpcResponse, RpcError> {
        self.rx.recv_timeout(timeout).map_err(|err| match err {
            RecvTimeoutError::Timeout => RpcError::Timeout,
            RecvTimeoutError::Disconnected => RpcError::Disconnected,
        })
    }
}
