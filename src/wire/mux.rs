//! Framed socket server and per-stream dispatch (§4.11).
//!
//! Modeled directly on `commy::manager::core::SharedFileManager::start` /
//! `run_server_loop` / `handle_connection`: bind a `TcpListener`, spawn one
//! task per accepted connection, use a `broadcast` channel for teardown the
//! same way `commy`'s `start_background_tasks` bridges an `mpsc` shutdown
//! signal into a `broadcast::Sender<()>` so every connection task can
//! `select!` on it.

use std::sync::Arc;

use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{RuncoreError, RuncoreResult};
use crate::record::{Record, ResultRecord};
use crate::wire::framing::FrameCodec;

pub type StreamId = String;
pub type ConnectionId = String;

/// Tagged union the client sends (§4.11, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ServerRequest {
    InformInit {
        stream_id: StreamId,
        connection_id: ConnectionId,
        api_key: Option<String>,
    },
    InformStart {
        stream_id: StreamId,
    },
    InformAttach {
        stream_id: StreamId,
        connection_id: ConnectionId,
    },
    RecordPublish {
        stream_id: StreamId,
        record: Record,
    },
    RecordCommunicate {
        stream_id: StreamId,
        connection_id: ConnectionId,
        record: Record,
    },
    InformFinish {
        stream_id: StreamId,
    },
    InformTeardown {
        exit_code: i32,
    },
}

impl ServerRequest {
    pub fn stream_id(&self) -> Option<&str> {
        match self {
            ServerRequest::InformInit { stream_id, .. }
            | ServerRequest::InformStart { stream_id }
            | ServerRequest::InformAttach { stream_id, .. }
            | ServerRequest::RecordPublish { stream_id, .. }
            | ServerRequest::RecordCommunicate { stream_id, .. }
            | ServerRequest::InformFinish { stream_id } => Some(stream_id.as_str()),
            ServerRequest::InformTeardown { .. } => None,
        }
    }
}

/// Tagged union the server sends back (§4.11, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ServerResponse {
    /// Sent once, immediately after the connection is accepted, carrying
    /// the connection id the client must stamp into `RecordCommunicate` so
    /// `Result`s can be routed back to it (§4.11: "a Control.connection_id
    /// is stamped so Results can be routed to this connection").
    Init { connection_id: ConnectionId },
    Result(ResultRecord),
    Ack,
}

/// A live stream registered by `InformInit`, torn down by `InformFinish` or
/// a global `InformTeardown` (§4.11, §5 shared-resource policy: the map is
/// mutex-guarded in spirit, `DashMap` in practice — `AddStream` is a single
/// insert, `FinishAndCloseAllStreams` iterates the map without holding any
/// single entry lock across an await).
struct StreamEntry {
    inbound: mpsc::Sender<ServerRequest>,
}

/// Process-wide registry of live streams and connections (§4.11).
/// `InformInit` creates a `Stream`; `InformFinish` deletes it idempotently.
#[derive(Clone)]
pub struct Mux {
    streams: Arc<DashMap<StreamId, StreamEntry>>,
    connections: Arc<DashMap<ConnectionId, mpsc::UnboundedSender<ServerResponse>>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Default for Mux {
    fn default() -> Self {
        let (shutdown_tx, _) = broadcast::channel(16);
        Self {
            streams: Arc::new(DashMap::new()),
            connections: Arc::new(DashMap::new()),
            shutdown_tx,
        }
    }
}

impl Mux {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly created stream's inbound channel. Called by
    /// whatever owns the Handler/Writer/Sender pipeline once it has
    /// processed an `InformInit`.
    pub fn add_stream(&self, stream_id: StreamId, inbound: mpsc::Sender<ServerRequest>) {
        self.streams.insert(stream_id, StreamEntry { inbound });
    }

    /// Idempotent: removing a stream id that isn't present is a no-op.
    pub fn remove_stream(&self, stream_id: &str) {
        self.streams.remove(stream_id);
    }

    pub fn has_stream(&self, stream_id: &str) -> bool {
        self.streams.contains_key(stream_id)
    }

    /// Route a `Result` back to whichever connection is waiting on it,
    /// identified by the `connection_id` stamped into `Control` when the
    /// originating record arrived as `RecordCommunicate` (§4.11).
    pub fn route_result(&self, connection_id: &str, result: ResultRecord) -> RuncoreResult<()> {
        let sender = self
            .connections
            .get(connection_id)
            .ok_or_else(|| RuncoreError::Internal(format!("unknown connection {connection_id}")))?;
        sender
            .send(ServerResponse::Result(result))
            .map_err(|_| RuncoreError::ChannelClosed(connection_id.to_string()))
    }

    /// Snapshot-then-iterate close of every live stream (§5 shared-resource
    /// policy), then fire the broadcast teardown signal so every connection
    /// task drops its socket.
    pub fn teardown(&self, exit_code: i32) {
        info!(exit_code, "tearing down all streams");
        let ids: Vec<StreamId> = self.streams.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.streams.remove(&id);
        }
        let _ = self.shutdown_tx.send(());
    }

    pub async fn serve(
        &self,
        listener: TcpListener,
        dispatch: mpsc::Sender<ServerRequest>,
    ) -> RuncoreResult<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            info!(%addr, "accepted connection");
                            let connection_id = Uuid::new_v4().to_string();
                            let connections = Arc::clone(&self.connections);
                            let dispatch = dispatch.clone();
                            let shutdown_rx = self.shutdown_tx.subscribe();
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(
                                    stream,
                                    connection_id.clone(),
                                    connections.clone(),
                                    dispatch,
                                    shutdown_rx,
                                )
                                .await
                                {
                                    error!(connection_id, error = %e, "connection ended with an error");
                                }
                                connections.remove(&connection_id);
                            });
                        }
                        Err(e) => error!(error = %e, "accept failed"),
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("mux shutting down listener");
                    return Ok(());
                }
            }
        }
    }
}

/// Three goroutine-style roles per connection: reader (framed decode →
/// inbound channel, closes inbound on EOF), writer (outbound channel →
/// framed encode, returns on channel close), handler (consumes inbound;
/// dispatches). A teardown watcher closes the connection if the global
/// teardown channel fires before reader EOF (§4.11).
async fn handle_connection(
    stream: TcpStream,
    connection_id: ConnectionId,
    connections: Arc<DashMap<ConnectionId, mpsc::UnboundedSender<ServerResponse>>>,
    dispatch: mpsc::Sender<ServerRequest>,
    mut teardown_rx: broadcast::Receiver<()>,
) -> RuncoreResult<()> {
    let (read_half, write_half) = stream.into_split();
    let mut reader = FramedRead::new(read_half, FrameCodec::<ServerRequest>::default());
    let mut writer = FramedWrite::new(write_half, FrameCodec::<ServerResponse>::default());

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ServerResponse>();
    connections.insert(connection_id.clone(), outbound_tx.clone());
    let _ = outbound_tx.send(ServerResponse::Init { connection_id: connection_id.clone() });

    let writer_task = tokio::spawn(async move {
        while let Some(response) = outbound_rx.recv().await {
            if let Err(e) = writer.send(&response).await {
                warn!(error = %e, "failed writing response, closing connection");
                break;
            }
        }
    });

    loop {
        tokio::select! {
            frame = reader.next() => {
                match frame {
                    Some(Ok(request)) => {
                        if dispatch.send(request).await.is_err() {
                            debug!(connection_id, "dispatch channel closed");
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        error!(connection_id, error = %e, "frame decode error");
                        return Err(e);
                    }
                    None => {
                        debug!(connection_id, "reader reached EOF");
                        break;
                    }
                }
            }
            _ = teardown_rx.recv() => {
                debug!(connection_id, "teardown watcher fired, closing connection");
                break;
            }
        }
    }

    writer_task.abort();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_and_remove_stream_is_idempotent() {
        let mux = Mux::new();
        let (tx, _rx) = mpsc::channel(1);
        mux.add_stream("run-1".to_string(), tx);
        assert!(mux.has_stream("run-1"));
        mux.remove_stream("run-1");
        mux.remove_stream("run-1");
        assert!(!mux.has_stream("run-1"));
    }

    #[test]
    fn route_result_to_unknown_connection_errors() {
        let mux = Mux::new();
        let result = ResultRecord {
            in_reply_to: crate::record::new_record_id(),
            kind: crate::record::ResultKind::Response(serde_json::Value::Null),
        };
        assert!(mux.route_result("does-not-exist", result).is_err());
    }
}
