//! Assembles the listener, transport and per-stream pipelines that make up
//! the running service (§4.11, §5). Kept in the library rather than the
//! binary so it can be driven directly in tests against the real wire
//! protocol instead of only through `main`.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::config::ServiceConfig;
use crate::error::{RuncoreError, RuncoreResult};
use crate::handler::Handler;
use crate::record::Record;
use crate::sender::Sender;
use crate::transport::{Transport, TransportConfig};
use crate::txlog::TransactionLogWriter;
use crate::wire::mux::{Mux, ServerRequest, StreamId};
use crate::writer::{Writer, CHANNEL_DEPTH};

const DISPATCH_DEPTH: usize = 256;
const PIPELINE_DEPTH: usize = 32;

/// Binds the listener and runs until the dispatch loop exits (i.e. forever,
/// barring a listener bind failure) (§4.11).
pub async fn run(config: ServiceConfig) -> RuncoreResult<()> {
    tokio::fs::create_dir_all(&config.run_dir)
        .await
        .map_err(|source| RuncoreError::Io { source, path: Some(config.run_dir.clone()) })?;

    let listener = TcpListener::bind((config.bind_address.as_str(), config.listen_port))
        .await
        .map_err(|source| RuncoreError::Io { source, path: None })?;
    let bound_addr = listener
        .local_addr()
        .map_err(|source| RuncoreError::Io { source, path: None })?;
    info!(%bound_addr, "runcore service listening");

    let transport = Arc::new(Transport::new(TransportConfig {
        base_url: config.base_url.clone(),
        api_key: config.api_key.clone().unwrap_or_default(),
        username: None,
        user_email: None,
        request_timeout: config.transport.request_timeout,
        max_elapsed_time: std::time::Duration::from_secs(120),
    })?);

    let mux = Mux::new();
    let (dispatch_tx, dispatch_rx) = mpsc::channel(DISPATCH_DEPTH);
    let serve_mux = mux.clone();
    let serve_task = tokio::spawn(async move {
        if let Err(e) = serve_mux.serve(listener, dispatch_tx).await {
            error!(error = %e, "mux listener exited");
        }
    });

    run_dispatch_loop(mux, transport, config, dispatch_rx).await;
    serve_task.abort();
    Ok(())
}

/// The single consumer of every accepted connection's decoded requests;
/// owns the map from stream id to that stream's Handler inbound channel,
/// since `Mux` itself only brokers connections, not pipelines (§4.11).
pub async fn run_dispatch_loop(
    mux: Mux,
    transport: Arc<Transport>,
    config: ServiceConfig,
    mut dispatch_rx: mpsc::Receiver<ServerRequest>,
) {
    let mut streams: HashMap<StreamId, mpsc::Sender<Record>> = HashMap::new();

    while let Some(request) = dispatch_rx.recv().await {
        match request {
            ServerRequest::InformInit { stream_id, connection_id: _, api_key: _ } => {
                if streams.contains_key(&stream_id) {
                    continue;
                }
                match spawn_stream(&mux, Arc::clone(&transport), &config, stream_id.clone()).await {
                    Ok(records_tx) => {
                        streams.insert(stream_id, records_tx);
                    }
                    Err(e) => error!(error = %e, "failed to start stream pipeline"),
                }
            }
            ServerRequest::InformStart { .. } | ServerRequest::InformAttach { .. } => {}
            ServerRequest::RecordPublish { stream_id, record } => {
                forward(&streams, &stream_id, record).await;
            }
            ServerRequest::RecordCommunicate { stream_id, connection_id, mut record } => {
                record.control.connection_id = connection_id;
                forward(&streams, &stream_id, record).await;
            }
            ServerRequest::InformFinish { stream_id } => {
                // Dropping the inbound sender closes the whole pipeline:
                // Handler's record loop ends, which drops its Writer/Sender
                // senders in turn (§4.11, §5).
                streams.remove(&stream_id);
                mux.remove_stream(&stream_id);
            }
            ServerRequest::InformTeardown { exit_code } => {
                mux.teardown(exit_code);
                streams.clear();
            }
        }
    }
}

async fn forward(streams: &HashMap<StreamId, mpsc::Sender<Record>>, stream_id: &str, record: Record) {
    match streams.get(stream_id) {
        Some(tx) if tx.send(record).await.is_ok() => {}
        Some(_) => warn!(stream_id, "stream pipeline closed, dropping record"),
        None => warn!(stream_id, "record for unknown stream, dropping"),
    }
}

/// Assembles one run's Handler/Writer/Sender pipeline and returns the
/// channel that feeds it (§4.11, §5: one reader/writer/Handler/Writer/
/// Sender task set per Stream).
pub async fn spawn_stream(
    mux: &Mux,
    transport: Arc<Transport>,
    config: &ServiceConfig,
    stream_id: StreamId,
) -> RuncoreResult<mpsc::Sender<Record>> {
    let (records_tx, records_rx) = mpsc::channel(PIPELINE_DEPTH);
    let (writer_tx, writer_rx) = mpsc::channel(CHANNEL_DEPTH);
    let (sender_tx, sender_rx) = mpsc::channel(PIPELINE_DEPTH);
    let (control_tx, control_rx) = mpsc::channel(8);

    // Each Stream gets its own subdirectory so two runs active in the same
    // process never share a transaction log, config.yaml or output.log
    // (§3: the Mux supports multiple concurrent Streams per process).
    let stream_run_dir = config.run_dir.join(&stream_id);
    tokio::fs::create_dir_all(&stream_run_dir)
        .await
        .map_err(|source| RuncoreError::Io { source, path: Some(stream_run_dir.clone()) })?;
    let log = TransactionLogWriter::create(stream_run_dir.join(&config.sync_file_name)).await?;

    let handler = Handler::with_debounce(
        writer_tx,
        sender_tx,
        config.debounce.requests_per_sec,
        config.debounce.burst as f64,
    );
    tokio::spawn(async move {
        if let Err(e) = handler.run(records_rx, control_rx).await {
            error!(error = %e, "handler task exited with an error");
        }
    });

    let writer = Writer::new(writer_rx, log);
    tokio::spawn(async move {
        if let Err(e) = writer.run().await {
            error!(error = %e, "writer task exited with an error");
        }
    });

    let sender = Sender::new(transport, mux.clone(), stream_run_dir, config.resume.mode, control_tx)
        .with_watcher_poll_period(config.watcher.polling_period);
    tokio::spawn(async move {
        if let Err(e) = sender.run(sender_rx).await {
            error!(error = %e, "sender task exited with an error");
        }
    });

    // Registered for `has_stream`/teardown bookkeeping; this process routes
    // decoded requests to the pipeline directly rather than through it.
    let (bookkeeping_tx, _bookkeeping_rx) = mpsc::channel(1);
    mux.add_stream(stream_id, bookkeeping_tx);

    Ok(records_tx)
}
