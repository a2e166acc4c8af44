//! WebSocket session lifecycle: one streaming client from upgrade through
//! the last result.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use axum::extract::ws::{CloseFrame, Message, WebSocket, close_code};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge, histogram};
use scribe_core::{ChunkBuffer, SessionId};
use scribe_runtime::{Admission, DrainReason, ErrorCode, Outbound, Session, SessionState};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::connection::ClientConnection;
use crate::config::ServerConfig;
use crate::metrics::{WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL, WS_DISCONNECTIONS_TOTAL};
use crate::protocol::{ClientMessage, ServerMessage, parse_client_message};
use crate::server::AppState;

type WsSink = SplitSink<WebSocket, Message>;

/// Close reason sent to a client dropped for silence.
const IDLE_CLOSE_REASON: &str = "idle timeout";

/// Run a streaming session for a freshly upgraded client.
///
/// 1. Registers a [`Session`] in the slot `admission` reserved and sends `ready`
/// 2. Cuts binary PCM frames into chunks and submits them in order
/// 3. Forwards decode results through a writer task that also pings
/// 4. On end of speech, error, disconnect or shutdown: drains in-flight
///    chunks, closes, and unregisters
pub async fn run_ws_session(ws: WebSocket, state: AppState, admission: Admission) {
    let session_id = SessionId::new();
    handle_session(ws, state, admission, session_id).await;
}

#[instrument(skip_all, fields(session_id = %session_id))]
async fn handle_session(
    ws: WebSocket,
    state: AppState,
    admission: Admission,
    session_id: SessionId,
) {
    let (mut ws_tx, mut ws_rx) = ws.split();
    let (out_tx, out_rx) = mpsc::unbounded_channel::<Outbound>();

    let session = Session::new(
        session_id.clone(),
        state.queue.clone(),
        state.engines.clone(),
        out_tx,
    );
    let connection = Arc::new(ClientConnection::new(session_id.clone()));
    admission.register(Arc::clone(&session));
    let _ = state.connections.fetch_add(1, Ordering::Relaxed);
    counter!(WS_CONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);
    info!("client connected");

    let chunker = ChunkBuffer::new(state.config.sample_rate, state.config.chunk_ms);
    let ready = ServerMessage::Ready {
        session_id: session_id.clone(),
    };
    let greeted = match ready.to_json() {
        Ok(json) => ws_tx.send(Message::Text(json.into())).await.is_ok(),
        Err(_) => false,
    };

    let exit = match chunker {
        Ok(mut chunker) if greeted => {
            let _ = session.start_streaming();
            let writer_done = CancellationToken::new();
            let writer = tokio::spawn(write_loop(
                ws_tx,
                out_rx,
                Arc::clone(&session),
                Arc::clone(&connection),
                Arc::clone(&state.config),
                writer_done.clone(),
            ));

            let exit = read_loop(
                &mut ws_rx,
                &session,
                &connection,
                &mut chunker,
                &state,
                &writer_done,
            )
            .await;

            finish(&session, &mut chunker, exit).await;
            if session.is_attached() {
                session.deliver(Outbound::Close);
                let _ = writer.await;
            } else {
                writer.abort();
            }
            exit
        }
        Ok(_) => DrainReason::TransportError,
        Err(e) => {
            warn!(error = %e, "cannot cut audio with configured geometry");
            DrainReason::TransportError
        }
    };

    if session.state() < SessionState::Draining {
        let _ = session.begin_drain(exit);
        session.detach();
        session.wait_idle().await;
    }
    let _ = session.close();
    let _ = state.registry.remove(&session_id);
    let _ = state.connections.fetch_sub(1, Ordering::Relaxed);
    counter!(WS_DISCONNECTIONS_TOTAL, "reason" => reason_label(exit)).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
    histogram!("ws_connection_duration_seconds").record(connection.age().as_secs_f64());
    info!(
        reason = reason_label(exit),
        chunks = session.chunks_decoded(),
        discarded = session.results_discarded(),
        "client disconnected"
    );
}

/// Consume client frames until the stream stops for some reason.
async fn read_loop(
    ws_rx: &mut futures::stream::SplitStream<WebSocket>,
    session: &Arc<Session>,
    connection: &ClientConnection,
    chunker: &mut ChunkBuffer,
    state: &AppState,
    writer_done: &CancellationToken,
) -> DrainReason {
    let session_shutdown = session.shutdown_token();
    let server_shutdown = state.shutdown.token();

    loop {
        let frame = tokio::select! {
            frame = ws_rx.next() => frame,
            () = session_shutdown.cancelled() => return DrainReason::ServerShutdown,
            () = server_shutdown.cancelled() => return DrainReason::ServerShutdown,
            () = writer_done.cancelled() => return DrainReason::Disconnected,
        };

        match frame {
            Some(Ok(Message::Binary(data))) => {
                connection.mark_alive();
                for chunk in chunker.push_pcm16(&data) {
                    debug!(seq = chunk.seq, samples = chunk.samples.len(), "chunk cut");
                    session.submit(chunk);
                }
            }
            Some(Ok(Message::Text(text))) => {
                connection.mark_alive();
                match parse_client_message(text.as_str()) {
                    Ok(ClientMessage::Start { wav_name, chunk_ms }) => {
                        if let Some(name) = wav_name {
                            connection.set_wav_name(name);
                        }
                        if let Some(ms) = chunk_ms {
                            if let Err(e) = chunker.set_chunk_ms(ms) {
                                reject(session, &e.to_string());
                                return DrainReason::ProtocolError;
                            }
                            debug!(
                                chunk_ms = ms,
                                samples = chunker.chunk_samples(),
                                "chunk length overridden"
                            );
                        }
                    }
                    Ok(ClientMessage::End) => return DrainReason::EndOfStream,
                    Err(e) => {
                        reject(session, &e.to_string());
                        return DrainReason::ProtocolError;
                    }
                }
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => connection.mark_alive(),
            Some(Ok(Message::Close(_))) | None => return DrainReason::Disconnected,
            Some(Err(e)) => {
                warn!(error = %e, "websocket read failed");
                return DrainReason::TransportError;
            }
        }
    }
}

fn reject(session: &Session, message: &str) {
    warn!(error = message, "invalid client message");
    session.deliver(Outbound::Error {
        seq: None,
        code: ErrorCode::InvalidMessage,
        message: message.to_owned(),
    });
}

/// Drain the session according to why reading stopped.
async fn finish(session: &Arc<Session>, chunker: &mut ChunkBuffer, exit: DrainReason) {
    match exit {
        DrainReason::EndOfStream | DrainReason::ServerShutdown => {
            let buffered = chunker.buffered_samples();
            if let Some(last) = chunker.finish() {
                debug!(seq = last.seq, samples = buffered, "flushing final chunk");
                session.submit(last);
            }
        }
        DrainReason::Disconnected | DrainReason::TransportError => session.detach(),
        DrainReason::ProtocolError => {}
    }
    let _ = session.begin_drain(exit);
    session.wait_idle().await;
}

/// Forward session results to the socket and keep the connection alive.
async fn write_loop(
    mut ws_tx: WsSink,
    mut out_rx: mpsc::UnboundedReceiver<Outbound>,
    session: Arc<Session>,
    connection: Arc<ClientConnection>,
    config: Arc<ServerConfig>,
    done: CancellationToken,
) {
    let _done = done.drop_guard();
    let mut ping_interval = tokio::time::interval(config.ping_interval());
    // Skip the immediate first tick
    let _ = ping_interval.tick().await;

    loop {
        tokio::select! {
            msg = out_rx.recv() => {
                let Some(outbound) = msg else { break };
                let Some(message) = ServerMessage::from_outbound(outbound, &connection.wav_name()) else {
                    let frame = CloseFrame {
                        code: close_code::NORMAL,
                        reason: "".into(),
                    };
                    let _ = ws_tx.send(Message::Close(Some(frame))).await;
                    break;
                };
                let sent = match message.to_json() {
                    Ok(json) => ws_tx.send(Message::Text(json.into())).await.is_ok(),
                    Err(e) => {
                        warn!(error = %e, "failed to serialize result");
                        true
                    }
                };
                if !sent {
                    session.detach();
                    break;
                }
            }
            _ = ping_interval.tick() => {
                if session.state() == SessionState::Streaming
                    && connection.idle_for() > config.idle_timeout()
                {
                    warn!(idle = ?connection.idle_for(), "client unresponsive, disconnecting");
                    let frame = CloseFrame {
                        code: close_code::AWAY,
                        reason: IDLE_CLOSE_REASON.into(),
                    };
                    let _ = ws_tx.send(Message::Close(Some(frame))).await;
                    break;
                }
                if ws_tx.send(Message::Ping(Vec::new().into())).await.is_err() {
                    session.detach();
                    break;
                }
            }
        }
    }
}

fn reason_label(reason: DrainReason) -> &'static str {
    match reason {
        DrainReason::EndOfStream => "end_of_stream",
        DrainReason::Disconnected => "disconnected",
        DrainReason::ProtocolError => "protocol_error",
        DrainReason::TransportError => "transport_error",
        DrainReason::ServerShutdown => "server_shutdown",
    }
}
