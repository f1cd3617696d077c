//! WebSocket session lifecycle: one connected client from upgrade through
//! disconnect.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use metrics::{counter, histogram};
use parley_core::constants::CLOSE_NORMAL;
use parley_core::{ConnectionId, Outbound};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::connection::{Connection, OutboundFrame};
use crate::dispatcher::{ConnectionContext, Dispatcher};
use crate::metrics::{CONNECTION_DURATION_SECONDS, CONNECTIONS_TOTAL};
use crate::registry::ConnectionRegistry;

/// How long the writer gets to flush queued frames after the reader exits.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Convert a queued frame into a socket message.
pub(crate) fn to_message(frame: OutboundFrame) -> Message {
    match frame {
        OutboundFrame::Text(text) => Message::Text(text.as_ref().into()),
        OutboundFrame::Ping => Message::Ping(Vec::new().into()),
        OutboundFrame::Close { code, reason } => Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })),
    }
}

/// Text payload of a data frame. Binary frames are accepted when they hold
/// UTF-8.
pub(crate) fn frame_text(message: &Message) -> Option<&str> {
    match message {
        Message::Text(text) => Some(text.as_str()),
        Message::Binary(data) => std::str::from_utf8(data).ok(),
        Message::Ping(_) | Message::Pong(_) | Message::Close(_) => None,
    }
}

/// Run a WebSocket session for a connected client.
///
/// 1. Registers the connection and sends `connection` with its id
/// 2. Dispatches inbound text frames in arrival order
/// 3. Forwards queued frames to the socket from a writer task
/// 4. Unregisters on disconnect, heartbeat termination, or shutdown
#[instrument(skip_all, fields(connection_id = tracing::field::Empty))]
pub async fn run_ws_session(
    ws: WebSocket,
    dispatcher: Dispatcher,
    registry: Arc<ConnectionRegistry>,
    shutdown: CancellationToken,
    queue_capacity: usize,
) {
    let (ws_tx, mut ws_rx) = ws.split();
    let (send_tx, send_rx) = mpsc::channel::<OutboundFrame>(queue_capacity.max(1));

    let id = ConnectionId::new();
    let _ = tracing::Span::current().record("connection_id", tracing::field::display(&id));
    let connection = Arc::new(Connection::new(id.clone(), send_tx));
    let cancel = connection.cancel_token();
    let started = Instant::now();

    registry.register(Arc::clone(&connection));
    counter!(CONNECTIONS_TOTAL).increment(1);
    info!("client connected");

    let _ = connection.send(&Outbound::Connection {
        connection_id: id.clone(),
    });

    let mut writer = spawn_writer(ws_tx, send_rx, cancel.clone());
    let mut ctx = ConnectionContext::new(Arc::clone(&connection), dispatcher.config().pipeline_capacity);

    loop {
        let next = tokio::select! {
            biased;
            () = shutdown.cancelled() => {
                let _ = connection.close(CLOSE_NORMAL, "server shutting down");
                break;
            }
            () = cancel.cancelled() => break,
            next = ws_rx.next() => next,
        };

        let message = match next {
            Some(Ok(message)) => message,
            Some(Err(e)) => {
                debug!(error = %e, "socket read failed");
                break;
            }
            None => break,
        };

        connection.mark_alive();
        if let Message::Close(_) = message {
            info!("client sent close frame");
            break;
        }
        match frame_text(&message) {
            Some(text) => dispatcher.dispatch(&mut ctx, text).await,
            None => {
                if let Message::Binary(data) = &message {
                    info!(len = data.len(), "received non-UTF8 binary frame");
                }
            }
        }
    }

    // Membership goes first so listener counts update before the socket drains.
    let _ = registry.unregister(&id);
    ctx.close().await;
    connection.terminate();
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await.is_err() {
        warn!("writer did not drain in time");
        writer.abort();
    }

    histogram!(CONNECTION_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
    info!(
        dropped = connection.drop_count(),
        "client disconnected"
    );
}

/// Forward queued frames until the queue closes, a close frame is written,
/// or the connection is cancelled with nothing left queued.
fn spawn_writer(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut send_rx: mpsc::Receiver<OutboundFrame>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                biased;
                frame = send_rx.recv() => frame,
                () = cancel.cancelled() => None,
            };
            let Some(frame) = frame else { break };

            let closing = matches!(frame, OutboundFrame::Close { .. });
            if let Err(e) = ws_tx.send(to_message(frame)).await {
                debug!(error = %e, "socket write failed");
                break;
            }
            if closing {
                break;
            }
        }
        let _ = ws_tx.close().await;
        cancel.cancel();
    })
}
