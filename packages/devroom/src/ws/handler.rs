//! WebSocket Handler
//!
//! Drives one workspace session from a single loop over the client socket,
//! the room relay and the workspace's sandbox events.

use axum::extract::ws::{Message, WebSocket};
use futures::{sink::SinkExt, stream::StreamExt};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::metrics::ServerMetrics;
use crate::sandbox::SandboxError;
use crate::session::WorkspaceSession;

use super::protocol::{ClientMessage, ProjectSummary, ServerMessage};

const SEND_CHANNEL_CAPACITY: usize = 256;

pub async fn handle_workspace_ws(
    socket: WebSocket,
    mut session: WorkspaceSession,
    metrics: Arc<ServerMetrics>,
) {
    let conn_id = session.connection();
    info!(
        %conn_id,
        "WebSocket open for project {} (user: {})",
        session.project().id,
        session.user().email
    );
    metrics.connection_opened();

    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<ServerMessage>(SEND_CHANNEL_CAPACITY);

    let sender_metrics = metrics.clone();
    let sender_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let json = match serde_json::to_string(&msg) {
                Ok(j) => j,
                Err(e) => {
                    error!("Failed to serialize message: {}", e);
                    continue;
                }
            };
            if ws_sender.send(Message::Text(json.into())).await.is_err() {
                sender_metrics.websocket_error();
                break;
            }
        }
    });

    // Subscribe before reading the status so no transition falls in between
    let mut sandbox_rx = session.subscribe_sandbox();
    let snapshot = ServerMessage::Snapshot {
        project: ProjectSummary::from(session.project()),
        messages: session.messages().to_vec(),
        file_tree: session.file_tree().clone(),
        sandbox: session.sandbox().status(),
    };
    if tx.send(snapshot).await.is_err() {
        warn!(%conn_id, "Failed to send snapshot - channel closed");
    }

    loop {
        tokio::select! {
            frame = ws_receiver.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    metrics.message_received();
                    handle_client_text(&mut session, &text, &tx).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(%conn_id, "WebSocket receive error: {}", e);
                    metrics.websocket_error();
                    break;
                }
            },
            event = session.next_relay_event() => match event {
                Some(event) => {
                    for update in session.apply_relay_event(event) {
                        let _ = tx.send(update.into()).await;
                    }
                }
                None => {
                    warn!(%conn_id, "Relay dropped the subscription");
                    break;
                }
            },
            event = sandbox_rx.recv() => match event {
                Ok(event) => {
                    session.apply_sandbox_event(&event);
                    let _ = tx.send(event.into()).await;
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(%conn_id, "Sandbox events lagged by {}", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    session.detach().await;
    drop(tx);
    let _ = sender_task.await;
    metrics.connection_closed();
    info!(%conn_id, "WebSocket closed");
}

async fn handle_client_text(
    session: &mut WorkspaceSession,
    text: &str,
    tx: &mpsc::Sender<ServerMessage>,
) {
    let msg = match serde_json::from_str::<ClientMessage>(text) {
        Ok(msg) => msg,
        Err(e) => {
            warn!(conn_id = %session.connection(), "Ignoring malformed frame: {}", e);
            return;
        }
    };

    match msg {
        ClientMessage::Chat { text } => {
            if let Some(message) = session.send_chat(&text).await {
                let _ = tx.send(ServerMessage::Message { message }).await;
            }
        }
        ClientMessage::EditFile { path, content } => {
            session.commit_edit(&path, &content);
        }
        // Sandbox commands can take minutes (npm install); keep the loop responsive
        ClientMessage::Run => {
            let run = session.run();
            let tx = tx.clone();
            tokio::spawn(async move {
                match run.await {
                    Ok(instance) => debug!("Run started instance {}", instance),
                    Err(e) => report_sandbox_error(&tx, e).await,
                }
            });
        }
        ClientMessage::Kill => {
            let kill = session.kill();
            let tx = tx.clone();
            tokio::spawn(async move {
                if let Err(e) = kill.await {
                    report_sandbox_error(&tx, e).await;
                }
            });
        }
        ClientMessage::Mount => {
            let mount = session.mount();
            let tx = tx.clone();
            tokio::spawn(async move {
                if let Err(e) = mount.await {
                    report_sandbox_error(&tx, e).await;
                }
            });
        }
    }
}

/// Controller failures already reach every subscriber as events; only a
/// missing controller needs telling directly.
async fn report_sandbox_error(tx: &mpsc::Sender<ServerMessage>, err: SandboxError) {
    match err {
        SandboxError::ControllerGone => {
            let _ = tx
                .send(ServerMessage::Error {
                    message: err.to_string(),
                })
                .await;
        }
        other => debug!("Sandbox command failed: {}", other),
    }
}
