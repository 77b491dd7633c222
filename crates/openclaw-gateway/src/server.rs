//! The WebSocket endpoint.
//!
//! Connections walk the challenge-response handshake, then enter the frame
//! loop: `method_call`s dispatch as independent tasks (responses may return
//! out of order), bus events fan out as `event` frames, and node clients
//! additionally answer gateway-originated calls. Dropping the connection
//! releases its `agent.wait` registrations but never cancels running turns.

use crate::auth::{Authenticator, Handshake, Principal};
use crate::config_watch::ConfigReloader;
use crate::gateway::ControlPlane;
use crate::rpc::{dispatch, NodeLinks, RpcContext};
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use openclaw_types::error::{OpenClawError, OpenClawResult};
use openclaw_types::event::{ClientRole, Frame};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Shared state for all connections.
pub struct ServerState {
    pub cp: Arc<ControlPlane>,
    pub reloader: Arc<ConfigReloader>,
    pub auth: Arc<Authenticator>,
    pub nodes: Arc<NodeLinks>,
}

/// Bind the listener up front so the caller can map failures to exit code 4.
pub fn bind_listener(addr: SocketAddr) -> OpenClawResult<std::net::TcpListener> {
    let listener = std::net::TcpListener::bind(addr)
        .map_err(|e| OpenClawError::Internal(format!("bind {addr}: {e}")))?;
    listener
        .set_nonblocking(true)
        .map_err(|e| OpenClawError::Internal(format!("set_nonblocking: {e}")))?;
    Ok(listener)
}

/// Serve the control plane on an already-bound listener.
///
/// TLS material is required (and verified by config validation) whenever the
/// bind address is non-loopback.
pub async fn serve(listener: std::net::TcpListener, state: Arc<ServerState>) -> OpenClawResult<()> {
    let config = state.cp.config.get();
    let app = Router::new()
        .route("/", get(ws_upgrade_handler))
        .with_state(state.clone());

    if let Some(tls) = &config.gateway.tls {
        let rustls = axum_server::tls_rustls::RustlsConfig::from_pem_file(
            &tls.cert_path,
            &tls.key_path,
        )
        .await
        .map_err(|e| OpenClawError::ConfigInvalid {
            path: "gateway.tls".to_string(),
            message: format!("cannot load certificate: {e}"),
        })?;
        info!("gateway serving with TLS");
        axum_server::from_tcp_rustls(listener, rustls)
            .serve(app.into_make_service())
            .await
            .map_err(|e| OpenClawError::Internal(format!("serve: {e}")))
    } else {
        let listener = tokio::net::TcpListener::from_std(listener)
            .map_err(|e| OpenClawError::Internal(format!("listener: {e}")))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| OpenClawError::Internal(format!("serve: {e}")))
    }
}

async fn ws_upgrade_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<ServerState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: Arc<ServerState>) {
    let (principal, requested_topics) = match handshake(&mut socket, &state).await {
        Ok(established) => established,
        Err(e) => {
            let _ = send_frame(
                &mut socket,
                &Frame::Error {
                    code: e.code().to_string(),
                    message: e.to_string(),
                },
            )
            .await;
            debug!(error = %e, "handshake failed");
            return;
        }
    };
    info!(principal = %principal.id, role = ?principal.role, "connection established");

    // Topic set from the hello frame, else per-role defaults (operators and
    // observers see everything).
    let topics: Vec<String> = requested_topics.unwrap_or_else(|| match principal.role {
        ClientRole::Operator | ClientRole::ReadOnly => vec![],
        ClientRole::Channel => vec![
            "chat.*".to_string(),
            "channel.*".to_string(),
            "config.*".to_string(),
        ],
        ClientRole::Node => vec!["approval.*".to_string()],
    });
    let mut subscription = state.cp.bus.subscribe(&topics);

    // Outbound frames from dispatch tasks (and node-link calls).
    let (out_tx, mut out_rx) = mpsc::channel::<Frame>(256);
    if principal.role == ClientRole::Node {
        state.nodes.register(&principal.id, out_tx.clone());
        state.cp.nodes.touch(&principal.id);
    }

    let _ = send_frame(
        &mut socket,
        &Frame::Event {
            topic: "gateway.connected".to_string(),
            payload: json!({
                "connectionId": subscription.id,
                "role": principal.role,
                "deviceKey": state.cp.identity.public_key(),
            }),
        },
    )
    .await;

    let mut inflight: JoinSet<()> = JoinSet::new();
    let mut slow_consumer = false;

    loop {
        tokio::select! {
            inbound = socket.recv() => {
                let message = match inbound {
                    Some(Ok(message)) => message,
                    _ => break,
                };
                let text = match message {
                    Message::Text(text) => text,
                    Message::Close(_) => break,
                    // axum answers pings itself.
                    _ => continue,
                };
                match serde_json::from_str::<Frame>(&text) {
                    Ok(Frame::MethodCall { id, method, params }) => {
                        let ctx = RpcContext {
                            cp: state.cp.clone(),
                            reloader: state.reloader.clone(),
                            nodes: state.nodes.clone(),
                            principal: principal.clone(),
                        };
                        let out = out_tx.clone();
                        inflight.spawn(async move {
                            let frame = match dispatch(&ctx, &method, params).await {
                                Ok(result) => Frame::Response {
                                    id,
                                    result: Some(result),
                                    error: None,
                                },
                                Err(e) => Frame::Response {
                                    id,
                                    result: None,
                                    error: Some(e.to_rpc()),
                                },
                            };
                            let _ = out.send(frame).await;
                        });
                    }
                    Ok(Frame::Response { id, result, error }) => {
                        // Only node clients answer gateway-originated calls.
                        if principal.role == ClientRole::Node {
                            state.nodes.complete(&principal.id, id, result, error);
                        }
                    }
                    Ok(_) => {
                        let _ = send_frame(&mut socket, &Frame::Error {
                            code: "bad_request".to_string(),
                            message: "unexpected frame after handshake".to_string(),
                        }).await;
                    }
                    Err(e) => {
                        let _ = send_frame(&mut socket, &Frame::Error {
                            code: "bad_request".to_string(),
                            message: format!("unparseable frame: {e}"),
                        }).await;
                    }
                }
            }

            event = subscription.rx.recv() => {
                match event {
                    Some(event) => {
                        let frame = Frame::Event {
                            topic: event.topic.clone(),
                            payload: serde_json::to_value(&event.payload).unwrap_or_default(),
                        };
                        if send_frame(&mut socket, &frame).await.is_err() {
                            break;
                        }
                    }
                    None => {
                        // The bus dropped us for falling behind.
                        slow_consumer = true;
                        break;
                    }
                }
            }

            outbound = out_rx.recv() => {
                let Some(frame) = outbound else { break };
                if send_frame(&mut socket, &frame).await.is_err() {
                    break;
                }
            }
        }
    }

    if slow_consumer {
        warn!(principal = %principal.id, "dropping slow consumer");
        let _ = send_frame(
            &mut socket,
            &Frame::Error {
                code: "slow_consumer".to_string(),
                message: "event buffer overflowed; reconnect to resume".to_string(),
            },
        )
        .await;
    }

    // Pending dispatches (agent.wait registrations included) die with the
    // connection; running turns continue for other subscribers.
    inflight.abort_all();
    state.cp.bus.unsubscribe(subscription.id);
    if principal.role == ClientRole::Node {
        state.nodes.unregister(&principal.id);
    }
    info!(principal = %principal.id, "connection closed");
}

/// Run the hello → challenge → proof exchange. Returns the authenticated
/// principal plus any topic set the client requested in its hello.
async fn handshake(
    socket: &mut WebSocket,
    state: &ServerState,
) -> OpenClawResult<(Principal, Option<Vec<String>>)> {
    let hello = recv_frame(socket)
        .await
        .ok_or_else(|| OpenClawError::AuthFailed("connection closed before hello".into()))?;
    let requested_topics = match &hello {
        Frame::Hello { topics, .. } => topics.clone(),
        _ => None,
    };
    let (pending, challenge) = state.auth.on_hello(&hello)?;
    send_frame(socket, &challenge)
        .await
        .map_err(|_| OpenClawError::AuthFailed("challenge send failed".into()))?;

    let proof = recv_frame(socket)
        .await
        .ok_or_else(|| OpenClawError::AuthFailed("connection closed before proof".into()))?;
    let pending = match pending {
        Handshake::AwaitProof { .. } => pending,
        Handshake::AwaitHello => {
            return Err(OpenClawError::AuthFailed("handshake out of order".into()))
        }
    };
    let principal = state.auth.on_proof(pending, &proof)?;
    Ok((principal, requested_topics))
}

async fn recv_frame(socket: &mut WebSocket) -> Option<Frame> {
    loop {
        match socket.recv().await? {
            Ok(Message::Text(text)) => return serde_json::from_str(&text).ok(),
            Ok(Message::Close(_)) => return None,
            Ok(_) => continue,
            Err(_) => return None,
        }
    }
}

async fn send_frame(socket: &mut WebSocket, frame: &Frame) -> Result<(), axum::Error> {
    let text = serde_json::to_string(frame).unwrap_or_default();
    socket.send(Message::Text(text.into())).await
}
