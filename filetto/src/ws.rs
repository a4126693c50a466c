//! WebSocket transport: listener construction, the auth-first
//! handshake, and the per-connection pump between the socket and the
//! coordinator.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use metrics::counter;
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, warn};

use filetto_lib::results::ResultSink;
use filetto_lib::store::store::KeyedStore;

use crate::auth::TokenVerifier;
use crate::collaborators::{Profile, ProfileStore};
use crate::config::{AppConfig, ServerConfig};
use crate::coordinator::Coordinator;
use crate::events::{ClientEvent, ServerEvent};

/// A connection that has not authenticated within this window is dropped.
const AUTH_TIMEOUT: Duration = Duration::from_secs(10);

fn build_ws_listener(cfg: &ServerConfig) -> Result<TcpListener> {
    let domain = match cfg.host {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    };

    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    if let Some(recv_buf_size) = cfg.socket_recv_buffer_bytes {
        socket.set_recv_buffer_size(recv_buf_size)?;
    }

    socket.bind(&cfg.host.into())?;
    socket.listen(cfg.listener_backlog)?;
    socket.set_nonblocking(true)?;

    let std_listener: std::net::TcpListener = socket.into();
    Ok(TcpListener::from_std(std_listener)?)
}

pub async fn serve<T: KeyedStore, S: ResultSink>(
    cfg: Arc<AppConfig>,
    coordinator: Coordinator<T, S>,
    verifier: Arc<dyn TokenVerifier>,
    profiles: Arc<dyn ProfileStore>,
) {
    debug!("binding websocket listener to {}", cfg.server.host);
    let listener = match build_ws_listener(&cfg.server) {
        Ok(listener) => listener,
        Err(err) => {
            error!("failed to build websocket listener: {}", err);
            return;
        }
    };

    loop {
        let (stream, socket) = match listener.accept().await {
            Ok(incoming) => incoming,
            Err(err) => {
                error!("failed to accept websocket connection: {}", err);
                continue;
            }
        };
        if let Err(err) = stream.set_nodelay(true) {
            warn!("{}: failed to set TCP_NODELAY: {}", socket, err);
        }
        if let Some(recv_buf_size) = cfg.server.socket_recv_buffer_bytes {
            let socket_ref = SockRef::from(&stream);
            if let Err(err) = socket_ref.set_recv_buffer_size(recv_buf_size) {
                warn!(
                    "{}: failed to set SO_RCVBUF={} on accepted socket: {}",
                    socket, recv_buf_size, err
                );
            }
        }

        let coordinator = coordinator.clone();
        let verifier = verifier.clone();
        let profiles = profiles.clone();
        tokio::spawn(async move {
            if let Err(err) = handle(stream, socket, coordinator, verifier, profiles).await {
                debug!("{}: connection ended: {}", socket, err);
            }
        });
    }
}

async fn handle<T: KeyedStore, S: ResultSink>(
    stream: TcpStream,
    socket: SocketAddr,
    coordinator: Coordinator<T, S>,
    verifier: Arc<dyn TokenVerifier>,
    profiles: Arc<dyn ProfileStore>,
) -> Result<()> {
    let ws = tokio_tungstenite::accept_async(stream).await?;
    let (mut sink, mut stream) = ws.split();

    // First frame must be `auth`; nothing else is dispatched before it.
    let token = match timeout(AUTH_TIMEOUT, stream.next()).await {
        Ok(Some(Ok(Message::Text(text)))) => match serde_json::from_str::<ClientEvent>(&text) {
            Ok(ClientEvent::Auth { token }) => token,
            _ => {
                let reply = encode(&ServerEvent::Error {
                    message: "expected auth".into(),
                });
                let _ = sink.send(Message::Text(reply.into())).await;
                anyhow::bail!("first frame was not auth");
            }
        },
        Ok(_) => anyhow::bail!("connection closed before auth"),
        Err(_) => anyhow::bail!("no auth frame within {:?}", AUTH_TIMEOUT),
    };

    let user_id = match verifier.verify(&token).await {
        Ok(user_id) => user_id,
        Err(err) => {
            counter!("filetto_auth_failures_total").increment(1);
            let reply = encode(&ServerEvent::Error {
                message: "authentication failed".into(),
            });
            let _ = sink.send(Message::Text(reply.into())).await;
            anyhow::bail!("authentication failed: {}", err);
        }
    };
    debug!("{}: session established for {}", socket, user_id);

    let profile = match profiles.ensure_user(&user_id, None).await {
        Ok(profile) => profile,
        Err(err) => {
            warn!("{}: profile upsert failed: {}", user_id, err);
            Profile {
                user_id: user_id.clone(),
                display_name: user_id.clone(),
            }
        }
    };
    let hello = encode(&ServerEvent::AuthOk {
        user_id: user_id.clone(),
        display_name: profile.display_name,
    });
    sink.send(Message::Text(hello.into())).await?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let conn_id = coordinator.connect(&user_id, tx).await;

    loop {
        tokio::select! {
            outbound = rx.recv() => {
                match outbound {
                    Some(event) => {
                        if sink.send(Message::Text(encode(&event).into())).await.is_err() {
                            break;
                        }
                    }
                    // Sender gone: this connection was superseded.
                    None => break,
                }
            }
            inbound = stream.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientEvent>(&text) {
                            Ok(event) => coordinator.handle_event(&user_id, event).await,
                            Err(err) => {
                                debug!("{}: undecodable frame: {}", user_id, err);
                                let reply = encode(&ServerEvent::Error {
                                    message: "invalid message".into(),
                                });
                                if sink.send(Message::Text(reply.into())).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if sink.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        debug!("{}: transport error: {}", user_id, err);
                        break;
                    }
                }
            }
        }
    }

    coordinator.disconnect(&user_id, conn_id).await;
    debug!("{}: session finished for {}", socket, user_id);
    Ok(())
}

fn encode(event: &ServerEvent) -> String {
    serde_json::to_string(event)
        .unwrap_or_else(|_| r#"{"type":"error","message":"internal error"}"#.to_string())
}
