//! Operator command channel
//!
//! Newline-delimited JSON over TCP. Each request line is a command
//! `{"action": "...", "args": {...}}` answered by one reply line
//! `{"accepted": ..., "state": ..., "reason": ...}`. Session status changes are
//! pushed to every connected client as `{"event": ...}` lines in between.

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::{debug, info, warn};

use crate::config::RemoteConfig;
use crate::session::{Command, CommandReply, SessionError, SessionHandle};

/// Longest accepted request line
const MAX_LINE_LENGTH: usize = 8 * 1024;

type Connection = Framed<TcpStream, LinesCodec>;

/// Bind the configured listen address and serve connections in the
/// background. Returns the bound address, or None when disabled.
pub async fn spawn_command_channel(
    config: &RemoteConfig,
    session: SessionHandle,
) -> Result<Option<SocketAddr>> {
    let Some(listen) = config.listen.as_deref() else {
        info!("Command channel disabled (no remote.listen)");
        return Ok(None);
    };

    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("Failed to bind command channel to {}", listen))?;
    let addr = listener.local_addr()?;
    info!("Command channel listening on {}", addr);

    tokio::spawn(accept_loop(listener, session));
    Ok(Some(addr))
}

async fn accept_loop(listener: TcpListener, session: SessionHandle) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                info!("Operator connected from {}", peer);
                tokio::spawn(serve_connection(stream, peer, session.clone()));
            }
            Err(e) => {
                warn!("Failed to accept operator connection: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn serve_connection(stream: TcpStream, peer: SocketAddr, session: SessionHandle) {
    let mut conn = Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
    let mut statuses = session.subscribe();

    loop {
        tokio::select! {
            line = conn.next() => {
                let reply = match line {
                    Some(Ok(line)) if line.trim().is_empty() => continue,
                    Some(Ok(line)) => match handle_request(&line, &session).await {
                        Ok(reply) => reply,
                        Err(e) => {
                            warn!("Dropping operator {}: {:#}", peer, e);
                            break;
                        }
                    },
                    Some(Err(LinesCodecError::MaxLineLengthExceeded)) => rejection(
                        &session,
                        format!("request longer than {} bytes", MAX_LINE_LENGTH),
                    ),
                    Some(Err(LinesCodecError::Io(e))) => {
                        debug!("Operator {} read error: {}", peer, e);
                        break;
                    }
                    None => break,
                };

                if send_line(&mut conn, &reply).await.is_err() {
                    break;
                }
            }

            status = statuses.recv() => {
                match status {
                    Ok(status) => {
                        if send_line(&mut conn, &status).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Operator {} lagged, missed {} status updates", peer, n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    info!("Operator {} disconnected", peer);
}

/// Parse one request line and run it through the engine
async fn handle_request(line: &str, session: &SessionHandle) -> Result<CommandReply> {
    let command: Command = match serde_json::from_str(line) {
        Ok(command) => command,
        Err(e) => return Ok(rejection(session, format!("malformed request: {}", e))),
    };
    debug!("Operator request: {:?}", command);
    session.command(command).await
}

fn rejection(session: &SessionHandle, reason: String) -> CommandReply {
    CommandReply::rejected("", session.snapshot().state, &SessionError::InvalidCommand(reason))
}

async fn send_line<T: Serialize>(conn: &mut Connection, value: &T) -> Result<()> {
    let line = serde_json::to_string(value)?;
    conn.send(line).await?;
    Ok(())
}
