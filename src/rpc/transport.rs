//! Newline-delimited JSON over TCP, one task per connection.

use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::methods::MethodHandler;
use super::protocol::{Request, Response};

pub struct Transport {
    bind_addr: SocketAddr,
    handler: Arc<MethodHandler>,
}

impl Transport {
    pub fn new(bind_addr: SocketAddr, handler: MethodHandler) -> Self {
        Self {
            bind_addr,
            handler: Arc::new(handler),
        }
    }

    pub async fn listen(&self, mut shutdown: broadcast::Receiver<()>) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr)
            .await
            .with_context(|| format!("Failed to bind RPC listener on {}", self.bind_addr))?;
        info!(addr = %self.bind_addr, "RPC server listening");

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(peer = %peer, "RPC client connected");
                        let handler = self.handler.clone();
                        tokio::spawn(async move {
                            if let Err(e) = serve_connection(stream, peer, handler).await {
                                debug!(peer = %peer, error = %e, "RPC connection error");
                            }
                        });
                    }
                    Err(e) => error!(error = %e, "Failed to accept RPC connection"),
                },
                _ = shutdown.recv() => {
                    info!("RPC server shutting down");
                    break;
                }
            }
        }

        Ok(())
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    handler: Arc<MethodHandler>,
) -> anyhow::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<Request>(line) {
            Ok(request) => match request.validate() {
                Err(reason) => {
                    warn!(peer = %peer, error = reason, "Invalid RPC request");
                    Response::invalid_request(request.id.clone().unwrap_or(serde_json::Value::Null))
                }
                Ok(()) if request.is_notification() => {
                    debug!(peer = %peer, method = %request.method, "RPC notification");
                    handler.handle(request).await;
                    continue;
                }
                Ok(()) => {
                    debug!(peer = %peer, method = %request.method, "RPC call");
                    handler.handle(request).await
                }
            },
            Err(e) => {
                warn!(peer = %peer, error = %e, "RPC parse error");
                Response::parse_error()
            }
        };

        let mut encoded = serde_json::to_string(&response)?;
        encoded.push('\n');
        writer.write_all(encoded.as_bytes()).await?;
    }

    debug!(peer = %peer, "RPC client disconnected");
    Ok(())
}
