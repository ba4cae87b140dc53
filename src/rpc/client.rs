//! One-shot JSON-RPC client used by the CLI.

use serde::de::DeserializeOwned;
use serde_json::Value;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;

use super::protocol::{Request, Response, RpcError};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to connect to sanitd at {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("communication error: {0}")]
    Io(#[from] std::io::Error),

    #[error("daemon closed the connection without replying")]
    NoReply,

    #[error("malformed reply: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("{}", .0.message)]
    Rpc(RpcError),
}

pub struct RpcClient {
    addr: SocketAddr,
}

impl RpcClient {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }

    pub async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<T, ClientError> {
        let connect = |source: std::io::Error| ClientError::Connect {
            addr: self.addr,
            source,
        };
        let mut stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(self.addr))
            .await
            .map_err(|_| connect(std::io::ErrorKind::TimedOut.into()))?
            .map_err(connect)?;

        let mut encoded = serde_json::to_string(&Request::new(method, params, 1))?;
        encoded.push('\n');
        stream.write_all(encoded.as_bytes()).await?;

        let mut reply = String::new();
        if BufReader::new(stream).read_line(&mut reply).await? == 0 {
            return Err(ClientError::NoReply);
        }

        let response: Response = serde_json::from_str(&reply)?;
        if let Some(error) = response.error {
            return Err(ClientError::Rpc(error));
        }
        Ok(serde_json::from_value(response.result.unwrap_or(Value::Null))?)
    }
}
