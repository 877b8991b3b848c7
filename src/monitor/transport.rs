// src/monitor/transport.rs

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use tokio::io::AsyncRead;
use tokio::net::TcpStream;
use tracing::info;

use crate::common::{AbcdError, Result};

/// Default port of a telnet RS-485 bridge.
pub const DEFAULT_TELNET_PORT: u16 = 23;

/// A connected byte source.
pub type Transport = Box<dyn AsyncRead + Send + Unpin>;

/// Where bus bytes come from.
///
/// * `telnet://host[:port]` is a TCP connection to an RS-485 bridge.
/// * `file://path` and bare paths are a serial device or capture file,
///   opened read-only. Line settings are left to the operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportUri {
    Telnet { host: String, port: u16 },
    File(PathBuf),
}

impl FromStr for TransportUri {
    type Err = AbcdError;

    fn from_str(uri: &str) -> Result<Self> {
        let Some((scheme, rest)) = uri.split_once("://") else {
            if uri.is_empty() {
                return Err(AbcdError::Config("transport uri is empty".to_string()));
            }
            return Ok(TransportUri::File(PathBuf::from(uri)));
        };
        match scheme {
            "file" if !rest.is_empty() => Ok(TransportUri::File(PathBuf::from(rest))),
            "telnet" => {
                let (host, port) = match rest.rsplit_once(':') {
                    Some((host, port)) => {
                        let port = port
                            .parse()
                            .map_err(|_| AbcdError::Config(format!("invalid port in '{}'", uri)))?;
                        (host, port)
                    }
                    None => (rest, DEFAULT_TELNET_PORT),
                };
                if host.is_empty() {
                    return Err(AbcdError::Config(format!("missing host in '{}'", uri)));
                }
                Ok(TransportUri::Telnet { host: host.to_string(), port })
            }
            _ => Err(AbcdError::Config(format!("unsupported transport '{}'", uri))),
        }
    }
}

impl fmt::Display for TransportUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportUri::Telnet { host, port } => write!(f, "telnet://{}:{}", host, port),
            TransportUri::File(path) => write!(f, "file://{}", path.display()),
        }
    }
}

impl TransportUri {
    pub async fn open(&self) -> Result<Transport> {
        match self {
            TransportUri::Telnet { host, port } => {
                let stream = TcpStream::connect((host.as_str(), *port)).await?;
                stream.set_nodelay(true)?;
                info!(transport = %self, "Connected to bus bridge");
                Ok(Box::new(stream))
            }
            TransportUri::File(path) => {
                let file = tokio::fs::File::open(path).await?;
                info!(transport = %self, "Opened bus device");
                Ok(Box::new(file))
            }
        }
    }
}

/// Parses `uri` and connects to it.
pub async fn open_transport(uri: &str) -> Result<Transport> {
    uri.parse::<TransportUri>()?.open().await
}
