//! Raw TLS transport: one fresh connection per exchange.
//!
//! Every request in this crate carries `Connection: close`, so there is no
//! pooling or reuse: [`Client::exchange`] opens an encrypted connection,
//! writes the request head and body, parses one response, and tears the
//! connection down on every exit path. Outgoing bytes are mirrored to the
//! diagnostic sink before they hit the wire.
//!
//! Failures to establish the connection are folded into a synthetic 503
//! exchange rather than an error, matching how every caller treats them:
//! report, no state change, resume ticking.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use thiserror::Error;
use tokio::{io::AsyncWriteExt, net::TcpStream};
use tokio_native_tls::TlsStream;

use crate::{
    events::EventSink,
    exchange::{HttpExchange, HttpExchanger},
    response,
};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("TLS setup failed: {0}")]
    Tls(#[from] native_tls::Error),

    #[error("unable to connect to {host}:{port}: {source}")]
    Connect {
        host: String,
        port: u16,
        source: std::io::Error,
    },

    #[error("sending request failed: {0}")]
    Send(#[from] std::io::Error),

    #[error(transparent)]
    Response(#[from] response::Error),
}

/// TLS transport client.
pub struct Client {
    connector: tokio_native_tls::TlsConnector,
    sink: Arc<dyn EventSink>,
}

impl Client {
    /// Window for establishing the TCP connection and TLS handshake.
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

    pub fn new(sink: Arc<dyn EventSink>) -> Result<Self> {
        let connector = native_tls::TlsConnector::new()?;
        Ok(Self {
            connector: connector.into(),
            sink,
        })
    }

    /// Opens a fresh encrypted connection to `host:port`.
    pub async fn connect(&self, host: &str, port: u16) -> Result<TlsStream<TcpStream>> {
        let connect = TcpStream::connect((host, port));
        let tcp = tokio::time::timeout(Self::CONNECT_TIMEOUT, connect)
            .await
            .unwrap_or_else(|_| {
                Err(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "connect timed out",
                ))
            })
            .map_err(|source| Error::Connect {
                host: host.to_owned(),
                port,
                source,
            })?;

        Ok(self.connector.connect(host, tcp).await?)
    }
}

#[async_trait]
impl HttpExchanger for Client {
    async fn exchange(
        &self,
        host: &str,
        port: u16,
        head: &str,
        body: &[u8],
    ) -> Result<HttpExchange> {
        let mut stream = match self.connect(host, port).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("{e}");
                return Ok(HttpExchange::unable_to_connect());
            }
        };

        self.sink.trace(">>>> REQUEST");
        self.sink.trace(head);
        if !body.is_empty() {
            self.sink.trace(&String::from_utf8_lossy(body));
        }

        stream.write_all(head.as_bytes()).await?;
        if !body.is_empty() {
            stream.write_all(body).await?;
        }

        let exchange = response::read_response(&mut stream, self.sink.as_ref()).await?;

        // Fresh connection per exchange; the far end got `Connection: close`.
        let _ = stream.shutdown().await;

        Ok(exchange)
    }
}
