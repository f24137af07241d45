//! Connection establishment behind the transport.
//!
//! A [`Link`] is one open duplex connection seen as a pair of text-frame
//! channels. The inbound side ending (`recv()` returning `None`) means the
//! connection closed. If it closed because a write failed, the failure is
//! reported before the inbound side ends.

use super::TransportError;
use futures_util::{SinkExt, StreamExt};
use std::future::Future;
use std::pin::Pin;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;

/// An open connection.
#[derive(Debug)]
pub struct Link {
    pub outbound: mpsc::Sender<String>,
    pub inbound: mpsc::Receiver<String>,
    failure: oneshot::Receiver<TransportError>,
}

impl Link {
    /// Wrap a channel pair. The returned sender reports a write failure;
    /// send on it before dropping the inbound sender.
    pub fn new(
        outbound: mpsc::Sender<String>,
        inbound: mpsc::Receiver<String>,
    ) -> (Self, oneshot::Sender<TransportError>) {
        let (failed, failure) = oneshot::channel();
        (
            Self {
                outbound,
                inbound,
                failure,
            },
            failed,
        )
    }

    /// Write failure that ended the connection, if any.
    pub(crate) fn take_failure(&mut self) -> Option<TransportError> {
        self.failure.try_recv().ok()
    }
}

pub type ConnectFuture = Pin<Box<dyn Future<Output = Result<Link, TransportError>> + Send>>;

/// Opens connections to a URL.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self, url: &str) -> ConnectFuture;
}

/// WebSocket client connector.
#[derive(Debug, Clone)]
pub struct WsConnector {
    buffer: usize,
}

impl WsConnector {
    pub fn new(buffer: usize) -> Self {
        Self {
            buffer: buffer.max(1),
        }
    }
}

impl Default for WsConnector {
    fn default() -> Self {
        Self::new(256)
    }
}

impl Connector for WsConnector {
    fn connect(&self, url: &str) -> ConnectFuture {
        let url = url.to_string();
        let buffer = self.buffer;
        Box::pin(async move {
            let (stream, _response) = tokio_tungstenite::connect_async(url.as_str())
                .await
                .map_err(|e| TransportError::Connect(e.to_string()))?;
            let (mut sink, mut source) = stream.split();

            let (outbound, mut outbound_rx) = mpsc::channel::<String>(buffer);
            let (inbound_tx, inbound) = mpsc::channel::<String>(buffer);
            let (link, failed) = Link::new(outbound, inbound);

            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        out = outbound_rx.recv() => match out {
                            Some(text) => {
                                if let Err(e) = sink.send(Message::Text(text)).await {
                                    tracing::warn!("WebSocket write failed: {}", e);
                                    let _ = failed.send(TransportError::Send(e.to_string()));
                                    break;
                                }
                            }
                            None => {
                                let _ = sink.close().await;
                                break;
                            }
                        },
                        frame = source.next() => match frame {
                            Some(Ok(Message::Text(text))) => {
                                if inbound_tx.send(text).await.is_err() {
                                    break;
                                }
                            }
                            Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                                Ok(text) => {
                                    if inbound_tx.send(text).await.is_err() {
                                        break;
                                    }
                                }
                                Err(_) => tracing::warn!("Dropping non UTF-8 binary frame"),
                            },
                            Some(Ok(Message::Close(_))) | None => break,
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                tracing::warn!("WebSocket read failed: {}", e);
                                break;
                            }
                        },
                    }
                }
                tracing::debug!("WebSocket pump finished");
            });

            Ok(link)
        })
    }
}
