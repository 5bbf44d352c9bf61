use crate::error::{Error, Result};
use crate::signaling::{SignalingChannel, SignalingConnector, SignalingMessage, SignalingSender};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

/// Connects to a relay over WebSocket, one JSON text frame per message
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: String,
}

impl WebSocketConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl SignalingConnector for WebSocketConnector {
    async fn connect(&self) -> Result<SignalingChannel> {
        info!("Connecting to signaling relay: {}", self.url);
        let (ws_stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| Error::Signaling(format!("Failed to connect to {}: {}", self.url, e)))?;
        info!("Connected to signaling relay");

        let (mut write, mut read) = ws_stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<SignalingMessage>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        // sender task
        tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                let text = match msg.to_json() {
                    Ok(text) => text,
                    Err(e) => {
                        error!("Failed to encode {}: {}", msg.event_name(), e);
                        continue;
                    }
                };
                debug!("-> {}", msg.event_name());
                if let Err(e) = write.send(Message::Text(text)).await {
                    error!("Failed to send WebSocket message: {}", e);
                    break;
                }
            }
            let _ = write.send(Message::Close(None)).await;
        });

        // receiver task
        tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                match frame {
                    Ok(Message::Text(text)) => match SignalingMessage::from_json(&text) {
                        Ok(msg) => {
                            debug!("<- {}", msg.event_name());
                            if inbound_tx.send(msg).is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!("Skipping malformed signaling frame: {}", e),
                    },
                    Ok(Message::Close(_)) => {
                        info!("Signaling relay closed the connection");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("WebSocket error: {}", e);
                        break;
                    }
                }
            }
        });

        Ok(SignalingChannel {
            sender: SignalingSender::new(outbound_tx),
            inbound: inbound_rx,
        })
    }
}
