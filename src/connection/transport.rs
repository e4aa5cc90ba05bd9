//! Duplex-Kanal zum Endpoint
//!
//! Ein `Connector` öffnet einen Kanal und kehrt sofort zurück. Lifecycle und
//! eingehende Frames kommen als [`ChannelEvent`] über einen mpsc-Receiver,
//! ausgehende Frames werden über einen mpsc-Sender geschrieben.

use super::state::{ChannelEvent, CLOSE_ABNORMAL, CLOSE_NO_STATUS};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

/// Puffer für ausgehende Frames (~2s Audio bei 32ms Chunks)
const OUTBOUND_CAPACITY: usize = 64;

/// Puffer für eingehende Events
const EVENT_CAPACITY: usize = 256;

/// Die beiden Enden eines geöffneten Kanals
#[derive(Debug)]
pub struct ChannelHandle {
    pub outbound: mpsc::Sender<Message>,
    pub events: mpsc::Receiver<ChannelEvent>,
}

/// Öffnet Kanäle zu einem Endpoint
pub trait Connector: Send + Sync {
    /// Startet den Verbindungsaufbau; das Ergebnis kommt als `Opened` oder `Error` Event
    fn open(&self, endpoint: &Url) -> ChannelHandle;
}

/// WebSocket-Kanal über tokio-tungstenite
#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketConnector;

impl Connector for WebSocketConnector {
    fn open(&self, endpoint: &Url) -> ChannelHandle {
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Message>(OUTBOUND_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel::<ChannelEvent>(EVENT_CAPACITY);
        let ws_url = endpoint.to_string();

        tokio::spawn(async move {
            tracing::info!("Connecting to endpoint: {}", ws_url);

            let ws_stream = match connect_async(ws_url.as_str()).await {
                Ok((ws_stream, _)) => ws_stream,
                Err(e) => {
                    tracing::error!("WebSocket connection failed: {}", e);
                    let _ = event_tx.send(ChannelEvent::Error(e.to_string())).await;
                    return;
                }
            };

            if event_tx.send(ChannelEvent::Opened).await.is_err() {
                return;
            }

            let (mut write, mut read) = ws_stream.split();

            // Write-Task starten
            let write_events = event_tx.clone();
            tokio::spawn(async move {
                while let Some(msg) = outbound_rx.recv().await {
                    let closing = matches!(msg, Message::Close(_));
                    if let Err(e) = write.send(msg).await {
                        tracing::error!("Failed to send WebSocket message: {}", e);
                        let _ = write_events.send(ChannelEvent::Error(e.to_string())).await;
                        break;
                    }
                    if closing {
                        break;
                    }
                }
            });

            // Read-Loop
            while let Some(msg_result) = read.next().await {
                let event = match msg_result {
                    Ok(Message::Binary(data)) => ChannelEvent::Binary(data),
                    Ok(Message::Text(text)) => ChannelEvent::Text(text),
                    Ok(Message::Close(frame)) => {
                        let (code, reason) = frame
                            .map(|f| (u16::from(f.code), f.reason.to_string()))
                            .unwrap_or((CLOSE_NO_STATUS, String::new()));
                        tracing::info!("WebSocket closed by server ({}): {}", code, reason);
                        let _ = event_tx.send(ChannelEvent::Closed { code, reason }).await;
                        return;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        tracing::error!("WebSocket error: {}", e);
                        let _ = event_tx.send(ChannelEvent::Error(e.to_string())).await;
                        return;
                    }
                };

                if event_tx.send(event).await.is_err() {
                    // Kanal wurde lokal abgebaut
                    return;
                }
            }

            let _ = event_tx
                .send(ChannelEvent::Closed {
                    code: CLOSE_ABNORMAL,
                    reason: "connection dropped without close frame".to_string(),
                })
                .await;
        });

        ChannelHandle {
            outbound: outbound_tx,
            events: event_rx,
        }
    }
}
