//! Connection Manager für den Audio-Kanal
//!
//! Verwaltet den Duplex-Kanal zum Endpoint:
//! - Verbindungsaufbau und -abbau
//! - Uplink von Audio-Chunks als WAV-Container
//! - Klassifizierung eingehender Frames (Audio vs. Kontroll-Nachricht)
//! - Event-basierte Weitergabe an die Anwendung

use super::messages::ControlMessage;
use super::state::{transition, ChannelEvent, ConnectionState, Effect, CLOSE_ABNORMAL};
use super::transport::Connector;
use crate::audio::codec::{self, DecodeError, PcmChunk};
use parking_lot::RwLock;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Fatale Verbindungsfehler, werden immer an die Anwendung gemeldet
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("Cannot reach the endpoint {endpoint}: {reason}")]
    Unreachable { endpoint: String, reason: String },

    #[error("Connection to {endpoint} closed unexpectedly (code {code}): {reason}")]
    UnexpectedClose {
        endpoint: String,
        code: u16,
        reason: String,
    },
}

// ============================================================================
// CONNECTION EVENTS
// ============================================================================

/// Events die vom ConnectionManager ausgelöst werden
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// Verbindungsstatus geändert
    StateChanged(ConnectionState),

    /// Text der synthetisierten Sprache
    TtsUpdate(String),

    /// Synthese beendet
    TtsEnd,

    /// Text der erkannten Sprache
    AsrUpdate(String),

    /// Finales Transkript
    AsrEnd(String),

    /// Verbindungsfehler
    Error(ConnectionError),
}

/// Empfänger des Downlink-Audios
///
/// Audio läuft nicht über den Broadcast-Kanal: ein langsamer Event-Konsument
/// würde dort Chunks überspringen. Chunks ohne registrierten Empfänger werden
/// verworfen.
type AudioTx = Arc<RwLock<Option<mpsc::UnboundedSender<PcmChunk>>>>;

// ============================================================================
// DECODE CONTEXT
// ============================================================================

/// Empfangsseitiger Dekodier-Kontext, an eine Sample Rate gebunden
#[derive(Debug, Default)]
pub struct DecodeContext {
    sample_rate: Option<u32>,
}

impl DecodeContext {
    pub fn sample_rate(&self) -> Option<u32> {
        self.sample_rate
    }

    /// Liest die Rate aus dem Header, passt den Kontext an und dekodiert
    pub fn decode(&mut self, bytes: &[u8]) -> Result<PcmChunk, DecodeError> {
        let sample_rate = codec::decode_header(bytes)?;
        if self.sample_rate != Some(sample_rate) {
            tracing::debug!("Creating decode context at {} Hz", sample_rate);
            self.sample_rate = Some(sample_rate);
        }
        codec::decode(bytes, sample_rate)
    }
}

// ============================================================================
// MANAGER STATE
// ============================================================================

#[derive(Debug)]
struct ActiveChannel {
    id: u64,
    outbound: mpsc::Sender<Message>,
}

/// `state == Disconnected` genau dann wenn `channel.is_none()`
#[derive(Debug)]
struct ManagerState {
    state: ConnectionState,
    channel: Option<ActiveChannel>,
    next_channel_id: u64,
}

// ============================================================================
// CONNECTION MANAGER
// ============================================================================

/// Besitzt den Kanal und die Verbindungs-Zustandsmaschine
pub struct ConnectionManager {
    endpoint: Url,
    connector: Box<dyn Connector>,
    inner: Arc<RwLock<ManagerState>>,
    event_tx: broadcast::Sender<ConnectionEvent>,
    audio_tx: AudioTx,
}

impl ConnectionManager {
    /// Erstellt einen neuen ConnectionManager
    pub fn new(endpoint: Url, connector: Box<dyn Connector>) -> Self {
        let (event_tx, _) = broadcast::channel(256);

        Self {
            endpoint,
            connector,
            inner: Arc::new(RwLock::new(ManagerState {
                state: ConnectionState::Disconnected,
                channel: None,
                next_channel_id: 0,
            })),
            event_tx,
            audio_tx: Arc::new(RwLock::new(None)),
        }
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.event_tx.subscribe()
    }

    /// Registriert den Empfänger für dekodiertes Downlink-Audio
    ///
    /// Es gibt genau einen Empfänger; ein neuer Aufruf ersetzt den vorherigen.
    /// Chunks gehen verlustfrei und in Empfangsreihenfolge durch.
    pub fn audio_stream(&self) -> mpsc::UnboundedReceiver<PcmChunk> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.audio_tx.write() = Some(tx);
        rx
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.read().state
    }

    /// Prüft ob verbunden
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Öffnet den Kanal, falls noch keiner existiert
    ///
    /// Kehrt sofort zurück; `Connected` folgt asynchron als Event.
    pub fn connect(&self) {
        let (id, events) = {
            let mut inner = self.inner.write();
            if inner.channel.is_some() {
                tracing::debug!("Channel already exists, ignoring connect()");
                return;
            }

            let handle = self.connector.open(&self.endpoint);
            let id = inner.next_channel_id;
            inner.next_channel_id += 1;
            inner.channel = Some(ActiveChannel {
                id,
                outbound: handle.outbound,
            });
            inner.state = ConnectionState::Connecting;
            (id, handle.events)
        };

        let _ = self
            .event_tx
            .send(ConnectionEvent::StateChanged(ConnectionState::Connecting));

        tokio::spawn(Self::drive_channel(
            id,
            events,
            Arc::clone(&self.inner),
            self.event_tx.clone(),
            Arc::clone(&self.audio_tx),
            self.endpoint.to_string(),
        ));
    }

    /// Baut den Kanal mit Normal Closure ab (z.B. beim Beenden)
    pub fn disconnect(&self) {
        let (channel, changed) = {
            let mut inner = self.inner.write();
            let changed = inner.state != ConnectionState::Disconnected;
            inner.state = ConnectionState::Disconnected;
            (inner.channel.take(), changed)
        };

        if let Some(channel) = channel {
            tracing::info!("Closing connection to {}", self.endpoint);
            Self::close_channel(&channel.outbound, "client disconnect");
        }

        if changed {
            let _ = self
                .event_tx
                .send(ConnectionEvent::StateChanged(ConnectionState::Disconnected));
        }
    }

    /// Sendet einen Audio-Chunk als Binär-Frame
    ///
    /// Ohne aktive Verbindung wird der Chunk verworfen (kein Queueing).
    /// Gibt zurück, ob der Chunk übergeben wurde.
    pub fn send_audio_chunk(&self, chunk: &PcmChunk) -> bool {
        let outbound = {
            let inner = self.inner.read();
            if inner.state != ConnectionState::Connected {
                tracing::warn!("Dropping audio chunk, connection is {:?}", inner.state);
                return false;
            }
            match inner.channel.as_ref() {
                Some(channel) => channel.outbound.clone(),
                None => return false,
            }
        };

        let container = match codec::encode_chunk(chunk) {
            Ok(container) => container,
            Err(e) => {
                tracing::warn!("Failed to encode audio chunk: {}", e);
                return false;
            }
        };

        match outbound.try_send(Message::Binary(container)) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("Failed to queue audio chunk: {}", e);
                false
            }
        }
    }

    // ========================================================================
    // PRIVATE METHODS
    // ========================================================================

    /// Verarbeitet die Events eines Kanals bis zu dessen Abbau
    async fn drive_channel(
        id: u64,
        mut events: mpsc::Receiver<ChannelEvent>,
        inner: Arc<RwLock<ManagerState>>,
        event_tx: broadcast::Sender<ConnectionEvent>,
        audio_tx: AudioTx,
        endpoint: String,
    ) {
        let mut decoder = DecodeContext::default();

        loop {
            let event = events.recv().await.unwrap_or(ChannelEvent::Closed {
                code: CLOSE_ABNORMAL,
                reason: "channel dropped".to_string(),
            });

            let (step, previous, closed_channel) = {
                let mut guard = inner.write();
                if guard.channel.as_ref().map(|c| c.id) != Some(id) {
                    tracing::trace!("Ignoring event from stale channel {}", id);
                    return;
                }

                let previous = guard.state;
                let step = transition(previous, event, &endpoint);
                guard.state = step.next;

                let closed_channel = if step.next == ConnectionState::Disconnected {
                    guard.channel.take()
                } else {
                    None
                };
                (step, previous, closed_channel)
            };

            for effect in step.effects {
                match effect {
                    Effect::SurfaceError(err) => {
                        tracing::error!("Connection error: {}", err);
                        let _ = event_tx.send(ConnectionEvent::Error(err));
                    }
                    Effect::CloseChannel => {
                        if let Some(channel) = closed_channel.as_ref() {
                            Self::close_channel(&channel.outbound, "channel error");
                        }
                    }
                    Effect::DeliverAudio(bytes) => match decoder.decode(&bytes) {
                        Ok(chunk) => Self::deliver_audio(chunk, &audio_tx),
                        Err(e) => {
                            tracing::warn!("Dropping undecodable audio frame: {}", e);
                        }
                    },
                    Effect::DeliverControl(text) => Self::dispatch_control(&text, &event_tx),
                }
            }

            if step.next != previous {
                tracing::info!("Connection state: {:?} -> {:?}", previous, step.next);
                let _ = event_tx.send(ConnectionEvent::StateChanged(step.next));
            }

            if step.next == ConnectionState::Disconnected {
                return;
            }
        }
    }

    fn deliver_audio(chunk: PcmChunk, audio_tx: &AudioTx) {
        let mut guard = audio_tx.write();
        let Some(tx) = guard.as_ref() else {
            tracing::trace!("No audio receiver registered, dropping chunk");
            return;
        };
        if tx.send(chunk).is_err() {
            tracing::debug!("Audio receiver dropped");
            *guard = None;
        }
    }

    /// Leitet eine Kontroll-Nachricht an die Anwendung weiter
    fn dispatch_control(text: &str, event_tx: &broadcast::Sender<ConnectionEvent>) {
        let event = match ControlMessage::parse(text) {
            Ok(ControlMessage::TtsUpdate { tts }) => ConnectionEvent::TtsUpdate(tts),
            Ok(ControlMessage::TtsEnd) => ConnectionEvent::TtsEnd,
            Ok(ControlMessage::AsrUpdate { asr }) => ConnectionEvent::AsrUpdate(asr),
            Ok(ControlMessage::AsrEnd { asr }) => ConnectionEvent::AsrEnd(asr),
            Err(e) => {
                tracing::warn!("Ignoring control message: {}", e);
                return;
            }
        };
        let _ = event_tx.send(event);
    }

    fn close_channel(outbound: &mpsc::Sender<Message>, reason: &'static str) {
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: reason.into(),
        };
        if let Err(e) = outbound.try_send(Message::Close(Some(frame))) {
            tracing::debug!("Could not send close frame: {}", e);
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(channel) = self.inner.write().channel.take() {
            Self::close_channel(&channel.outbound, "client dropped");
        }
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("endpoint", &self.endpoint.as_str())
            .field("state", &self.state())
            .finish()
    }
}
