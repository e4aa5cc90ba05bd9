//! Voice Client - Duplex Audio-Streaming zu einem Sprach-Endpoint
//!
//! Ein Client-Prozess mit:
//! - Mikrofon-Capture in 16kHz Mono Chunks
//! - WebSocket-Kanal mit WAV-Containern in beide Richtungen
//! - Lückenloser Wiedergabe der empfangenen Sprach-Sequenzen
//! - Transkript-Updates (TTS/ASR) als Kontroll-Nachrichten

pub mod audio;
pub mod cli;
pub mod config;
pub mod connection;

use audio::{
    CaptureBackend, CaptureError, CaptureService, CpalCaptureBackend, CpalOutputBackend,
    OutputBackend, PcmChunk, PlaybackScheduler,
};
use clap::Parser;
use config::ClientConfig;
use connection::{
    ConnectionEvent, ConnectionManager, ConnectionState, Connector, WebSocketConnector,
};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

/// Puffer zwischen Capture-Thread und Uplink-Task (~2s bei 32ms Chunks)
const UPLINK_CAPACITY: usize = 64;

// ============================================================================
// VOICE SESSION
// ============================================================================

/// Eine Client-Session: genau ein Kanal, ein Mikrofon, ein Playback-Buffer
pub struct VoiceSession {
    config: ClientConfig,
    connection: Arc<ConnectionManager>,
    capture: CaptureService,
    playback: PlaybackScheduler,
    tasks: Vec<JoinHandle<()>>,
}

impl VoiceSession {
    /// Verdrahtet die Komponenten; muss innerhalb einer Tokio-Runtime laufen
    pub fn new(
        config: ClientConfig,
        connector: Box<dyn Connector>,
        capture_backend: Box<dyn CaptureBackend>,
        output_backend: Box<dyn OutputBackend>,
    ) -> Result<Self, audio::AudioError> {
        let playback = PlaybackScheduler::new(output_backend, config.initial_playback_rate)?;
        let connection = Arc::new(ConnectionManager::new(config.endpoint.clone(), connector));

        let (chunk_tx, chunk_rx) = mpsc::channel(UPLINK_CAPACITY);
        let capture = CaptureService::new(capture_backend, config.is_secure_context(), chunk_tx);

        let tasks = vec![
            tokio::spawn(forward_uplink(chunk_rx, Arc::clone(&connection))),
            tokio::spawn(forward_downlink(
                connection.audio_stream(),
                playback.clone(),
            )),
            tokio::spawn(handle_connection_events(
                connection.subscribe(),
                playback.clone(),
            )),
        ];

        Ok(Self {
            config,
            connection,
            capture,
            playback,
            tasks,
        })
    }

    /// Session mit WebSocket-Kanal und den Standard-Audiogeräten
    pub fn with_default_devices(config: ClientConfig) -> Result<Self, audio::AudioError> {
        Self::new(
            config,
            Box::new(WebSocketConnector),
            Box::new(CpalCaptureBackend::new()),
            Box::new(CpalOutputBackend::new()),
        )
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn capture(&self) -> &CaptureService {
        &self.capture
    }

    pub fn playback(&self) -> &PlaybackScheduler {
        &self.playback
    }

    pub fn connect(&self) {
        self.connection.connect();
    }

    pub fn start_recording(&mut self) -> Result<(), CaptureError> {
        self.capture.start_recording()
    }

    pub fn stop_recording(&mut self) -> Result<(), CaptureError> {
        self.capture.stop_recording()
    }

    /// Beendet die Session: Aufnahme pausieren, Wiedergabe abbrechen, Kanal schließen
    pub fn shutdown(&mut self) {
        if let Err(e) = self.capture.stop_recording() {
            tracing::warn!("Failed to stop recording: {}", e);
        }
        self.playback.interrupt();
        self.connection.disconnect();
    }
}

impl Drop for VoiceSession {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

// ============================================================================
// WIRING TASKS
// ============================================================================

/// Leitet Mikrofon-Chunks an den Kanal weiter
async fn forward_uplink(mut chunks: mpsc::Receiver<PcmChunk>, connection: Arc<ConnectionManager>) {
    let mut dropped: u64 = 0;

    while let Some(chunk) = chunks.recv().await {
        if !connection.send_audio_chunk(&chunk) {
            dropped += 1;
            if dropped % 100 == 1 {
                tracing::debug!("Uplink dropped {} chunk(s) so far", dropped);
            }
        }
    }

    tracing::debug!("Uplink task finished");
}

/// Spielt empfangene Audio-Chunks lückenlos ab
async fn forward_downlink(
    mut chunks: mpsc::UnboundedReceiver<PcmChunk>,
    playback: PlaybackScheduler,
) {
    while let Some(chunk) = chunks.recv().await {
        if let Err(e) = playback.play(&chunk) {
            tracing::error!("Playback failed: {}", e);
        }
    }

    tracing::debug!("Downlink task finished");
}

/// Verarbeitet Status- und Transkript-Events des ConnectionManagers
async fn handle_connection_events(
    mut event_rx: broadcast::Receiver<ConnectionEvent>,
    playback: PlaybackScheduler,
) {
    loop {
        let event = match event_rx.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!("Event handler lagged, skipped {} event(s)", skipped);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        match event {
            ConnectionEvent::TtsUpdate(text) => {
                tracing::info!(target: "voice_client::transcript", "agent: {}", text);
            }
            ConnectionEvent::TtsEnd => {
                tracing::debug!("Agent finished speaking");
            }
            ConnectionEvent::AsrUpdate(text) => {
                tracing::info!(target: "voice_client::transcript", "user (partial): {}", text);
            }
            ConnectionEvent::AsrEnd(text) => {
                tracing::info!(target: "voice_client::transcript", "user: {}", text);
            }
            ConnectionEvent::StateChanged(state) => {
                tracing::info!("Connection state changed: {:?}", state);
                if state == ConnectionState::Disconnected {
                    playback.interrupt();
                }
            }
            ConnectionEvent::Error(err) => {
                tracing::error!("Connection error: {}", err);
            }
        }
    }
}

// ============================================================================
// ENTRY POINT
// ============================================================================

/// Startet den Client bis Ctrl-C oder Verbindungsende
pub async fn run() -> anyhow::Result<()> {
    let args = cli::Args::parse();
    cli::init_logging(&args);

    tracing::info!("Starting voice client...");

    let (config, config_error) = ClientConfig::resolve(args.endpoint.as_deref());
    if let Some(e) = config_error {
        tracing::error!("Configuration error: {}", e);
    }
    tracing::info!("Session {} -> {}", config.session_id, config.endpoint);

    let mut session = VoiceSession::with_default_devices(config)?;
    let mut events = session.connection().subscribe();

    session.connect();
    if let Err(e) = session.start_recording() {
        tracing::error!("Recording unavailable: {}", e);
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down...");
                break;
            }
            event = events.recv() => match event {
                Ok(ConnectionEvent::StateChanged(ConnectionState::Disconnected)) => {
                    tracing::info!("Connection closed, exiting");
                    break;
                }
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    session.shutdown();

    // Close-Frame noch rausschicken lassen
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    Ok(())
}
