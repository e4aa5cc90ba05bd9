//! Capture Service - Mikrofonzugriff und Chunk-Erzeugung
//!
//! Verwaltet den Zustand des Mikrofonzugriffs (Initial -> Loading ->
//! Granted/Error) und liefert Chunks fester Größe mit 16kHz Mono an einen
//! Sink. Der Service kennt das Netzwerk nicht; der Sink wird von außen
//! verdrahtet.

use super::codec::PcmChunk;
use super::device::find_best_input_config;
use super::resample::{downmix, StreamResampler};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BuildStreamError, Device, Stream};
use ringbuf::{traits::*, HeapRb};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

// ============================================================================
// CONSTANTS
// ============================================================================

/// Ziel-Sample-Rate für den Uplink
pub const TARGET_SAMPLE_RATE: u32 = 16000;

/// Channels (Mono für Voice)
pub const CHANNELS: u16 = 1;

/// Chunk-Größe in Samples (32ms @ 16kHz)
pub const CHUNK_SIZE: usize = 512;

/// Kapazität des Ring-Buffers im Assembler
const RING_BUFFER_SIZE: usize = CHUNK_SIZE * 16;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    #[error("Microphone access requires a secure context (wss:// or a loopback endpoint)")]
    InsecureContext,

    #[error("Microphone access denied: {0}")]
    PermissionDenied(String),

    #[error("No audio input device found")]
    NoInputDevice,

    #[error("Unsupported audio configuration: {0}")]
    UnsupportedConfig(String),

    #[error("Failed to build audio stream: {0}")]
    StreamBuildError(String),

    #[error("Failed to start audio stream: {0}")]
    StreamPlayError(String),
}

// ============================================================================
// STATE
// ============================================================================

/// Zustand des Mikrofonzugriffs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MicAccessState {
    /// Noch nicht angefragt
    Initial,
    /// Zugriff wird angefragt
    Loading,
    /// Zugriff erteilt, Capture-Graph existiert
    Granted,
    /// Anfrage fehlgeschlagen
    Error,
}

/// Events die vom CaptureService ausgelöst werden
#[derive(Debug, Clone)]
pub enum CaptureEvent {
    StateChanged(MicAccessState),
    RecordingChanged(bool),
}

/// Empfänger für fertige Chunks
pub type ChunkSink = mpsc::Sender<PcmChunk>;

// ============================================================================
// CAPTURE GRAPH
// ============================================================================

/// Liefert Zugriff auf ein Mikrofon
pub trait CaptureBackend: Send {
    /// Fordert den Zugriff an und baut einen pausierten Capture-Graphen
    fn open(&mut self, sink: ChunkSink) -> Result<Box<dyn CaptureGraph>, CaptureError>;
}

pub trait CaptureGraph: Send {
    fn resume(&mut self) -> Result<(), CaptureError>;
    fn suspend(&mut self) -> Result<(), CaptureError>;
}

// ============================================================================
// CHUNK ASSEMBLER
// ============================================================================

/// Sammelt Samples im Ring-Buffer und schneidet Chunks fester Größe ab
pub struct ChunkAssembler {
    ring: HeapRb<f32>,
    chunk_size: usize,
    sample_rate: u32,
}

impl ChunkAssembler {
    pub fn new(chunk_size: usize, sample_rate: u32) -> Self {
        Self {
            ring: HeapRb::new(RING_BUFFER_SIZE.max(chunk_size * 2)),
            chunk_size,
            sample_rate,
        }
    }

    /// Nimmt Samples auf und gibt alle vollständigen Chunks in FIFO-Reihenfolge zurück
    pub fn push(&mut self, samples: &[f32]) -> Vec<PcmChunk> {
        let mut chunks = Vec::new();
        let mut rest = samples;

        while !rest.is_empty() {
            let pushed = self.ring.push_slice(rest);
            rest = &rest[pushed..];

            while self.ring.occupied_len() >= self.chunk_size {
                let mut chunk = vec![0.0; self.chunk_size];
                self.ring.pop_slice(&mut chunk);
                chunks.push(PcmChunk::new(chunk, self.sample_rate, CHANNELS));
            }
        }

        chunks
    }

    /// Anzahl gepufferter Samples, die noch keinen vollen Chunk ergeben
    pub fn pending(&self) -> usize {
        self.ring.occupied_len()
    }
}

// ============================================================================
// CAPTURE SERVICE
// ============================================================================

/// Mikrofon-Aufnahme mit Zugriffs-Zustandsmaschine
pub struct CaptureService {
    backend: Box<dyn CaptureBackend>,
    graph: Option<Box<dyn CaptureGraph>>,
    secure_context: bool,
    sink: ChunkSink,
    state: MicAccessState,
    is_recording: bool,
    last_error: Option<CaptureError>,
    event_tx: broadcast::Sender<CaptureEvent>,
}

impl CaptureService {
    /// Erstellt einen neuen CaptureService
    ///
    /// `secure_context` entscheidet, ob überhaupt Mikrofonzugriff angefragt werden darf.
    pub fn new(backend: Box<dyn CaptureBackend>, secure_context: bool, sink: ChunkSink) -> Self {
        let (event_tx, _) = broadcast::channel(16);

        Self {
            backend,
            graph: None,
            secure_context,
            sink,
            state: MicAccessState::Initial,
            is_recording: false,
            last_error: None,
            event_tx,
        }
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<CaptureEvent> {
        self.event_tx.subscribe()
    }

    pub fn state(&self) -> MicAccessState {
        self.state
    }

    pub fn is_recording(&self) -> bool {
        self.is_recording
    }

    pub fn last_error(&self) -> Option<&CaptureError> {
        self.last_error.as_ref()
    }

    /// Startet die Aufnahme
    ///
    /// Fragt beim ersten Aufruf (bzw. nach einem Fehler) den Mikrofonzugriff an.
    /// Danach wird der bestehende Graph nur fortgesetzt.
    pub fn start_recording(&mut self) -> Result<(), CaptureError> {
        if self.state != MicAccessState::Granted {
            self.set_state(MicAccessState::Loading);

            match self.acquire() {
                Ok(graph) => {
                    tracing::info!(
                        "Microphone access granted: {} Hz, {} channel(s), {} samples per chunk",
                        TARGET_SAMPLE_RATE,
                        CHANNELS,
                        CHUNK_SIZE
                    );
                    self.graph = Some(graph);
                    self.last_error = None;
                    self.set_state(MicAccessState::Granted);
                }
                Err(e) => {
                    tracing::error!("Microphone access failed: {}", e);
                    self.last_error = Some(e.clone());
                    self.set_state(MicAccessState::Error);
                    return Err(e);
                }
            }
        }

        if self.is_recording {
            return Ok(());
        }

        if let Some(graph) = self.graph.as_mut() {
            graph.resume()?;
        }
        self.set_recording(true);
        Ok(())
    }

    /// Pausiert die Aufnahme, Zugriff und Graph bleiben erhalten
    pub fn stop_recording(&mut self) -> Result<(), CaptureError> {
        if !self.is_recording {
            return Ok(());
        }

        if let Some(graph) = self.graph.as_mut() {
            graph.suspend()?;
        }
        self.set_recording(false);
        Ok(())
    }

    fn acquire(&mut self) -> Result<Box<dyn CaptureGraph>, CaptureError> {
        if !self.secure_context {
            return Err(CaptureError::InsecureContext);
        }
        self.backend.open(self.sink.clone())
    }

    fn set_state(&mut self, state: MicAccessState) {
        tracing::debug!("Microphone access state: {:?}", state);
        self.state = state;
        let _ = self.event_tx.send(CaptureEvent::StateChanged(state));
    }

    fn set_recording(&mut self, recording: bool) {
        self.is_recording = recording;
        let _ = self.event_tx.send(CaptureEvent::RecordingChanged(recording));
    }
}

impl std::fmt::Debug for CaptureService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureService")
            .field("state", &self.state)
            .field("is_recording", &self.is_recording)
            .field("last_error", &self.last_error)
            .finish()
    }
}

// ============================================================================
// CPAL CAPTURE
// ============================================================================

/// Capture-Backend auf dem Standard-Mikrofon
pub struct CpalCaptureBackend {
    device: Option<Device>,
}

impl CpalCaptureBackend {
    pub fn new() -> Self {
        let device = cpal::default_host().default_input_device();
        if device.is_none() {
            tracing::warn!("No audio input device found");
        }
        Self { device }
    }
}

impl Default for CpalCaptureBackend {
    fn default() -> Self {
        Self::new()
    }
}

// Device ist nicht auf allen Plattformen Send
unsafe impl Send for CpalCaptureBackend {}

impl CaptureBackend for CpalCaptureBackend {
    fn open(&mut self, sink: ChunkSink) -> Result<Box<dyn CaptureGraph>, CaptureError> {
        let device = self.device.as_ref().ok_or(CaptureError::NoInputDevice)?;

        let config = find_best_input_config(device, TARGET_SAMPLE_RATE)
            .map_err(CaptureError::UnsupportedConfig)?;

        tracing::info!(
            "Building capture stream: {} Hz, {} channels",
            config.sample_rate.0,
            config.channels
        );

        let active = Arc::new(AtomicBool::new(false));
        let active_flag = Arc::clone(&active);
        let channels = config.channels.max(1) as usize;
        // Zustand lebt über alle Callbacks des Streams
        let mut resampler = StreamResampler::new(config.sample_rate.0, TARGET_SAMPLE_RATE);
        let mut assembler = ChunkAssembler::new(CHUNK_SIZE, TARGET_SAMPLE_RATE);

        let stream = device
            .build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    if !active_flag.load(Ordering::Acquire) {
                        return;
                    }

                    let mono = downmix(data, channels);
                    let samples = resampler.process(&mono);

                    for chunk in assembler.push(&samples) {
                        match sink.try_send(chunk) {
                            Ok(()) => {}
                            Err(mpsc::error::TrySendError::Full(_)) => {
                                tracing::warn!("Capture sink full, dropping audio chunk");
                            }
                            Err(mpsc::error::TrySendError::Closed(_)) => return,
                        }
                    }
                },
                |err| {
                    tracing::error!("Audio capture error: {}", err);
                },
                None,
            )
            .map_err(|e| match e {
                BuildStreamError::DeviceNotAvailable => {
                    CaptureError::PermissionDenied("input device not available".to_string())
                }
                other => CaptureError::StreamBuildError(other.to_string()),
            })?;

        Ok(Box::new(CpalCaptureGraph { stream, active }))
    }
}

struct CpalCaptureGraph {
    stream: Stream,
    active: Arc<AtomicBool>,
}

// Stream ist nicht automatisch Send, wird aber nur vom CaptureService angefasst
unsafe impl Send for CpalCaptureGraph {}

impl CaptureGraph for CpalCaptureGraph {
    fn resume(&mut self) -> Result<(), CaptureError> {
        self.stream
            .play()
            .map_err(|e| CaptureError::StreamPlayError(e.to_string()))?;
        self.active.store(true, Ordering::Release);
        Ok(())
    }

    fn suspend(&mut self) -> Result<(), CaptureError> {
        self.active.store(false, Ordering::Release);
        if let Err(e) = self.stream.pause() {
            // Nicht jeder Host unterstützt pause(); das Flag hält die Chunks trotzdem zurück
            tracing::debug!("Capture stream pause not supported: {}", e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Debug, Default)]
    struct BackendLog {
        opens: usize,
        resumes: usize,
        suspends: usize,
    }

    struct FakeBackend {
        log: Arc<Mutex<BackendLog>>,
        failures: Vec<CaptureError>,
    }

    struct FakeGraph {
        log: Arc<Mutex<BackendLog>>,
    }

    impl CaptureBackend for FakeBackend {
        fn open(&mut self, _sink: ChunkSink) -> Result<Box<dyn CaptureGraph>, CaptureError> {
            self.log.lock().opens += 1;
            if let Some(err) = self.failures.pop() {
                return Err(err);
            }
            Ok(Box::new(FakeGraph {
                log: Arc::clone(&self.log),
            }))
        }
    }

    impl CaptureGraph for FakeGraph {
        fn resume(&mut self) -> Result<(), CaptureError> {
            self.log.lock().resumes += 1;
            Ok(())
        }

        fn suspend(&mut self) -> Result<(), CaptureError> {
            self.log.lock().suspends += 1;
            Ok(())
        }
    }

    fn service(
        secure: bool,
        failures: Vec<CaptureError>,
    ) -> (CaptureService, Arc<Mutex<BackendLog>>) {
        let log = Arc::new(Mutex::new(BackendLog::default()));
        let backend = FakeBackend {
            log: Arc::clone(&log),
            failures,
        };
        let (sink, _rx) = mpsc::channel(8);
        (CaptureService::new(Box::new(backend), secure, sink), log)
    }

    #[test]
    fn test_insecure_context_fails_without_request() {
        let (mut capture, log) = service(false, Vec::new());

        let err = capture.start_recording().unwrap_err();

        assert_eq!(err, CaptureError::InsecureContext);
        assert_eq!(capture.state(), MicAccessState::Error);
        assert_eq!(capture.last_error(), Some(&CaptureError::InsecureContext));
        assert!(!capture.is_recording());
        assert_eq!(log.lock().opens, 0);
    }

    #[test]
    fn test_permission_denied_sets_error_state() {
        let denied = CaptureError::PermissionDenied("blocked".to_string());
        let (mut capture, _log) = service(true, vec![denied.clone()]);

        assert_eq!(capture.start_recording(), Err(denied));
        assert_eq!(capture.state(), MicAccessState::Error);
        assert!(!capture.is_recording());
    }

    #[test]
    fn test_grant_starts_recording() {
        let (mut capture, log) = service(true, Vec::new());
        assert_eq!(capture.state(), MicAccessState::Initial);

        capture.start_recording().unwrap();

        assert_eq!(capture.state(), MicAccessState::Granted);
        assert!(capture.is_recording());
        assert_eq!(log.lock().opens, 1);
        assert_eq!(log.lock().resumes, 1);
    }

    #[test]
    fn test_toggle_reuses_graph() {
        let (mut capture, log) = service(true, Vec::new());

        capture.start_recording().unwrap();
        capture.stop_recording().unwrap();
        assert!(!capture.is_recording());
        assert_eq!(capture.state(), MicAccessState::Granted);

        capture.start_recording().unwrap();
        assert!(capture.is_recording());

        let log = log.lock();
        assert_eq!(log.opens, 1);
        assert_eq!(log.resumes, 2);
        assert_eq!(log.suspends, 1);
    }

    #[test]
    fn test_retry_after_error() {
        let (mut capture, log) = service(true, vec![CaptureError::NoInputDevice]);

        assert!(capture.start_recording().is_err());
        capture.start_recording().unwrap();

        assert_eq!(capture.state(), MicAccessState::Granted);
        assert!(capture.last_error().is_none());
        assert_eq!(log.lock().opens, 2);
    }

    #[test]
    fn test_state_events() {
        let (mut capture, _log) = service(true, Vec::new());
        let mut events = capture.subscribe();

        capture.start_recording().unwrap();

        assert!(matches!(
            events.try_recv(),
            Ok(CaptureEvent::StateChanged(MicAccessState::Loading))
        ));
        assert!(matches!(
            events.try_recv(),
            Ok(CaptureEvent::StateChanged(MicAccessState::Granted))
        ));
        assert!(matches!(
            events.try_recv(),
            Ok(CaptureEvent::RecordingChanged(true))
        ));
    }

    #[test]
    fn test_stop_without_start_is_noop() {
        let (mut capture, log) = service(true, Vec::new());
        capture.stop_recording().unwrap();
        assert_eq!(capture.state(), MicAccessState::Initial);
        assert_eq!(log.lock().suspends, 0);
    }

    #[test]
    fn test_assembler_emits_fixed_chunks_in_order() {
        let mut assembler = ChunkAssembler::new(CHUNK_SIZE, TARGET_SAMPLE_RATE);
        let samples: Vec<f32> = (0..1600).map(|i| i as f32).collect();

        let mut chunks = assembler.push(&samples[..1000]);
        assert_eq!(chunks.len(), 1);
        assert_eq!(assembler.pending(), 1000 - CHUNK_SIZE);

        chunks.extend(assembler.push(&samples[1000..]));
        assert_eq!(chunks.len(), 3);
        assert_eq!(assembler.pending(), 1600 - 3 * CHUNK_SIZE);

        for (n, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.samples.len(), CHUNK_SIZE);
            assert_eq!(chunk.sample_rate, TARGET_SAMPLE_RATE);
            assert_eq!(chunk.channel_count, CHANNELS);
            assert_eq!(chunk.samples[0], (n * CHUNK_SIZE) as f32);
        }
    }

    #[test]
    fn test_assembler_handles_input_larger_than_ring() {
        let mut assembler = ChunkAssembler::new(CHUNK_SIZE, TARGET_SAMPLE_RATE);
        let chunks = assembler.push(&vec![0.0; RING_BUFFER_SIZE * 3]);
        assert_eq!(chunks.len(), RING_BUFFER_SIZE * 3 / CHUNK_SIZE);
        assert_eq!(assembler.pending(), 0);
    }
}
