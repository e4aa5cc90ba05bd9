//! Playback Scheduler - lückenlose Wiedergabe empfangener Audio-Chunks
//!
//! Chunks kommen in unregelmäßigen Abständen über das Netzwerk an. Der
//! Scheduler sammelt sie in einem rollenden Buffer, startet die Wiedergabe
//! erst nach einem Vorlauf von 0.8s und erkennt das Ende einer Sequenz über
//! einen einzelnen Reset-Timer, der bei jedem Chunk neu gesetzt wird.
//!
//! Der Output-Graph (cpal Stream) liest direkt aus dem geteilten Buffer.

use super::codec::PcmChunk;
use super::device::find_best_output_config;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, Stream};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};

// ============================================================================
// CONSTANTS
// ============================================================================

/// Maximale Länge des Playback-Buffers in Sekunden
pub const MAX_BUFFER_SECONDS: u32 = 120;

/// Vorlauf, bevor eine Sequenz zu spielen beginnt
pub const START_THRESHOLD_SECONDS: f64 = 0.8;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AudioError {
    #[error("No audio output device found")]
    NoOutputDevice,

    #[error("Unsupported audio configuration: {0}")]
    UnsupportedConfig(String),

    #[error("Failed to build audio stream: {0}")]
    StreamBuildError(String),

    #[error("Failed to start audio stream: {0}")]
    StreamPlayError(String),

    #[error("Output graph already stopped")]
    AlreadyStopped,
}

// ============================================================================
// PLAYBACK BUFFER
// ============================================================================

/// Mono Float-Buffer einer Sequenz
///
/// `offset` ist die Schreibposition, `cursor` die Leseposition des
/// Output-Graphen. Die Kapazität ist auf [`MAX_BUFFER_SECONDS`] begrenzt.
#[derive(Debug)]
pub struct PlaybackBuffer {
    samples: Vec<f32>,
    capacity: usize,
    sample_rate: u32,
    cursor: usize,
}

pub type SharedPlaybackBuffer = Arc<Mutex<PlaybackBuffer>>;

impl PlaybackBuffer {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            samples: Vec::new(),
            capacity: MAX_BUFFER_SECONDS as usize * sample_rate as usize,
            sample_rate,
            cursor: 0,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Schreibposition in Samples
    pub fn offset(&self) -> usize {
        self.samples.len()
    }

    pub fn remaining_capacity(&self) -> usize {
        self.capacity - self.samples.len()
    }

    /// Hängt Samples an, gibt die Anzahl tatsächlich geschriebener Samples zurück
    pub fn append(&mut self, samples: &[f32]) -> usize {
        let count = samples.len().min(self.remaining_capacity());
        self.samples.extend_from_slice(&samples[..count]);
        count
    }

    /// Sample `ahead` Positionen hinter dem Cursor (Stille falls noch nicht geschrieben)
    pub fn peek(&self, ahead: usize) -> f32 {
        self.samples
            .get(self.cursor + ahead)
            .copied()
            .unwrap_or(0.0)
    }

    /// Bewegt den Lese-Cursor, höchstens bis zur Schreibposition
    pub fn advance(&mut self, count: usize) {
        self.cursor = (self.cursor + count).min(self.samples.len());
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }
}

// ============================================================================
// OUTPUT GRAPH
// ============================================================================

/// Erzeugt Output-Graphen für einen Buffer
pub trait OutputBackend: Send {
    /// Baut einen neuen Graphen mit der Sample Rate des Buffers
    fn create(&mut self, buffer: SharedPlaybackBuffer) -> Result<Box<dyn OutputGraph>, AudioError>;
}

/// Ein lebender Output-Graph; Drop zerstört ihn
pub trait OutputGraph: Send {
    /// Startet die Wiedergabe ab Buffer-Anfang
    fn start(&mut self) -> Result<(), AudioError>;

    /// Stoppt die Wiedergabe. Liefert [`AudioError::AlreadyStopped`] wenn nicht gestartet.
    fn stop(&mut self) -> Result<(), AudioError>;
}

// ============================================================================
// SCHEDULER
// ============================================================================

struct SchedulerState {
    backend: Box<dyn OutputBackend>,
    graph: Option<Box<dyn OutputGraph>>,
    buffer: SharedPlaybackBuffer,
    sample_rate: u32,
    sequence_duration: f64,
    sequence_start: Option<Instant>,
    playing: bool,
    /// Wird bei jedem Arm/Cancel erhöht; veraltete Timer ignorieren sich selbst
    generation: u64,
    reset_timer: Option<JoinHandle<()>>,
}

impl SchedulerState {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.reset_timer.take() {
            timer.abort();
        }
        self.generation = self.generation.wrapping_add(1);
    }

    /// Stoppt und zerstört den aktuellen Graphen und leert die Sequenz
    fn teardown(&mut self) {
        self.cancel_timer();

        if let Some(mut graph) = self.graph.take() {
            match graph.stop() {
                Ok(()) | Err(AudioError::AlreadyStopped) => {}
                Err(e) => tracing::warn!("Failed to stop output graph: {}", e),
            }
        }

        self.playing = false;
        self.sequence_duration = 0.0;
        self.sequence_start = None;
    }

    /// Baut Buffer und Graph neu auf (alter Graph wird vorher zerstört)
    fn rebuild(&mut self, sample_rate: u32) -> Result<(), AudioError> {
        self.teardown();

        self.sample_rate = sample_rate;
        self.buffer = Arc::new(Mutex::new(PlaybackBuffer::new(sample_rate)));
        self.graph = Some(self.backend.create(Arc::clone(&self.buffer))?);
        Ok(())
    }

    fn reset(&mut self) -> Result<(), AudioError> {
        let sample_rate = self.sample_rate;
        self.rebuild(sample_rate)
    }

    fn start_playback(&mut self, now: Instant) -> Result<(), AudioError> {
        let graph = self.graph.as_mut().ok_or(AudioError::NoOutputDevice)?;
        graph.start()?;
        self.sequence_start = Some(now);
        self.playing = true;
        Ok(())
    }

    /// Zeit bis der gepufferte Audio-Inhalt aufgebraucht ist
    fn remaining(&self, now: Instant) -> Duration {
        let elapsed = self
            .sequence_start
            .map(|start| now.saturating_duration_since(start).as_secs_f64())
            .unwrap_or(0.0);
        Duration::from_secs_f64((self.sequence_duration - elapsed).max(0.0))
    }
}

/// Scheduler für die Wiedergabe eingehender Audio-Sequenzen
///
/// Der Handle ist billig klonbar; alle Klone teilen denselben Zustand.
#[derive(Clone)]
pub struct PlaybackScheduler {
    inner: Arc<Mutex<SchedulerState>>,
}

impl PlaybackScheduler {
    /// Erstellt einen Scheduler mit einem Output-Graphen für `sample_rate`
    pub fn new(
        mut backend: Box<dyn OutputBackend>,
        sample_rate: u32,
    ) -> Result<Self, AudioError> {
        let buffer = Arc::new(Mutex::new(PlaybackBuffer::new(sample_rate)));
        let graph = backend.create(Arc::clone(&buffer))?;

        tracing::info!("PlaybackScheduler initialized: {}Hz", sample_rate);

        Ok(Self {
            inner: Arc::new(Mutex::new(SchedulerState {
                backend,
                graph: Some(graph),
                buffer,
                sample_rate,
                sequence_duration: 0.0,
                sequence_start: None,
                playing: false,
                generation: 0,
                reset_timer: None,
            })),
        })
    }

    /// Reiht einen Chunk in die laufende Sequenz ein
    ///
    /// Muss innerhalb einer Tokio-Runtime aufgerufen werden (Reset-Timer).
    pub fn play(&self, chunk: &PcmChunk) -> Result<(), AudioError> {
        if chunk.sample_rate == 0 || chunk.channel_count == 0 {
            tracing::warn!("Ignoring audio chunk without sample rate or channels");
            return Ok(());
        }

        let mut state = self.inner.lock();

        if chunk.sample_rate != state.sample_rate || state.graph.is_none() {
            tracing::info!(
                "Rebuilding playback graph: {} Hz -> {} Hz",
                state.sample_rate,
                chunk.sample_rate
            );
            state.rebuild(chunk.sample_rate)?;
        }

        let samples = chunk.to_mono();
        if state.buffer.lock().remaining_capacity() < samples.len() {
            tracing::warn!("Playback buffer full, resetting sequence");
            state.reset()?;
        }

        let written = state.buffer.lock().append(&samples);
        if written < samples.len() {
            tracing::warn!(
                "Dropped {} samples exceeding playback buffer capacity",
                samples.len() - written
            );
        }

        state.cancel_timer();
        let rate = state.sample_rate as f64;
        state.sequence_duration += written as f64 / rate;

        let now = Instant::now();
        if state.sequence_start.is_none() {
            if state.sequence_duration < START_THRESHOLD_SECONDS {
                return Ok(());
            }
            tracing::debug!(
                "Starting playback after {:.3}s of buffered audio",
                state.sequence_duration
            );
            state.start_playback(now)?;
        }

        let remaining = state.remaining(now);
        let generation = state.generation;
        let inner = Arc::clone(&self.inner);
        state.reset_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(remaining).await;

            let mut state = inner.lock();
            if state.generation != generation {
                tracing::trace!("Ignoring stale playback reset timer");
                return;
            }
            tracing::debug!("Playback sequence finished");
            if let Err(e) = state.reset() {
                tracing::error!("Failed to reset playback: {}", e);
            }
        }));

        Ok(())
    }

    /// Verwirft die aktuelle Sequenz und baut einen frischen Graphen auf
    pub fn reset(&self) -> Result<(), AudioError> {
        self.inner.lock().reset()
    }

    /// Bricht die Wiedergabe sofort ab (Barge-in)
    pub fn interrupt(&self) {
        let mut state = self.inner.lock();
        state.cancel_timer();
        if let Err(e) = state.reset() {
            tracing::error!("Failed to reset playback after interrupt: {}", e);
        }
    }

    /// Schreibposition des aktuellen Buffers in Samples
    pub fn offset(&self) -> usize {
        self.inner.lock().buffer.lock().offset()
    }

    pub fn sample_rate(&self) -> u32 {
        self.inner.lock().sample_rate
    }

    /// Gepufferte Dauer der aktuellen Sequenz in Sekunden
    pub fn sequence_duration(&self) -> f64 {
        self.inner.lock().sequence_duration
    }

    pub fn is_playing(&self) -> bool {
        self.inner.lock().playing
    }
}

impl Drop for SchedulerState {
    fn drop(&mut self) {
        if let Some(timer) = self.reset_timer.take() {
            timer.abort();
        }
    }
}

impl std::fmt::Debug for PlaybackScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("PlaybackScheduler")
            .field("sample_rate", &state.sample_rate)
            .field("sequence_duration", &state.sequence_duration)
            .field("playing", &state.playing)
            .finish()
    }
}

// ============================================================================
// CPAL OUTPUT
// ============================================================================

/// Output-Backend auf dem Standard-Lautsprecher
pub struct CpalOutputBackend {
    device: Option<Device>,
}

impl CpalOutputBackend {
    pub fn new() -> Self {
        let device = cpal::default_host().default_output_device();
        if device.is_none() {
            tracing::warn!("No audio output device found");
        }
        Self { device }
    }
}

impl Default for CpalOutputBackend {
    fn default() -> Self {
        Self::new()
    }
}

// Device ist nicht auf allen Plattformen Send
unsafe impl Send for CpalOutputBackend {}

impl OutputBackend for CpalOutputBackend {
    fn create(&mut self, buffer: SharedPlaybackBuffer) -> Result<Box<dyn OutputGraph>, AudioError> {
        let device = self.device.as_ref().ok_or(AudioError::NoOutputDevice)?;

        let source_rate = buffer.lock().sample_rate();
        let config =
            find_best_output_config(device, source_rate).map_err(AudioError::UnsupportedConfig)?;

        tracing::debug!(
            "Building playback stream: buffer {} Hz, device {} Hz, {} channels",
            source_rate,
            config.sample_rate.0,
            config.channels
        );

        let playing = Arc::new(AtomicBool::new(false));
        let playing_flag = Arc::clone(&playing);
        let channels = config.channels.max(1) as usize;
        let step = source_rate as f64 / config.sample_rate.0 as f64;
        let mut phase = 0.0f64;

        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    if !playing_flag.load(Ordering::Acquire) {
                        data.fill(0.0);
                        return;
                    }

                    let mut buffer = buffer.lock();
                    for frame in data.chunks_mut(channels) {
                        // Linear zwischen den beiden nächsten Buffer-Samples interpolieren
                        let s1 = buffer.peek(0);
                        let s2 = buffer.peek(1);
                        let sample = s1 + (s2 - s1) * phase as f32;

                        phase += step;
                        let whole = phase.floor();
                        phase -= whole;
                        buffer.advance(whole as usize);

                        frame.fill(sample);
                    }
                },
                |err| {
                    tracing::error!("Audio playback error: {}", err);
                },
                None,
            )
            .map_err(|e| AudioError::StreamBuildError(e.to_string()))?;

        stream
            .play()
            .map_err(|e| AudioError::StreamPlayError(e.to_string()))?;

        Ok(Box::new(CpalOutputGraph {
            _stream: stream,
            playing,
        }))
    }
}

/// Output-Graph auf einem cpal Stream; bis `start()` wird Stille ausgegeben
struct CpalOutputGraph {
    _stream: Stream,
    playing: Arc<AtomicBool>,
}

// Stream ist nicht automatisch Send, wird aber nur unter dem Scheduler-Lock angefasst
unsafe impl Send for CpalOutputGraph {}

impl OutputGraph for CpalOutputGraph {
    fn start(&mut self) -> Result<(), AudioError> {
        self.playing.store(true, Ordering::Release);
        Ok(())
    }

    fn stop(&mut self) -> Result<(), AudioError> {
        if !self.playing.swap(false, Ordering::AcqRel) {
            return Err(AudioError::AlreadyStopped);
        }
        Ok(())
    }
}
