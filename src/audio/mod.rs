//! Audio Module - Codec, Aufnahme und Wiedergabe
//!
//! Dieses Modul verwaltet:
//! - WAV-Container für den Wire-Transport (Codec)
//! - Mikrofon Capture mit Zugriffs-Zustandsmaschine
//! - Lückenlose Wiedergabe empfangener Sequenzen

mod capture;
pub mod codec;
mod device;
mod playback;
mod resample;

pub use capture::{
    CaptureBackend, CaptureError, CaptureEvent, CaptureGraph, CaptureService, ChunkAssembler,
    ChunkSink, CpalCaptureBackend, MicAccessState, CHANNELS, CHUNK_SIZE, TARGET_SAMPLE_RATE,
};
pub use codec::{DecodeError, EncodeError, PcmChunk};
pub use playback::{
    AudioError, CpalOutputBackend, OutputBackend, OutputGraph, PlaybackBuffer, PlaybackScheduler,
    SharedPlaybackBuffer, MAX_BUFFER_SECONDS, START_THRESHOLD_SECONDS,
};
