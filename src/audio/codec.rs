//! Audio Codec - PCM <-> WAV-Container
//!
//! Der Wire-Container ist ein Standard RIFF/WAVE Layout mit 44 Byte Header
//! (little-endian) gefolgt vom rohen PCM Payload:
//!
//! | Offset | Inhalt                              |
//! |--------|-------------------------------------|
//! | 0..4   | `"RIFF"`                            |
//! | 4..8   | Gesamtgröße - 8                     |
//! | 8..12  | `"WAVE"`                            |
//! | 12..16 | `"fmt "`                            |
//! | 16..20 | 16 (Größe des fmt-Chunks)           |
//! | 20..22 | 1 (PCM)                             |
//! | 22..24 | Kanäle                              |
//! | 24..28 | Sample Rate                         |
//! | 28..32 | Byte Rate                           |
//! | 32..34 | Block Align                         |
//! | 34..36 | Bits pro Sample (16)                |
//! | 36..40 | `"data"`                            |
//! | 40..44 | Payload-Länge in Bytes              |

use super::resample::resample_interleaved;
use byteorder::{ByteOrder, LittleEndian};
use hound::{SampleFormat, WavReader};
use std::io::Cursor;
use thiserror::Error;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Länge des Container-Headers
pub const HEADER_LEN: usize = 44;

/// Bits pro Sample im Uplink
pub const BITS_PER_SAMPLE: u16 = 16;

const BYTES_PER_SAMPLE: u16 = BITS_PER_SAMPLE / 8;
const FORMAT_PCM: u16 = 1;
const FMT_CHUNK_LEN: u32 = 16;

const RIFF_MARKER: &[u8; 4] = b"RIFF";
const WAVE_MARKER: &[u8; 4] = b"WAVE";

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    #[error("Invalid audio format: {0}")]
    InvalidFormat(&'static str),

    #[error("PCM payload of {len} bytes is not a multiple of the {block_align} byte block alignment")]
    MisalignedPayload { len: usize, block_align: u16 },
}

/// Fehler beim Dekodieren eingehender Container (nicht fatal)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Invalid audio container: {0}")]
    InvalidContainer(String),

    #[error("Failed to decode audio: {0}")]
    Malformed(String),
}

// ============================================================================
// PCM CHUNK
// ============================================================================

/// Zusammenhängende PCM Samples (normalisiert, interleaved)
#[derive(Debug, Clone, PartialEq)]
pub struct PcmChunk {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channel_count: u16,
}

impl PcmChunk {
    pub fn new(samples: Vec<f32>, sample_rate: u32, channel_count: u16) -> Self {
        Self {
            samples,
            sample_rate,
            channel_count,
        }
    }

    /// Anzahl der Frames (Samples pro Kanal)
    pub fn frames(&self) -> usize {
        if self.channel_count == 0 {
            return 0;
        }
        self.samples.len() / self.channel_count as usize
    }

    /// Dauer in Sekunden
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / self.sample_rate as f64
    }

    pub fn to_mono(&self) -> Vec<f32> {
        super::resample::downmix(&self.samples, self.channel_count as usize)
    }

    /// Konvertiert zu 16-Bit PCM (little-endian), Werte werden geclamped
    pub fn to_pcm16(&self) -> Vec<u8> {
        let mut bytes = vec![0u8; self.samples.len() * BYTES_PER_SAMPLE as usize];
        for (sample, out) in self
            .samples
            .iter()
            .zip(bytes.chunks_exact_mut(BYTES_PER_SAMPLE as usize))
        {
            let value = (sample.clamp(-1.0, 1.0) * i16::MAX as f32).round() as i16;
            LittleEndian::write_i16(out, value);
        }
        bytes
    }
}

// ============================================================================
// ENCODE
// ============================================================================

/// Verpackt rohe 16-Bit PCM Bytes in einen WAV-Container
///
/// Der Payload wird unverändert hinter den Header kopiert.
pub fn encode(pcm: &[u8], sample_rate: u32, channel_count: u16) -> Result<Vec<u8>, EncodeError> {
    if sample_rate == 0 {
        return Err(EncodeError::InvalidFormat("sample rate must be positive"));
    }
    if channel_count == 0 {
        return Err(EncodeError::InvalidFormat("channel count must be positive"));
    }

    let block_align = channel_count
        .checked_mul(BYTES_PER_SAMPLE)
        .ok_or(EncodeError::InvalidFormat("channel count too large"))?;
    if pcm.len() % block_align as usize != 0 {
        return Err(EncodeError::MisalignedPayload {
            len: pcm.len(),
            block_align,
        });
    }

    let payload_len = u32::try_from(pcm.len())
        .ok()
        .filter(|len| *len <= u32::MAX - (HEADER_LEN as u32 - 8))
        .ok_or(EncodeError::InvalidFormat("payload too large for a RIFF container"))?;
    let byte_rate = sample_rate
        .checked_mul(block_align as u32)
        .ok_or(EncodeError::InvalidFormat("sample rate too large"))?;

    let mut header = [0u8; HEADER_LEN];
    header[0..4].copy_from_slice(RIFF_MARKER);
    LittleEndian::write_u32(&mut header[4..8], HEADER_LEN as u32 - 8 + payload_len);
    header[8..12].copy_from_slice(WAVE_MARKER);
    header[12..16].copy_from_slice(b"fmt ");
    LittleEndian::write_u32(&mut header[16..20], FMT_CHUNK_LEN);
    LittleEndian::write_u16(&mut header[20..22], FORMAT_PCM);
    LittleEndian::write_u16(&mut header[22..24], channel_count);
    LittleEndian::write_u32(&mut header[24..28], sample_rate);
    LittleEndian::write_u32(&mut header[28..32], byte_rate);
    LittleEndian::write_u16(&mut header[32..34], block_align);
    LittleEndian::write_u16(&mut header[34..36], BITS_PER_SAMPLE);
    header[36..40].copy_from_slice(b"data");
    LittleEndian::write_u32(&mut header[40..44], payload_len);

    let mut container = Vec::with_capacity(HEADER_LEN + pcm.len());
    container.extend_from_slice(&header);
    container.extend_from_slice(pcm);
    Ok(container)
}

/// Kodiert einen normalisierten Chunk als 16-Bit Container
pub fn encode_chunk(chunk: &PcmChunk) -> Result<Vec<u8>, EncodeError> {
    encode(&chunk.to_pcm16(), chunk.sample_rate, chunk.channel_count)
}

// ============================================================================
// DECODE
// ============================================================================

/// Liest nur die Sample Rate aus dem Header, ohne Samples zu dekodieren
pub fn decode_header(bytes: &[u8]) -> Result<u32, DecodeError> {
    if bytes.len() < HEADER_LEN {
        return Err(DecodeError::InvalidContainer(format!(
            "expected at least {} header bytes, got {}",
            HEADER_LEN,
            bytes.len()
        )));
    }
    if &bytes[0..4] != RIFF_MARKER {
        return Err(DecodeError::InvalidContainer("missing RIFF marker".to_string()));
    }
    if &bytes[8..12] != WAVE_MARKER {
        return Err(DecodeError::InvalidContainer("missing WAVE marker".to_string()));
    }

    Ok(LittleEndian::read_u32(&bytes[24..28]))
}

/// Vollständiges Dekodieren eines Containers
///
/// Unterstützt Integer-PCM (8/16/24/32 Bit) und 32-Bit Float. Weicht die
/// Rate des Containers von `sample_rate` ab, wird linear resampled.
pub fn decode(bytes: &[u8], sample_rate: u32) -> Result<PcmChunk, DecodeError> {
    let reader =
        WavReader::new(Cursor::new(bytes)).map_err(|e| DecodeError::Malformed(e.to_string()))?;
    let spec = reader.spec();

    let samples: Vec<f32> = match spec.sample_format {
        SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<Result<_, _>>()
            .map_err(|e| DecodeError::Malformed(e.to_string()))?,
        SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample.clamp(1, 32) - 1)) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<Result<_, _>>()
                .map_err(|e| DecodeError::Malformed(e.to_string()))?
        }
    };

    let samples = if sample_rate != 0 && spec.sample_rate != sample_rate {
        resample_interleaved(
            &samples,
            spec.channels as usize,
            spec.sample_rate,
            sample_rate,
        )
    } else {
        samples
    };

    Ok(PcmChunk::new(
        samples,
        if sample_rate != 0 {
            sample_rate
        } else {
            spec.sample_rate
        },
        spec.channels,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pcm16(values: &[i16]) -> Vec<u8> {
        let mut bytes = vec![0u8; values.len() * 2];
        LittleEndian::write_i16_into(values, &mut bytes);
        bytes
    }

    #[test]
    fn test_five_sample_mono_container() {
        let pcm = pcm16(&[0, 1, 2, 3, 4]);
        let container = encode(&pcm, 16000, 1).unwrap();

        assert_eq!(container.len(), 54);
        assert_eq!(decode_header(&container).unwrap(), 16000);
        assert_eq!(&container[44..], &pcm[..]);
    }

    #[test]
    fn test_header_fields() {
        let pcm = pcm16(&[1, -1, 2, -2]);
        let container = encode(&pcm, 22050, 2).unwrap();

        assert_eq!(&container[0..4], b"RIFF");
        assert_eq!(LittleEndian::read_u32(&container[4..8]), 36 + 8);
        assert_eq!(&container[8..16], b"WAVEfmt ");
        assert_eq!(LittleEndian::read_u32(&container[16..20]), 16);
        assert_eq!(LittleEndian::read_u16(&container[20..22]), 1);
        assert_eq!(LittleEndian::read_u16(&container[22..24]), 2);
        assert_eq!(LittleEndian::read_u32(&container[24..28]), 22050);
        assert_eq!(LittleEndian::read_u32(&container[28..32]), 22050 * 4);
        assert_eq!(LittleEndian::read_u16(&container[32..34]), 4);
        assert_eq!(LittleEndian::read_u16(&container[34..36]), 16);
        assert_eq!(&container[36..40], b"data");
        assert_eq!(LittleEndian::read_u32(&container[40..44]), 8);
    }

    #[test]
    fn test_header_peek_matches_encoded_rate() {
        for (rate, channels) in [(8000, 1), (16000, 1), (44100, 2), (48000, 6)] {
            let pcm = vec![0u8; 2 * channels as usize * 10];
            let container = encode(&pcm, rate, channels).unwrap();
            assert_eq!(decode_header(&container).unwrap(), rate);
            assert_eq!(LittleEndian::read_u32(&container[40..44]) as usize, pcm.len());
        }
    }

    #[test]
    fn test_empty_payload_is_valid() {
        let container = encode(&[], 16000, 1).unwrap();
        assert_eq!(container.len(), HEADER_LEN);
        assert_eq!(decode_header(&container).unwrap(), 16000);
    }

    #[test]
    fn test_misaligned_payload_rejected() {
        let err = encode(&[0, 1, 2], 16000, 1).unwrap_err();
        assert_eq!(
            err,
            EncodeError::MisalignedPayload {
                len: 3,
                block_align: 2
            }
        );
        assert!(encode(&[0, 0], 16000, 0).is_err());
        assert!(encode(&[0, 0], 0, 1).is_err());
    }

    #[test]
    fn test_missing_markers_rejected() {
        let mut container = encode(&pcm16(&[1, 2]), 16000, 1).unwrap();

        let mut no_riff = container.clone();
        no_riff[0..4].copy_from_slice(b"RIFX");
        assert!(matches!(
            decode_header(&no_riff),
            Err(DecodeError::InvalidContainer(_))
        ));

        container[8..12].copy_from_slice(b"AVI ");
        assert!(matches!(
            decode_header(&container),
            Err(DecodeError::InvalidContainer(_))
        ));
    }

    #[test]
    fn test_short_input_rejected() {
        assert!(matches!(
            decode_header(b"RIFF"),
            Err(DecodeError::InvalidContainer(_))
        ));
    }

    #[test]
    fn test_decode_normalizes_samples() {
        let container = encode(&pcm16(&[0, 16384, -32768]), 16000, 1).unwrap();
        let chunk = decode(&container, 16000).unwrap();

        assert_eq!(chunk.sample_rate, 16000);
        assert_eq!(chunk.channel_count, 1);
        assert_eq!(chunk.samples, vec![0.0, 0.5, -1.0]);
    }

    fn hound_container<S: hound::Sample + Copy>(
        bits_per_sample: u16,
        sample_format: SampleFormat,
        samples: &[S],
    ) -> Vec<u8> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 24000,
            bits_per_sample,
            sample_format,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            for sample in samples {
                writer.write_sample(*sample).unwrap();
            }
            writer.finalize().unwrap();
        }
        cursor.into_inner()
    }

    #[test]
    fn test_decode_float_container() {
        let container = hound_container(32, SampleFormat::Float, &[0.5f32, -0.25]);
        let chunk = decode(&container, 24000).unwrap();

        assert_eq!(chunk.sample_rate, 24000);
        assert_eq!(chunk.samples, vec![0.5, -0.25]);
    }

    #[test]
    fn test_decode_24_bit_container() {
        let container = hound_container(24, SampleFormat::Int, &[4_194_304i32, -8_388_608]);
        let chunk = decode(&container, 24000).unwrap();

        assert_eq!(chunk.samples, vec![0.5, -1.0]);
    }

    #[test]
    fn test_decode_32_bit_container() {
        let container = hound_container(32, SampleFormat::Int, &[1i32 << 30, i32::MIN]);
        let chunk = decode(&container, 24000).unwrap();

        assert_eq!(chunk.samples, vec![0.5, -1.0]);
    }

    #[test]
    fn test_decode_8_bit_container() {
        // 8-Bit WAV ist unsigned (Mitte 128); hound liefert vorzeichenbehaftete Werte
        let container = hound_container(8, SampleFormat::Int, &[64i8, -128, 0]);
        let chunk = decode(&container, 24000).unwrap();
        assert_eq!(chunk.samples, vec![0.5, -1.0, 0.0]);
    }

    #[test]
    fn test_decode_resamples_to_requested_rate() {
        let container = encode(&pcm16(&[0; 160]), 16000, 1).unwrap();
        let chunk = decode(&container, 8000).unwrap();

        assert_eq!(chunk.sample_rate, 8000);
        assert_eq!(chunk.samples.len(), 80);
    }

    #[test]
    fn test_decode_garbage_is_malformed() {
        let mut container = encode(&pcm16(&[1, 2, 3]), 16000, 1).unwrap();
        // Unbekanntes Format-Tag
        LittleEndian::write_u16(&mut container[20..22], 77);
        assert!(matches!(
            decode(&container, 16000),
            Err(DecodeError::Malformed(_))
        ));
        assert!(decode(b"not a wav file at all", 16000).is_err());
    }

    #[test]
    fn test_chunk_helpers() {
        let chunk = PcmChunk::new(vec![1.0, 0.0, -1.0, 0.0], 4, 2);
        assert_eq!(chunk.frames(), 2);
        assert!((chunk.duration() - 0.5).abs() < f64::EPSILON);
        assert_eq!(chunk.to_mono(), vec![0.5, -0.5]);

        let bytes = chunk.to_pcm16();
        assert_eq!(LittleEndian::read_i16(&bytes[0..2]), i16::MAX);
        assert_eq!(LittleEndian::read_i16(&bytes[4..6]), -i16::MAX);
    }

    #[test]
    fn test_encode_chunk_roundtrip_header() {
        let chunk = PcmChunk::new(vec![0.25; 512], 16000, 1);
        let container = encode_chunk(&chunk).unwrap();
        assert_eq!(container.len(), HEADER_LEN + 1024);
        assert_eq!(decode_header(&container).unwrap(), 16000);
    }
}
