//! cpal Geräte-Konfiguration
//!
//! Gemeinsame Auswahl der Stream-Konfiguration für Mikrofon und Lautsprecher.

use cpal::traits::DeviceTrait;
use cpal::{Device, SampleFormat, StreamConfig, SupportedStreamConfigRange};

/// Findet die beste Input-Konfiguration für die Ziel-Rate
pub fn find_best_input_config(device: &Device, target_rate: u32) -> Result<StreamConfig, String> {
    let configs = device.supported_input_configs().map_err(|e| e.to_string())?;
    select_best_config(configs.collect(), target_rate)
        .ok_or_else(|| "No suitable audio input configuration found".to_string())
}

/// Findet die beste Output-Konfiguration für die Ziel-Rate
pub fn find_best_output_config(device: &Device, target_rate: u32) -> Result<StreamConfig, String> {
    let configs = device.supported_output_configs().map_err(|e| e.to_string())?;
    select_best_config(configs.collect(), target_rate)
        .ok_or_else(|| "No suitable audio output configuration found".to_string())
}

/// Wählt die beste Konfiguration aus einer Liste
///
/// Priorität: exakte Ziel-Rate mit F32 > beliebige Rate mit F32 > erste Konfiguration.
pub fn select_best_config(
    configs: Vec<SupportedStreamConfigRange>,
    target_rate: u32,
) -> Option<StreamConfig> {
    let target_rate = cpal::SampleRate(target_rate);

    for config in &configs {
        if config.min_sample_rate() <= target_rate
            && config.max_sample_rate() >= target_rate
            && config.sample_format() == SampleFormat::F32
        {
            return Some(config.with_sample_rate(target_rate).into());
        }
    }

    for config in &configs {
        if config.sample_format() == SampleFormat::F32 {
            return Some(config.with_max_sample_rate().into());
        }
    }

    configs
        .first()
        .map(|config| config.with_max_sample_rate().into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cpal::{SampleRate, SupportedBufferSize};

    fn range(min: u32, max: u32, format: SampleFormat) -> SupportedStreamConfigRange {
        SupportedStreamConfigRange::new(
            2,
            SampleRate(min),
            SampleRate(max),
            SupportedBufferSize::Unknown,
            format,
        )
    }

    #[test]
    fn test_prefers_exact_rate_f32() {
        let configs = vec![
            range(8000, 96000, SampleFormat::I16),
            range(8000, 96000, SampleFormat::F32),
        ];
        let config = select_best_config(configs, 16000).unwrap();
        assert_eq!(config.sample_rate.0, 16000);
    }

    #[test]
    fn test_falls_back_to_max_rate() {
        let configs = vec![range(44100, 48000, SampleFormat::F32)];
        let config = select_best_config(configs, 16000).unwrap();
        assert_eq!(config.sample_rate.0, 48000);
    }

    #[test]
    fn test_empty_list_has_no_config() {
        assert!(select_best_config(Vec::new(), 16000).is_none());
    }
}
