//! Einfache Sample-Konvertierung
//!
//! Lineares Resampling und Mono-Downmix. Der Capture-Pfad (Mikrofon zu
//! 16kHz) nutzt den zustandsbehafteten [`StreamResampler`], der Codec
//! resampled ganze Container auf einmal.

/// Lineares Resampling eines Mono-Signals
pub fn resample_linear(data: &[f32], source_rate: u32, target_rate: u32) -> Vec<f32> {
    if source_rate == target_rate || source_rate == 0 || target_rate == 0 {
        return data.to_vec();
    }

    let ratio = target_rate as f64 / source_rate as f64;
    let new_len = (data.len() as f64 * ratio) as usize;
    (0..new_len)
        .map(|i| {
            let src_idx = i as f64 / ratio;
            let idx = src_idx as usize;
            let frac = (src_idx - idx as f64) as f32;
            let s1 = data.get(idx).copied().unwrap_or(0.0);
            let s2 = data.get(idx + 1).copied().unwrap_or(s1);
            s1 + (s2 - s1) * frac
        })
        .collect()
}

/// Resampling von interleaved Multi-Channel Audio (kanalweise)
pub fn resample_interleaved(
    data: &[f32],
    channels: usize,
    source_rate: u32,
    target_rate: u32,
) -> Vec<f32> {
    if channels <= 1 {
        return resample_linear(data, source_rate, target_rate);
    }
    if source_rate == target_rate {
        return data.to_vec();
    }

    let per_channel: Vec<Vec<f32>> = (0..channels)
        .map(|c| {
            let channel: Vec<f32> = data.iter().skip(c).step_by(channels).copied().collect();
            resample_linear(&channel, source_rate, target_rate)
        })
        .collect();

    let frames = per_channel.iter().map(Vec::len).min().unwrap_or(0);
    let mut out = Vec::with_capacity(frames * channels);
    for i in 0..frames {
        for channel in &per_channel {
            out.push(channel[i]);
        }
    }
    out
}

/// Lineares Resampling eines fortlaufenden Mono-Streams
///
/// Die Position des nächsten Output-Samples wird exakt über
/// `produced * source_rate / target_rate` bestimmt. Das letzte Sample jedes
/// Blocks wird behalten, damit über Blockgrenzen hinweg interpoliert wird.
/// Blockweise Verarbeitung liefert dadurch dasselbe Ergebnis wie ein einziger
/// großer Block.
#[derive(Debug, Clone)]
pub struct StreamResampler {
    source_rate: u64,
    target_rate: u64,
    /// Bisher erzeugte Output-Samples
    produced: u64,
    /// Absoluter Input-Index von `last`
    base: u64,
    last: Option<f32>,
}

impl StreamResampler {
    pub fn new(source_rate: u32, target_rate: u32) -> Self {
        Self {
            source_rate: source_rate as u64,
            target_rate: target_rate as u64,
            produced: 0,
            base: 0,
            last: None,
        }
    }

    fn is_passthrough(&self) -> bool {
        self.source_rate == self.target_rate || self.source_rate == 0 || self.target_rate == 0
    }

    /// Verarbeitet den nächsten Block; Output-Positionen, für die noch das
    /// folgende Input-Sample fehlt, kommen mit dem nächsten Block
    pub fn process(&mut self, data: &[f32]) -> Vec<f32> {
        if self.is_passthrough() {
            return data.to_vec();
        }
        let Some(&newest) = data.last() else {
            return Vec::new();
        };

        let (base, last) = (self.base, self.last);
        let carried = usize::from(last.is_some());
        let end = base + (data.len() + carried) as u64;
        let sample = |abs: u64| -> f32 {
            let rel = (abs - base) as usize;
            match (rel.checked_sub(carried), last) {
                (Some(i), _) => data[i],
                (None, Some(last)) => last,
                (None, None) => 0.0,
            }
        };

        let mut out = Vec::with_capacity(
            (data.len() as u64 * self.target_rate / self.source_rate) as usize + 1,
        );
        loop {
            let position = self.produced * self.source_rate;
            let idx = position / self.target_rate;
            if idx + 1 >= end {
                break;
            }
            let frac = (position % self.target_rate) as f32 / self.target_rate as f32;
            let s1 = sample(idx);
            let s2 = sample(idx + 1);
            out.push(s1 + (s2 - s1) * frac);
            self.produced += 1;
        }

        self.base = end - 1;
        self.last = Some(newest);
        out
    }
}

/// Mischt interleaved Audio auf einen Kanal herunter (Mittelwert)
pub fn downmix(data: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return data.to_vec();
    }
    data.chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_rate_is_passthrough() {
        let data = vec![0.1, 0.2, 0.3];
        assert_eq!(resample_linear(&data, 16000, 16000), data);
    }

    #[test]
    fn test_downsample_halves_length() {
        let data: Vec<f32> = (0..480).map(|i| i as f32 / 480.0).collect();
        let out = resample_linear(&data, 48000, 24000);
        assert_eq!(out.len(), 240);
        // Jedes zweite Sample bleibt exakt erhalten
        assert_eq!(out[10], data[20]);
    }

    #[test]
    fn test_upsample_interpolates() {
        let out = resample_linear(&[0.0, 1.0], 8000, 16000);
        assert_eq!(out.len(), 4);
        assert!((out[1] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_interleaved_keeps_channels_apart() {
        // Links konstant 1.0, rechts konstant -1.0
        let data: Vec<f32> = (0..200).map(|i| if i % 2 == 0 { 1.0 } else { -1.0 }).collect();
        let out = resample_interleaved(&data, 2, 16000, 8000);
        assert_eq!(out.len(), 100);
        assert!(out.iter().step_by(2).all(|s| (*s - 1.0).abs() < 1e-6));
        assert!(out.iter().skip(1).step_by(2).all(|s| (*s + 1.0).abs() < 1e-6));
    }

    fn sine(len: usize, rate: u32) -> Vec<f32> {
        (0..len)
            .map(|i| (2.0 * std::f32::consts::PI * 440.0 * i as f32 / rate as f32).sin())
            .collect()
    }

    #[test]
    fn test_stream_blocks_match_whole_signal() {
        let input = sine(44544, 44100);

        let mut whole = StreamResampler::new(44100, 16000);
        let expected = whole.process(&input);

        let mut blocked = StreamResampler::new(44100, 16000);
        let output: Vec<f32> = input
            .chunks(512)
            .flat_map(|block| blocked.process(block))
            .collect();

        assert_eq!(output.len(), expected.len());
        assert_eq!(output, expected);

        // Nur die letzte Position wartet noch auf das nächste Input-Sample
        let ideal = 44544.0 * 16000.0 / 44100.0;
        assert!((output.len() as f64 - ideal).abs() <= 1.0);
    }

    #[test]
    fn test_stream_is_continuous_across_blocks() {
        let input = sine(4800, 48000);
        let mut resampler = StreamResampler::new(48000, 16000);
        let output: Vec<f32> = input
            .chunks(441)
            .flat_map(|block| resampler.process(block))
            .collect();

        // 440Hz bei 16kHz: maximal ~0.18 Unterschied zwischen Nachbarn
        let max_step = output
            .windows(2)
            .map(|w| (w[1] - w[0]).abs())
            .fold(0.0f32, f32::max);
        assert!(max_step < 0.2, "discontinuity of {}", max_step);
        assert_eq!(output.len(), 1600);
    }

    #[test]
    fn test_stream_upsampling_interpolates_over_boundary() {
        let mut resampler = StreamResampler::new(8000, 16000);
        assert_eq!(resampler.process(&[0.0]), Vec::<f32>::new());
        assert_eq!(resampler.process(&[1.0]), vec![0.0, 0.5]);
        assert_eq!(resampler.process(&[]), Vec::<f32>::new());
        assert_eq!(resampler.process(&[0.0]), vec![1.0, 0.5]);
    }

    #[test]
    fn test_stream_same_rate_is_passthrough() {
        let mut resampler = StreamResampler::new(16000, 16000);
        assert_eq!(resampler.process(&[0.1, 0.2]), vec![0.1, 0.2]);
    }

    #[test]
    fn test_downmix_averages_frames() {
        let out = downmix(&[1.0, 0.0, 0.5, 0.5], 2);
        assert_eq!(out, vec![0.5, 0.5]);
    }
}
