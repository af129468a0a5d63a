use std::{
    collections::BTreeMap,
    f32::consts::PI,
    fmt,
    sync::{Arc, Mutex},
};

use realfft::{num_complex::Complex32, RealFftPlanner, RealToComplex};
use serde::{Deserialize, Serialize};

use crate::{
    audio::{self, InputSource},
    config::AnalysisConfig,
    LightSyncError, Result,
};

const BASS_BAND_HZ: (f32, f32) = (20.0, 250.0);
const MID_BAND_HZ: (f32, f32) = (250.0, 4_000.0);
const ONSET_FLOOR: f32 = 1e-3;
const ONSET_THRESHOLD_SIGMA: f32 = 1.5;
const ONSET_CONTEXT_SECONDS: f32 = 1.0;
const MIN_BEAT_INTERVAL: f32 = 0.25;
const TEMPO_BIN_SECONDS: f32 = 0.01;
const TEMPO_RANGE_BPM: (f32, f32) = (70.0, 180.0);
const LOUD_AMPLITUDE: f32 = 0.1;

/// Band energies and amplitude for one analysis window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct FrequencySlice {
    /// Start of the window in seconds.
    pub timestamp: f32,
    pub bass: f32,
    pub mid: f32,
    pub treble: f32,
    /// RMS amplitude of the raw window, zero when under the noise floor.
    pub amplitude: f32,
}

/// Coarse, rule-based mood label derived from tempo and loudness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mood {
    Calm,
    Dramatic,
    Relaxed,
    Happy,
    Energetic,
    Intense,
}

impl Mood {
    /// Slow (<90 BPM), moderate (90-130) and fast (>130) tempo buckets are
    /// split by whether the mean amplitude reaches the loudness threshold.
    pub fn classify(bpm: Option<f32>, mean_amplitude: f32) -> Self {
        let loud = mean_amplitude >= LOUD_AMPLITUDE;
        let bpm = bpm.unwrap_or(0.0);
        match (bpm, loud) {
            (b, false) if b < 90.0 => Mood::Calm,
            (b, true) if b < 90.0 => Mood::Dramatic,
            (b, false) if b <= 130.0 => Mood::Relaxed,
            (b, true) if b <= 130.0 => Mood::Happy,
            (_, false) => Mood::Energetic,
            (_, true) => Mood::Intense,
        }
    }
}

impl fmt::Display for Mood {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Mood::Calm => "calm",
            Mood::Dramatic => "dramatic",
            Mood::Relaxed => "relaxed",
            Mood::Happy => "happy",
            Mood::Energetic => "energetic",
            Mood::Intense => "intense",
        };
        f.write_str(label)
    }
}

/// Everything the timeline generator needs to know about a track.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioFeatures {
    pub duration: f32,
    pub sample_rate: u32,
    pub hop_seconds: f32,
    pub slices: Vec<FrequencySlice>,
    pub bpm: Option<f32>,
    pub beats: Vec<f32>,
    pub mood: Mood,
}

impl AudioFeatures {
    /// Mean slice amplitude; 0 for empty features.
    pub fn mean_amplitude(&self) -> f32 {
        if self.slices.is_empty() {
            return 0.0;
        }
        self.slices.iter().map(|s| s.amplitude).sum::<f32>() / self.slices.len() as f32
    }

    /// Loudest slice amplitude; 0 for empty features.
    pub fn peak_amplitude(&self) -> f32 {
        self.slices.iter().map(|s| s.amplitude).fold(0.0, f32::max)
    }

    /// Returns the slice covering `time`, i.e. the last slice starting at or
    /// before it.
    pub fn slice_at(&self, time: f32) -> Option<&FrequencySlice> {
        let index = self.slices.partition_point(|s| s.timestamp <= time);
        if index == 0 {
            self.slices.first()
        } else {
            self.slices.get(index - 1)
        }
    }
}

/// Offline feature extractor. Splits a waveform into overlapping Hann
/// windows, measures band energy per window, then derives beats, tempo and
/// mood from the amplitude envelope.
pub struct AudioAnalyzer {
    config: AnalysisConfig,
    planner: RealFftPlanner<f32>,
}

impl AudioAnalyzer {
    /// Validates `config` and plans the FFT for its window size.
    pub fn new(config: AnalysisConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            planner: RealFftPlanner::new(),
        })
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    /// Decodes a container (WAV, FLAC, MP3, AAC) and analyses it. Payloads
    /// above the configured byte ceiling are rejected before decoding.
    pub fn analyze_bytes(&mut self, bytes: Vec<u8>) -> Result<AudioFeatures> {
        if bytes.len() as u64 > self.config.max_audio_bytes {
            return Err(LightSyncError::input(format!(
                "audio payload of {} bytes exceeds the {} byte limit",
                bytes.len(),
                self.config.max_audio_bytes
            )));
        }
        let decoded = audio::decode(bytes)?;
        self.analyze(&decoded.samples, decoded.sample_rate)
    }

    /// Drains an [`InputSource`] to completion and analyses what it produced.
    pub fn analyze_source(&mut self, source: &mut dyn InputSource) -> Result<AudioFeatures> {
        let collected = Arc::new(Mutex::new(Vec::new()));
        let sink = collected.clone();
        source.on_frame(Box::new(move |frame| {
            if let Ok(mut buffer) = sink.lock() {
                buffer.extend_from_slice(frame);
            }
        }));
        source.start()?;
        source.stop();

        let samples = collected
            .lock()
            .map_err(|_| LightSyncError::msg("input buffer has been poisoned"))?
            .clone();
        self.analyze(&samples, source.sample_rate())
    }

    /// Analyses mono samples at the given sample rate.
    pub fn analyze(&mut self, samples: &[f32], sample_rate: u32) -> Result<AudioFeatures> {
        if samples.is_empty() {
            return Err(LightSyncError::input("analysis requires at least one sample"));
        }
        if sample_rate == 0 {
            return Err(LightSyncError::input("sample rate must be positive"));
        }
        if samples.iter().any(|s| !s.is_finite()) {
            return Err(LightSyncError::input("audio contains non-finite samples"));
        }

        let fft_size = self.config.fft_size;
        let hop = self.config.hop_size;
        let hop_seconds = hop as f32 / sample_rate as f32;
        let duration = samples.len() as f32 / sample_rate as f32;

        let slices = self.compute_slices(samples, sample_rate, fft_size, hop)?;
        let envelope: Vec<f32> = slices.iter().map(|s| s.amplitude).collect();
        let beats = detect_beats(&envelope, hop_seconds)
            .into_iter()
            .map(|index| slices[index].timestamp)
            .collect::<Vec<_>>();
        let bpm = estimate_tempo(&beats, hop_seconds);

        let mean_amplitude = envelope.iter().sum::<f32>() / envelope.len() as f32;
        let mood = Mood::classify(bpm, mean_amplitude);

        tracing::info!(
            duration,
            slices = slices.len(),
            beats = beats.len(),
            bpm,
            %mood,
            "audio analysis complete"
        );

        Ok(AudioFeatures {
            duration,
            sample_rate,
            hop_seconds,
            slices,
            bpm,
            beats,
            mood,
        })
    }

    fn compute_slices(
        &mut self,
        samples: &[f32],
        sample_rate: u32,
        fft_size: usize,
        hop: usize,
    ) -> Result<Vec<FrequencySlice>> {
        let mut fft = FftResources::new(&mut self.planner, fft_size);
        let window: Vec<f32> = (0..fft_size).map(|i| hann_value(i, fft_size)).collect();

        let window_count = if samples.len() <= fft_size {
            1
        } else {
            (samples.len() - fft_size).div_ceil(hop) + 1
        };

        let bin_hz = sample_rate as f32 / fft_size as f32;
        let nyquist = sample_rate as f32 * 0.5;
        // A full-scale sine peaks near fft_size / 4 after Hann windowing.
        let norm = fft_size as f32 / 4.0;
        let noise_floor = self.config.noise_floor;

        let mut slices = Vec::with_capacity(window_count);
        for index in 0..window_count {
            let start = index * hop;
            let end = (start + fft_size).min(samples.len());
            let frame = &samples[start..end];
            let timestamp = start as f32 / sample_rate as f32;

            let amplitude = compute_rms(frame);
            if amplitude < noise_floor {
                slices.push(FrequencySlice {
                    timestamp,
                    ..Default::default()
                });
                continue;
            }

            fft.input.iter_mut().for_each(|v| *v = 0.0);
            for (i, sample) in frame.iter().enumerate() {
                fft.input[i] = sample * window[i];
            }
            fft.plan
                .process_with_scratch(&mut fft.input, &mut fft.spectrum, &mut fft.scratch)
                .map_err(|e| LightSyncError::msg(format!("fft failed: {e}")))?;

            let (mut bass, mut mid, mut treble) = (0.0f32, 0.0f32, 0.0f32);
            for (k, bin) in fft.spectrum.iter().enumerate().skip(1) {
                let freq = k as f32 * bin_hz;
                let power = bin.norm_sqr();
                if (BASS_BAND_HZ.0..BASS_BAND_HZ.1).contains(&freq) {
                    bass += power;
                } else if (MID_BAND_HZ.0..MID_BAND_HZ.1).contains(&freq) {
                    mid += power;
                } else if freq >= MID_BAND_HZ.1 && freq <= nyquist {
                    treble += power;
                }
            }

            slices.push(FrequencySlice {
                timestamp,
                bass: (bass.sqrt() / norm).clamp(0.0, 1.0),
                mid: (mid.sqrt() / norm).clamp(0.0, 1.0),
                treble: (treble.sqrt() / norm).clamp(0.0, 1.0),
                amplitude,
            });
        }

        Ok(slices)
    }
}

impl fmt::Debug for AudioAnalyzer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioAnalyzer")
            .field("config", &self.config)
            .finish()
    }
}

struct FftResources {
    plan: Arc<dyn RealToComplex<f32>>,
    scratch: Vec<Complex32>,
    spectrum: Vec<Complex32>,
    input: Vec<f32>,
}

impl FftResources {
    fn new(planner: &mut RealFftPlanner<f32>, size: usize) -> Self {
        let plan = planner.plan_fft_forward(size);
        Self {
            scratch: plan.make_scratch_vec(),
            spectrum: plan.make_output_vec(),
            input: plan.make_input_vec(),
            plan,
        }
    }
}

/// Peak-picks a smoothed, half-wave rectified onset signal and returns the
/// indices of detected beats.
fn detect_beats(envelope: &[f32], hop_seconds: f32) -> Vec<usize> {
    if envelope.len() < 3 {
        return Vec::new();
    }

    let onset: Vec<f32> = std::iter::once(0.0)
        .chain(envelope.windows(2).map(|w| (w[1] - w[0]).max(0.0)))
        .collect();
    let smoothed: Vec<f32> = (0..onset.len())
        .map(|i| {
            let lo = i.saturating_sub(1);
            let hi = (i + 1).min(onset.len() - 1);
            onset[lo..=hi].iter().sum::<f32>() / (hi - lo + 1) as f32
        })
        .collect();

    let context = ((ONSET_CONTEXT_SECONDS / hop_seconds).ceil() as usize).max(1);
    let min_gap = MIN_BEAT_INTERVAL / hop_seconds;

    let mut beats: Vec<usize> = Vec::new();
    for i in 1..smoothed.len() - 1 {
        let value = smoothed[i];
        if value <= ONSET_FLOOR || value < smoothed[i - 1] || value <= smoothed[i + 1] {
            continue;
        }

        let lo = i.saturating_sub(context);
        let hi = (i + context).min(smoothed.len() - 1);
        let (mean, std_dev) = mean_and_std(&smoothed[lo..=hi]);
        if value <= mean + ONSET_THRESHOLD_SIGMA * std_dev {
            continue;
        }

        match beats.last().copied() {
            Some(last) if ((i - last) as f32) < min_gap => {
                if value > smoothed[last] {
                    if let Some(slot) = beats.last_mut() {
                        *slot = i;
                    }
                }
            }
            _ => beats.push(i),
        }
    }

    beats
}

/// Tempo from the most common inter-beat interval. Histogram bins are never
/// narrower than one hop so grid jitter does not split the mode.
fn estimate_tempo(beats: &[f32], hop_seconds: f32) -> Option<f32> {
    if beats.len() < 2 {
        return None;
    }

    let bin_width = TEMPO_BIN_SECONDS.max(hop_seconds);
    let mut histogram: BTreeMap<u32, Vec<f32>> = BTreeMap::new();
    for pair in beats.windows(2) {
        let interval = pair[1] - pair[0];
        if interval > f32::EPSILON {
            let bin = (interval / bin_width).round() as u32;
            histogram.entry(bin).or_default().push(interval);
        }
    }

    let neighbourhood = |bin: u32| -> Vec<f32> {
        histogram
            .range(bin.saturating_sub(1)..=bin + 1)
            .flat_map(|(_, intervals)| intervals.iter().copied())
            .collect()
    };

    // Ties resolve to the shortest interval because the map iterates in
    // ascending order and only a strictly larger count replaces the mode.
    let mut best: Option<(usize, u32)> = None;
    for &bin in histogram.keys() {
        let count = neighbourhood(bin).len();
        if best.map(|(c, _)| count > c).unwrap_or(true) {
            best = Some((count, bin));
        }
    }

    let (_, mode_bin) = best?;
    let intervals = neighbourhood(mode_bin);
    let modal_interval = intervals.iter().sum::<f32>() / intervals.len() as f32;
    if modal_interval <= f32::EPSILON {
        return None;
    }

    let mut bpm = 60.0 / modal_interval;
    while bpm < TEMPO_RANGE_BPM.0 {
        bpm *= 2.0;
    }
    while bpm > TEMPO_RANGE_BPM.1 {
        bpm /= 2.0;
    }
    Some(bpm)
}

fn mean_and_std(values: &[f32]) -> (f32, f32) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let mean = values.iter().sum::<f32>() / values.len() as f32;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / values.len() as f32;
    (mean, variance.sqrt())
}

fn compute_rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|sample| sample * sample).sum();
    (sum / samples.len() as f32).sqrt()
}

fn hann_value(index: usize, len: usize) -> f32 {
    if len <= 1 {
        return 1.0;
    }

    0.5 - 0.5 * ((2.0 * PI * index as f32) / (len as f32 - 1.0)).cos()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{tests::wav_bytes, DecodedAudio, ReplaySource};

    fn analyzer() -> AudioAnalyzer {
        AudioAnalyzer::new(AnalysisConfig::default()).unwrap()
    }

    /// 80 Hz bursts of 60 ms every `period` seconds.
    fn click_track(sample_rate: u32, seconds: f32, period: f32) -> Vec<f32> {
        let total = (sample_rate as f32 * seconds) as usize;
        let burst = (sample_rate as f32 * 0.06) as usize;
        let step = (sample_rate as f32 * period) as usize;
        (0..total)
            .map(|i| {
                if i % step < burst {
                    (2.0 * PI * 80.0 * i as f32 / sample_rate as f32).sin() * 0.8
                } else {
                    0.0
                }
            })
            .collect()
    }

    #[test]
    fn silent_clip_has_no_beats() {
        let samples = vec![0.0; 44_100 * 10];
        let features = analyzer().analyze(&samples, 44_100).unwrap();

        assert!(features.beats.is_empty());
        assert_eq!(features.bpm, None);
        assert!((features.duration - 10.0).abs() < 1e-3);
        assert!(!features.slices.is_empty());
        assert!(features.slices.iter().all(|s| s.amplitude.abs() < 1e-6));
        assert_eq!(features.mood, Mood::Calm);
    }

    #[test]
    fn slices_follow_the_hop_grid() {
        let samples = vec![0.3; 10_000];
        let features = analyzer().analyze(&samples, 44_100).unwrap();
        let hop = 1024.0 / 44_100.0;

        for (i, slice) in features.slices.iter().enumerate() {
            assert!((slice.timestamp - i as f32 * hop).abs() < 1e-5);
        }
    }

    #[test]
    fn detects_tempo_from_regular_clicks() {
        let samples = click_track(44_100, 8.0, 0.5);
        let features = analyzer().analyze(&samples, 44_100).unwrap();

        assert!(features.beats.len() >= 12, "beats: {:?}", features.beats);
        let bpm = features.bpm.expect("tempo should be detected");
        assert!((bpm - 120.0).abs() < 5.0, "bpm was {bpm}");
        assert!(features.beats.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn tempo_ignores_an_outlier_interval() {
        let mut beats = vec![0.0, 0.1];
        beats.extend((1..12).map(|i| 0.1 + i as f32 * 0.5));
        let bpm = estimate_tempo(&beats, 0.01).unwrap();
        assert!((bpm - 120.0).abs() < 1.0, "bpm was {bpm}");
    }

    #[test]
    fn bass_tone_lands_in_bass_band() {
        let samples: Vec<f32> = (0..44_100)
            .map(|i| (2.0 * PI * 100.0 * i as f32 / 44_100.0).sin())
            .collect();
        let features = analyzer().analyze(&samples, 44_100).unwrap();
        let slice = features.slices[5];

        assert!(slice.bass > 0.5);
        assert!(slice.bass > slice.mid * 5.0);
        assert!(slice.bass > slice.treble * 5.0);
    }

    #[test]
    fn short_clip_produces_single_slice() {
        let features = analyzer().analyze(&[0.5; 100], 44_100).unwrap();
        assert_eq!(features.slices.len(), 1);
    }

    #[test]
    fn rejects_invalid_input() {
        let mut analyzer = analyzer();
        assert!(matches!(
            analyzer.analyze(&[], 44_100).unwrap_err(),
            LightSyncError::Input(_)
        ));
        assert!(analyzer.analyze(&[0.1, f32::NAN], 44_100).is_err());
        assert!(analyzer.analyze(&[0.1; 10], 0).is_err());
    }

    #[test]
    fn analyses_encoded_audio() {
        let samples = click_track(22_050, 4.0, 0.5);
        let features = analyzer().analyze_bytes(wav_bytes(&samples, 22_050)).unwrap();

        assert_eq!(features.sample_rate, 22_050);
        assert!((features.duration - 4.0).abs() < 0.01);
    }

    #[test]
    fn rejects_oversized_payload() {
        let mut analyzer = AudioAnalyzer::new(AnalysisConfig {
            max_audio_bytes: 16,
            ..Default::default()
        })
        .unwrap();
        let err = analyzer.analyze_bytes(vec![0; 17]).unwrap_err();
        assert!(err.to_string().contains("exceeds"));
    }

    #[test]
    fn analyses_replayed_source() {
        let audio = DecodedAudio {
            samples: vec![0.0; 4_410],
            sample_rate: 44_100,
        };
        let mut source = ReplaySource::new(audio, 512);
        let features = analyzer().analyze_source(&mut source).unwrap();
        assert!((features.duration - 0.1).abs() < 1e-4);
    }

    #[test]
    fn mood_buckets() {
        assert_eq!(Mood::classify(None, 0.0), Mood::Calm);
        assert_eq!(Mood::classify(Some(80.0), 0.4), Mood::Dramatic);
        assert_eq!(Mood::classify(Some(110.0), 0.05), Mood::Relaxed);
        assert_eq!(Mood::classify(Some(120.0), 0.3), Mood::Happy);
        assert_eq!(Mood::classify(Some(150.0), 0.02), Mood::Energetic);
        assert_eq!(Mood::classify(Some(170.0), 0.5), Mood::Intense);
    }

    #[test]
    fn slice_lookup_returns_covering_slice() {
        let features = analyzer().analyze(&vec![0.2; 8_192], 44_100).unwrap();
        let hop = features.hop_seconds;
        let slice = features.slice_at(hop * 2.5).unwrap();
        assert!((slice.timestamp - hop * 2.0).abs() < 1e-6);
    }
}
