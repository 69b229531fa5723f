//! Log mel filterbank frontend for the embedding model.
//!
//! Matches the Kaldi-style frontend speaker embedding models are trained
//! with: Povey window (hamming^0.85), 25ms frames with 10ms shift,
//! pre-emphasis 0.97, 80 mel bins over 20-7600 Hz, followed by CMVN.
//! Input is mono f32 PCM in `[-1, 1]`.

use std::f64::consts::PI;

/// Mel filterbank extraction parameters.
#[derive(Debug, Clone)]
pub struct FbankConfig {
    /// Input sample rate in Hz.
    pub sample_rate: usize,
    /// Number of mel channels.
    pub num_mels: usize,
    /// Frame length in samples (400 = 25ms @ 16kHz).
    pub frame_length: usize,
    /// Frame shift in samples (160 = 10ms @ 16kHz).
    pub frame_shift: usize,
    /// Pre-emphasis coefficient.
    pub pre_emphasis: f64,
    /// Floor applied to mel energies before the log.
    pub energy_floor: f64,
    /// Low mel-bank cutoff in Hz.
    pub low_freq: f64,
    /// High cutoff; non-positive values are offsets from Nyquist.
    pub high_freq: f64,
}

impl Default for FbankConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            num_mels: 80,
            frame_length: 400,
            frame_shift: 160,
            pre_emphasis: 0.97,
            energy_floor: 1e-10,
            low_freq: 20.0,
            high_freq: -400.0,
        }
    }
}

/// Extracts log mel filterbank features from mono f32 PCM.
///
/// Returns `[num_frames][num_mels]`, or `None` when the input is shorter
/// than a single frame.
pub fn compute_fbank(samples: &[f32], cfg: &FbankConfig) -> Option<Vec<Vec<f32>>> {
    if cfg.frame_shift == 0 || cfg.frame_length == 0 || cfg.num_mels == 0 {
        return None;
    }
    if samples.len() < cfg.frame_length {
        return None;
    }

    let num_frames = (samples.len() - cfg.frame_length) / cfg.frame_shift + 1;
    let fft_size = cfg.frame_length.next_power_of_two();

    let window = povey_window(cfg.frame_length);
    let high_freq = if cfg.high_freq <= 0.0 {
        cfg.sample_rate as f64 / 2.0 + cfg.high_freq
    } else {
        cfg.high_freq
    };
    let bank = mel_bank(cfg.num_mels, fft_size, cfg.sample_rate, cfg.low_freq, high_freq);

    let mut features = Vec::with_capacity(num_frames);
    let mut spectrum = vec![(0.0f64, 0.0f64); fft_size];

    for f in 0..num_frames {
        let offset = f * cfg.frame_shift;
        let mut frame: Vec<f64> = samples[offset..offset + cfg.frame_length]
            .iter()
            .map(|&s| s as f64)
            .collect();

        // DC removal, then per-frame pre-emphasis.
        let mean = frame.iter().sum::<f64>() / frame.len() as f64;
        for v in &mut frame {
            *v -= mean;
        }
        if cfg.pre_emphasis > 0.0 {
            for i in (1..frame.len()).rev() {
                frame[i] -= cfg.pre_emphasis * frame[i - 1];
            }
            frame[0] *= 1.0 - cfg.pre_emphasis;
        }

        // Window, zero-pad, FFT, power spectrum.
        for slot in &mut spectrum {
            *slot = (0.0, 0.0);
        }
        for (i, &v) in frame.iter().enumerate() {
            spectrum[i] = (v * window[i], 0.0);
        }
        fft(&mut spectrum);

        let mut mels = vec![0.0f32; cfg.num_mels];
        for (m, filter) in bank.iter().enumerate() {
            let mut energy = 0.0f64;
            for &(k, w) in filter {
                let (re, im) = spectrum[k];
                energy += w * (re * re + im * im);
            }
            mels[m] = energy.max(cfg.energy_floor).ln() as f32;
        }
        features.push(mels);
    }

    Some(features)
}

/// Cepstral mean and variance normalization, per mel bin.
pub fn cmvn(features: &mut [Vec<f32>]) {
    if features.is_empty() {
        return;
    }
    let num_mels = features[0].len();
    let t = features.len() as f64;

    for m in 0..num_mels {
        let mean = features.iter().map(|f| f[m] as f64).sum::<f64>() / t;
        let var = features
            .iter()
            .map(|f| {
                let d = f[m] as f64 - mean;
                d * d
            })
            .sum::<f64>()
            / t;
        let std = var.sqrt().max(1e-10);
        for f in features.iter_mut() {
            f[m] = ((f[m] as f64 - mean) / std) as f32;
        }
    }
}

/// L2-normalizes a vector in place. Zero vectors are left unchanged.
pub fn l2_normalize(v: &mut [f32]) {
    let norm: f64 = v.iter().map(|&x| (x as f64) * (x as f64)).sum::<f64>().sqrt();
    if norm > 0.0 {
        let scale = (1.0 / norm) as f32;
        for x in v.iter_mut() {
            *x *= scale;
        }
    }
}

/// Povey window: hamming^0.85, as used by Kaldi.
fn povey_window(n: usize) -> Vec<f64> {
    (0..n)
        .map(|i| {
            let hamming = 0.54 - 0.46 * (2.0 * PI * i as f64 / (n - 1) as f64).cos();
            hamming.powf(0.85)
        })
        .collect()
}

fn hz_to_mel(hz: f64) -> f64 {
    2595.0 * (1.0 + hz / 700.0).log10()
}

fn mel_to_hz(mel: f64) -> f64 {
    700.0 * (10.0f64.powf(mel / 2595.0) - 1.0)
}

/// Triangular mel filters as sparse `(bin, weight)` lists.
fn mel_bank(
    num_mels: usize,
    fft_size: usize,
    sample_rate: usize,
    low_freq: f64,
    high_freq: f64,
) -> Vec<Vec<(usize, f64)>> {
    let half_fft = fft_size / 2 + 1;
    let mel_low = hz_to_mel(low_freq);
    let mel_high = hz_to_mel(high_freq);

    // num_mels + 2 equally spaced points on the mel scale, mapped to bins.
    let bins: Vec<usize> = (0..num_mels + 2)
        .map(|i| {
            let mel = mel_low + i as f64 * (mel_high - mel_low) / (num_mels + 1) as f64;
            let bin = (mel_to_hz(mel) * fft_size as f64 / sample_rate as f64).floor() as isize;
            bin.clamp(0, half_fft as isize - 1) as usize
        })
        .collect();

    (0..num_mels)
        .map(|m| {
            let (left, center, right) = (bins[m], bins[m + 1], bins[m + 2]);
            let mut filter = Vec::new();
            if center > left {
                for k in left..=center {
                    filter.push((k, (k - left) as f64 / (center - left) as f64));
                }
            }
            if right > center {
                for k in center..=right {
                    filter.push((k, (right - k) as f64 / (right - center) as f64));
                }
            }
            filter
        })
        .collect()
}

/// In-place radix-2 Cooley-Tukey FFT over `(re, im)` pairs.
/// Length must be a power of two.
fn fft(x: &mut [(f64, f64)]) {
    let n = x.len();
    if n <= 1 {
        return;
    }

    // Bit-reversal permutation.
    let mut j = 0usize;
    for i in 1..n {
        let mut bit = n >> 1;
        while j & bit != 0 {
            j ^= bit;
            bit >>= 1;
        }
        j ^= bit;
        if i < j {
            x.swap(i, j);
        }
    }

    let mut size = 2;
    while size <= n {
        let half = size / 2;
        let angle = -2.0 * PI / size as f64;
        let step = (angle.cos(), angle.sin());
        for start in (0..n).step_by(size) {
            let mut w = (1.0f64, 0.0f64);
            for k in 0..half {
                let (ur, ui) = x[start + k];
                let (vr, vi) = x[start + k + half];
                let tr = w.0 * vr - w.1 * vi;
                let ti = w.0 * vi + w.1 * vr;
                x[start + k] = (ur + tr, ui + ti);
                x[start + k + half] = (ur - tr, ui - ti);
                w = (w.0 * step.0 - w.1 * step.1, w.0 * step.1 + w.1 * step.0);
            }
        }
        size <<= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn too_short_returns_none() {
        let cfg = FbankConfig::default();
        assert!(compute_fbank(&vec![0.0; 100], &cfg).is_none());
    }

    #[test]
    fn silence_frame_count() {
        let cfg = FbankConfig::default();
        // (800 - 400) / 160 + 1 = 3 frames.
        let features = compute_fbank(&vec![0.0; 800], &cfg).unwrap();
        assert_eq!(features.len(), 3);
        assert_eq!(features[0].len(), 80);
    }

    #[test]
    fn tone_produces_varied_energies() {
        let cfg = FbankConfig::default();
        let samples: Vec<f32> = (0..16000)
            .map(|i| {
                let t = i as f64 / 16000.0;
                ((440.0 * 2.0 * PI * t).sin() * 0.9) as f32
            })
            .collect();
        let features = compute_fbank(&samples, &cfg).unwrap();
        // (16000 - 400) / 160 + 1 = 98 frames.
        assert_eq!(features.len(), 98);

        let frame = &features[0];
        assert!(
            frame.windows(2).any(|w| (w[0] - w[1]).abs() > 0.01),
            "tone should produce non-uniform mel energies"
        );
    }

    #[test]
    fn cmvn_zero_mean() {
        let mut features = vec![
            vec![1.0f32, 2.0, 3.0],
            vec![3.0, 4.0, 5.0],
            vec![5.0, 6.0, 7.0],
        ];
        cmvn(&mut features);
        for m in 0..3 {
            let mean: f64 = features.iter().map(|f| f[m] as f64).sum::<f64>() / 3.0;
            assert!(mean.abs() < 1e-5, "mel bin {m} mean should be ~0, got {mean}");
        }
    }

    #[test]
    fn l2_normalize_unit_length() {
        let mut v = vec![3.0f32, 4.0];
        l2_normalize(&mut v);
        let norm: f64 = v.iter().map(|&x| (x as f64) * (x as f64)).sum::<f64>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6);
    }

    #[test]
    fn l2_normalize_zero_vector() {
        let mut v = vec![0.0f32; 4];
        l2_normalize(&mut v);
        assert_eq!(v, vec![0.0; 4]);
    }

    #[test]
    fn fft_impulse() {
        // FFT of an impulse is flat.
        let mut buf = vec![(1.0, 0.0), (0.0, 0.0), (0.0, 0.0), (0.0, 0.0)];
        fft(&mut buf);
        for (re, im) in &buf {
            assert!((re - 1.0).abs() < 1e-10);
            assert!(im.abs() < 1e-10);
        }
    }

    #[test]
    fn fft_parseval() {
        let n = 8;
        let mut buf: Vec<(f64, f64)> = (0..n)
            .map(|i| ((2.0 * PI * i as f64 / n as f64).sin(), 0.0))
            .collect();
        let time_energy: f64 = buf.iter().map(|(r, im)| r * r + im * im).sum();
        fft(&mut buf);
        let freq_energy: f64 = buf.iter().map(|(r, im)| r * r + im * im).sum();
        assert!((time_energy * n as f64 - freq_energy).abs() < 1e-8);
    }

    #[test]
    fn mel_hz_roundtrip() {
        for &hz in &[0.0, 100.0, 440.0, 1000.0, 8000.0] {
            let back = mel_to_hz(hz_to_mel(hz));
            assert!((hz - back).abs() < 1e-6);
        }
    }
}
