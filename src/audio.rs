//! Audio decoding and resampling front.
//!
//! Turns files into the mono PCM stream the fingerprint pipeline expects.
//! WAV goes through hound and FLAC through claxon, both in-process; every
//! other container is handed to an ffmpeg subprocess.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("WAV decode error: {0}")]
    Wav(String),
    #[error("FLAC decode error: {0}")]
    Flac(String),
    #[error("ffmpeg not found — required for {0} files")]
    FfmpegNotFound(String),
    #[error("ffmpeg decode error: {0}")]
    Ffmpeg(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Decoded interleaved samples plus their stream parameters.
struct RawAudio {
    samples: Vec<f32>,
    sample_rate: u32,
    channels: usize,
}

/// Load an audio file as mono PCM at `target_rate`.
pub fn load_samples(path: &Path, target_rate: u32) -> Result<Vec<f32>, DecodeError> {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();

    let raw = match ext.as_str() {
        "wav" => load_wav(path)?,
        "flac" => load_flac(path)?,
        _ => load_via_ffmpeg(path, &ext)?,
    };

    let mono = downmix(&raw.samples, raw.channels);
    Ok(resample(&mono, raw.sample_rate, target_rate))
}

fn load_wav(path: &Path) -> Result<RawAudio, DecodeError> {
    let mut reader = hound::WavReader::open(path)
        .map_err(|e| DecodeError::Wav(format!("{}: {}", path.display(), e)))?;
    let spec = reader.spec();

    let samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<Result<_, _>>()
            .map_err(|e| DecodeError::Wav(e.to_string()))?,
        hound::SampleFormat::Int => {
            let scale = 2_f32.powi(spec.bits_per_sample as i32 - 1);
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<Result<_, _>>()
                .map_err(|e| DecodeError::Wav(e.to_string()))?
        }
    };

    Ok(RawAudio {
        samples,
        sample_rate: spec.sample_rate,
        channels: spec.channels as usize,
    })
}

fn load_flac(path: &Path) -> Result<RawAudio, DecodeError> {
    let mut reader = claxon::FlacReader::open(path)
        .map_err(|e| DecodeError::Flac(format!("{}: {}", path.display(), e)))?;

    let info = reader.streaminfo();
    let sample_rate = info.sample_rate;
    let channels = info.channels as usize;
    let scale = 2_f32.powi(info.bits_per_sample as i32 - 1);

    let samples: Vec<f32> = reader
        .samples()
        .map(|s| s.map(|v| v as f32 / scale))
        .collect::<Result<_, _>>()
        .map_err(|e| DecodeError::Flac(format!("{}: {}", path.display(), e)))?;

    Ok(RawAudio {
        samples,
        sample_rate,
        channels,
    })
}

/// Decode anything else by round-tripping through ffmpeg into a scratch
/// WAV. Covers MP3, OGG, M4A, AIFF and whatever else ffmpeg knows.
fn load_via_ffmpeg(path: &Path, ext: &str) -> Result<RawAudio, DecodeError> {
    if Command::new("ffmpeg").arg("-version").output().is_err() {
        return Err(DecodeError::FfmpegNotFound(ext.to_string()));
    }

    let scratch = scratch_wav_path();
    let run = Command::new("ffmpeg")
        .arg("-y")
        .arg("-i")
        .arg(path)
        .args(["-acodec", "pcm_s16le", "-f", "wav"])
        .arg(&scratch)
        .output();

    let decoded = match run {
        Ok(out) if out.status.success() => load_wav(&scratch),
        Ok(out) => Err(DecodeError::Ffmpeg(
            String::from_utf8_lossy(&out.stderr).into_owned(),
        )),
        Err(e) => Err(DecodeError::Io(e)),
    };
    std::fs::remove_file(&scratch).ok();
    decoded
}

/// Scratch names carry the pid plus a sequence number so concurrent
/// workers never hand ffmpeg the same target.
fn scratch_wav_path() -> PathBuf {
    static SEQ: AtomicU64 = AtomicU64::new(0);
    let n = SEQ.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("waveprint-{}-{n}.wav", std::process::id()))
}

/// Average interleaved channels down to mono.
fn downmix(samples: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return samples.to_vec();
    }
    samples
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

/// Resample by averaging each target-rate bucket of source samples.
/// Cheap and alias-prone, but the fingerprint grid tops out well below
/// the Nyquist limit of the target rate.
pub fn resample(mono: &[f32], from: u32, to: u32) -> Vec<f32> {
    if from == to || mono.is_empty() {
        return mono.to_vec();
    }

    let out_len = (mono.len() as u64 * to as u64 / from as u64) as usize;
    let mut out = Vec::with_capacity(out_len);
    for i in 0..out_len {
        let lo = (i as u64 * from as u64 / to as u64) as usize;
        let mut hi = ((i as u64 + 1) * from as u64 / to as u64) as usize;
        if hi <= lo {
            hi = lo + 1;
        }
        let hi = hi.min(mono.len());
        let sum: f32 = mono[lo..hi].iter().sum();
        out.push(sum / (hi - lo) as f32);
    }
    out
}
