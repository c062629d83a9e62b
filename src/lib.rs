//! # mbrola-rs
//!
//! A Rust library for diphone concatenative speech synthesis with MBROLA
//! voice databases.
//!
//! ## Features
//!
//! - **Diphone synthesis**: pitch-synchronous overlap-add with boundary smoothing
//! - **Flexible database storage**: on-disk, in-memory or zero-copy ROM images
//! - **Streaming channels**: feed phonetic text in pieces and pull samples as they come
//!
//! ## Quick Start
//!
//! ```toml
//! [dependencies]
//! mbrola-rs = "2026.10"
//! ```
//!
//! ```ignore
//! use std::path::PathBuf;
//! use mbrola_rs::{engines::mbrola::MbrolaEngine, SynthesisEngine};
//!
//! let mut engine = MbrolaEngine::new();
//! engine.load_model(&PathBuf::from("voices/fr1/fr1"))?;
//!
//! let result = engine.synthesize("_ 50\nb 60\no 120 50 130\n_ 50\n", None)?;
//! result.write_wav(&PathBuf::from("output.wav"))?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod engines;

use std::path::Path;

/// The result of a synthesis operation.
///
/// Contains 16-bit PCM samples and the sample rate of the output audio.
#[derive(Debug)]
pub struct SynthesisResult {
    /// Mono 16-bit samples
    pub samples: Vec<i16>,
    /// Sample rate of the audio (the voice frequency)
    pub sample_rate: u32,
}

impl SynthesisResult {
    /// Write the audio to a 16-bit PCM WAV file.
    pub fn write_wav(&self, path: &Path) -> Result<(), Box<dyn std::error::Error>> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: self.sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec)?;
        for &sample in &self.samples {
            writer.write_sample(sample)?;
        }
        writer.finalize()?;
        Ok(())
    }

    /// Duration of the audio in seconds.
    pub fn duration_secs(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

/// Common interface for text-to-speech synthesis engines.
///
/// This trait defines the standard operations that all synthesis engines must support.
/// Each engine may have different parameter types for model loading and inference configuration.
pub trait SynthesisEngine {
    /// Parameters for configuring inference behavior (volume, ratios, etc.)
    type SynthesisParams;
    /// Parameters for configuring model loading (phoneme maps, storage, etc.)
    type ModelParams: Default;

    /// Load a model from the specified path using default parameters.
    fn load_model(&mut self, model_path: &Path) -> Result<(), Box<dyn std::error::Error>> {
        self.load_model_with_params(model_path, Self::ModelParams::default())
    }

    /// Load a model from the specified path with custom parameters.
    fn load_model_with_params(
        &mut self,
        model_path: &Path,
        params: Self::ModelParams,
    ) -> Result<(), Box<dyn std::error::Error>>;

    /// Unload the currently loaded model and free associated resources.
    fn unload_model(&mut self);

    /// Synthesize speech from the given phonetic text.
    fn synthesize(
        &mut self,
        text: &str,
        params: Option<Self::SynthesisParams>,
    ) -> Result<SynthesisResult, Box<dyn std::error::Error>>;

    /// Synthesize speech from the given text and write to a WAV file.
    ///
    /// Default implementation calls `synthesize()` then `SynthesisResult::write_wav()`.
    fn synthesize_to_file(
        &mut self,
        text: &str,
        wav_path: &Path,
        params: Option<Self::SynthesisParams>,
    ) -> Result<(), Box<dyn std::error::Error>> {
        self.synthesize(text, params)?.write_wav(wav_path)
    }
}
