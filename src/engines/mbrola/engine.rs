use std::path::{Path, PathBuf};

use crate::{SynthesisEngine, SynthesisResult};

use super::channels::Channel;
use super::config::{MbrolaInferenceParams, MbrolaModelParams};
use super::model::{MbrolaError, MbrolaModel};

/// Diphone synthesis engine.
///
/// Input is phonetic text in the `.pho` format: one phone per line with its
/// duration in milliseconds and optional pitch targets.
///
/// # Quick Start
///
/// ```rust,no_run
/// use mbrola_rs::{SynthesisEngine, engines::mbrola::MbrolaEngine};
/// use std::path::PathBuf;
///
/// let mut engine = MbrolaEngine::new();
/// engine.load_model(&PathBuf::from("voices/fr1/fr1"))?;
/// let result = engine.synthesize("_ 50\nb 60\no 120 50 130\n_ 50\n", None)?;
/// result.write_wav(&PathBuf::from("bo.wav"))?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
///
/// # Streaming
///
/// ```rust,no_run
/// use mbrola_rs::{SynthesisEngine, engines::mbrola::MbrolaEngine};
/// use std::path::PathBuf;
///
/// let mut engine = MbrolaEngine::new();
/// engine.load_model(&PathBuf::from("voices/fr1/fr1"))?;
/// let mut channel = engine.open_stream(None)?;
/// channel.write_pho("_ 50\nb 60\no 120 50 130\n");
/// channel.flush();
/// let mut buffer = [0i16; 1024];
/// while channel.read(&mut buffer)? == buffer.len() {}
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub struct MbrolaEngine {
    model: Option<MbrolaModel>,
    model_path: Option<PathBuf>,
    defaults: MbrolaInferenceParams,
}

impl Default for MbrolaEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MbrolaEngine {
    pub fn new() -> Self {
        Self {
            model: None,
            model_path: None,
            defaults: MbrolaInferenceParams::default(),
        }
    }

    /// Engine whose requests without explicit parameters use `defaults`.
    pub fn with_defaults(defaults: MbrolaInferenceParams) -> Self {
        Self {
            model: None,
            model_path: None,
            defaults,
        }
    }

    pub fn model(&self) -> Option<&MbrolaModel> {
        self.model.as_ref()
    }

    pub fn model_path(&self) -> Option<&Path> {
        self.model_path.as_deref()
    }

    /// Printable metadata of the loaded database (requires model to be loaded).
    pub fn database_info(&self) -> Vec<String> {
        self.model.as_ref().map(|m| m.info()).unwrap_or_default()
    }

    /// Open a streaming channel on the loaded voice.
    pub fn open_stream(
        &self,
        params: Option<MbrolaInferenceParams>,
    ) -> Result<Channel<'static>, MbrolaError> {
        let model = self.model.as_ref().ok_or(MbrolaError::ModelNotLoaded)?;
        model.open_channel(params.as_ref().unwrap_or(&self.defaults))
    }
}

impl Drop for MbrolaEngine {
    fn drop(&mut self) {
        self.unload_model();
    }
}

impl SynthesisEngine for MbrolaEngine {
    type SynthesisParams = MbrolaInferenceParams;
    type ModelParams = MbrolaModelParams;

    fn load_model_with_params(
        &mut self,
        model_path: &Path,
        params: Self::ModelParams,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let model = MbrolaModel::load(model_path, &params)?;
        self.model = Some(model);
        self.model_path = Some(model_path.to_path_buf());
        Ok(())
    }

    fn unload_model(&mut self) {
        self.model = None;
        self.model_path = None;
    }

    fn synthesize(
        &mut self,
        text: &str,
        params: Option<Self::SynthesisParams>,
    ) -> Result<SynthesisResult, Box<dyn std::error::Error>> {
        let model = self.model.as_ref().ok_or(MbrolaError::ModelNotLoaded)?;

        let p = params.unwrap_or_else(|| self.defaults.clone());
        let (samples, sample_rate) = model.synthesize_pho(text, &p)?;

        Ok(SynthesisResult {
            samples,
            sample_rate,
        })
    }
}
