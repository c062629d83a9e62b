use std::path::{Path, PathBuf};

use super::channels::Channel;
use super::config::{MbrolaInferenceParams, MbrolaModelParams, StorageMode};
use super::database::Database;
use super::parser::{InputMode, PhoParser};
use super::synthesizer::Synthesizer;

#[derive(thiserror::Error, Debug)]
pub enum MbrolaError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),
    #[error("database {0} not found")]
    DatabaseNotFound(PathBuf),
    #[error("database version {found} is not supported, expected at most {supported}")]
    Version { found: String, supported: String },
    #[error("malformed database: {0}")]
    Format(String),
    #[error("silence diphone {0}-{0} is missing from the database")]
    NoSilence(String),
    #[error("unsupported coding scheme {0}")]
    UnsupportedCoding(u8),
    #[error("cannot duplicate {left}-{right}: source diphone is missing")]
    DuplicateSourceMissing { left: String, right: String },
    #[error("cannot duplicate into {left}-{right}: diphone already exists")]
    DuplicateExists { left: String, right: String },
    #[error("renaming produces diphone {left}-{right} twice")]
    DuplicateDiphone { left: String, right: String },
    #[error("database is shared by another handle and cannot be edited")]
    DatabaseShared,
    #[error("more than {0} phonemes")]
    TooManyPhonemes(usize),
    #[error("diphone index is full")]
    IndexFull,
    #[error("unknown diphone {left}-{right}")]
    UnknownDiphone { left: String, right: String },
    #[error("{count} samples at offset {offset} fall outside the wave region")]
    WaveOutOfRange { offset: i64, count: usize },
    #[error("pitch pattern degenerate for {left}-{right}, check the pitch targets")]
    PitchDegenerate { left: String, right: String },
    #[error("syntax error on line {line}: {message}")]
    Syntax { line: usize, message: String },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Model not loaded. Call load_model() first.")]
    ModelNotLoaded,
}

impl MbrolaError {
    /// Classic negative error code for callers that work with integers.
    pub fn code(&self) -> i32 {
        match self {
            MbrolaError::IndexFull => -1,
            MbrolaError::Syntax { .. } => -3,
            MbrolaError::InvalidConfig(_) => -4,
            MbrolaError::Wav(_) => -5,
            MbrolaError::DuplicateDiphone { .. } | MbrolaError::DatabaseShared => -6,
            MbrolaError::ModelNotLoaded => -7,
            MbrolaError::PitchDegenerate { .. } => -20,
            MbrolaError::WaveOutOfRange { .. } => -30,
            MbrolaError::Io(_) => -31,
            MbrolaError::DatabaseNotFound(_) => -40,
            MbrolaError::Version { .. } => -41,
            MbrolaError::Format(_) => -42,
            MbrolaError::NoSilence(_) => -43,
            MbrolaError::UnknownDiphone { .. } => -63,
            MbrolaError::DuplicateSourceMissing { .. } | MbrolaError::DuplicateExists { .. } => {
                -64
            }
            MbrolaError::TooManyPhonemes(_) => -65,
            MbrolaError::UnsupportedCoding(_) => -71,
        }
    }
}

pub type MbrolaResult<T> = Result<T, MbrolaError>;

/// A loaded voice: the database after phoneme renaming and cloning.
#[derive(Debug)]
pub struct MbrolaModel {
    database: Database<'static>,
    path: PathBuf,
}

impl MbrolaModel {
    /// Open the database at `path` and apply the rename and clone maps.
    pub fn load(path: &Path, params: &MbrolaModelParams) -> MbrolaResult<Self> {
        log::info!("Loading diphone database from {}", path.display());
        let mut database = match params.storage {
            StorageMode::File => Database::open(path)?,
            StorageMode::Memory => Database::open_in_memory(path)?,
            StorageMode::Rom => {
                let image = std::fs::read(path).map_err(|e| match e.kind() {
                    std::io::ErrorKind::NotFound => {
                        MbrolaError::DatabaseNotFound(path.to_path_buf())
                    }
                    _ => MbrolaError::Io(e),
                })?;
                super::rom::load_owned(&image)?
            }
        };

        if !params.rename.is_empty() {
            database.rename_phonemes(&params.rename)?;
        }
        if !params.clone.is_empty() {
            database.clone_phonemes(&params.clone)?;
        }

        log::info!(
            "Database {} v{}: {} diphones, {} Hz, period {}",
            database.name(),
            database.version(),
            database.index().len(),
            database.sample_rate(),
            database.period()
        );
        for line in database.printable_info() {
            log::debug!("{line}");
        }

        Ok(Self {
            database,
            path: path.to_path_buf(),
        })
    }

    pub fn from_database(database: Database<'static>) -> Self {
        let path = PathBuf::from(database.name());
        Self { database, path }
    }

    pub fn database(&self) -> &Database<'static> {
        &self.database
    }

    pub fn database_mut(&mut self) -> &mut Database<'static> {
        &mut self.database
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Independent handle on the same voice, for another channel.
    pub fn handle(&self) -> MbrolaResult<Database<'static>> {
        self.database.try_clone()
    }

    pub fn info(&self) -> Vec<String> {
        self.database.printable_info().collect()
    }

    /// Synthesize a complete `.pho` document. Returns the samples and their
    /// sample rate.
    pub fn synthesize_pho(
        &self,
        text: &str,
        params: &MbrolaInferenceParams,
    ) -> MbrolaResult<(Vec<i16>, u32)> {
        params.validate()?;
        let mut synthesizer = Synthesizer::new(self.handle()?);
        synthesizer.apply_params(params);
        let mut parser = PhoParser::for_database(synthesizer.database(), InputMode::Document)
            .with_params(params);
        parser.feed(text);

        let mut samples = Vec::new();
        synthesizer.synthesize_all(&mut parser, &mut samples)?;
        let stats = synthesizer.stats();
        log::debug!(
            "Synthesized {} samples from {} diphones ({} missing)",
            samples.len(),
            stats.diphones,
            stats.missing_diphones
        );
        Ok((samples, synthesizer.voice_freq()))
    }

    /// Streaming channel over a fresh handle on this voice.
    pub fn open_channel(&self, params: &MbrolaInferenceParams) -> MbrolaResult<Channel<'static>> {
        params.validate()?;
        Ok(Channel::with_params(self.handle()?, params))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engines::mbrola::builder::{DatabaseBuilder, Segment};
    use crate::engines::mbrola::config::PhonemeMap;
    use crate::engines::mbrola::pitch_marks::FrameType;

    fn voice_file() -> tempfile::NamedTempFile {
        let bytes = DatabaseBuilder::new(16000, 80)
            .segment(Segment::tone("_", "a", &[FrameType::VoicedStable; 4], 160))
            .segment(Segment::tone("a", "_", &[FrameType::VoicedStable; 4], 160))
            .segment(Segment::tone("_", "_", &[FrameType::UnvoicedStable; 2], 80))
            .info("(c) test voice")
            .to_bytes()
            .unwrap();
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), bytes).unwrap();
        file
    }

    #[test]
    fn error_codes_match_the_classic_values() {
        assert_eq!(MbrolaError::NoSilence("_".into()).code(), -43);
        assert_eq!(
            MbrolaError::UnknownDiphone {
                left: "a".into(),
                right: "b".into()
            }
            .code(),
            -63
        );
        assert_eq!(
            MbrolaError::Version {
                found: "9.9".into(),
                supported: "3.4.0".into()
            }
            .code(),
            -41
        );
    }

    #[test]
    fn load_applies_rename_before_clone() {
        let file = voice_file();
        let params = MbrolaModelParams {
            rename: PhonemeMap::parse("a o").unwrap(),
            clone: PhonemeMap::parse("o u").unwrap(),
            ..Default::default()
        };
        let model = MbrolaModel::load(file.path(), &params).unwrap();
        let db = model.database();
        assert!(db.find("_", "a").is_none());
        assert!(db.find("_", "o").is_some());
        assert!(db.find("_", "u").is_some());
        assert_eq!(model.info(), vec!["(c) test voice".to_string()]);
    }

    #[test]
    fn missing_database_reports_its_path() {
        let err = MbrolaModel::load(Path::new("/no/such/voice"), &MbrolaModelParams::default())
            .unwrap_err();
        assert_eq!(err.code(), -40);
    }

    #[test]
    fn synthesis_runs_at_the_voice_frequency() {
        let file = voice_file();
        let model = MbrolaModel::load(file.path(), &MbrolaModelParams::default()).unwrap();
        let params = MbrolaInferenceParams {
            voice_freq: Some(8000),
            ..Default::default()
        };
        let (samples, rate) = model.synthesize_pho("_ 20\na 60\n_ 20\n", &params).unwrap();
        assert_eq!(rate, 8000);
        assert!(!samples.is_empty());
    }

    #[test]
    fn invalid_inference_params_are_rejected() {
        let file = voice_file();
        let model = MbrolaModel::load(file.path(), &MbrolaModelParams::default()).unwrap();
        let params = MbrolaInferenceParams {
            volume: -1.0,
            ..Default::default()
        };
        let err = model.synthesize_pho("_ 20\n", &params).unwrap_err();
        assert_eq!(err.code(), -4);
    }

    #[test]
    fn every_storage_mode_loads_the_same_voice() {
        let file = voice_file();
        let mut rom = MbrolaModel::load(file.path(), &MbrolaModelParams::default()).unwrap();
        let image = crate::engines::mbrola::rom::to_rom(rom.database_mut()).unwrap();
        let rom_file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(rom_file.path(), image).unwrap();

        for (path, storage) in [
            (file.path(), StorageMode::File),
            (file.path(), StorageMode::Memory),
            (rom_file.path(), StorageMode::Rom),
        ] {
            let params = MbrolaModelParams {
                storage,
                ..Default::default()
            };
            let model = MbrolaModel::load(path, &params).unwrap();
            assert_eq!(model.database().index().len(), 3, "{storage:?}");
            assert_eq!(model.database().sample_rate(), 16000);
        }
    }
}
