use std::path::Path;

use derive_builder::Builder;
use serde::{Deserialize, Serialize};

use super::model::{MbrolaError, MbrolaResult};

/// Ordered list of `(old, new)` phoneme pairs for renaming or cloning.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PhonemeMap {
    pairs: Vec<(String, String)>,
}

impl PhonemeMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse whitespace-separated pairs, e.g. `"a A b B"`.
    pub fn parse(text: &str) -> MbrolaResult<Self> {
        let tokens: Vec<&str> = text.split_whitespace().collect();
        if tokens.len() % 2 != 0 {
            return Err(MbrolaError::InvalidConfig(format!(
                "phoneme list {text:?} has an odd number of names"
            )));
        }
        let mut map = Self::new();
        for pair in tokens.chunks_exact(2) {
            map.push(pair[0], pair[1]);
        }
        Ok(map)
    }

    /// Like [`parse`](Self::parse), refusing to rename a phoneme twice.
    pub fn parse_rename(text: &str) -> MbrolaResult<Self> {
        let parsed = Self::parse(text)?;
        let mut map = Self::new();
        for (from, to) in parsed.iter() {
            map.push_unique(from, to)?;
        }
        Ok(map)
    }

    pub fn push(&mut self, from: &str, to: &str) {
        self.pairs.push((from.to_string(), to.to_string()));
    }

    /// Append a pair whose source must not be mapped already.
    pub fn push_unique(&mut self, from: &str, to: &str) -> MbrolaResult<()> {
        if self.get(from).is_some() {
            return Err(MbrolaError::InvalidConfig(format!(
                "phoneme {from} is renamed twice"
            )));
        }
        self.push(from, to);
        Ok(())
    }

    /// Target of the first pair whose source is `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(from, _)| from == name)
            .map(|(_, to)| to.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().map(|(a, b)| (a.as_str(), b.as_str()))
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Append every pair of `other`.
    pub fn extend(&mut self, other: &PhonemeMap) {
        self.pairs.extend(other.pairs.iter().cloned());
    }
}

/// Where the wave samples of a database live after loading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageMode {
    /// Seek and read the database file per diphone.
    #[default]
    File,
    /// Decode the whole wave region at load.
    Memory,
    /// The path names a ROM image, loaded into memory.
    Rom,
}

/// Parameters for loading a diphone database.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Builder)]
#[builder(default)]
#[serde(default)]
pub struct MbrolaModelParams {
    /// Phonemes renamed in the index before synthesis.
    pub rename: PhonemeMap,
    /// Phonemes duplicated under a new name, applied after renaming.
    pub clone: PhonemeMap,
    pub storage: StorageMode,
}

/// Parameters for a synthesis request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Builder)]
#[builder(default, setter(into))]
#[serde(default)]
pub struct MbrolaInferenceParams {
    /// Linear gain applied to every grain.
    pub volume: f32,
    /// Output sample rate. `None` keeps the database rate.
    pub voice_freq: Option<u32>,
    /// Multiplier on every phone duration.
    pub time_ratio: f32,
    /// Multiplier on every pitch target.
    pub freq_ratio: f32,
    /// Blend voiced frames across diphone boundaries.
    pub smoothing: bool,
    /// Replace unknown diphones with silence instead of failing.
    pub tolerant: bool,
    pub comment_symbol: String,
    pub flush_symbol: String,
}

impl Default for MbrolaInferenceParams {
    fn default() -> Self {
        Self {
            volume: 1.0,
            voice_freq: None,
            time_ratio: 1.0,
            freq_ratio: 1.0,
            smoothing: true,
            tolerant: false,
            comment_symbol: ";".to_string(),
            flush_symbol: "#".to_string(),
        }
    }
}

impl MbrolaInferenceParams {
    /// Load parameters from a JSON file. Missing fields keep their defaults.
    pub fn from_json_file(path: &Path) -> MbrolaResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let params: Self = serde_json::from_str(&content)
            .map_err(|e| MbrolaError::InvalidConfig(format!("Failed to parse JSON: {e}")))?;
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> MbrolaResult<()> {
        for (name, value) in [
            ("volume", self.volume),
            ("time_ratio", self.time_ratio),
            ("freq_ratio", self.freq_ratio),
        ] {
            if !(value > 0.0) || !value.is_finite() {
                return Err(MbrolaError::InvalidConfig(format!(
                    "{name} must be positive, got {value}"
                )));
            }
        }
        if self.voice_freq == Some(0) {
            return Err(MbrolaError::InvalidConfig(
                "voice frequency must be positive".to_string(),
            ));
        }
        if self.comment_symbol.is_empty() || self.flush_symbol.is_empty() {
            return Err(MbrolaError::InvalidConfig(
                "comment and flush symbols cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Settings read from an initialization file.
///
/// Each line holds one keyword, optionally preceded by comment characters:
///
/// ```text
/// ;; RENAME a A
/// ;; CLONE e E
/// ;; FLUSH #
/// ;; COMMENT ;
/// ;; TIME 1.2
/// ;; FREQ 0.9
/// ;; VOLUME 2
/// ;; VOICE 22050
/// ;; IGNORE
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InitFile {
    pub rename: PhonemeMap,
    pub clone: PhonemeMap,
    pub flush_symbol: Option<String>,
    pub comment_symbol: Option<String>,
    pub time_ratio: Option<f32>,
    pub freq_ratio: Option<f32>,
    pub volume: Option<f32>,
    pub voice_freq: Option<u32>,
    /// Unknown diphones fall back to silence.
    pub ignore_errors: bool,
}

impl InitFile {
    pub fn load(path: &Path) -> MbrolaResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => MbrolaError::DatabaseNotFound(path.to_path_buf()),
            _ => MbrolaError::Io(e),
        })?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> MbrolaResult<Self> {
        let mut init = Self::default();
        for (number, line) in text.lines().enumerate() {
            let line = line.trim_start_matches(|c: char| c == ';' || c.is_whitespace());
            let mut tokens = line.split_whitespace();
            let Some(keyword) = tokens.next() else {
                continue;
            };
            let mut arg = || {
                tokens.next().ok_or_else(|| {
                    MbrolaError::InvalidConfig(format!(
                        "line {}: {keyword} needs an argument",
                        number + 1
                    ))
                })
            };

            match keyword {
                "RENAME" => {
                    let (from, to) = (arg()?, arg()?);
                    init.rename.push_unique(from, to)?;
                }
                "CLONE" => {
                    let (from, to) = (arg()?, arg()?);
                    init.clone.push(from, to);
                }
                "FLUSH" => init.flush_symbol = Some(arg()?.to_string()),
                "COMMENT" => init.comment_symbol = Some(arg()?.to_string()),
                "TIME" => init.time_ratio = Some(parse_number(arg()?, number)?),
                "FREQ" => init.freq_ratio = Some(parse_number(arg()?, number)?),
                "VOLUME" => init.volume = Some(parse_number(arg()?, number)?),
                "VOICE" => init.voice_freq = Some(parse_number(arg()?, number)?),
                "IGNORE" => init.ignore_errors = true,
                other => log::debug!("Skipping init line {}: {other}", number + 1),
            }
        }
        Ok(init)
    }

    /// Merge into load and synthesis parameters. Init settings win.
    pub fn apply(&self, model: &mut MbrolaModelParams, inference: &mut MbrolaInferenceParams) {
        model.rename.extend(&self.rename);
        model.clone.extend(&self.clone);
        if let Some(symbol) = &self.flush_symbol {
            inference.flush_symbol = symbol.clone();
        }
        if let Some(symbol) = &self.comment_symbol {
            inference.comment_symbol = symbol.clone();
        }
        if let Some(ratio) = self.time_ratio {
            inference.time_ratio = ratio;
        }
        if let Some(ratio) = self.freq_ratio {
            inference.freq_ratio = ratio;
        }
        if let Some(volume) = self.volume {
            inference.volume = volume;
        }
        if self.voice_freq.is_some() {
            inference.voice_freq = self.voice_freq;
        }
        inference.tolerant |= self.ignore_errors;
    }
}

fn parse_number<T: std::str::FromStr>(text: &str, line: usize) -> MbrolaResult<T> {
    text.parse().map_err(|_| {
        MbrolaError::InvalidConfig(format!("line {}: {text:?} is not a number", line + 1))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn phoneme_map_keeps_pair_order() {
        let map = PhonemeMap::parse("a A  b B\nc C").unwrap();
        assert_eq!(
            map.iter().collect::<Vec<_>>(),
            vec![("a", "A"), ("b", "B"), ("c", "C")]
        );
        assert_eq!(map.get("b"), Some("B"));
        assert_eq!(map.get("B"), None);
    }

    #[test]
    fn odd_phoneme_list_is_rejected() {
        assert!(matches!(
            PhonemeMap::parse("a A b"),
            Err(MbrolaError::InvalidConfig(_))
        ));
    }

    #[test]
    fn rename_list_refuses_duplicate_sources() {
        assert!(PhonemeMap::parse("a A a B").is_ok());
        assert!(matches!(
            PhonemeMap::parse_rename("a A a B"),
            Err(MbrolaError::InvalidConfig(_))
        ));
    }

    #[test]
    fn init_file_accepts_comment_prefixes() {
        let init = InitFile::parse(
            ";; RENAME a A\n\
             ; CLONE e E\n\
             FLUSH ##\n\
             ;;TIME 1.5\n\
             ;; VOICE 22050\n\
             ;; just a remark\n\
             ;; IGNORE\n",
        )
        .unwrap();
        assert_eq!(init.rename.get("a"), Some("A"));
        assert_eq!(init.clone.get("e"), Some("E"));
        assert_eq!(init.flush_symbol.as_deref(), Some("##"));
        assert_eq!(init.time_ratio, Some(1.5));
        assert_eq!(init.voice_freq, Some(22050));
        assert!(init.ignore_errors);
    }

    #[test]
    fn init_file_reports_missing_arguments() {
        let err = InitFile::parse("RENAME a\n").unwrap_err();
        assert_eq!(err.code(), -4);
        assert!(InitFile::parse("VOLUME loud").is_err());
    }

    #[test]
    fn init_settings_override_parameters() {
        let init = InitFile::parse("VOLUME 0.5\nRENAME a A\nIGNORE").unwrap();
        let mut model = MbrolaModelParams::default();
        let mut inference = MbrolaInferenceParams::default();
        init.apply(&mut model, &mut inference);
        assert_eq!(inference.volume, 0.5);
        assert!(inference.tolerant);
        assert_eq!(model.rename.len(), 1);
        assert_eq!(inference.flush_symbol, "#");
    }

    #[test]
    fn builder_fills_unset_fields_with_defaults() {
        let params = MbrolaInferenceParamsBuilder::default()
            .volume(2.0)
            .flush_symbol("@")
            .build()
            .unwrap();
        assert_eq!(params.volume, 2.0);
        assert_eq!(params.flush_symbol, "@");
        assert_eq!(params.time_ratio, 1.0);
        assert!(params.smoothing);

        let model = MbrolaModelParamsBuilder::default()
            .storage(StorageMode::Memory)
            .build()
            .unwrap();
        assert_eq!(model.storage, StorageMode::Memory);
        assert!(model.rename.is_empty());
    }

    #[test]
    fn json_sidecar_loads_partial_settings() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), r#"{"volume": 0.8, "tolerant": true}"#).unwrap();
        let params = MbrolaInferenceParams::from_json_file(file.path()).unwrap();
        assert_eq!(params.volume, 0.8);
        assert!(params.tolerant);
        assert_eq!(params.comment_symbol, ";");

        std::fs::write(file.path(), r#"{"volume": -1}"#).unwrap();
        assert!(MbrolaInferenceParams::from_json_file(file.path()).is_err());
    }

    #[test]
    fn model_params_round_trip_through_json() {
        let params = MbrolaModelParams {
            rename: PhonemeMap::parse("a A").unwrap(),
            clone: PhonemeMap::new(),
            storage: StorageMode::Rom,
        };
        let json = serde_json::to_string(&params).unwrap();
        assert!(json.contains(r#""storage":"rom""#));
        let back: MbrolaModelParams = serde_json::from_str(&json).unwrap();
        assert_eq!(back, params);
    }
}
