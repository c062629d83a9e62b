use super::config::MbrolaInferenceParams;
use super::database::Database;
use super::model::{MbrolaError, MbrolaResult};
use super::parser::{InputMode, PhoParser, PhoneSource};
use super::synthesizer::{SynthesisStats, Synthesizer};

/// An independent streaming synthesis session.
///
/// Phonetic text is written in arbitrary pieces and samples are pulled as
/// they become available. Several channels can run over handles on the same
/// database.
#[derive(Debug)]
pub struct Channel<'db> {
    synthesizer: Synthesizer<'db>,
    parser: PhoParser,
    last_error: Option<(i32, String)>,
}

impl<'db> Channel<'db> {
    pub fn new(database: Database<'db>) -> Self {
        let parser = PhoParser::for_database(&database, InputMode::Stream);
        Self {
            synthesizer: Synthesizer::new(database),
            parser,
            last_error: None,
        }
    }

    pub fn with_params(database: Database<'db>, params: &MbrolaInferenceParams) -> Self {
        let parser = PhoParser::for_database(&database, InputMode::Stream).with_params(params);
        let mut synthesizer = Synthesizer::new(database);
        synthesizer.apply_params(params);
        Self {
            synthesizer,
            parser,
            last_error: None,
        }
    }

    /// Queue phonetic text.
    pub fn write_pho(&mut self, text: &str) {
        self.parser.feed(text);
    }

    /// End the current utterance so its last phones can be synthesized.
    pub fn flush(&mut self) {
        let line = format!("\n{}\n", self.parser.flush_symbol());
        self.parser.feed(&line);
    }

    /// Pull up to `out.len()` samples. A short count means the utterance
    /// was flushed or the queued text is exhausted.
    pub fn read(&mut self, out: &mut [i16]) -> MbrolaResult<usize> {
        self.synthesizer
            .read(&mut self.parser, out)
            .inspect_err(|e| {
                log::warn!("Channel error {}: {e}", e.code());
                self.last_error = Some((e.code(), e.to_string()));
            })
    }

    /// Drop queued text and start the next utterance from scratch.
    pub fn reset(&mut self) {
        self.parser.reset();
        self.synthesizer.restart();
    }

    pub fn set_volume(&mut self, volume: f32) {
        self.synthesizer.set_volume(volume);
    }

    pub fn set_voice_freq(&mut self, freq: u32) -> MbrolaResult<()> {
        if freq == 0 {
            return Err(MbrolaError::InvalidConfig(
                "voice frequency must be positive".to_string(),
            ));
        }
        self.synthesizer.set_voice_freq(freq);
        Ok(())
    }

    pub fn set_smoothing(&mut self, smoothing: bool) {
        self.synthesizer.set_smoothing(smoothing);
    }

    pub fn set_tolerance(&mut self, tolerant: bool) {
        self.synthesizer.set_tolerant(tolerant);
    }

    pub fn set_time_ratio(&mut self, ratio: f32) {
        self.parser.set_time_ratio(ratio);
    }

    pub fn set_freq_ratio(&mut self, ratio: f32) {
        self.parser.set_freq_ratio(ratio);
    }

    /// Output sample rate.
    pub fn voice_freq(&self) -> u32 {
        self.synthesizer.voice_freq()
    }

    pub fn stats(&self) -> SynthesisStats {
        self.synthesizer.stats()
    }

    /// Code and message of the last failed read.
    pub fn last_error(&self) -> Option<(i32, &str)> {
        self.last_error
            .as_ref()
            .map(|(code, message)| (*code, message.as_str()))
    }

    pub fn clear_error(&mut self) {
        self.last_error = None;
    }
}
