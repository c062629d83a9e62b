//! MBROLA diphone synthesis engine.
//!
//! Speech is produced by concatenating recorded diphones (transitions
//! between two phonemes) from a voice database and reshaping them to the
//! requested durations and pitch with pitch-synchronous overlap-add.
//!
//! # Input
//!
//! The engine reads phonetic text in the `.pho` format:
//!
//! ```text
//! ; name  duration(ms)  [position(%) pitch(Hz)]...
//! _   50
//! b   60
//! o  120   50 130
//! _   50
//! ```
//!
//! Phones without pitch targets get an interpolated contour. A line holding
//! only `#` ends the utterance.
//!
//! # Voice Databases
//!
//! A database is a single binary file holding the diphone index, the
//! voicing marks of every analysis frame and the recorded waves. It can be
//! read from disk on demand, decoded into memory, or used in place from a
//! ROM image produced by [`rom::to_rom`].
//!
//! # Examples
//!
//! ## Basic Usage
//!
//! ```rust,no_run
//! use mbrola_rs::{SynthesisEngine, engines::mbrola::MbrolaEngine};
//! use std::path::PathBuf;
//!
//! let mut engine = MbrolaEngine::new();
//! engine.load_model(&PathBuf::from("voices/fr1/fr1"))?;
//!
//! let result = engine.synthesize("_ 50\nb 60\no 120 50 130\n_ 50\n", None)?;
//! println!("Generated {} samples at {}Hz", result.samples.len(), result.sample_rate);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Renamed Phonemes and Slower Speech
//!
//! ```rust,no_run
//! use mbrola_rs::{SynthesisEngine, engines::mbrola::{MbrolaEngine, MbrolaInferenceParams, MbrolaModelParams, PhonemeMap}};
//! use std::path::PathBuf;
//!
//! let mut engine = MbrolaEngine::new();
//! let model_params = MbrolaModelParams {
//!     rename: PhonemeMap::parse("o O")?,
//!     ..Default::default()
//! };
//! engine.load_model_with_params(&PathBuf::from("voices/fr1/fr1"), model_params)?;
//!
//! let params = MbrolaInferenceParams {
//!     time_ratio: 1.5,
//!     ..Default::default()
//! };
//! engine.synthesize_to_file("_ 50\nb 60\nO 120\n_ 50\n", &PathBuf::from("out.wav"), Some(params))?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod audio;
pub mod builder;
pub mod channels;
pub mod config;
pub mod database;
pub mod diphone_index;
pub mod engine;
pub mod model;
pub mod parser;
pub mod phone;
pub mod phoneme_table;
pub mod pitch_marks;
pub mod rom;
pub mod synthesizer;
pub mod unit;

pub use audio::{AudioSink, AudioWriter, FileType, SampleFormat};
pub use channels::Channel;
pub use config::{InitFile, MbrolaInferenceParams, MbrolaModelParams, PhonemeMap, StorageMode};
pub use database::Database;
pub use engine::MbrolaEngine;
pub use model::{MbrolaError, MbrolaModel, MbrolaResult};
pub use parser::{InputMode, PhoParser, PhoneEvent, PhoneSequence, PhoneSource};
pub use phone::Phone;
pub use synthesizer::{SynthesisStats, Synthesizer};
