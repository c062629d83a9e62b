//! Speech synthesis engines.
//!
//! # Available Engines
//!
//! - `mbrola` - MBROLA diphone concatenation (binary voice databases)

pub mod mbrola;
