use std::io::{Cursor, Read, Write};
use std::path::PathBuf;
use std::time::Instant;

use clap::Parser;

use mbrola_rs::engines::mbrola::{
    rom, AudioWriter, FileType, InitFile, InputMode, MbrolaInferenceParams,
    MbrolaModel, MbrolaModelParams, PhoParser, PhonemeMap, SampleFormat, StorageMode,
    Synthesizer,
};

/// Diphone speech synthesizer: phonetic input to audio.
#[derive(Parser, Debug)]
#[command(name = "mbrola", version)]
struct Cli {
    /// Replace unknown diphones with silence instead of stopping.
    #[arg(short = 'e')]
    ignore_errors: bool,

    /// Print the database information.
    #[arg(short = 'i')]
    info: bool,

    /// Volume ratio.
    #[arg(short = 'v', value_name = "VOL")]
    volume: Option<f32>,

    /// Pitch ratio.
    #[arg(short = 'f', value_name = "RATIO")]
    freq_ratio: Option<f32>,

    /// Duration ratio.
    #[arg(short = 't', value_name = "RATIO")]
    time_ratio: Option<f32>,

    /// Output sample rate in Hz.
    #[arg(short = 'l', value_name = "HZ")]
    voice_freq: Option<u32>,

    /// Phoneme renaming list, e.g. "a A  e E".
    #[arg(short = 'R', value_name = "LIST")]
    rename: Option<String>,

    /// Phoneme cloning list, e.g. "a A2".
    #[arg(short = 'C', value_name = "LIST")]
    clone: Option<String>,

    /// Initialization file.
    #[arg(short = 'I', value_name = "FILE")]
    init: Option<PathBuf>,

    /// Write a ROM image of the database next to it.
    #[arg(short = 'W')]
    dump_rom: bool,

    /// The database argument is a ROM image.
    #[arg(short = 'w')]
    rom: bool,

    /// Diphone database.
    database: PathBuf,

    /// Input .pho files ("-" for stdin) followed by the output file ("-"
    /// for raw samples on stdout).
    files: Vec<String>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let cli = Cli::parse();

    let mut model_params = MbrolaModelParams::default();
    let mut params = MbrolaInferenceParams::default();
    if let Some(init) = &cli.init {
        InitFile::load(init)?.apply(&mut model_params, &mut params);
    }
    if let Some(list) = &cli.rename {
        model_params.rename.extend(&PhonemeMap::parse_rename(list)?);
    }
    if let Some(list) = &cli.clone {
        model_params.clone.extend(&PhonemeMap::parse(list)?);
    }
    if cli.rom {
        model_params.storage = StorageMode::Rom;
    }
    params.tolerant |= cli.ignore_errors;
    if let Some(volume) = cli.volume {
        params.volume = volume;
    }
    if let Some(ratio) = cli.freq_ratio {
        params.freq_ratio = ratio;
    }
    if let Some(ratio) = cli.time_ratio {
        params.time_ratio = ratio;
    }
    if cli.voice_freq.is_some() {
        params.voice_freq = cli.voice_freq;
    }
    params.validate()?;

    let load_start = Instant::now();
    let model = MbrolaModel::load(&cli.database, &model_params)?;
    eprintln!("Database loaded in {:.2?}", load_start.elapsed());

    if cli.info {
        for line in model.info() {
            println!("{line}");
        }
    }

    if cli.dump_rom {
        let mut database = model.handle()?;
        let image = rom::to_rom(&mut database)?;
        let rom_path = cli.database.with_extension("rom");
        std::fs::write(&rom_path, image)?;
        eprintln!("ROM image written to {}", rom_path.display());
    }

    let (inputs, output) = match cli.files.split_last() {
        None => return Ok(()),
        Some((last, [])) => (std::slice::from_ref(last), "-"),
        Some((last, inputs)) => (inputs, last.as_str()),
    };

    let mut synthesizer = Synthesizer::new(model.handle()?);
    synthesizer.apply_params(&params);
    let mut parser =
        PhoParser::for_database(synthesizer.database(), InputMode::Document).with_params(&params);
    for input in inputs {
        let mut text = String::new();
        if input == "-" {
            std::io::stdin().read_to_string(&mut text)?;
        } else {
            text = std::fs::read_to_string(input)?;
        }
        parser.feed(&text);
        if !text.ends_with('\n') {
            parser.feed("\n");
        }
    }

    let rate = synthesizer.voice_freq();
    let synth_start = Instant::now();
    let count = if output == "-" {
        let mut raw = Cursor::new(Vec::new());
        let mut writer = AudioWriter::new(&mut raw, FileType::Raw, SampleFormat::Lin16, rate)?;
        let count = synthesizer.synthesize_all(&mut parser, &mut writer)?;
        writer.finalize()?;
        std::io::stdout().write_all(raw.get_ref())?;
        count
    } else {
        let path = PathBuf::from(output);
        let mut writer = AudioWriter::create(&path, SampleFormat::Lin16, rate)?;
        let count = synthesizer.synthesize_all(&mut parser, &mut writer)?;
        writer.finalize()?;
        count
    };

    let audio_duration = count as f64 / rate as f64;
    eprintln!(
        "Synthesized {:.2}s audio in {:.2?} ({} diphones)",
        audio_duration,
        synth_start.elapsed(),
        synthesizer.stats().diphones
    );
    Ok(())
}
