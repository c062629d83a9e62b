//! Diphone database: binary loader and writer, wave storage, metadata.
//!
//! # File layout
//!
//! All multi-byte fields are little-endian.
//!
//! ```text
//! "MBROLA"                      magic, first 4 bytes double as byte-order sentinel
//! version        [u8; 5]        e.g. "2.060"
//! diphone_count  i16
//! mark_size      u16            0 => the real size follows as i32
//! (mark_size     i32)
//! raw_size       i32            wave region size in bytes
//! sample_rate    i16
//! period         u8             analysis period in samples
//! coding         u8             top bit: ROM image, low 7 bits: scheme
//! primary index  { left\0 right\0 halfseg:i16 frames:u8 wave_frames:u8 }*
//! replacements   { src_left\0 src_right\0 new_left\0 new_right\0 }*
//! pitch marks    ceil(mark_size / 4) bytes, 2 bits per frame
//! waves          raw_size bytes of i16 samples
//! info           zero-terminated strings up to end of file
//! ```

use std::fs::File;
use std::io::{self, BufReader, Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};

use super::config::PhonemeMap;
use super::diphone_index::{capacity_for, DiphoneEntry, DiphoneIndex, SegmentFields};
use super::model::MbrolaError;
use super::pitch_marks::{packed_len, PitchMarks};

/// Magic bytes at the start of every database.
pub const MAGIC: &[u8; 6] = b"MBROLA";

/// First four magic bytes read as a little-endian word.
pub const ARCH_SENTINEL: u32 = 0x4f52_424d;

/// Newest database version this crate reads.
pub const SYNTH_VERSION: &str = "3.4.0";

/// Version written when upgrading a legacy database.
pub const CURRENT_FORMAT_VERSION: &str = "2.060";

/// Databases older than this use fixed 8-byte index records.
pub const LEGACY_VERSION: &str = "2.05";

/// Oldest legacy layout still supported.
pub const OLDEST_VERSION: &str = "2.02";

/// Coding byte flag marking a ROM image.
pub const ROM_MASK: u8 = 0x80;

/// Leading byte of an info string hidden from display.
pub const INFO_ESCAPE: u8 = 0xFF;

const LEGACY_MAX_FRAME_FACTOR: f32 = 1.5;
const LONG_PERIOD_WARNING: u16 = 400;

/// Encoding of the wave region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coding {
    /// Pre-2.05 layout, raw 16-bit samples.
    Legacy,
    /// Raw 16-bit little-endian samples.
    Raw,
}

impl Coding {
    pub fn from_id(id: u8) -> Result<Self, MbrolaError> {
        match id & !ROM_MASK {
            0 => Ok(Coding::Legacy),
            1 => Ok(Coding::Raw),
            other => Err(MbrolaError::UnsupportedCoding(other)),
        }
    }

    pub fn id(self) -> u8 {
        match self {
            Coding::Legacy => 0,
            Coding::Raw => 1,
        }
    }

    /// Decode stored wave bytes into samples, appending to `out`.
    pub fn decode(self, bytes: &[u8], out: &mut Vec<i16>) {
        match self {
            Coding::Legacy | Coding::Raw => {
                out.extend(bytes.chunks_exact(2).map(LittleEndian::read_i16));
            }
        }
    }
}

/// Fixed header fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseHeader {
    pub version: String,
    pub diphone_count: usize,
    /// Number of frames in the pitch-mark stream.
    pub mark_size: usize,
    /// Size of the wave region in bytes.
    pub raw_size: usize,
    pub sample_rate: u32,
    /// Analysis period in samples.
    pub period: u16,
    pub coding: Coding,
    /// Coding byte as stored.
    pub coding_id: u8,
    /// The mark size was stored in the 16-bit legacy field.
    pub short_mark_field: bool,
}

impl DatabaseHeader {
    pub fn is_legacy(&self) -> bool {
        self.version.as_str() < LEGACY_VERSION
    }
}

/// One record of the on-disk index, in file order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexRecord {
    Primary {
        left: String,
        right: String,
        halfseg: i32,
        frame_count: u8,
        wave_frames: u8,
    },
    Replacement {
        source: (String, String),
        target: (String, String),
    },
}

/// Free-text metadata string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfoString {
    bytes: Vec<u8>,
}

impl InfoString {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn hidden(text: &str) -> Self {
        let mut bytes = vec![INFO_ESCAPE];
        bytes.extend_from_slice(text.as_bytes());
        Self { bytes }
    }

    pub fn is_hidden(&self) -> bool {
        self.bytes.first() == Some(&INFO_ESCAPE)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn text(&self) -> String {
        let visible = if self.is_hidden() {
            &self.bytes[1..]
        } else {
            &self.bytes[..]
        };
        String::from_utf8_lossy(visible).into_owned()
    }
}

impl From<&str> for InfoString {
    fn from(text: &str) -> Self {
        Self::new(text.as_bytes().to_vec())
    }
}

/// Samples of one diphone, either copied or borrowed from a ROM image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Buffer<'a> {
    Owned(Vec<i16>),
    Borrowed(&'a [u8]),
}

impl Default for Buffer<'_> {
    fn default() -> Self {
        Buffer::Owned(Vec::new())
    }
}

impl Buffer<'_> {
    pub fn len(&self) -> usize {
        match self {
            Buffer::Owned(samples) => samples.len(),
            Buffer::Borrowed(bytes) => bytes.len() / 2,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sample at `index`, or silence past the end.
    pub fn sample(&self, index: usize) -> i16 {
        match self {
            Buffer::Owned(samples) => samples.get(index).copied().unwrap_or(0),
            Buffer::Borrowed(bytes) => bytes
                .get(2 * index..2 * index + 2)
                .map(LittleEndian::read_i16)
                .unwrap_or(0),
        }
    }

    pub fn to_vec(&self) -> Vec<i16> {
        (0..self.len()).map(|i| self.sample(i)).collect()
    }
}

/// File-backed wave store with its own cursor.
#[derive(Debug)]
pub struct FileWaves {
    path: PathBuf,
    file: File,
    raw_offset: u64,
}

/// Backing store of the wave region.
#[derive(Debug)]
pub enum WaveStore<'a> {
    /// Decoded in memory, shared between clones.
    Owned(Arc<Vec<i16>>),
    /// Read from disk on every unit load.
    File(FileWaves),
    /// Borrowed from a ROM image.
    Borrowed(&'a [u8]),
}

impl WaveStore<'_> {
    fn try_clone(&self) -> Result<Self, MbrolaError> {
        Ok(match self {
            WaveStore::Owned(samples) => WaveStore::Owned(Arc::clone(samples)),
            WaveStore::File(waves) => {
                WaveStore::File(FileWaves {
                    path: waves.path.clone(),
                    file: File::open(&waves.path)?,
                    raw_offset: waves.raw_offset,
                })
            }
            WaveStore::Borrowed(bytes) => WaveStore::Borrowed(*bytes),
        })
    }
}

/// Read-only tables shared by every clone of a database.
#[derive(Debug)]
pub(crate) struct Tables<'a> {
    pub(crate) header: DatabaseHeader,
    pub(crate) index: DiphoneIndex,
    pub(crate) manifest: Vec<IndexRecord>,
    pub(crate) pitch_marks: PitchMarks<'a>,
    pub(crate) info: Vec<InfoString>,
    pub(crate) silence: String,
    pub(crate) max_frame: usize,
}

/// A loaded diphone database.
///
/// Cloning with [`try_clone`](Database::try_clone) shares the index, pitch
/// marks and metadata, and gives the clone its own file cursor. Rename and
/// clone operations need exclusive ownership and must run before any clone
/// is made.
#[derive(Debug)]
pub struct Database<'a> {
    name: String,
    tables: Arc<Tables<'a>>,
    waves: WaveStore<'a>,
}

/// Index, pitch marks and header read from the front of a database file.
struct Layout {
    header: DatabaseHeader,
    index: DiphoneIndex,
    manifest: Vec<IndexRecord>,
    silence: String,
    max_frame: usize,
    pitch_marks: PitchMarks<'static>,
    raw_offset: u64,
}

impl Database<'static> {
    /// Open a database file. Waves stay on disk and are read per unit.
    pub fn open(path: &Path) -> Result<Self, MbrolaError> {
        let file = File::open(path).map_err(|e| open_error(path, e))?;
        let mut reader = BufReader::new(file);
        let layout = read_layout(&mut reader)?;

        reader.seek(SeekFrom::Start(
            layout.raw_offset + layout.header.raw_size as u64,
        ))?;
        let info = read_info(&mut reader)?;

        let waves = WaveStore::File(FileWaves {
            path: path.to_path_buf(),
            file: File::open(path)?,
            raw_offset: layout.raw_offset,
        });
        let database = Self::assemble(path.display().to_string(), layout, info, waves);
        database.log_summary();
        Ok(database)
    }

    /// Open a database file and decode the whole wave region into memory.
    pub fn open_in_memory(path: &Path) -> Result<Self, MbrolaError> {
        let bytes = std::fs::read(path).map_err(|e| open_error(path, e))?;
        Self::from_bytes(path.display().to_string(), &bytes)
    }

    /// Parse a database image held in memory. Samples are decoded into an
    /// owned buffer.
    pub fn from_bytes(name: impl Into<String>, bytes: &[u8]) -> Result<Self, MbrolaError> {
        let mut reader = Cursor::new(bytes);
        let layout = read_layout(&mut reader)?;

        let mut raw = vec![0u8; layout.header.raw_size];
        reader
            .read_exact(&mut raw)
            .map_err(|_| MbrolaError::Format("wave region is truncated".to_string()))?;
        let mut samples = Vec::with_capacity(raw.len() / 2);
        layout.header.coding.decode(&raw, &mut samples);

        let info = read_info(&mut reader)?;
        let database = Self::assemble(
            name.into(),
            layout,
            info,
            WaveStore::Owned(Arc::new(samples)),
        );
        database.log_summary();
        Ok(database)
    }

    fn assemble(
        name: String,
        layout: Layout,
        info: Vec<InfoString>,
        waves: WaveStore<'static>,
    ) -> Self {
        Self {
            name,
            tables: Arc::new(Tables {
                header: layout.header,
                index: layout.index,
                manifest: layout.manifest,
                pitch_marks: layout.pitch_marks,
                info,
                silence: layout.silence,
                max_frame: layout.max_frame,
            }),
            waves,
        }
    }
}

impl<'a> Database<'a> {
    pub(crate) fn from_tables(name: String, tables: Tables<'a>, waves: WaveStore<'a>) -> Self {
        Self {
            name,
            tables: Arc::new(tables),
            waves,
        }
    }

    fn log_summary(&self) {
        log::info!(
            "Loaded database {} (version {}, {} diphones, {} Hz, period {})",
            self.name,
            self.version(),
            self.tables.index.len(),
            self.sample_rate(),
            self.period()
        );
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn header(&self) -> &DatabaseHeader {
        &self.tables.header
    }

    pub fn version(&self) -> &str {
        &self.tables.header.version
    }

    pub fn sample_rate(&self) -> u32 {
        self.tables.header.sample_rate
    }

    pub fn period(&self) -> u16 {
        self.tables.header.period
    }

    pub fn coding(&self) -> Coding {
        self.tables.header.coding
    }

    /// Phoneme used for pauses and as the tolerant-mode fallback.
    pub fn silence(&self) -> &str {
        &self.tables.silence
    }

    /// Largest physical frame count of any diphone.
    pub fn max_frame(&self) -> usize {
        self.tables.max_frame
    }

    /// Capacity of a per-unit sample buffer; zero for ROM images.
    pub fn max_samples(&self) -> usize {
        match self.waves {
            WaveStore::Borrowed(_) => 0,
            _ => self.tables.max_frame * self.period() as usize,
        }
    }

    pub fn index(&self) -> &DiphoneIndex {
        &self.tables.index
    }

    pub fn manifest(&self) -> &[IndexRecord] {
        &self.tables.manifest
    }

    pub fn pitch_marks(&self) -> &PitchMarks<'a> {
        &self.tables.pitch_marks
    }

    pub fn info(&self) -> &[InfoString] {
        &self.tables.info
    }

    /// Info strings meant for display.
    pub fn printable_info(&self) -> impl Iterator<Item = String> + '_ {
        self.tables
            .info
            .iter()
            .filter(|info| !info.is_hidden())
            .map(InfoString::text)
    }

    pub fn find(&self, left: &str, right: &str) -> Option<DiphoneEntry> {
        self.tables.index.get(left, right)
    }

    pub fn is_rom(&self) -> bool {
        matches!(self.waves, WaveStore::Borrowed(_))
    }

    pub fn waves(&self) -> &WaveStore<'a> {
        &self.waves
    }

    /// Clone sharing the read-only tables, with an independent file cursor.
    pub fn try_clone(&self) -> Result<Self, MbrolaError> {
        Ok(Self {
            name: self.name.clone(),
            tables: Arc::clone(&self.tables),
            waves: self.waves.try_clone()?,
        })
    }

    /// Load `count` samples starting at `wave_offset` into `buffer`.
    pub fn load_samples(
        &mut self,
        wave_offset: i64,
        count: usize,
        buffer: &mut Buffer<'a>,
    ) -> Result<(), MbrolaError> {
        let out_of_range = || MbrolaError::WaveOutOfRange {
            offset: wave_offset,
            count,
        };
        let start = usize::try_from(wave_offset).map_err(|_| out_of_range())?;
        let coding = self.coding();

        match &mut self.waves {
            WaveStore::Owned(samples) => {
                let slice = samples
                    .get(start..start + count)
                    .ok_or_else(out_of_range)?;
                let mut owned = match std::mem::take(buffer) {
                    Buffer::Owned(vec) => vec,
                    Buffer::Borrowed(_) => Vec::new(),
                };
                owned.clear();
                owned.extend_from_slice(slice);
                *buffer = Buffer::Owned(owned);
            }
            WaveStore::File(waves) => {
                let mut raw = vec![0u8; 2 * count];
                waves
                    .file
                    .seek(SeekFrom::Start(waves.raw_offset + 2 * start as u64))?;
                waves.file.read_exact(&mut raw).map_err(|e| match e.kind() {
                    io::ErrorKind::UnexpectedEof => out_of_range(),
                    _ => MbrolaError::Io(e),
                })?;
                let mut owned = match std::mem::take(buffer) {
                    Buffer::Owned(vec) => vec,
                    Buffer::Borrowed(_) => Vec::new(),
                };
                owned.clear();
                coding.decode(&raw, &mut owned);
                *buffer = Buffer::Owned(owned);
            }
            WaveStore::Borrowed(bytes) => {
                let bytes: &'a [u8] = *bytes;
                let slice = bytes
                    .get(2 * start..2 * (start + count))
                    .ok_or_else(out_of_range)?;
                *buffer = Buffer::Borrowed(slice);
            }
        }
        Ok(())
    }

    /// Every wave sample, in storage order.
    pub fn read_all_samples(&mut self) -> Result<Vec<i16>, MbrolaError> {
        let count = self.tables.header.raw_size / 2;
        let mut buffer = Buffer::default();
        self.load_samples(0, count, &mut buffer)?;
        Ok(buffer.to_vec())
    }

    fn tables_mut(&mut self) -> Result<&mut Tables<'a>, MbrolaError> {
        Arc::get_mut(&mut self.tables).ok_or(MbrolaError::DatabaseShared)
    }

    /// Rename phonemes everywhere in the index. The index is rebuilt.
    pub fn rename_phonemes(&mut self, map: &PhonemeMap) -> Result<(), MbrolaError> {
        if map.is_empty() {
            return Ok(());
        }
        let tables = self.tables_mut()?;
        let index = tables.index.renamed(|name| map.get(name))?;

        let rename = |name: &mut String| {
            if let Some(new) = map.get(name.as_str()) {
                *name = new.to_string();
            }
        };
        for record in &mut tables.manifest {
            match record {
                IndexRecord::Primary { left, right, .. } => {
                    rename(left);
                    rename(right);
                }
                IndexRecord::Replacement { source, target } => {
                    rename(&mut source.0);
                    rename(&mut source.1);
                    rename(&mut target.0);
                    rename(&mut target.1);
                }
            }
        }
        if let Some(new) = map.get(&tables.silence) {
            log::info!("Silence phoneme renamed from {} to {}", tables.silence, new);
            tables.silence = new.to_string();
        }
        tables.index = index;
        tables.header.diphone_count = tables.manifest.len();
        Ok(())
    }

    /// Duplicate every diphone involving a cloned phoneme. Pairs apply in order.
    pub fn clone_phonemes(&mut self, map: &PhonemeMap) -> Result<(), MbrolaError> {
        if map.is_empty() {
            return Ok(());
        }
        let tables = self.tables_mut()?;
        let mut index = tables.index.clone();
        let mut added = Vec::new();
        for (from, to) in map.iter() {
            let (next, pairs) = index.cloned(from, to)?;
            log::debug!("Cloned {} into {}: {} new diphones", from, to, pairs.len());
            index = next;
            added.extend(pairs);
        }

        tables.index = index;
        tables
            .manifest
            .extend(added.into_iter().map(|pair| IndexRecord::Replacement {
                source: pair.source,
                target: pair.target,
            }));
        tables.header.diphone_count = tables.manifest.len();
        Ok(())
    }

    /// Write the database in the current file format.
    ///
    /// A database loaded from a current-format file is reproduced byte for
    /// byte. Legacy databases are upgraded.
    pub fn write_to<W: Write>(&mut self, writer: &mut W) -> Result<(), MbrolaError> {
        if self.tables.manifest.is_empty() && !self.tables.index.is_empty() {
            return Err(MbrolaError::Format(
                "index manifest unavailable, ROM images cannot be written as files".to_string(),
            ));
        }
        let samples = self.read_all_samples()?;
        let tables = &self.tables;
        let header = &tables.header;

        let (version, coding_id) = if header.is_legacy() {
            log::warn!(
                "Upgrading database {} from version {} to {}",
                self.name,
                header.version,
                CURRENT_FORMAT_VERSION
            );
            (CURRENT_FORMAT_VERSION, Coding::Raw.id())
        } else {
            (header.version.as_str(), header.coding_id)
        };

        writer.write_all(MAGIC)?;
        writer.write_all(&fixed_bytes(version, 5))?;
        writer.write_i16::<LittleEndian>(to_i16(tables.manifest.len(), "diphone count")?)?;
        match u16::try_from(header.mark_size) {
            Ok(size) if header.short_mark_field && size != 0 => {
                writer.write_u16::<LittleEndian>(size)?;
            }
            _ => {
                writer.write_u16::<LittleEndian>(0)?;
                writer.write_i32::<LittleEndian>(to_i32(header.mark_size, "mark size")?)?;
            }
        }
        writer.write_i32::<LittleEndian>(to_i32(header.raw_size, "wave size")?)?;
        writer.write_i16::<LittleEndian>(to_i16(header.sample_rate as usize, "sample rate")?)?;
        writer.write_u8(header.period as u8)?;
        writer.write_u8(coding_id)?;

        for record in tables.manifest.iter() {
            if let IndexRecord::Primary {
                left,
                right,
                halfseg,
                frame_count,
                wave_frames,
            } = record
            {
                write_zstring(writer, left.as_bytes())?;
                write_zstring(writer, right.as_bytes())?;
                writer.write_i16::<LittleEndian>(to_i16_signed(*halfseg, "halfseg")?)?;
                writer.write_u8(*frame_count)?;
                writer.write_u8(*wave_frames)?;
            }
        }
        for record in tables.manifest.iter() {
            if let IndexRecord::Replacement { source, target } = record {
                write_zstring(writer, source.0.as_bytes())?;
                write_zstring(writer, source.1.as_bytes())?;
                write_zstring(writer, target.0.as_bytes())?;
                write_zstring(writer, target.1.as_bytes())?;
            }
        }

        writer.write_all(tables.pitch_marks.as_bytes())?;

        let mut raw = Vec::with_capacity(header.raw_size);
        for sample in samples {
            raw.write_i16::<LittleEndian>(sample)?;
        }
        raw.resize(header.raw_size, 0);
        writer.write_all(&raw)?;

        for info in &tables.info {
            write_zstring(writer, info.as_bytes())?;
        }
        Ok(())
    }

    /// Write the database to a file in the current file format.
    pub fn save(&mut self, path: &Path) -> Result<(), MbrolaError> {
        let mut writer = io::BufWriter::new(File::create(path)?);
        self.write_to(&mut writer)?;
        writer.flush()?;
        Ok(())
    }
}

fn open_error(path: &Path, error: io::Error) -> MbrolaError {
    match error.kind() {
        io::ErrorKind::NotFound => MbrolaError::DatabaseNotFound(path.to_path_buf()),
        _ => MbrolaError::Io(error),
    }
}

fn truncated(_: io::Error) -> MbrolaError {
    MbrolaError::Format("unexpected end of file in database header or index".to_string())
}

fn read_layout<R: Read + Seek>(reader: &mut R) -> Result<Layout, MbrolaError> {
    let header = read_header(reader)?;
    let (index, manifest, silence, max_frame) = match header.coding {
        Coding::Legacy => read_legacy_index(reader, &header)?,
        Coding::Raw => read_index(reader, &header)?,
    };

    let mut bytes = vec![0u8; packed_len(header.mark_size)];
    reader.read_exact(&mut bytes).map_err(truncated)?;
    let pitch_marks = PitchMarks::from_bytes(bytes, header.mark_size);
    let raw_offset = reader.stream_position()?;

    Ok(Layout {
        header,
        index,
        manifest,
        silence,
        max_frame,
        pitch_marks,
        raw_offset,
    })
}

/// Check the magic and version, then read the fixed header fields.
pub fn read_header<R: Read>(reader: &mut R) -> Result<DatabaseHeader, MbrolaError> {
    let mut magic = [0u8; 6];
    reader.read_exact(&mut magic).map_err(|_| {
        MbrolaError::Format("database is empty or too short for a header".to_string())
    })?;
    if &magic != MAGIC || LittleEndian::read_u32(&magic[..4]) != ARCH_SENTINEL {
        return Err(MbrolaError::Format(
            "bad magic, not a diphone database or wrong byte order".to_string(),
        ));
    }

    let mut version = [0u8; 5];
    reader.read_exact(&mut version).map_err(truncated)?;
    let version = String::from_utf8_lossy(&version).into_owned();

    let diphone_count = reader.read_i16::<LittleEndian>().map_err(truncated)?;
    let short_mark = reader.read_u16::<LittleEndian>().map_err(truncated)?;
    let (mark_size, short_mark_field) = if short_mark == 0 {
        (reader.read_i32::<LittleEndian>().map_err(truncated)?, false)
    } else {
        (short_mark as i32, true)
    };
    let raw_size = reader.read_i32::<LittleEndian>().map_err(truncated)?;
    let sample_rate = reader.read_i16::<LittleEndian>().map_err(truncated)?;
    let period = reader.read_u8().map_err(truncated)?;
    let coding_id = reader.read_u8().map_err(truncated)?;

    if version.as_str() > SYNTH_VERSION {
        return Err(MbrolaError::Version {
            found: version,
            supported: SYNTH_VERSION.to_string(),
        });
    }
    if version.as_str() < OLDEST_VERSION {
        return Err(MbrolaError::Format(format!(
            "database version {version} predates {OLDEST_VERSION} and is not supported"
        )));
    }
    if period as u16 > LONG_PERIOD_WARNING {
        log::warn!("Period {period} is really long");
    }
    if period == 0 {
        return Err(MbrolaError::Format("analysis period is zero".to_string()));
    }
    if diphone_count < 0 || mark_size < 0 || raw_size < 0 || sample_rate <= 0 {
        return Err(MbrolaError::Format(
            "negative size or rate in database header".to_string(),
        ));
    }

    let coding = if version.as_str() < LEGACY_VERSION {
        log::warn!("Database version {version} uses the legacy layout, think of upgrading it");
        Coding::Legacy
    } else {
        Coding::from_id(coding_id)?
    };

    Ok(DatabaseHeader {
        version,
        diphone_count: diphone_count as usize,
        mark_size: mark_size as usize,
        raw_size: raw_size as usize,
        sample_rate: sample_rate as u32,
        period: period as u16,
        coding,
        coding_id,
        short_mark_field,
    })
}

type IndexParts = (DiphoneIndex, Vec<IndexRecord>, String, usize);

fn read_index<R: Read>(reader: &mut R, header: &DatabaseHeader) -> Result<IndexParts, MbrolaError> {
    let count = header.diphone_count;
    let period = header.period as i64;
    let mut index = DiphoneIndex::with_capacity(capacity_for(count));
    let mut manifest = Vec::with_capacity(count);
    let mut silence = None;
    let mut max_frame = 0usize;
    let mut pitch_mark = 0usize;
    let mut wave = 0i64;

    while pitch_mark != header.mark_size && manifest.len() < count {
        let left = read_name(reader)?;
        let right = read_name(reader)?;
        let halfseg = reader.read_i16::<LittleEndian>().map_err(truncated)? as i32;
        let frame_count = reader.read_u8().map_err(truncated)?;
        let wave_frames = reader.read_u8().map_err(truncated)?;

        index.insert(
            &left,
            &right,
            SegmentFields {
                wave_offset: wave,
                halfseg,
                pitch_mark_start: pitch_mark as i32,
                frame_count,
            },
        )?;
        pitch_mark += frame_count as usize;
        wave += wave_frames as i64 * period;
        max_frame = max_frame.max(wave_frames as usize);
        if pitch_mark == header.mark_size {
            silence = Some(left.clone());
        }
        manifest.push(IndexRecord::Primary {
            left,
            right,
            halfseg,
            frame_count,
            wave_frames,
        });
    }

    let silence = silence.ok_or_else(|| {
        MbrolaError::Format("index does not cover the pitch-mark region".to_string())
    })?;

    while manifest.len() < count {
        let source = (read_name(reader)?, read_name(reader)?);
        let target = (read_name(reader)?, read_name(reader)?);
        index.insert_replacement(
            (source.0.as_str(), source.1.as_str()),
            (target.0.as_str(), target.1.as_str()),
        )?;
        manifest.push(IndexRecord::Replacement { source, target });
    }

    Ok((index, manifest, silence, max_frame))
}

fn read_legacy_index<R: Read>(
    reader: &mut R,
    header: &DatabaseHeader,
) -> Result<IndexParts, MbrolaError> {
    let count = header.diphone_count;
    let period = header.period as i64;
    let mut index = DiphoneIndex::with_capacity(count);
    let mut manifest = Vec::with_capacity(count);
    let mut silence = String::new();
    let mut max_frame = 0usize;
    let mut pitch_mark = 0usize;
    let mut wave = 0i64;

    while pitch_mark != header.mark_size && manifest.len() < count {
        let mut record = [0u8; 8];
        reader.read_exact(&mut record).map_err(truncated)?;
        let left = short_name(&record[0..2]);
        let right = short_name(&record[2..4]);
        let halfseg = LittleEndian::read_i16(&record[4..6]) as i32;
        let frame_count = record[6];
        let wave_frames = record[7];

        index.insert(
            &left,
            &right,
            SegmentFields {
                wave_offset: wave,
                halfseg,
                pitch_mark_start: pitch_mark as i32,
                frame_count,
            },
        )?;
        pitch_mark += frame_count as usize;
        wave += wave_frames as i64 * period;
        max_frame = max_frame.max((frame_count as f32 * LEGACY_MAX_FRAME_FACTOR) as usize);
        silence = left.clone();
        manifest.push(IndexRecord::Primary {
            left,
            right,
            halfseg,
            frame_count,
            wave_frames,
        });
    }

    while manifest.len() < count {
        let mut record = [0u8; 8];
        reader.read_exact(&mut record).map_err(truncated)?;
        let target = (short_name(&record[0..2]), short_name(&record[2..4]));
        let source = (short_name(&record[4..6]), short_name(&record[6..8]));
        index.insert_replacement(
            (source.0.as_str(), source.1.as_str()),
            (target.0.as_str(), target.1.as_str()),
        )?;
        manifest.push(IndexRecord::Replacement { source, target });
    }

    Ok((index, manifest, silence, max_frame))
}

/// Name stored in a NUL-padded two-byte field.
fn short_name(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

fn read_name<R: Read>(reader: &mut R) -> Result<String, MbrolaError> {
    match read_zstring(reader)? {
        Some(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
        None => Err(MbrolaError::Format(
            "unexpected end of file in diphone index".to_string(),
        )),
    }
}

/// Read a zero-terminated string. `None` at a clean end of file.
pub fn read_zstring<R: Read>(reader: &mut R) -> Result<Option<Vec<u8>>, MbrolaError> {
    let mut bytes = Vec::new();
    loop {
        match reader.read_u8() {
            Ok(0) => return Ok(Some(bytes)),
            Ok(byte) => bytes.push(byte),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Ok(if bytes.is_empty() { None } else { Some(bytes) });
            }
            Err(e) => return Err(MbrolaError::Io(e)),
        }
    }
}

pub fn write_zstring<W: Write>(writer: &mut W, bytes: &[u8]) -> io::Result<()> {
    writer.write_all(bytes)?;
    writer.write_u8(0)
}

fn read_info<R: Read>(reader: &mut R) -> Result<Vec<InfoString>, MbrolaError> {
    let mut info = Vec::new();
    while let Some(bytes) = read_zstring(reader)? {
        info.push(InfoString::new(bytes));
    }
    Ok(info)
}

/// `text` truncated or NUL-padded to `len` bytes.
pub fn fixed_bytes(text: &str, len: usize) -> Vec<u8> {
    let mut bytes = text.as_bytes().to_vec();
    bytes.resize(len, 0);
    bytes
}

pub(crate) fn to_i16(value: usize, what: &str) -> Result<i16, MbrolaError> {
    i16::try_from(value).map_err(|_| MbrolaError::Format(format!("{what} {value} does not fit")))
}

fn to_i16_signed(value: i32, what: &str) -> Result<i16, MbrolaError> {
    i16::try_from(value).map_err(|_| MbrolaError::Format(format!("{what} {value} does not fit")))
}

pub(crate) fn to_i32(value: usize, what: &str) -> Result<i32, MbrolaError> {
    i32::try_from(value).map_err(|_| MbrolaError::Format(format!("{what} {value} does not fit")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engines::mbrola::builder::{DatabaseBuilder, Segment};
    use crate::engines::mbrola::pitch_marks::FrameType;
    use pretty_assertions::assert_eq;

    fn sample_builder() -> DatabaseBuilder {
        let voiced = [FrameType::VoicedStable; 4];
        DatabaseBuilder::new(16000, 80)
            .info("test voice")
            .hidden_info("build 7")
            .segment(Segment::tone("_", "a", &[FrameType::UnvoicedStable; 4], 160))
            .segment(Segment::tone("a", "_", &voiced, 120))
            .segment(Segment::tone("_", "_", &[FrameType::UnvoicedStable; 2], 80))
            .replacement(("a", "_"), ("a", "#"))
    }

    #[test]
    fn header_round_trips_through_both_size_encodings() {
        for short in [false, true] {
            let bytes = sample_builder().short_mark_field(short).to_bytes().unwrap();
            let header = read_header(&mut Cursor::new(&bytes)).unwrap();
            assert_eq!(header.short_mark_field, short);
            assert_eq!(header.mark_size, 10);
            assert_eq!(header.diphone_count, 4);
            assert_eq!(header.sample_rate, 16000);
            assert_eq!(header.period, 80);
            assert_eq!(header.coding, Coding::Raw);
        }
    }

    #[test]
    fn loaded_file_is_written_back_byte_for_byte() {
        for short in [false, true] {
            let bytes = sample_builder().short_mark_field(short).to_bytes().unwrap();
            let mut database = Database::from_bytes("mem", &bytes).unwrap();
            let mut written = Vec::new();
            database.write_to(&mut written).unwrap();
            assert_eq!(written, bytes);
        }
    }

    #[test]
    fn index_offsets_accumulate_in_file_order() {
        let bytes = sample_builder().to_bytes().unwrap();
        let database = Database::from_bytes("mem", &bytes).unwrap();

        let first = database.find("_", "a").unwrap();
        let second = database.find("a", "_").unwrap();
        let last = database.find("_", "_").unwrap();
        assert_eq!((first.pitch_mark_start, first.wave_offset), (0, 0));
        // unvoiced tails carry one extra recorded frame
        assert_eq!((second.pitch_mark_start, second.wave_offset), (4, 5 * 80));
        assert_eq!((last.pitch_mark_start, last.wave_offset), (8, 9 * 80));
        assert_eq!(database.silence(), "_");
        assert_eq!(database.max_frame(), 5);
        assert_eq!(database.find("a", "#").unwrap().fields(), second.fields());
        assert_eq!(database.pitch_marks().len(), 10);
    }

    #[test]
    fn hidden_info_is_not_printable() {
        let bytes = sample_builder().to_bytes().unwrap();
        let database = Database::from_bytes("mem", &bytes).unwrap();
        assert_eq!(database.info().len(), 2);
        assert_eq!(
            database.printable_info().collect::<Vec<_>>(),
            vec!["test voice".to_string()]
        );
    }

    #[test]
    fn rejects_bad_magic_and_newer_versions() {
        let mut bytes = sample_builder().to_bytes().unwrap();
        bytes[0] = b'X';
        assert!(matches!(
            Database::from_bytes("mem", &bytes),
            Err(MbrolaError::Format(_))
        ));

        let bytes = sample_builder().version("9.999").to_bytes().unwrap();
        assert!(matches!(
            Database::from_bytes("mem", &bytes),
            Err(MbrolaError::Version { .. })
        ));

        assert!(matches!(
            Database::from_bytes("mem", b"MBR"),
            Err(MbrolaError::Format(_))
        ));
    }

    #[test]
    fn rejects_unknown_coding() {
        let mut bytes = sample_builder().to_bytes().unwrap();
        // coding byte sits right after magic, version, count, sizes, rate, period
        let coding_at = 6 + 5 + 2 + 2 + 4 + 4 + 2 + 1;
        bytes[coding_at] = 3;
        assert!(matches!(
            Database::from_bytes("mem", &bytes),
            Err(MbrolaError::UnsupportedCoding(3))
        ));
    }

    #[test]
    fn replacement_with_missing_source_is_fatal() {
        let bytes = sample_builder()
            .replacement(("o", "o"), ("u", "u"))
            .to_bytes()
            .unwrap();
        assert!(matches!(
            Database::from_bytes("mem", &bytes),
            Err(MbrolaError::DuplicateSourceMissing { .. })
        ));
    }

    #[test]
    fn file_backed_and_memory_loads_agree() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("voice.dba");
        std::fs::write(&path, sample_builder().to_bytes().unwrap()).unwrap();

        let mut on_disk = Database::open(&path).unwrap();
        let mut in_memory = Database::open_in_memory(&path).unwrap();
        assert_eq!(on_disk.read_all_samples().unwrap(), in_memory.read_all_samples().unwrap());
        assert_eq!(on_disk.info(), in_memory.info());

        let entry = on_disk.find("a", "_").unwrap();
        let mut a = Buffer::default();
        let mut b = Buffer::default();
        on_disk.load_samples(entry.wave_offset, 160, &mut a).unwrap();
        in_memory.load_samples(entry.wave_offset, 160, &mut b).unwrap();
        assert_eq!(a, b);

        assert!(matches!(
            on_disk.load_samples(entry.wave_offset, 100_000, &mut a),
            Err(MbrolaError::WaveOutOfRange { .. })
        ));
    }

    #[test]
    fn missing_file_is_reported() {
        let err = Database::open(Path::new("/nonexistent/voice.dba")).unwrap_err();
        assert!(matches!(err, MbrolaError::DatabaseNotFound(_)));
    }

    #[test]
    fn rename_follows_the_silence_and_refuses_shared_tables() {
        let bytes = sample_builder().to_bytes().unwrap();
        let mut database = Database::from_bytes("mem", &bytes).unwrap();
        let map = PhonemeMap::parse("_ sil").unwrap();
        database.rename_phonemes(&map).unwrap();
        assert_eq!(database.silence(), "sil");
        assert!(database.find("sil", "a").is_some());
        assert!(database.find("_", "a").is_none());

        let clone = database.try_clone().unwrap();
        assert!(matches!(
            database.rename_phonemes(&map),
            Err(MbrolaError::DatabaseShared)
        ));
        drop(clone);
        assert!(database.rename_phonemes(&PhonemeMap::parse("sil _").unwrap()).is_ok());
    }

    #[test]
    fn renamed_and_cloned_database_reloads_identically() {
        let bytes = sample_builder().to_bytes().unwrap();
        let mut database = Database::from_bytes("mem", &bytes).unwrap();
        database
            .clone_phonemes(&PhonemeMap::parse("a e").unwrap())
            .unwrap();
        assert!(database.find("e", "_").is_some());
        assert!(database.find("_", "e").is_some());

        let mut written = Vec::new();
        database.write_to(&mut written).unwrap();
        let reloaded = Database::from_bytes("mem", &written).unwrap();
        for (left, right, entry) in database.index().named_entries() {
            assert_eq!(reloaded.find(left, right).map(|e| e.fields()), Some(entry.fields()));
        }
        assert_eq!(reloaded.index().len(), database.index().len());
    }

    #[test]
    fn legacy_database_loads_and_upgrades() {
        let bytes = sample_builder().legacy(true).to_bytes().unwrap();
        let mut database = Database::from_bytes("old", &bytes).unwrap();
        assert_eq!(database.coding(), Coding::Legacy);
        assert_eq!(database.silence(), "_");
        assert_eq!(database.max_frame(), 6);
        assert!(database.find("a", "#").is_some());

        let mut upgraded = Vec::new();
        database.write_to(&mut upgraded).unwrap();
        let reloaded = Database::from_bytes("new", &upgraded).unwrap();
        assert_eq!(reloaded.version(), CURRENT_FORMAT_VERSION);
        assert_eq!(reloaded.coding(), Coding::Raw);
        for (left, right, entry) in database.index().named_entries() {
            assert_eq!(reloaded.find(left, right).map(|e| e.fields()), Some(entry.fields()));
        }
    }
}
