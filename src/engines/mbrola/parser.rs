//! Phonetic input: `.pho` lines to phones with complete pitch contours.
//!
//! Each line reads `NAME DURATION [POSITION FREQUENCY]...`, positions in
//! percent of the duration, optionally written as `(POSITION, FREQUENCY)`.
//! Phones without pitch targets are buffered until one with targets
//! arrives, then the contour is interpolated linearly across the run.

use std::collections::VecDeque;

use super::config::MbrolaInferenceParams;
use super::database::Database;
use super::model::{MbrolaError, MbrolaResult};
use super::phone::Phone;

/// Most phones buffered while waiting for a pitch target.
pub const MAX_PHONES_IN_ONESHOT: usize = 250;

/// What a phone source hands the synthesizer.
#[derive(Debug, Clone, PartialEq)]
pub enum PhoneEvent {
    Phone(Phone),
    /// End of an utterance.
    Flush,
    /// No more input for now.
    Eof,
}

/// Anything that produces phones for the synthesizer.
pub trait PhoneSource {
    fn next_phone(&mut self) -> MbrolaResult<PhoneEvent>;

    /// Drop buffered phones and pending input.
    fn reset(&mut self);
}

/// How running out of input is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InputMode {
    /// The input is complete: its end closes the last utterance.
    #[default]
    Document,
    /// More input may be fed later: its end suspends the parser.
    Stream,
}

enum Line {
    Text(String),
    Flush,
    End,
}

/// Parser for the `.pho` format.
#[derive(Debug, Clone)]
pub struct PhoParser {
    mode: InputMode,
    lines: VecDeque<String>,
    partial: String,
    line_number: usize,
    silence: String,
    default_pitch: f32,
    time_ratio: f32,
    freq_ratio: f32,
    comment_symbol: String,
    flush_symbol: String,
    /// `buffer[0]` is the last phone of the previous run, not yet issued.
    buffer: Vec<Phone>,
    cursor: usize,
    closed: bool,
    pending: Option<PhoneEvent>,
}

impl PhoParser {
    pub fn new(mode: InputMode, silence: &str, default_pitch: f32) -> Self {
        let mut parser = Self {
            mode,
            lines: VecDeque::new(),
            partial: String::new(),
            line_number: 0,
            silence: silence.to_string(),
            default_pitch,
            time_ratio: 1.0,
            freq_ratio: 1.0,
            comment_symbol: ";".to_string(),
            flush_symbol: "#".to_string(),
            buffer: Vec::with_capacity(MAX_PHONES_IN_ONESHOT),
            cursor: 0,
            closed: false,
            pending: None,
        };
        parser.init_buffer();
        parser
    }

    pub fn document(default_pitch: f32) -> Self {
        Self::new(InputMode::Document, "_", default_pitch)
    }

    pub fn stream(default_pitch: f32) -> Self {
        Self::new(InputMode::Stream, "_", default_pitch)
    }

    /// Parser using the silence and natural pitch of `database`.
    pub fn for_database(database: &Database<'_>, mode: InputMode) -> Self {
        let default_pitch = database.sample_rate() as f32 / database.period() as f32;
        Self::new(mode, database.silence(), default_pitch)
    }

    pub fn with_params(mut self, params: &MbrolaInferenceParams) -> Self {
        self.time_ratio = params.time_ratio;
        self.freq_ratio = params.freq_ratio;
        self.comment_symbol = params.comment_symbol.clone();
        self.flush_symbol = params.flush_symbol.clone();
        self
    }

    pub fn mode(&self) -> InputMode {
        self.mode
    }

    pub fn time_ratio(&self) -> f32 {
        self.time_ratio
    }

    pub fn set_time_ratio(&mut self, ratio: f32) {
        self.time_ratio = ratio;
    }

    pub fn freq_ratio(&self) -> f32 {
        self.freq_ratio
    }

    pub fn set_freq_ratio(&mut self, ratio: f32) {
        self.freq_ratio = ratio;
    }

    pub fn flush_symbol(&self) -> &str {
        &self.flush_symbol
    }

    pub fn set_flush_symbol(&mut self, symbol: &str) {
        self.flush_symbol = symbol.to_string();
    }

    pub fn set_comment_symbol(&mut self, symbol: &str) {
        self.comment_symbol = symbol.to_string();
    }

    /// Queue more input. Only complete lines are parsed in stream mode.
    pub fn feed(&mut self, text: &str) {
        self.partial.push_str(text);
        while let Some(end) = self.partial.find('\n') {
            let mut line: String = self.partial.drain(..=end).collect();
            line.pop();
            if line.ends_with('\r') {
                line.pop();
            }
            self.lines.push_back(line);
        }
    }

    /// Lines queued but not yet parsed.
    pub fn pending_lines(&self) -> usize {
        self.lines.len() + usize::from(!self.partial.is_empty())
    }

    fn init_buffer(&mut self) {
        let mut head = Phone::new(&self.silence, 0.0);
        head.push_pitch(0.0, self.default_pitch);
        self.buffer.clear();
        self.buffer.push(head);
        self.cursor = 0;
        self.closed = false;
        self.pending = None;
    }

    fn phone_count(&self) -> usize {
        self.buffer.len() - 1
    }

    fn shift(&mut self) {
        if let Some(tail) = self.buffer.pop() {
            self.buffer.clear();
            self.buffer.push(tail);
        }
        self.cursor = 0;
        self.closed = false;
    }

    fn pop_line(&mut self) -> Option<String> {
        if let Some(line) = self.lines.pop_front() {
            return Some(line);
        }
        if self.mode == InputMode::Document && !self.partial.is_empty() {
            return Some(std::mem::take(&mut self.partial));
        }
        None
    }

    /// Next line holding a phone, handling comments and commands on the way.
    fn read_line(&mut self) -> Line {
        loop {
            let Some(line) = self.pop_line() else {
                return Line::End;
            };
            self.line_number += 1;
            let rest = line.trim_start();
            if rest.is_empty() {
                continue;
            }
            if rest.starts_with(self.flush_symbol.as_str()) {
                return Line::Flush;
            }
            if let Some(comment) = rest.strip_prefix(self.comment_symbol.as_str()) {
                if let Some(command) = comment.strip_prefix(self.comment_symbol.as_str()) {
                    self.command(command.trim());
                }
                continue;
            }
            return Line::Text(line);
        }
    }

    /// `T = ratio`, `F = ratio` or `FLUSH symbol`; anything else is a comment.
    fn command(&mut self, command: &str) {
        let value = |rest: &str| {
            rest.trim_start()
                .strip_prefix('=')
                .and_then(|v| v.split_whitespace().next())
                .and_then(|v| v.parse::<f32>().ok())
        };
        if let Some(ratio) = command.strip_prefix('T').and_then(value) {
            log::debug!("Time ratio set to {ratio}");
            self.time_ratio = ratio;
        } else if let Some(ratio) = command.strip_prefix('F').and_then(value) {
            log::debug!("Frequency ratio set to {ratio}");
            self.freq_ratio = ratio;
        } else if let Some(symbol) = command
            .strip_prefix("FLUSH")
            .and_then(|rest| rest.split_whitespace().next())
        {
            log::debug!("Flush symbol set to {symbol}");
            self.flush_symbol = symbol.to_string();
        }
    }

    fn append(&mut self, name: &str, duration: f32) {
        let mut phone = Phone::new(name, duration);
        // replaced by the interpolated 0% point
        phone.push_pitch(0.0, 0.0);
        self.buffer.push(phone);

        if self.phone_count() == MAX_PHONES_IN_ONESHOT - 2 {
            log::warn!("Too many phones without pitch information at '{name}'");
            if let Some(tail) = self.buffer.last_mut() {
                tail.push_pitch(0.0, self.default_pitch);
            }
        }
    }

    fn parse_line(&mut self, line: &str) -> MbrolaResult<()> {
        let syntax = |message: String| MbrolaError::Syntax {
            line: self.line_number,
            message,
        };
        let mut fields = line.split_whitespace();
        let name = fields.next().unwrap_or_default();
        let duration = fields
            .next()
            .and_then(|d| d.parse::<f32>().ok())
            .ok_or_else(|| syntax(format!("expected a duration after '{name}'")))?;

        let rest: Vec<&str> = fields
            .flat_map(|f| f.split(['(', ')', ',']))
            .filter(|f| !f.is_empty())
            .collect();
        let numbers: Vec<f32> = rest
            .iter()
            .map(|f| f.parse::<f32>())
            .collect::<Result<_, _>>()
            .map_err(|_| syntax(format!("unexpected text in '{}'", line.trim())))?;
        if numbers.len() % 2 != 0 {
            return Err(syntax(format!("unpaired pitch target in '{}'", line.trim())));
        }

        if name == self.silence {
            self.append(&self.silence.clone(), 0.0);
        }
        self.append(name, duration * self.time_ratio);
        let freq_ratio = self.freq_ratio;
        if let Some(phone) = self.buffer.last_mut() {
            for pair in numbers.chunks_exact(2) {
                phone.push_pitch_percent(pair[0], pair[1] * freq_ratio);
            }
        }
        Ok(())
    }

    /// Read lines until a phone with pitch targets closes the run. Returns
    /// the event to deliver once the run is issued, if any.
    fn fill(&mut self) -> MbrolaResult<Option<PhoneEvent>> {
        let end = loop {
            let end = match self.read_line() {
                Line::Text(line) => {
                    self.parse_line(&line)?;
                    if self.buffer.last().is_some_and(|p| p.pitch.len() == 1) {
                        continue;
                    }
                    break None;
                }
                Line::Flush => PhoneEvent::Flush,
                Line::End if self.mode == InputMode::Document => PhoneEvent::Eof,
                Line::End => return Ok(None),
            };

            // three trailing silences: the first reveals the last phone, the
            // second is issued, the third seeds the next utterance
            let silence = self.silence.clone();
            for _ in 0..3 {
                self.append(&silence, 0.0);
            }
            let pitch = self.default_pitch * self.freq_ratio;
            if let Some(tail) = self.buffer.last_mut() {
                tail.push_pitch(0.0, pitch);
            }
            break Some(end);
        };
        self.interpolate();
        Ok(end)
    }

    /// Straight line from the head's last target to the tail's first.
    fn interpolate(&mut self) {
        let n = self.phone_count();
        let head = &self.buffer[0];
        let tail = &self.buffer[n];
        let target = tail.pitch.get(1).or(tail.pitch.first()).copied();
        let (target_position, target_frequency) =
            target.map_or((0.0, 0.0), |p| (p.position, p.frequency));

        let mut position = head.duration - head.last_pitch().map_or(0.0, |p| p.position);
        let core: f32 = self.buffer[1..n].iter().map(|p| p.duration).sum();
        let span = core + target_position + position;
        let b = head.tail_frequency();
        let a = if span != 0.0 {
            (target_frequency - b) / span
        } else {
            0.0
        };

        for phone in &mut self.buffer[1..n] {
            phone.pitch.clear();
            phone.push_pitch(0.0, a * position + b);
            position += phone.duration;
            let duration = phone.duration;
            phone.push_pitch(duration, a * position + b);
        }
        if let Some(first) = self.buffer[n].pitch.first_mut() {
            first.position = 0.0;
            first.frequency = a * position + b;
        }
        let first = self.buffer.get(1).map_or(b, |p| p.pitch.first().map_or(b, |p| p.frequency));
        let head = &mut self.buffer[0];
        let duration = head.duration;
        head.push_pitch(duration, first);
        self.closed = true;
    }
}

impl PhoneSource for PhoParser {
    fn next_phone(&mut self) -> MbrolaResult<PhoneEvent> {
        if self.cursor == self.phone_count() || !self.closed {
            if self.cursor == self.phone_count() {
                self.shift();
            }
            if let Some(event) = self.pending.take() {
                return Ok(event);
            }

            self.pending = self.fill()?;
            if !self.closed {
                return Ok(PhoneEvent::Eof);
            }
        }

        let phone = self.buffer[self.cursor].clone();
        self.cursor += 1;
        Ok(PhoneEvent::Phone(phone))
    }

    fn reset(&mut self) {
        self.init_buffer();
        self.lines.clear();
        self.partial.clear();
    }
}

/// A prepared list of phones, for callers computing prosody themselves.
///
/// Every phone needs pitch targets at 0% and 100% of its duration.
#[derive(Debug, Clone, Default)]
pub struct PhoneSequence {
    events: VecDeque<PhoneEvent>,
}

impl PhoneSequence {
    pub fn new(phones: Vec<Phone>) -> Self {
        Self {
            events: phones.into_iter().map(PhoneEvent::Phone).collect(),
        }
    }

    pub fn push(&mut self, phone: Phone) {
        self.events.push_back(PhoneEvent::Phone(phone));
    }

    /// End the current utterance.
    pub fn flush(&mut self) {
        self.events.push_back(PhoneEvent::Flush);
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

impl PhoneSource for PhoneSequence {
    fn next_phone(&mut self) -> MbrolaResult<PhoneEvent> {
        Ok(self.events.pop_front().unwrap_or(PhoneEvent::Eof))
    }

    fn reset(&mut self) {
        self.events.clear();
    }
}
