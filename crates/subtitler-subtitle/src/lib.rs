//! The cue model the translation engine batches and translates, plus a
//! minimal `.srt` codec. Parsing/serializing ASS or VTT, and everything
//! else a general subtitle toolkit would offer, is out of scope here —
//! this crate only implements the narrow contract the engine actually
//! consumes (parse source → cues, serialize cues → target file).

use std::path::Path;
use subtitler_common::{Result, SubtitlerError};

fn timestamp_to_ms(ts: srtlib::Timestamp) -> u32 {
    let (h, m, s, ms) = ts.get();
    srtlib::Timestamp::convert_to_milliseconds(h, m, s, ms)
}

/// One timed subtitle entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cue {
    pub index: usize,
    pub start_ms: u32,
    pub end_ms: u32,
    pub text: String,
    pub style: Option<String>,
}

impl Cue {
    pub fn new(index: usize, start_ms: u32, end_ms: u32, text: impl Into<String>) -> Self {
        Self {
            index,
            start_ms,
            end_ms,
            text: text.into(),
            style: None,
        }
    }

    pub fn duration_ms(&self) -> u32 {
        self.end_ms.saturating_sub(self.start_ms)
    }

    pub fn overlaps(&self, other: &Cue) -> bool {
        self.start_ms < other.end_ms && other.start_ms < self.end_ms
    }
}

/// An ordered sequence of cues, the in-memory form the engine parses
/// source subtitles into and serializes translated subtitles from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubtitleFile {
    pub cues: Vec<Cue>,
}

impl SubtitleFile {
    pub fn new() -> Self {
        Self { cues: Vec::new() }
    }

    pub fn parse_srt(content: &str) -> Result<Self> {
        let subs = srtlib::Subtitles::parse_from_str(content.to_string())
            .map_err(|e| SubtitlerError::BadInput(format!("invalid srt: {e}")))?;

        let cues = subs
            .to_vec()
            .into_iter()
            .map(|s| Cue {
                index: s.num,
                start_ms: timestamp_to_ms(s.start_time),
                end_ms: timestamp_to_ms(s.end_time),
                text: s.text,
                style: None,
            })
            .collect();

        Ok(Self { cues })
    }

    pub fn parse_srt_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse_srt(&content)
    }

    pub fn to_srt(&self) -> String {
        let mut subs = srtlib::Subtitles::new();
        for cue in &self.cues {
            subs.push(srtlib::Subtitle::new(
                cue.index,
                srtlib::Timestamp::from_milliseconds(cue.start_ms),
                srtlib::Timestamp::from_milliseconds(cue.end_ms),
                cue.text.clone(),
            ));
        }
        subs.to_string()
    }

    pub fn save_srt(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, self.to_srt())?;
        Ok(())
    }

    /// `post` phase validation: cue count, max text length, non-overlapping timings.
    pub fn validate(&self, expected_count: usize, max_text_len: usize) -> Result<()> {
        if self.cues.len() != expected_count {
            return Err(SubtitlerError::BadInput(format!(
                "cue count mismatch: expected {expected_count}, got {}",
                self.cues.len()
            )));
        }
        for cue in &self.cues {
            if cue.text.chars().count() > max_text_len {
                return Err(SubtitlerError::BadInput(format!(
                    "cue {} exceeds max text length {max_text_len}",
                    cue.index
                )));
            }
        }
        for pair in self.cues.windows(2) {
            if pair[0].overlaps(&pair[1]) {
                return Err(SubtitlerError::BadInput(format!(
                    "cues {} and {} overlap",
                    pair[0].index, pair[1].index
                )));
            }
        }
        Ok(())
    }
}

/// Soft-wrap `text` at word boundaries so no line exceeds `max_len`
/// characters, preserving `{...}`/`<...>` inline formatting tokens as
/// atomic units that are never split mid-token.
pub fn soft_wrap(text: &str, max_len: usize) -> String {
    if max_len == 0 {
        return text.to_string();
    }

    let mut lines: Vec<String> = Vec::new();
    let mut current = String::new();

    for word in text.split_whitespace() {
        let candidate_len = if current.is_empty() {
            word.chars().count()
        } else {
            current.chars().count() + 1 + word.chars().count()
        };

        if candidate_len > max_len && !current.is_empty() {
            lines.push(std::mem::take(&mut current));
        }

        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(word);
    }

    if !current.is_empty() {
        lines.push(current);
    }

    lines.join("\n")
}
