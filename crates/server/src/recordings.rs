use std::fs;
use std::path::PathBuf;
use std::sync::OnceLock;

use anyhow::{Context, bail};
use chrono::NaiveDateTime;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// The list operation returns at most this many transcripts.
pub const MAX_LISTED: usize = 100;

fn stem_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(rec|web)_(\d{8})_(\d{6})$").expect("static regex"))
}

fn timestamp_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d{2}:\d{2}:\d{2}[,.]\d{3}$").expect("static regex"))
}

/// Reduce a path input to its basename. Directory separators are stripped
/// and anything still containing `..` is rejected.
pub fn sanitize_name(name: &str) -> Option<String> {
    let base = name.rsplit(['/', '\\']).next().unwrap_or("");
    if base.is_empty() || base.contains("..") {
        return None;
    }
    Some(base.to_string())
}

/// Parse the datetime embedded in a recording stem (`rec_YYYYMMDD_HHMMSS`
/// or `web_YYYYMMDD_HHMMSS`).
pub fn parse_stem_datetime(stem: &str) -> Option<NaiveDateTime> {
    let caps = stem_re().captures(stem)?;
    NaiveDateTime::parse_from_str(&format!("{}_{}", &caps[2], &caps[3]), "%Y%m%d_%H%M%S").ok()
}

/// One transcript as returned by the list operation.
#[derive(Debug, Clone, Serialize)]
pub struct RecordingEntry {
    pub file: String,
    /// Same-stem `.wav`, when one exists
    pub audio: Option<String>,
    pub datetime: String,
}

/// One cue of a transcript.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SrtSegment {
    pub index: u32,
    pub start: String,
    pub end: String,
    pub text: String,
}

/// Read-side access to the recordings drop directory.
///
/// The recording pipeline (capture, transcription, upload) lives outside
/// this process; the contract is purely the on-disk layout of stem-matched
/// `.wav`/`.srt` pairs plus a `history/` subdirectory of prior transcript
/// versions.
#[derive(Clone)]
pub struct RecordingStore {
    dir: PathBuf,
}

impl RecordingStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    /// Resolve a user-supplied transcript name to a path inside the store.
    /// Unknown or non-matching names are rejected.
    fn resolve_srt(&self, name: &str) -> anyhow::Result<(PathBuf, String)> {
        let base = sanitize_name(name).context("Invalid file name")?;
        let stem = base
            .strip_suffix(".srt")
            .with_context(|| format!("Not a transcript file: {base}"))?;
        if !stem_re().is_match(stem) {
            bail!("File name does not match the recording pattern: {base}");
        }
        Ok((self.dir.join(&base), base))
    }

    /// Enumerate up to [`MAX_LISTED`] transcripts, newest first.
    pub fn list(&self) -> Vec<RecordingEntry> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                debug!(dir = %self.dir.display(), "Cannot read recordings directory: {e}");
                return Vec::new();
            }
        };

        let mut recordings: Vec<(NaiveDateTime, RecordingEntry)> = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(stem) = name.strip_suffix(".srt") else {
                continue;
            };
            let Some(datetime) = parse_stem_datetime(stem) else {
                continue;
            };
            let wav = format!("{stem}.wav");
            let audio = self.dir.join(&wav).is_file().then_some(wav);
            recordings.push((
                datetime,
                RecordingEntry {
                    file: name.to_string(),
                    audio,
                    datetime: datetime.format("%Y-%m-%d %H:%M:%S").to_string(),
                },
            ));
        }

        recordings.sort_by(|a, b| b.0.cmp(&a.0));
        recordings.truncate(MAX_LISTED);
        recordings.into_iter().map(|(_, entry)| entry).collect()
    }

    /// Read and parse one transcript.
    pub fn get(&self, name: &str) -> anyhow::Result<Vec<SrtSegment>> {
        let (path, base) = self.resolve_srt(name)?;
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read transcript {base}"))?;
        Ok(parse_srt(&content))
    }

    /// Overwrite one transcript, preserving the previous version under
    /// `history/<name>.<YYYY-MM-DD_HHMMSS>`.
    pub fn save(&self, name: &str, content: &str) -> anyhow::Result<()> {
        let (path, base) = self.resolve_srt(name)?;

        if path.is_file() {
            let history = self.dir.join("history");
            fs::create_dir_all(&history).context("Failed to create history directory")?;
            let stamp = chrono::Local::now().format("%Y-%m-%d_%H%M%S");
            let backup = history.join(format!("{base}.{stamp}"));
            fs::copy(&path, &backup)
                .with_context(|| format!("Failed to back up {base}"))?;
            debug!(file = base, backup = %backup.display(), "Transcript backed up");
        }

        fs::write(&path, content).with_context(|| format!("Failed to write transcript {base}"))?;
        Ok(())
    }

    /// Resolve a user-supplied audio name for the range-serving endpoint.
    pub fn resolve_wav(&self, name: &str) -> anyhow::Result<PathBuf> {
        let base = sanitize_name(name).context("Invalid file name")?;
        let stem = base
            .strip_suffix(".wav")
            .with_context(|| format!("Not an audio file: {base}"))?;
        if !stem_re().is_match(stem) {
            bail!("File name does not match the recording pattern: {base}");
        }
        Ok(self.dir.join(base))
    }
}

/// Parse SRT content into ordered segments. Blocks that do not follow the
/// `index / start --> end / text` shape are skipped.
pub fn parse_srt(content: &str) -> Vec<SrtSegment> {
    let mut segments = Vec::new();
    let content = content.replace("\r\n", "\n");

    for block in content.split("\n\n") {
        let lines: Vec<&str> = block.lines().filter(|l| !l.trim().is_empty()).collect();
        if lines.len() < 2 {
            continue;
        }

        let Ok(index) = lines[0].trim().parse::<u32>() else {
            continue;
        };
        let Some((start, end)) = lines[1].split_once("-->") else {
            continue;
        };
        let start = start.trim();
        let end = end.trim();
        if !timestamp_re().is_match(start) || !timestamp_re().is_match(end) {
            continue;
        }

        segments.push(SrtSegment {
            index,
            start: start.to_string(),
            end: end.to_string(),
            text: lines[2..].join("\n"),
        });
    }

    segments
}
