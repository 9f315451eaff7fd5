//! Media domain types shared between the catalog, the wire protocol and the
//! daemon.

use serde::{Deserialize, Serialize};

/// Encoding outcome codes as stored in the queue and carried on the wire.
///
/// The queue additionally uses `NOT_STARTED` (0) for entries waiting to be
/// picked up and `STARTED` (1) while a worker holds the file.
pub mod status {
    pub const NOT_STARTED: i8 = 0;
    pub const STARTED: i8 = 1;
    pub const OK: i8 = 5;
    pub const RETRIABLE_ERROR: i8 = -1;
    pub const SERVER_IO_ERROR: i8 = -9;
    pub const UNKNOWN_ERROR: i8 = -50;
    pub const PERMANENT_ERROR: i8 = -100;

    /// Codes in `[-99, -1]` allow the file to be handed out again, up to the
    /// retry cap.
    pub fn is_retriable(code: i8) -> bool {
        (-99..=-1).contains(&code)
    }
}

/// What a worker is willing to take on.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct MediaFileRequirements {
    pub encoder_type: String,
    /// 0 means no size limit.
    pub max_file_size: u64,
}

/// Job description handed to a worker. `file_length == 0` is the sentinel
/// for "no job available".
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct MediaEncoderSettings {
    pub file_length: u64,
    pub encoder_type: String,
    /// Extension of the source file, without the dot.
    pub file_extension: String,
    /// Extension of the installed archive, with the dot.
    pub final_extension: String,
    pub command_line_parameters: String,
}

/// Outcome a worker reports for its reserved file.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct EncodingResultInfo {
    pub status: i8,
    pub file_length: u64,
    pub error: String,
}

impl EncodingResultInfo {
    pub fn new(status: i8, file_length: u64, error: impl Into<String>) -> Self {
        Self {
            status,
            file_length,
            error: error.into(),
        }
    }
}

/// A finished encode bound to its source row and archive path.
#[derive(Clone, Debug)]
pub struct EncodedFile {
    pub info: EncodingResultInfo,
    pub source_id: i64,
    pub path: std::path::PathBuf,
}

/// The canonical ffmpeg-style parameter set handed to workers.
pub fn command_line_parameters(v_codec: &str, a_codec: &str, crf: u32, a_bitrate: u32) -> String {
    format!(
        "-y -hide_banner -nostats -loglevel warning -copyts -map_metadata 0 \
         -movflags use_metadata_tags -preset veryfast \
         -c:v {v_codec} -c:a {a_codec} -crf {crf} -b:a {a_bitrate}"
    )
}

/// Archive path for a source: `/a/b/name.ext` becomes
/// `/a/b/name<suffix><final_extension>`.
pub fn archived_name(
    source: &std::path::Path,
    suffix: &str,
    final_extension: &str,
) -> std::path::PathBuf {
    let s = source.to_string_lossy();
    let stem = match s.rfind('.') {
        // a dot inside the final component strips the extension
        Some(pos) if !s[pos..].contains('/') => &s[..pos],
        _ => &s[..],
    };
    std::path::PathBuf::from(format!("{stem}{suffix}{final_extension}"))
}

/// Source path an archive was derived from: the result suffix is removed,
/// the final extension stays (`name_archived.mp4` maps back to `name.mp4`).
pub fn source_name_for_archive(archive: &std::path::Path, suffix: &str) -> std::path::PathBuf {
    let s = archive.to_string_lossy();
    match s.rfind(suffix) {
        Some(pos) => {
            let mut name = String::with_capacity(s.len() - suffix.len());
            name.push_str(&s[..pos]);
            name.push_str(&s[pos + suffix.len()..]);
            std::path::PathBuf::from(name)
        }
        None => archive.to_path_buf(),
    }
}

/// A path names an archive iff it contains the result suffix and ends with
/// the final extension.
pub fn is_archive(path: &std::path::Path, suffix: &str, final_extension: &str) -> bool {
    let s = path.to_string_lossy();
    s.contains(suffix) && s.ends_with(final_extension)
}

/// Extension of the source file without the dot, empty when there is none.
pub fn file_extension(path: &std::path::Path) -> String {
    path.extension()
        .map(|e| e.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Compiled `filename_match_pattern`, case-insensitive like the config
/// default.
#[derive(Clone, Debug)]
pub struct InterestingMatcher {
    pattern: regex::Regex,
}

impl InterestingMatcher {
    pub fn new(pattern: &str) -> anyhow::Result<Self> {
        let pattern = regex::RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .map_err(|e| anyhow::anyhow!("invalid filename match pattern: {e}"))?;
        Ok(Self { pattern })
    }

    pub fn is_interesting(&self, path: &std::path::Path) -> bool {
        self.pattern.is_match(&path.to_string_lossy())
    }
}
