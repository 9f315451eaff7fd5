//! Daemon configuration and its `key = value` file loader.

use anyhow::{Context, Result};

/// Everything the daemon reads from its configuration file.
#[derive(Clone, Debug)]
pub struct DaemonConfig {
    /// TCP port the RPC server listens on.
    pub server_port: u16,
    /// Payload size of a single read/write chunk on the wire (bytes).
    pub chunk_size: usize,
    /// `:`-separated list of directory specs to watch. A spec is either a
    /// literal path or `start_folder::regex`.
    pub folders_to_watch: String,
    /// Case-insensitive regex deciding which files are encode candidates.
    pub filename_match_pattern: String,
    pub v_codec: String,
    pub a_codec: String,
    pub a_bitrate: u32,
    pub crf: u32,
    /// Where upload sinks live; empty means the current directory.
    pub temp_folder: std::path::PathBuf,
    /// Extension of installed archives, with the dot.
    pub final_extension: String,
    pub db_path: std::path::PathBuf,
    /// Inserted between the source stem and the final extension.
    pub result_file_suffix: String,
    pub log_file: Option<std::path::PathBuf>,
    /// 0=ERROR, 1=INFO, 2=DEBUG, 3=TRACE.
    pub verbosity: u8,
    /// Window for pairing the two halves of a rename (milliseconds).
    pub move_pair_timeout_ms: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            server_port: 2020,
            chunk_size: 256 * 1024,
            folders_to_watch: String::new(),
            filename_match_pattern:
                r"\.(mp4|3gp|mov|avi|mts|vob|ts|mpg|mpe|mpeg|divx|qt|wmv|asf|flv)$".to_string(),
            v_codec: "libx265".to_string(),
            a_codec: "aac".to_string(),
            a_bitrate: 80000,
            crf: 22,
            temp_folder: std::path::PathBuf::new(),
            final_extension: ".mp4".to_string(),
            db_path: std::path::PathBuf::from("/var/cache/marchive/marchive.db"),
            result_file_suffix: "_archived".to_string(),
            log_file: None,
            verbosity: 0,
            move_pair_timeout_ms: 250,
        }
    }
}

impl DaemonConfig {
    /// Load configuration from an INI-style file: `key = value` lines,
    /// `#` starts a comment, keys are case-insensitive (underscores
    /// optional). Unknown keys are warned about and skipped.
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read config file {:?}", path))?;
        let mut config = Self::default();
        for (lineno, raw) in text.lines().enumerate() {
            let line = match raw.find('#') {
                Some(pos) => &raw[..pos],
                None => raw,
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let key = key.trim();
            let value = value.trim();
            config
                .apply(key, value)
                .with_context(|| format!("{:?} line {}: bad value for {}", path, lineno + 1, key))?;
        }
        Ok(config)
    }

    fn apply(&mut self, key: &str, value: &str) -> Result<()> {
        let normalized: String = key
            .chars()
            .filter(|c| *c != '_')
            .map(|c| c.to_ascii_lowercase())
            .collect();
        match normalized.as_str() {
            "serverport" => self.server_port = value.parse()?,
            "chunksize" => self.chunk_size = value.parse()?,
            "folderstowatch" => self.folders_to_watch = value.to_string(),
            "filenamematchpattern" => self.filename_match_pattern = value.to_string(),
            "vcodec" => self.v_codec = value.to_string(),
            "acodec" => self.a_codec = value.to_string(),
            "abitrate" => self.a_bitrate = value.parse()?,
            "crf" => self.crf = value.parse()?,
            "tempfolder" => self.temp_folder = value.into(),
            "finalextension" => self.final_extension = value.to_string(),
            "dbpath" => self.db_path = value.into(),
            "resultfilesuffix" => self.result_file_suffix = value.to_string(),
            "logfile" => {
                self.log_file = if value.is_empty() {
                    None
                } else {
                    Some(value.into())
                }
            }
            "verbosity" => self.verbosity = value.parse()?,
            "movepairtimeoutms" => self.move_pair_timeout_ms = value.parse()?,
            _ => tracing::warn!("ignored unrecognized configuration key {key} = {value}"),
        }
        Ok(())
    }

    /// The watch list split on the path separator, empty entries dropped.
    pub fn watch_folders(&self) -> Vec<String> {
        self.folders_to_watch
            .split(':')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn move_pair_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.move_pair_timeout_ms)
    }
}
