use serde::Deserialize;
use std::fs;
use std::path::PathBuf;

use crate::error::{ReadoutError, Result};
use crate::recorder::writer::CompressionAlgorithm;

const DEFAULT_CONFIG_PATH: &str = "/etc/readoutd/readoutd.toml";
const ENV_CONFIG_PATH: &str = "READOUTD_CONFIG";

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub link: LinkConfig,
    #[serde(default)]
    pub recording: RecordingConfig,
    #[serde(default)]
    pub emulator: EmulatorConfig,
}

impl Config {
    /// Load configuration from file. The path can be overridden with the
    /// `READOUTD_CONFIG` environment variable. A missing file yields the
    /// defaults; a file that fails to parse is a configuration error.
    pub fn load() -> Result<Self> {
        let path =
            std::env::var(ENV_CONFIG_PATH).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(&PathBuf::from(path))
    }

    pub fn load_from(path: &PathBuf) -> Result<Self> {
        match fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents)
                .map_err(|e| ReadoutError::Configuration(format!("{}: {e}", path.display()))),
            Err(_) => Ok(Config::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.link.validate()?;
        self.recording.validate()
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct LinkConfig {
    /// Capacity of the latency buffer, in elements.
    #[serde(default = "default_latency_buffer_size")]
    pub latency_buffer_size: usize,
    /// Occupancy fraction at which eviction kicks in, in [0, 1].
    #[serde(default = "default_pop_limit_pct")]
    pub pop_limit_pct: f32,
    /// Fraction of the occupancy popped per eviction, in [0, 1].
    #[serde(default = "default_pop_size_pct")]
    pub pop_size_pct: f32,
    #[serde(default = "default_num_request_handling_threads")]
    pub num_request_handling_threads: usize,
    /// Waiting-list scans a deferred request survives before timing out.
    #[serde(default = "default_retry_count")]
    pub retry_count: usize,
    #[serde(default = "default_source_queue_timeout_ms")]
    pub source_queue_timeout_ms: u64,
    #[serde(default = "default_fragment_queue_timeout_ms")]
    pub fragment_queue_timeout_ms: u64,
    #[serde(default)]
    pub apa_number: u32,
    #[serde(default)]
    pub link_number: u32,
    /// Synthesise self-triggers from heartbeats (standalone testing).
    #[serde(default)]
    pub fake_trigger_flag: bool,
    /// Rewrite incoming timestamps to a perfectly incrementing sequence.
    #[serde(default)]
    pub emulator_mode: bool,
}

impl LinkConfig {
    pub fn validate(&self) -> Result<()> {
        if self.latency_buffer_size < 2 {
            return Err(ReadoutError::Configuration(format!(
                "latency_buffer_size must be at least 2, got {}",
                self.latency_buffer_size
            )));
        }
        if !(0.0..=1.0).contains(&self.pop_limit_pct) || !(0.0..=1.0).contains(&self.pop_size_pct) {
            return Err(ReadoutError::Configuration(format!(
                "auto-pop percentage out of range: pop_limit_pct={} pop_size_pct={}",
                self.pop_limit_pct, self.pop_size_pct
            )));
        }
        if self.num_request_handling_threads == 0 {
            return Err(ReadoutError::Configuration(
                "num_request_handling_threads must be nonzero".into(),
            ));
        }
        Ok(())
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            latency_buffer_size: default_latency_buffer_size(),
            pop_limit_pct: default_pop_limit_pct(),
            pop_size_pct: default_pop_size_pct(),
            num_request_handling_threads: default_num_request_handling_threads(),
            retry_count: default_retry_count(),
            source_queue_timeout_ms: default_source_queue_timeout_ms(),
            fragment_queue_timeout_ms: default_fragment_queue_timeout_ms(),
            apa_number: 0,
            link_number: 0,
            fake_trigger_flag: false,
            emulator_mode: false,
        }
    }
}

fn default_latency_buffer_size() -> usize {
    100_000
}
fn default_pop_limit_pct() -> f32 {
    0.8
}
fn default_pop_size_pct() -> f32 {
    0.1
}
fn default_num_request_handling_threads() -> usize {
    4
}
fn default_retry_count() -> usize {
    100
}
fn default_source_queue_timeout_ms() -> u64 {
    100
}
fn default_fragment_queue_timeout_ms() -> u64 {
    100
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct RecordingConfig {
    #[serde(default)]
    pub enable_raw_recording: bool,
    #[serde(default = "default_output_file")]
    pub output_file: PathBuf,
    /// Size of the in-memory block buffer; with O_DIRECT this is also the
    /// write granularity and must be a multiple of 4096.
    #[serde(default = "default_stream_buffer_size")]
    pub stream_buffer_size: usize,
    #[serde(default)]
    pub compression_algorithm: CompressionAlgorithm,
    #[serde(default = "default_use_o_direct")]
    pub use_o_direct: bool,
}

impl RecordingConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.enable_raw_recording {
            return Ok(());
        }
        if self.stream_buffer_size == 0 {
            return Err(ReadoutError::Configuration(
                "stream_buffer_size must be nonzero".into(),
            ));
        }
        if self.use_o_direct && self.stream_buffer_size % 4096 != 0 {
            return Err(ReadoutError::Configuration(format!(
                "stream_buffer_size must be a multiple of 4096 with use_o_direct, got {}",
                self.stream_buffer_size
            )));
        }
        Ok(())
    }
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            enable_raw_recording: false,
            output_file: default_output_file(),
            stream_buffer_size: default_stream_buffer_size(),
            compression_algorithm: CompressionAlgorithm::default(),
            use_o_direct: default_use_o_direct(),
        }
    }
}

fn default_output_file() -> PathBuf {
    PathBuf::from("/var/lib/readoutd/raw-recording.bin")
}
fn default_stream_buffer_size() -> usize {
    8 * 1024 * 1024
}
fn default_use_o_direct() -> bool {
    true
}

/// Built-in source emulator, used by the standalone daemon.
#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct EmulatorConfig {
    /// Super-chunk production rate.
    #[serde(default = "default_rate_khz")]
    pub rate_khz: f64,
    /// Probability of dropping a chunk, creating a real timestamp gap.
    #[serde(default)]
    pub dropout_rate: f64,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            rate_khz: default_rate_khz(),
            dropout_rate: 0.0,
        }
    }
}

fn default_rate_khz() -> f64 {
    10.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn parse_config_defaults() {
        let toml = r#"[link]
latency_buffer_size = 100000
pop_limit_pct = 0.8
pop_size_pct = 0.1
num_request_handling_threads = 4
retry_count = 100
apa_number = 2
link_number = 5
[recording]
enable_raw_recording = true
output_file = "/tmp/output.bin"
compression_algorithm = "zstd"
use_o_direct = false
"#;
        let cfg: Config = toml::from_str(toml).unwrap();
        assert_eq!(cfg.link.latency_buffer_size, 100_000);
        assert_eq!(cfg.link.apa_number, 2);
        assert_eq!(cfg.link.link_number, 5);
        assert_eq!(cfg.link.source_queue_timeout_ms, 100);
        assert_eq!(cfg.link.fragment_queue_timeout_ms, 100);
        assert!(!cfg.link.fake_trigger_flag);
        assert!(cfg.recording.enable_raw_recording);
        assert_eq!(cfg.recording.compression_algorithm, CompressionAlgorithm::Zstd);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn bad_percentage_fails_validation() {
        let mut cfg = Config::default();
        cfg.link.pop_limit_pct = 1.5;
        assert!(matches!(
            cfg.validate(),
            Err(ReadoutError::Configuration(_))
        ));
    }

    #[test]
    fn unknown_compression_algorithm_fails_parse() {
        let toml = r#"[recording]
compression_algorithm = "brotli"
"#;
        assert!(toml::from_str::<Config>(toml).is_err());
    }

    #[test]
    fn unknown_key_fails_parse() {
        let toml = r#"[link]
latency_buffer_sized = 10
"#;
        assert!(toml::from_str::<Config>(toml).is_err());
    }

    #[test]
    fn unaligned_direct_buffer_fails_validation() {
        let mut cfg = Config::default();
        cfg.recording.enable_raw_recording = true;
        cfg.recording.stream_buffer_size = 1000;
        cfg.recording.use_o_direct = true;
        assert!(cfg.validate().is_err());
        cfg.recording.use_o_direct = false;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn env_override() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[link]\nlink_number = 9").unwrap();
        unsafe {
            std::env::set_var(ENV_CONFIG_PATH, file.path());
        }
        let cfg = Config::load().unwrap();
        assert_eq!(cfg.link.link_number, 9);
        unsafe {
            std::env::remove_var(ENV_CONFIG_PATH);
        }
    }
}
