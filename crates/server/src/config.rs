//! Chunkserver configuration: one struct, deserialized from TOML and
//! validated in a single pass.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::warn;

use chunkd_engine::EngineConfig;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("can't read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("can't parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Worker ceiling per pool.
    pub workers_max: u32,
    /// Busy-worker count above which the server reports overload.
    pub workers_hload_himark: Option<u32>,
    /// Busy-worker count below which the overload report clears.
    pub workers_hload_lomark: Option<u32>,
    /// Target idle pool size; surplus idle workers retire.
    pub workers_max_idle: u32,

    /// Chunks per v61 registration frame, clamped to [100, 10000].
    pub chunks_per_register_packet: u32,
    /// Optional shared secret for master authentication.
    pub auth_code: Option<String>,
    pub master_host: String,
    pub master_port: u16,
    /// Local address the master connection binds to.
    pub bind_host: Option<String>,
    /// Master read-idle timeout in seconds; 0 lets the master decide,
    /// anything else is clamped to >= 10.
    pub master_timeout: u32,
    pub master_reconnection_delay: u32,
    /// Subset of A-Z, separated by ',' or ';'.
    pub labels: String,

    pub listen_host: String,
    pub listen_port: u16,

    /// Directory holding `chunkserverid.mfs`.
    pub data_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers_max: EngineConfig::DEFAULT_WORKERS_MAX,
            workers_hload_himark: None,
            workers_hload_lomark: None,
            workers_max_idle: EngineConfig::DEFAULT_WORKERS_MAX_IDLE,
            chunks_per_register_packet: 1000,
            auth_code: None,
            master_host: "mfsmaster".to_string(),
            master_port: 9420,
            bind_host: None,
            master_timeout: 0,
            master_reconnection_delay: 5,
            labels: String::new(),
            listen_host: "0.0.0.0".to_string(),
            listen_port: 9422,
            data_path: PathBuf::from("."),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&raw)?;
        config.validate();
        Ok(config)
    }

    /// Applies the documented clamps, warning about nonsensical settings.
    pub fn validate(&mut self) {
        self.chunks_per_register_packet = self.chunks_per_register_packet.clamp(100, 10000);

        if self.master_timeout > 65535 {
            self.master_timeout = 65535;
        }
        if self.master_timeout > 0 && self.master_timeout < 10 {
            self.master_timeout = 10;
        }

        if let Some(himark) = self.workers_hload_himark {
            if himark >= self.workers_max {
                warn!("workers_hload_himark >= workers_max - it doesn't make sense - setting workers_hload_himark to workers_max * 3/4");
                self.workers_hload_himark = None;
            }
        }
        let himark = self
            .workers_hload_himark
            .unwrap_or(self.workers_max * 3 / 4);
        if let Some(lomark) = self.workers_hload_lomark {
            if lomark >= self.workers_max {
                warn!("workers_hload_lomark >= workers_max - it doesn't make sense - setting workers_hload_lomark to workers_max * 1/2");
                self.workers_hload_lomark = None;
            } else if lomark >= himark {
                warn!("workers_hload_lomark >= workers_hload_himark - it doesn't make sense - setting workers_hload_lomark to workers_hload_himark * 2/3");
                self.workers_hload_lomark = Some(himark * 2 / 3);
            }
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        let himark = self
            .workers_hload_himark
            .unwrap_or(self.workers_max * 3 / 4);
        let lomark = self.workers_hload_lomark.unwrap_or(self.workers_max / 2);
        EngineConfig {
            workers_max: self.workers_max,
            workers_himark: himark,
            workers_lomark: lomark,
            workers_max_idle: self.workers_max_idle,
        }
    }

    /// Parses `labels` into the 26-bit mask sent to the master, with the
    /// same diagnostics the flat config format produced.
    pub fn label_mask(&self) -> u32 {
        let mut mask = 0u32;
        let mut after_label = false;
        let mut parse_error = false;
        for c in self.labels.chars() {
            match c {
                'A'..='Z' | 'a'..='z' => {
                    let bit = 1u32 << (c.to_ascii_uppercase() as u32 - 'A' as u32);
                    if after_label {
                        warn!("labels: separator not found before label {c}");
                        parse_error = true;
                    }
                    after_label = true;
                    if mask & bit != 0 {
                        warn!("labels: found duplicate label {c}");
                        parse_error = true;
                    }
                    mask |= bit;
                }
                ',' | ';' => {
                    if after_label {
                        after_label = false;
                    } else {
                        if mask != 0 {
                            warn!("labels: more than one separator found");
                        } else {
                            warn!("labels: found separator at the beginning of definition");
                        }
                        parse_error = true;
                    }
                }
                ' ' | '\t' => {}
                other => {
                    warn!("labels: unrecognized character {other}");
                    parse_error = true;
                }
            }
        }
        if !after_label && mask != 0 {
            warn!("labels: found separator at the end of definition");
            parse_error = true;
        }
        if parse_error {
            warn!("labels must be a set of letters separated by ',' or ';'");
        }
        mask
    }
}
