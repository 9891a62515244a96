//! Runtime configuration: CLI flags via `clap`, an optional TOML file,
//! and the defaults named in spec.md \S6.
//!
//! Grounded on the teacher's `config.rs` (clap + toml + serde), extended
//! with every tunable the spec names instead of just `addr`/`clients`.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;

#[derive(Parser, Debug)]
#[command(version, about = "Realtime collaborative Markdown editor core")]
struct Opts {
    /// Path to a TOML config file. CLI flags override file values.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to bind the WebSocket/HTTP listener to.
    #[arg(short, long)]
    addr: Option<SocketAddr>,

    /// Directory the filesystem-backed `DocumentStore` persists into.
    #[arg(long)]
    store_dir: Option<PathBuf>,
}

/// Fully-resolved runtime configuration.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    pub addr: SocketAddr,
    pub store_dir: PathBuf,

    #[serde(with = "duration_secs")]
    pub save_delay: Duration,
    #[serde(with = "duration_secs")]
    pub compaction_age: Duration,
    #[serde(with = "duration_secs")]
    pub shutdown_flush_deadline: Duration,

    pub max_connections_per_document: usize,
    pub max_total_connections: usize,
    pub max_cached_rooms: usize,
    pub max_message_bytes: usize,
    pub max_persisted_bytes: usize,
    pub snapshot_compress_threshold: usize,
    pub snapshot_preview_chars: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8080".parse().expect("valid default addr"),
            store_dir: PathBuf::from("./data/documents"),
            save_delay: Duration::from_secs(4),
            compaction_age: Duration::from_secs(5 * 60),
            shutdown_flush_deadline: Duration::from_secs(5),
            max_connections_per_document: 50,
            max_total_connections: 500,
            max_cached_rooms: 20,
            max_message_bytes: 1_048_576,
            max_persisted_bytes: 5_242_880,
            snapshot_compress_threshold: 10 * 1024,
            snapshot_preview_chars: 1_000,
        }
    }
}

impl Config {
    /// Parses CLI args, optionally layering a TOML file underneath them.
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        let opts = Opts::parse();
        let mut config = match &opts.config {
            Some(path) => {
                let contents = std::fs::read_to_string(path)?;
                toml::from_str(&contents)?
            }
            None => Config::default(),
        };

        if let Some(addr) = opts.addr {
            config.addr = addr;
        }
        if let Some(dir) = opts.store_dir {
            config.store_dir = dir;
        }

        Ok(config)
    }
}

/// Serializes a `Duration` as whole seconds in the TOML file, so the
/// config format stays human-editable (`save_delay = 4` rather than a
/// nested struct).
mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let config = Config::default();
        assert_eq!(config.max_connections_per_document, 50);
        assert_eq!(config.max_total_connections, 500);
        assert_eq!(config.max_cached_rooms, 20);
        assert_eq!(config.max_message_bytes, 1_048_576);
        assert_eq!(config.max_persisted_bytes, 5_242_880);
        assert_eq!(config.save_delay, Duration::from_secs(4));
        assert_eq!(config.compaction_age, Duration::from_secs(300));
    }

    #[test]
    fn parses_toml_with_partial_overrides() {
        let toml_str = r#"
            max_cached_rooms = 5
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.max_cached_rooms, 5);
        assert_eq!(config.max_total_connections, 500);
    }
}
