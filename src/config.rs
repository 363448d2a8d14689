use anyhow::{Context, Result};
use serde::Deserialize;
use std::{
    fs,
    net::{Ipv4Addr, SocketAddr, SocketAddrV4, ToSocketAddrs},
    path::{Path, PathBuf},
};

use crate::cli::Cli;
use crate::filter::FilterChain;
use crate::inspect::{InspectorChain, PacketLogger, PatternFilter};
use crate::relay::{DEFAULT_HIGH_WATERMARK, Watermarks};
use crate::session::{DEFAULT_READ_CHUNK_SIZE, RelayContext};

#[derive(Debug, thiserror::Error)]
pub enum AddrError {
    #[error("invalid address `{0}`: expected host:port")]
    Malformed(String),
    #[error("port out of range in `{0}`")]
    BadPort(String),
    #[error("could not resolve `{addr}`: {reason}")]
    Unresolved { addr: String, reason: String },
}

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("high_watermark must be at least 2, got {0}")]
    HighWatermark(usize),
    #[error("read_chunk_size must be non-zero")]
    ReadChunkSize,
}

/// Parses a listen address: `host:port`, or a bare port bound on loopback.
pub fn parse_listen_addr(input: &str) -> Result<SocketAddr, AddrError> {
    if !input.is_empty() && input.bytes().all(|b| b.is_ascii_digit()) {
        return match input.parse::<u16>() {
            Ok(port) if port > 0 => Ok(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port).into()),
            _ => Err(AddrError::BadPort(input.to_string())),
        };
    }
    parse_host_port(input)
}

/// Parses `host:port`, resolving host names once.
pub fn parse_host_port(input: &str) -> Result<SocketAddr, AddrError> {
    if let Ok(addr) = input.parse::<SocketAddr>() {
        return Ok(addr);
    }
    let Some((host, port)) = input.rsplit_once(':') else {
        return Err(AddrError::Malformed(input.to_string()));
    };
    if host.is_empty() {
        return Err(AddrError::Malformed(input.to_string()));
    }
    if port.parse::<u16>().is_err() {
        return Err(AddrError::BadPort(input.to_string()));
    }
    input
        .to_socket_addrs()
        .map_err(|e| AddrError::Unresolved {
            addr: input.to_string(),
            reason: e.to_string(),
        })?
        .next()
        .ok_or_else(|| AddrError::Unresolved {
            addr: input.to_string(),
            reason: "no addresses found".to_string(),
        })
}

/// Tuning knobs read from the optional TOML file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RelaySettings {
    pub high_watermark: usize,
    pub read_chunk_size: usize,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            high_watermark: DEFAULT_HIGH_WATERMARK,
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
        }
    }
}

impl RelaySettings {
    pub fn validate(self) -> Result<Self, SettingsError> {
        if self.high_watermark < 2 {
            return Err(SettingsError::HighWatermark(self.high_watermark));
        }
        if self.read_chunk_size == 0 {
            return Err(SettingsError::ReadChunkSize);
        }
        Ok(self)
    }

    #[must_use]
    pub const fn watermarks(&self) -> Watermarks {
        Watermarks::with_high(self.high_watermark)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct SettingsFile {
    #[serde(default)]
    relay: RelaySettings,
}

pub fn load_settings(path: &Path) -> Result<RelaySettings> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let file: SettingsFile = toml::from_str(&content)
        .with_context(|| format!("Failed to parse {} as valid TOML", path.display()))?;
    Ok(file.relay.validate()?)
}

/// Everything the relay needs, fixed at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    pub upstream: SocketAddr,
    pub log_file: Option<PathBuf>,
    pub patterns: Vec<String>,
    pub settings: RelaySettings,
}

impl Config {
    pub fn from_cli(cli: Cli) -> Result<Self> {
        let listen = parse_listen_addr(&cli.listen).context("Invalid listen address")?;
        let upstream = parse_host_port(&cli.connect).context("Invalid connect address")?;
        let settings = match &cli.config {
            Some(path) => load_settings(path)?,
            None => RelaySettings::default(),
        };
        Ok(Self {
            listen,
            upstream,
            log_file: cli.log_file,
            patterns: cli.patterns,
            settings,
        })
    }

    /// Compiles the filter chain, opens the log file and assembles the shared
    /// session context. Any failure here aborts startup.
    pub fn relay_context(&self) -> Result<RelayContext> {
        let chain = FilterChain::compile(&self.patterns)?;
        let mut inspectors = InspectorChain::new();
        if let Some(path) = &self.log_file {
            inspectors = inspectors.with(PacketLogger::create(path)?);
        }
        if !chain.is_empty() {
            inspectors = inspectors.with(PatternFilter::new(chain, std::io::stdout()));
        }

        let mut ctx = RelayContext::new(inspectors);
        ctx.watermarks = self.settings.watermarks();
        ctx.read_chunk_size = self.settings.read_chunk_size;
        Ok(ctx)
    }
}
