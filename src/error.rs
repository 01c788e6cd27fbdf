use thiserror::Error;

use crate::packet::PacketType;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileReadError(#[from] std::io::Error),
    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TimingError {
    #[error("{0} duration needs the allocated bandwidth")]
    MissingBandwidth(PacketType),
    #[error("no subcarrier entry for a {0} MHz channel")]
    UnknownBandwidth(f64),
    #[error("MCS {0} is not in the MCS table")]
    UnknownMcs(u8),
}

#[derive(Error, Debug)]
pub enum SimulationError {
    #[error("Initialize the simulator before running the simulation")]
    NotInitialized,
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Timing(#[from] TimingError),
}
