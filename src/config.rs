//! Run parameters and channel/PHY tables, loadable from TOML.

use serde::Deserialize;
use std::fmt;
use std::fs;
use std::path::Path;

use crate::error::ConfigError;
use crate::packet::PacketType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum Direction {
    #[serde(rename = "DL")]
    Downlink,
    #[serde(rename = "UL")]
    Uplink,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Downlink => write!(f, "DL"),
            Direction::Uplink => write!(f, "UL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum Modulation {
    #[serde(rename = "BPSK")]
    Bpsk,
    #[serde(rename = "QPSK")]
    Qpsk,
    #[serde(rename = "16-QAM")]
    Qam16,
    #[serde(rename = "64-QAM")]
    Qam64,
    #[serde(rename = "256-QAM")]
    Qam256,
    #[serde(rename = "1024-QAM")]
    Qam1024,
}

impl Modulation {
    /// Coded bits carried per subcarrier.
    pub fn bits(&self) -> u32 {
        match self {
            Modulation::Bpsk => 1,
            Modulation::Qpsk => 2,
            Modulation::Qam16 => 4,
            Modulation::Qam64 => 6,
            Modulation::Qam256 => 8,
            Modulation::Qam1024 => 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct McsEntry {
    pub index: u8,
    pub modulation: Modulation,
    pub coding_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SubcarrierEntry {
    /// Sub-channel width in MHz.
    pub bandwidth: f64,
    pub subcarriers: u32,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MaxStationsEntry {
    pub bandwidth: f64,
    pub stations: usize,
}

pub(crate) fn same_width(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-9
}

/// Radio channel and PHY parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Channel width in MHz.
    pub bandwidth: f64,
    /// Sub-channel widths a resource unit can take, ascending.
    pub subchannels: Vec<f64>,
    pub spatial_streams: u32,
    pub cw_min: u32,
    pub cw_max: u32,
    pub aifsn: u32,
    /// Slot time in microseconds.
    pub slot_time: f64,
    pub sifs_time: f64,
    pub txop_time: f64,
    /// Payload of one MPDU in bits.
    pub mpdu_size: u32,
    pub max_stations: Vec<MaxStationsEntry>,
    pub subcarriers: Vec<SubcarrierEntry>,
    pub mcs_table: Vec<McsEntry>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        let mcs = [
            (Modulation::Bpsk, 1.0 / 2.0),
            (Modulation::Qpsk, 1.0 / 2.0),
            (Modulation::Qpsk, 3.0 / 4.0),
            (Modulation::Qam16, 1.0 / 2.0),
            (Modulation::Qam16, 3.0 / 4.0),
            (Modulation::Qam64, 2.0 / 3.0),
            (Modulation::Qam64, 3.0 / 4.0),
            (Modulation::Qam64, 5.0 / 6.0),
            (Modulation::Qam256, 3.0 / 4.0),
            (Modulation::Qam256, 5.0 / 6.0),
            (Modulation::Qam1024, 3.0 / 4.0),
            (Modulation::Qam1024, 5.0 / 6.0),
        ];
        ChannelConfig {
            bandwidth: 40.0,
            subchannels: vec![2.22, 5.0, 10.0, 20.0, 40.0, 80.0, 160.0],
            spatial_streams: 1,
            cw_min: 15,
            cw_max: 63,
            aifsn: 3,
            slot_time: 9.0,
            sifs_time: 16.0,
            txop_time: 2.528 * 1000.0,
            mpdu_size: 12000,
            max_stations: [(20.0, 9), (40.0, 18), (80.0, 37), (160.0, 74)]
                .iter()
                .map(|&(bandwidth, stations)| MaxStationsEntry { bandwidth, stations })
                .collect(),
            subcarriers: [
                (2.22, 24),
                (5.0, 48),
                (10.0, 102),
                (20.0, 234),
                (40.0, 468),
                (80.0, 980),
                (160.0, 1960),
            ]
            .iter()
            .map(|&(bandwidth, subcarriers)| SubcarrierEntry {
                bandwidth,
                subcarriers,
            })
            .collect(),
            mcs_table: mcs
                .iter()
                .enumerate()
                .map(|(index, &(modulation, coding_rate))| McsEntry {
                    index: index as u8,
                    modulation,
                    coding_rate,
                })
                .collect(),
        }
    }
}

impl ChannelConfig {
    pub fn aifs_time(&self) -> f64 {
        (self.aifsn as f64 * self.slot_time) + self.sifs_time
    }

    pub fn difs_time(&self) -> f64 {
        (2.0 * self.slot_time) + self.sifs_time
    }

    pub fn subcarriers_for(&self, bandwidth: f64) -> Option<u32> {
        self.subcarriers
            .iter()
            .find(|e| same_width(e.bandwidth, bandwidth))
            .map(|e| e.subcarriers)
    }

    pub fn max_stations_for(&self, bandwidth: f64) -> Option<usize> {
        self.max_stations
            .iter()
            .find(|e| same_width(e.bandwidth, bandwidth))
            .map(|e| e.stations)
    }

    pub fn mcs(&self, index: u8) -> Option<&McsEntry> {
        self.mcs_table.iter().find(|e| e.index == index)
    }
}

/// Parameters of one simulation run.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Horizon in microseconds.
    pub simulation_time: f64,
    pub number_of_ap: usize,
    pub number_of_stations: usize,
    pub seed: u64,
    pub direction: Direction,
    pub mcs: u8,
    /// Data rate in Mb/s, used when `data_rate_predefined` is set.
    pub data_rate: f64,
    /// Resource-unit widths in MHz, used when `ru_predefined` is set.
    pub ru_list: Vec<f64>,
    pub rts_procedure: bool,
    pub bsrp_procedure: bool,
    pub mpdu_aggregation: bool,
    pub ru_predefined: bool,
    pub data_rate_predefined: bool,
    pub channel: ChannelConfig,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        SimulationConfig {
            simulation_time: 100_000.0,
            number_of_ap: 1,
            number_of_stations: 60,
            seed: 1,
            direction: Direction::Downlink,
            mcs: 11,
            data_rate: 72.0,
            ru_list: vec![10.0, 10.0, 10.0, 10.0],
            rts_procedure: false,
            bsrp_procedure: false,
            mpdu_aggregation: false,
            ru_predefined: true,
            data_rate_predefined: false,
            channel: ChannelConfig::default(),
        }
    }
}

impl SimulationConfig {
    /// Load and validate a configuration from a TOML file. Missing keys keep their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        let config: SimulationConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let channel = &self.channel;
        if self.number_of_ap == 0 {
            return Err(ConfigError::ValidationError(
                "Number of access points must be positive".into(),
            ));
        }
        if self.number_of_stations < self.number_of_ap {
            return Err(ConfigError::ValidationError(
                "Every access point needs at least one station".into(),
            ));
        }
        if self.simulation_time <= 0.0 {
            return Err(ConfigError::ValidationError(
                "Simulation time must be positive".into(),
            ));
        }
        if channel.mcs(self.mcs).is_none() {
            return Err(ConfigError::ValidationError(format!(
                "MCS {} is not in the MCS table",
                self.mcs
            )));
        }
        if self.data_rate_predefined && self.data_rate <= 0.0 {
            return Err(ConfigError::ValidationError(
                "Predefined data rate must be positive".into(),
            ));
        }
        if channel.spatial_streams == 0 {
            return Err(ConfigError::ValidationError(
                "Number of spatial streams must be positive".into(),
            ));
        }
        if channel.slot_time <= 0.0 {
            return Err(ConfigError::ValidationError("Slot time must be positive".into()));
        }
        if channel.cw_min > channel.cw_max {
            return Err(ConfigError::ValidationError(
                "CW_MIN must not exceed CW_MAX".into(),
            ));
        }
        if channel.subchannels.is_empty() {
            return Err(ConfigError::ValidationError(
                "Sub-channel catalogue must not be empty".into(),
            ));
        }
        for width in channel.subchannels.iter().chain(self.ru_list.iter()) {
            if channel.subcarriers_for(*width).is_none() {
                return Err(ConfigError::ValidationError(format!(
                    "No subcarrier entry for a {} MHz sub-channel",
                    width
                )));
            }
        }
        if self.ru_predefined {
            if self.ru_list.is_empty() {
                return Err(ConfigError::ValidationError(
                    "Predefined RU list must not be empty".into(),
                ));
            }
        } else if channel.max_stations_for(channel.bandwidth).is_none() {
            return Err(ConfigError::ValidationError(format!(
                "No max-stations entry for a {} MHz channel",
                channel.bandwidth
            )));
        }
        Ok(())
    }

    /// AP expectation at the start of every round.
    pub fn initial_ap_expectation(&self) -> PacketType {
        match self.direction {
            Direction::Downlink if self.rts_procedure => PacketType::Cts,
            Direction::Downlink => PacketType::TbBack,
            Direction::Uplink if self.bsrp_procedure => PacketType::Bsr,
            Direction::Uplink if self.rts_procedure => PacketType::Cts,
            Direction::Uplink => PacketType::UlAMpdu,
        }
    }

    /// Station expectation at the start of every round.
    pub fn initial_station_expectation(&self) -> PacketType {
        match self.direction {
            Direction::Downlink if self.rts_procedure => PacketType::MuRts,
            Direction::Downlink => PacketType::DlAMpdu,
            Direction::Uplink if self.bsrp_procedure => PacketType::BsrpTrigger,
            Direction::Uplink if self.rts_procedure => PacketType::MuRts,
            Direction::Uplink => PacketType::BasicTrigger,
        }
    }

    /// Frame that follows the RTS handshake (or opens the round without one).
    pub fn data_phase_frame(&self) -> PacketType {
        match self.direction {
            Direction::Downlink => PacketType::DlAMpdu,
            Direction::Uplink => PacketType::BasicTrigger,
        }
    }
}
