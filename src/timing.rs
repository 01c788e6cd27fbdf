//! Frame durations and data volumes.
//!
//! Durations are in microseconds, frame lengths in bits. Legacy frames (control
//! and trigger frames) use the 24 bits/symbol legacy rate; HE frames use the data
//! rate derived from the MCS, the spatial streams and the subcarriers of the
//! resource unit.

use rand::Rng;

use crate::config::{ChannelConfig, Direction, McsEntry, SimulationConfig};
use crate::error::TimingError;
use crate::packet::PacketType;

const SERVICE_FIELD: f64 = 16.0;
const MPDU_DELIMITER: f64 = 32.0;
const MAC_HEADER: f64 = 320.0;
const TAIL_BITS: f64 = 18.0;
const RTS_LENGTH: f64 = 160.0;
const CTS_LENGTH: f64 = 112.0;
const BLOCK_ACK_LENGTH: f64 = 256.0;
const BSRP_LENGTH: f64 = 160.0;
const BSR_LENGTH: f64 = 112.0;

const LEGACY_PREAMBLE: f64 = 20.0;
const HE_MU_PREAMBLE: f64 = 48.0;
const HE_TB_PREAMBLE: f64 = 48.0;

const OFDM_LEGACY: f64 = 3.6;
const OFDM: f64 = 13.6;
const LEGACY_DATA_RATE: f64 = 24.0;

fn legacy_frame_time(length: f64) -> f64 {
    LEGACY_PREAMBLE + ((SERVICE_FIELD + length + TAIL_BITS) / LEGACY_DATA_RATE) * OFDM_LEGACY
}

fn mu_rts_length(destinations: usize) -> f64 {
    224.0 + (40 * destinations) as f64
}

fn basic_trigger_length(destinations: usize) -> f64 {
    224.0 + (48 * destinations) as f64
}

fn ms_back_length(destinations: usize) -> f64 {
    176.0 + (64 * destinations) as f64
}

/// Rate model of one run, fixed at construction.
#[derive(Debug, Clone)]
pub struct Timing {
    channel: ChannelConfig,
    mcs: McsEntry,
    direction: Direction,
    predefined_rate: Option<f64>,
    aggregation: bool,
    rts: bool,
}

impl Timing {
    pub fn new(config: &SimulationConfig) -> Result<Timing, TimingError> {
        let mcs = config
            .channel
            .mcs(config.mcs)
            .cloned()
            .ok_or(TimingError::UnknownMcs(config.mcs))?;
        Ok(Timing {
            channel: config.channel.clone(),
            mcs,
            direction: config.direction,
            predefined_rate: config.data_rate_predefined.then_some(config.data_rate),
            aggregation: config.mpdu_aggregation,
            rts: config.rts_procedure,
        })
    }

    pub fn sifs_time(&self) -> f64 {
        self.channel.sifs_time
    }

    pub fn aifs_time(&self) -> f64 {
        self.channel.aifs_time()
    }

    pub fn slot_time(&self) -> f64 {
        self.channel.slot_time
    }

    /// Air time of a frame. HE frames (A-MPDUs and TB-BACK) need the resource-unit width.
    pub fn packet_time(
        &self,
        packet_type: PacketType,
        bandwidth: Option<f64>,
        destinations: usize,
    ) -> Result<f64, TimingError> {
        let width = || bandwidth.ok_or(TimingError::MissingBandwidth(packet_type));
        match packet_type {
            PacketType::BsrpTrigger => Ok(self.bsrp_time()),
            PacketType::Bsr => Ok(self.bsr_time()),
            PacketType::MuRts => Ok(self.mu_rts_time(destinations)),
            PacketType::Cts => Ok(self.cts_time()),
            PacketType::BasicTrigger => Ok(self.trigger_time(destinations)),
            PacketType::MsBack => Ok(self.ms_back_time(destinations)),
            PacketType::TbBack => self.tb_back_time(width()?),
            PacketType::DlAMpdu => self.data_frame_time(HE_MU_PREAMBLE, width()?, destinations),
            PacketType::UlAMpdu => self.data_frame_time(HE_TB_PREAMBLE, width()?, destinations),
        }
    }

    pub fn bsrp_time(&self) -> f64 {
        legacy_frame_time(BSRP_LENGTH)
    }

    pub fn bsr_time(&self) -> f64 {
        legacy_frame_time(BSR_LENGTH)
    }

    pub fn rts_time(&self) -> f64 {
        legacy_frame_time(RTS_LENGTH)
    }

    pub fn mu_rts_time(&self, destinations: usize) -> f64 {
        legacy_frame_time(mu_rts_length(destinations))
    }

    pub fn cts_time(&self) -> f64 {
        legacy_frame_time(CTS_LENGTH)
    }

    pub fn trigger_time(&self, destinations: usize) -> f64 {
        legacy_frame_time(basic_trigger_length(destinations))
    }

    pub fn back_time(&self) -> f64 {
        legacy_frame_time(BLOCK_ACK_LENGTH)
    }

    pub fn ms_back_time(&self, destinations: usize) -> f64 {
        legacy_frame_time(ms_back_length(destinations))
    }

    pub fn tb_back_time(&self, bandwidth: f64) -> Result<f64, TimingError> {
        let r = self.effective_rate(bandwidth)?;
        Ok(HE_TB_PREAMBLE + ((SERVICE_FIELD + BLOCK_ACK_LENGTH + TAIL_BITS) / r) * OFDM)
    }

    fn data_frame_time(
        &self,
        preamble: f64,
        bandwidth: f64,
        destinations: usize,
    ) -> Result<f64, TimingError> {
        let r = self.effective_rate(bandwidth)?;
        let mpdu_bits = MPDU_DELIMITER + MAC_HEADER + self.mpdu_size();
        if self.aggregation {
            let mpdus = self.number_of_mpdu(r, bandwidth, destinations)?;
            Ok(preamble + ((SERVICE_FIELD + mpdus * mpdu_bits + TAIL_BITS) / r) * OFDM)
        } else {
            Ok(preamble + ((SERVICE_FIELD + mpdu_bits + TAIL_BITS) / r) * OFDM)
        }
    }

    /// Bits carried per HE symbol on a resource unit of `bandwidth` MHz, derived from the MCS.
    pub fn data_rate(&self, bandwidth: f64) -> Result<f64, TimingError> {
        let subcarriers = self
            .channel
            .subcarriers_for(bandwidth)
            .ok_or(TimingError::UnknownBandwidth(bandwidth))?;
        let streams = self.channel.spatial_streams as f64;
        let bits = self.mcs.modulation.bits() as f64;
        Ok(streams * bits * self.mcs.coding_rate * subcarriers as f64)
    }

    /// Rate used for frame durations: the predefined rate when configured, else the derived one.
    fn effective_rate(&self, bandwidth: f64) -> Result<f64, TimingError> {
        match self.predefined_rate {
            Some(rate) => Ok(rate * OFDM),
            None => self.data_rate(bandwidth),
        }
    }

    fn mpdu_size(&self) -> f64 {
        self.channel.mpdu_size as f64
    }

    /// MPDUs that fit in what the TXOP leaves after the control frames of the exchange.
    fn number_of_mpdu(
        &self,
        data_rate: f64,
        bandwidth: f64,
        destinations: usize,
    ) -> Result<f64, TimingError> {
        let sifs = self.channel.sifs_time;
        let aifs = self.channel.aifs_time();
        let mut txop_remained = self.channel.txop_time;
        if self.rts {
            txop_remained -= self.mu_rts_time(destinations) + self.cts_time() + (2.0 * sifs);
        }
        match self.direction {
            Direction::Downlink => {
                txop_remained -= self.tb_back_time(bandwidth)? + sifs + aifs + HE_MU_PREAMBLE;
            }
            Direction::Uplink => {
                txop_remained -= self.trigger_time(destinations)
                    + self.ms_back_time(destinations)
                    + (2.0 * sifs)
                    + aifs
                    + HE_TB_PREAMBLE;
            }
        }
        let mpdu_time = ((SERVICE_FIELD + MPDU_DELIMITER + MAC_HEADER + self.mpdu_size() + TAIL_BITS)
            / data_rate)
            * OFDM;
        Ok((txop_remained / mpdu_time).floor().max(0.0))
    }

    /// Payload bits delivered by one data frame on a resource unit of `bandwidth` MHz.
    pub fn sent_data(&self, bandwidth: f64, destinations: usize) -> Result<u64, TimingError> {
        if self.aggregation {
            let r = self.data_rate(bandwidth)?;
            let mpdus = self.number_of_mpdu(r, bandwidth, destinations)?;
            Ok(mpdus as u64 * self.channel.mpdu_size as u64)
        } else {
            Ok(self.channel.mpdu_size as u64)
        }
    }

    /// Contention window after `retries` failed attempts.
    pub fn contention_window(&self, retries: u32) -> u32 {
        let cw_min = self.channel.cw_min as u64;
        let window = ((cw_min + 1) << retries.min(32)) - 1;
        window.min(self.channel.cw_max as u64) as u32
    }

    /// Draws a backoff: a uniform number of slots from the contention window, plus AIFS.
    pub fn random_backoff_time<R: Rng>(&self, retries: u32, rng: &mut R) -> f64 {
        let slots = rng.gen_range(0..=self.contention_window(retries));
        slots as f64 * self.channel.slot_time + self.aifs_time()
    }
}
