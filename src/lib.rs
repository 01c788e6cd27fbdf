//! Discrete-event simulator of the IEEE 802.11ax OFDMA MAC layer.
//!
//! Access points contend for a shared channel with exponential backoff, split it
//! into resource units for several stations at once and run the downlink or
//! uplink frame exchange with them. Collisions, retries, channel time, latency
//! and transferred data are accounted in [`stats::Stats`].

pub mod access_point;
pub mod channel;
pub mod config;
pub mod error;
pub mod node;
pub mod packet;
pub mod scheduler;
pub mod simulation;
pub mod station;
pub mod stats;
pub mod timing;
