//! Counters written by the protocol during a run and the summaries derived from them.

use std::fmt;

use crate::packet::NodeId;

fn round3(value: f64) -> f64 {
    (value * 1000.0).round_ties_even() / 1000.0
}

#[derive(Debug, Clone, Default)]
pub struct Stats {
    /// Cumulative channel time in microseconds.
    transmission_time: f64,
    latency_per_station: Vec<f64>,
    data_transferred_per_station: Vec<u64>,
    number_of_transmissions_per_station: Vec<u64>,
    number_of_transmissions_per_ap: Vec<u64>,
    number_of_retransmissions_per_ap: Vec<u64>,
}

impl Stats {
    pub fn new(number_of_ap: usize, number_of_stations: usize) -> Stats {
        Stats {
            transmission_time: 0.0,
            latency_per_station: vec![0.0; number_of_stations],
            data_transferred_per_station: vec![0; number_of_stations],
            number_of_transmissions_per_station: vec![0; number_of_stations],
            number_of_transmissions_per_ap: vec![0; number_of_ap],
            number_of_retransmissions_per_ap: vec![0; number_of_ap],
        }
    }

    pub fn transmission_time(&self) -> f64 {
        self.transmission_time
    }

    pub fn add_transmission_time(&mut self, time: f64) {
        self.transmission_time += time;
    }

    /// Adds `latency` to every station outside `in_transmission`.
    pub fn increase_latency_for_stations_not_transmitting(
        &mut self,
        in_transmission: &[usize],
        latency: f64,
    ) {
        for (station, total) in self.latency_per_station.iter_mut().enumerate() {
            if !in_transmission.contains(&station) {
                *total += latency;
            }
        }
    }

    /// Airtime and idle-station latency move together for every frame exchange.
    pub fn account_channel_time(&mut self, in_transmission: &[usize], time: f64) {
        self.add_transmission_time(time);
        self.increase_latency_for_stations_not_transmitting(in_transmission, time);
    }

    pub fn add_data_transferred(&mut self, station: usize, bits: u64) {
        self.data_transferred_per_station[station] += bits;
    }

    pub fn count_ap_transmission(&mut self, ap: usize) {
        self.number_of_transmissions_per_ap[ap] += 1;
    }

    pub fn count_station_transmission(&mut self, station: usize) {
        self.number_of_transmissions_per_station[station] += 1;
    }

    pub fn count_retransmission(&mut self, ap: usize) {
        self.number_of_retransmissions_per_ap[ap] += 1;
    }

    pub fn latency(&self, station: usize) -> f64 {
        self.latency_per_station[station]
    }

    pub fn data_transferred(&self, station: usize) -> u64 {
        self.data_transferred_per_station[station]
    }

    pub fn transmissions_per_station(&self) -> &[u64] {
        &self.number_of_transmissions_per_station
    }

    pub fn transmissions_per_ap(&self) -> &[u64] {
        &self.number_of_transmissions_per_ap
    }

    pub fn retransmissions_per_ap(&self) -> &[u64] {
        &self.number_of_retransmissions_per_ap
    }

    pub fn number_of_transmissions(&self) -> u64 {
        self.number_of_transmissions_per_ap.iter().sum()
    }

    pub fn number_of_retransmissions(&self) -> u64 {
        self.number_of_retransmissions_per_ap.iter().sum()
    }

    /// Mb/s for `bits` carried over the cumulative channel time.
    fn throughput_of(&self, bits: u64) -> f64 {
        if self.transmission_time <= 0.0 {
            return 0.0;
        }
        let bps = (bits as f64 / (self.transmission_time / 1_000_000.0)).round_ties_even();
        round3(bps / 1_000_000.0)
    }

    pub fn throughput(&self) -> f64 {
        self.throughput_of(self.data_transferred_per_station.iter().sum())
    }

    pub fn throughput_per_station(&self) -> Vec<(NodeId, f64)> {
        self.data_transferred_per_station
            .iter()
            .enumerate()
            .map(|(i, bits)| (NodeId::Station(i), self.throughput_of(*bits)))
            .collect()
    }

    /// Average latency per transmission in ms. `None` for stations never served.
    pub fn latency_per_station(&self) -> Vec<(NodeId, Option<f64>)> {
        self.latency_per_station
            .iter()
            .zip(&self.number_of_transmissions_per_station)
            .enumerate()
            .map(|(i, (latency, transmissions))| {
                let average = (*transmissions > 0)
                    .then(|| round3((latency / *transmissions as f64) / 1000.0));
                (NodeId::Station(i), average)
            })
            .collect()
    }

    /// Mean of the per-station latencies over the stations that were served.
    pub fn average_latency(&self) -> Option<f64> {
        let served: Vec<f64> = self
            .latency_per_station()
            .into_iter()
            .filter_map(|(_, latency)| latency)
            .collect();
        if served.is_empty() {
            return None;
        }
        Some(round3(served.iter().sum::<f64>() / served.len() as f64))
    }

    pub fn summary(&self) -> StatsSummary {
        StatsSummary {
            transmissions: self.number_of_transmissions(),
            retransmissions: self.number_of_retransmissions(),
            throughput_per_station: self.throughput_per_station(),
            throughput: self.throughput(),
            latency_per_station: self.latency_per_station(),
            average_latency: self.average_latency(),
        }
    }
}

/// End-of-run report.
#[derive(Debug, Clone, PartialEq)]
pub struct StatsSummary {
    pub transmissions: u64,
    pub retransmissions: u64,
    pub throughput_per_station: Vec<(NodeId, f64)>,
    pub throughput: f64,
    pub latency_per_station: Vec<(NodeId, Option<f64>)>,
    pub average_latency: Option<f64>,
}

impl fmt::Display for StatsSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Number of transmissions performed in entire network: {}",
            self.transmissions
        )?;
        writeln!(
            f,
            "Number of retransmissions occurred in entire network: {}",
            self.retransmissions
        )?;
        for (station, thr) in &self.throughput_per_station {
            writeln!(f, "Throughput obtained for {}: {} Mbps", station, thr)?;
        }
        writeln!(
            f,
            "Throughput obtained for the entire network: {} Mbps",
            self.throughput
        )?;
        match self.average_latency {
            Some(latency) => write!(
                f,
                "Average latency obtained for the entire network: {} ms",
                latency
            ),
            None => write!(f, "Average latency obtained for the entire network: n/a"),
        }
    }
}
