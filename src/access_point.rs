//! Access point: station partition, per-round scheduling, contention and the
//! AP side of every frame exchange.

use rand::seq::index::sample;
use rand::Rng;
use std::cell::RefCell;
use std::rc::Rc;

use crate::config::Direction;
use crate::error::TimingError;
use crate::node::{hold, send_packet, Interruption, Node, NodeContext, Protocol};
use crate::packet::{NodeId, Packet, PacketType};
use crate::scheduler::{Interrupt, ProcessId};
use crate::station::Station;

/// Failed attempts after which the round is abandoned.
const MAX_RETRANSMISSIONS: u32 = 7;

/// Picks `min(candidates, max_stations)` distinct positions out of `candidates`.
pub fn select_destinations<R: Rng>(candidates: usize, max_stations: usize, rng: &mut R) -> Vec<usize> {
    if candidates > max_stations {
        sample(rng, candidates, max_stations).into_vec()
    } else {
        (0..candidates).collect()
    }
}

/// How many of the narrowest sub-channels fit side by side in `bandwidth`.
pub fn derived_capacity(bandwidth: f64, subchannels: &[f64]) -> usize {
    let narrowest = subchannels.iter().copied().fold(f64::INFINITY, f64::min);
    if narrowest.is_finite() && narrowest > 0.0 {
        ((bandwidth + 1e-9) / narrowest).floor() as usize
    } else {
        0
    }
}

/// Draws one resource unit per destination from the configured list, without replacement.
///
/// Returns the assigned widths, in destination order, and the units left over.
pub fn allocate_predefined<R: Rng>(
    ru_list: &[f64],
    destinations: usize,
    rng: &mut R,
) -> (Vec<f64>, Vec<f64>) {
    let mut pool = ru_list.to_vec();
    let mut assigned = Vec::with_capacity(destinations);
    for _ in 0..destinations {
        if pool.is_empty() {
            break;
        }
        let pick = rng.gen_range(0..pool.len());
        assigned.push(pool.remove(pick));
    }
    (assigned, pool)
}

/// Builds a pool of `destinations` widths by upgrading entries through the
/// sub-channel catalogue until the pool fills `bandwidth`, then hands them out at random.
///
/// An upgrade that would overshoot the channel is skipped, so the assigned widths never
/// sum to more than `bandwidth`.
pub fn allocate_derived<R: Rng>(
    bandwidth: f64,
    subchannels: &[f64],
    destinations: usize,
    rng: &mut R,
) -> (Vec<f64>, Vec<f64>) {
    let mut pool = vec![0.0; destinations];
    let mut sum = 0.0;
    'fill: for &width in subchannels {
        for slot in pool.iter_mut() {
            let candidate = sum - *slot + width;
            if candidate > bandwidth + 1e-9 {
                continue;
            }
            *slot = width;
            sum = candidate;
            if (bandwidth - sum).round_ties_even() <= 0.0 {
                break 'fill;
            }
        }
    }
    allocate_predefined(&pool, destinations, rng)
}

enum AttemptError {
    Interrupted(Interruption),
    Timing(TimingError),
}

impl From<Interrupt<Interruption>> for AttemptError {
    fn from(interrupt: Interrupt<Interruption>) -> Self {
        AttemptError::Interrupted(interrupt.cause)
    }
}

impl From<TimingError> for AttemptError {
    fn from(error: TimingError) -> Self {
        AttemptError::Timing(error)
    }
}

struct ApState {
    assigned_stations: Vec<Rc<Station>>,
    destination_stations: Vec<Rc<Station>>,
    expected_destinations_number: usize,
    received_packets_number: usize,
    sensing_process: Option<ProcessId>,
    backoff_process: Option<ProcessId>,
    backoff_suspended: bool,
    retransmission_counter: u32,
    transmission_complete: bool,
    transmission_abandoned: bool,
    type_of_packet_to_wait: PacketType,
}

impl ApState {
    fn destination_indices(&self) -> Vec<usize> {
        self.destination_stations.iter().map(|s| s.index()).collect()
    }

    fn destination_ids(&self) -> Vec<NodeId> {
        self.destination_stations.iter().map(|s| s.id()).collect()
    }

    /// Closes the round without counting it.
    fn abandon(&mut self) {
        self.transmission_complete = true;
        self.transmission_abandoned = true;
        self.retransmission_counter = 0;
        self.sensing_process = None;
    }
}

pub struct AccessPoint {
    index: usize,
    node: Node,
    all_stations: Rc<Vec<Rc<Station>>>,
    state: RefCell<ApState>,
}

impl AccessPoint {
    pub fn new(index: usize, cx: NodeContext, all_stations: Rc<Vec<Rc<Station>>>) -> AccessPoint {
        let initial = cx.config.initial_ap_expectation();
        AccessPoint {
            index,
            node: Node::new(NodeId::AccessPoint(index), cx),
            all_stations,
            state: RefCell::new(ApState {
                assigned_stations: Vec::new(),
                destination_stations: Vec::new(),
                expected_destinations_number: 0,
                received_packets_number: 0,
                sensing_process: None,
                backoff_process: None,
                backoff_suspended: false,
                retransmission_counter: 0,
                transmission_complete: false,
                transmission_abandoned: false,
                type_of_packet_to_wait: initial,
            }),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn id(&self) -> NodeId {
        self.node.id()
    }

    pub fn assigned_stations(&self) -> Vec<NodeId> {
        self.state.borrow().assigned_stations.iter().map(|s| s.id()).collect()
    }

    pub fn destination_stations(&self) -> Vec<NodeId> {
        self.state.borrow().destination_ids()
    }

    pub fn retransmission_counter(&self) -> u32 {
        self.state.borrow().retransmission_counter
    }

    pub fn type_of_packet_to_wait(&self) -> PacketType {
        self.state.borrow().type_of_packet_to_wait
    }

    pub fn is_transmission_complete(&self) -> bool {
        self.state.borrow().transmission_complete
    }

    /// Round loop of this access point. Runs until the horizon.
    pub async fn perform_transmission(self: Rc<Self>) {
        self.assign_stations_to_ap();
        let env = self.node.env().clone();
        loop {
            log::info!("[{}] - [{}] Transmission scheduling is started.", env.now(), self.id());
            {
                let mut state = self.state.borrow_mut();
                state.transmission_complete = false;
                state.transmission_abandoned = false;
                state.destination_stations.clear();
            }
            self.select_stations_for_current_transmission();
            self.allocate_resources();

            log::info!("[{}] - [{}] New transmission is started.", env.now(), self.id());
            let sensing = env.process(Rc::clone(&self).compete_for_channel_and_start_transmission());
            self.state.borrow_mut().sensing_process = Some(sensing);
            if let Err(Interrupt { cause }) = env.join(sensing).await {
                log::warn!("[{}] - [{}] Round loop interrupted: {}", env.now(), self.id(), cause);
            }
            while !self.is_transmission_complete() {
                hold(&self.node, 1.0).await;
            }

            let state = self.state.borrow();
            if !state.transmission_abandoned {
                let mut stats = self.node.cx().stats.borrow_mut();
                stats.count_ap_transmission(self.index);
                for station in &state.destination_stations {
                    stats.count_station_transmission(station.index());
                }
            }
            drop(state);
            log::info!("[{}] - [{}] Transmission complete.", env.now(), self.id());
        }
    }

    /// Claims this AP's share of the unassociated stations for the whole run.
    fn assign_stations_to_ap(&self) {
        let config = &self.node.cx().config;
        let stations_per_ap = config.number_of_stations / config.number_of_ap;
        let available: Vec<&Rc<Station>> =
            self.all_stations.iter().filter(|s| !s.is_associated()).collect();
        let amount = stations_per_ap.min(available.len());
        let picked = sample(&mut *self.node.cx().rng.borrow_mut(), available.len(), amount);

        let mut assigned: Vec<Rc<Station>> =
            picked.iter().map(|i| Rc::clone(available[i])).collect();
        for station in &assigned {
            station.associate();
        }
        if self.index + 1 == config.number_of_ap {
            for station in self.all_stations.iter().filter(|s| !s.is_associated()) {
                station.associate();
                assigned.push(Rc::clone(station));
            }
        }

        let names: Vec<String> = assigned.iter().map(|s| s.id().to_string()).collect();
        log::info!(
            "[{}] - [{}] List of stations assigned to Access Point: [{}]",
            self.node.now(),
            self.id(),
            names.join(", ")
        );
        self.state.borrow_mut().assigned_stations = assigned;
    }

    fn select_stations_for_current_transmission(&self) {
        let cx = self.node.cx();
        let max_stations = if cx.config.ru_predefined {
            cx.config.ru_list.len()
        } else {
            let channel = cx.channel.borrow();
            let fit = derived_capacity(channel.bandwidth(), channel.possible_subchannels());
            match channel.max_stations_in_transmission() {
                Some(max) => max.min(fit),
                None => {
                    log::error!(
                        "[{}] - [{}] No station limit for a {} MHz channel",
                        self.node.now(),
                        self.id(),
                        channel.bandwidth()
                    );
                    fit
                }
            }
        };

        let mut state = self.state.borrow_mut();
        let picked = select_destinations(
            state.assigned_stations.len(),
            max_stations,
            &mut *cx.rng.borrow_mut(),
        );
        let destinations: Vec<Rc<Station>> = picked
            .into_iter()
            .map(|i| Rc::clone(&state.assigned_stations[i]))
            .collect();
        state.destination_stations = destinations;

        let names: Vec<String> = state.destination_ids().iter().map(|id| id.to_string()).collect();
        log::info!(
            "[{}] - [{}] Stations selected for current transmission: [{}]",
            self.node.now(),
            self.id(),
            names.join(", ")
        );
    }

    fn allocate_resources(&self) {
        let cx = self.node.cx();
        let state = self.state.borrow();
        let destinations = state.destination_stations.len();
        let (assigned, _) = {
            let mut rng = cx.rng.borrow_mut();
            if cx.config.ru_predefined {
                allocate_predefined(&cx.config.ru_list, destinations, &mut *rng)
            } else {
                let channel = cx.channel.borrow();
                allocate_derived(
                    channel.bandwidth(),
                    channel.possible_subchannels(),
                    destinations,
                    &mut *rng,
                )
            }
        };
        for (station, width) in state.destination_stations.iter().zip(assigned) {
            station.set_allocated_bw(width);
            log::info!(
                "[{}] - [{}] {}MHz allocated for {}",
                self.node.now(),
                self.id(),
                width,
                station.id()
            );
        }
    }

    async fn compete_for_channel_and_start_transmission(self: Rc<Self>) {
        log::info!(
            "[{}] - [{}] New channel sensing process is started.",
            self.node.now(),
            self.id()
        );
        loop {
            match self.start_transmission().await {
                Ok(()) => {
                    let mut state = self.state.borrow_mut();
                    state.sensing_process = None;
                    state.retransmission_counter = 0;
                    self.node.cx().channel.borrow_mut().remove_transmitting_ap(self.id());
                    break;
                }
                Err(AttemptError::Interrupted(Interruption::Collision(packet))) => {
                    self.node.cx().channel.borrow_mut().remove_transmitting_ap(self.id());
                    hold(&self.node, 1.0).await;
                    if self.handle_collision(&packet) {
                        break;
                    }
                    hold(&self.node, 1.0).await;
                }
                Err(AttemptError::Interrupted(other)) => {
                    log::warn!(
                        "[{}] - [{}] Sensing process interrupted: {}",
                        self.node.now(),
                        self.id(),
                        other
                    );
                }
                Err(AttemptError::Timing(error)) => {
                    log::error!(
                        "[{}] - [{}] Transmission dropped: {}",
                        self.node.now(),
                        self.id(),
                        error
                    );
                    self.node.cx().channel.borrow_mut().remove_transmitting_ap(self.id());
                    self.abandon_round();
                    break;
                }
            }
        }
    }

    /// Books the failed attempt. Returns `true` when the round is given up.
    fn handle_collision(&self, packet: &Packet) -> bool {
        let cx = self.node.cx();
        let retries = {
            let mut state = self.state.borrow_mut();
            state.retransmission_counter += 1;
            state.retransmission_counter
        };
        {
            let mut stats = cx.stats.borrow_mut();
            stats.count_retransmission(self.index);
            stats.add_transmission_time(-((packet.duration + cx.timing.sifs_time()) / 2.0));
        }
        log::info!(
            "[{}] - [{}] Collision occurred. Backoff procedure will be repeated. Current retransmission counter: {}",
            self.node.now(),
            self.id(),
            retries
        );
        if retries > MAX_RETRANSMISSIONS {
            log::info!(
                "[{}] - [{}] Too many tries to perform transmission, packet will be dropped",
                self.node.now(),
                self.id()
            );
            self.abandon_round();
            return true;
        }
        false
    }

    fn abandon_round(&self) {
        self.state.borrow_mut().abandon();
    }

    /// Backoff, then the first frame of the exchange.
    async fn start_transmission(self: &Rc<Self>) -> Result<(), AttemptError> {
        let env = self.node.env();
        let backoff = env.process(Rc::clone(self).backoff_procedure());
        self.state.borrow_mut().backoff_process = Some(backoff);
        env.join(backoff).await?;

        log::info!(
            "[{}] - [{}] Backoff procedure complete. Data sending started.",
            self.node.now(),
            self.id()
        );
        self.node.cx().channel.borrow_mut().add_transmitting_ap(self.id());
        let packet = {
            let mut state = self.state.borrow_mut();
            self.first_frame(&mut state)?
        };
        env.call(send_packet(Rc::clone(self), Rc::new(packet))).await?;
        Ok(())
    }

    fn first_frame(&self, state: &mut ApState) -> Result<Packet, TimingError> {
        let config = &self.node.cx().config;
        match config.direction {
            Direction::Downlink if config.rts_procedure => self.build_mu_rts(state),
            Direction::Downlink => self.build_data_packet(state),
            Direction::Uplink if config.bsrp_procedure => self.build_bsrp_trigger(state),
            Direction::Uplink if config.rts_procedure => self.build_mu_rts(state),
            Direction::Uplink => self.build_basic_trigger(state),
        }
    }

    async fn backoff_procedure(self: Rc<Self>) {
        let cx = self.node.cx();
        let retries = self.state.borrow().retransmission_counter;
        let mut timeout = cx.timing.random_backoff_time(retries, &mut *cx.rng.borrow_mut());
        log::info!("[{}] - [{}] New backoff time: {}", self.node.now(), self.id(), timeout);
        let backoff_time = loop {
            let counted = timeout;
            match self.count_down(&mut timeout).await {
                Ok(()) => break counted,
                Err(_) => {
                    log::info!(
                        "[{}] - [{}] Sensing process suspended because the channel is busy. Remaining backoff time: {}",
                        self.node.now(),
                        self.id(),
                        timeout
                    );
                    self.state.borrow_mut().backoff_suspended = true;
                }
            }
        };

        let mut state = self.state.borrow_mut();
        cx.stats
            .borrow_mut()
            .account_channel_time(&state.destination_indices(), backoff_time);
        state.backoff_process = None;
    }

    /// Waits for an idle channel, then counts `remaining` down slot by slot.
    async fn count_down(&self, remaining: &mut f64) -> Result<(), Interrupt<Interruption>> {
        let cx = self.node.cx();
        while !cx.channel.borrow().is_available() {
            cx.env.timeout(1.0).await?;
        }
        self.state.borrow_mut().backoff_suspended = false;
        let slot = cx.timing.slot_time();
        while *remaining > 0.0 {
            cx.env.timeout(slot).await?;
            *remaining -= slot;
        }
        Ok(())
    }

    fn account(&self, state: &ApState, time: f64) {
        self.node
            .cx()
            .stats
            .borrow_mut()
            .account_channel_time(&state.destination_indices(), time);
    }

    fn build_bsrp_trigger(&self, state: &mut ApState) -> Result<Packet, TimingError> {
        let duration = self.node.cx().timing.bsrp_time();
        self.build(state, PacketType::BsrpTrigger, duration)
    }

    fn build_mu_rts(&self, state: &mut ApState) -> Result<Packet, TimingError> {
        let duration = self.node.cx().timing.mu_rts_time(state.destination_stations.len());
        self.build(state, PacketType::MuRts, duration)
    }

    fn build_basic_trigger(&self, state: &mut ApState) -> Result<Packet, TimingError> {
        let duration = self.node.cx().timing.trigger_time(state.destination_stations.len());
        self.build(state, PacketType::BasicTrigger, duration)
    }

    /// DL A-MPDU; lasts as long as the slowest resource unit needs.
    fn build_data_packet(&self, state: &mut ApState) -> Result<Packet, TimingError> {
        let duration = self.longest_data_frame(state, PacketType::DlAMpdu)?;
        self.build(state, PacketType::DlAMpdu, duration)
    }

    fn longest_data_frame(&self, state: &ApState, packet_type: PacketType) -> Result<f64, TimingError> {
        let timing = &self.node.cx().timing;
        let destinations = state.destination_stations.len();
        let mut longest = 0.0_f64;
        for station in &state.destination_stations {
            let time = timing.packet_time(packet_type, station.allocated_bw(), destinations)?;
            longest = longest.max(time);
        }
        Ok(longest)
    }

    /// Opening frames and the DL data frame expect a reply from every destination.
    fn build(&self, state: &mut ApState, packet_type: PacketType, duration: f64) -> Result<Packet, TimingError> {
        let packet = self
            .node
            .generate_new_packet(packet_type, duration, state.destination_ids());
        state.expected_destinations_number = state.destination_stations.len();
        self.account(state, duration + self.node.cx().timing.sifs_time());
        Ok(packet)
    }

    fn build_ms_back(&self, state: &mut ApState) -> Result<Packet, TimingError> {
        let timing = &self.node.cx().timing;
        let duration = timing.ms_back_time(state.destination_stations.len());
        let packet = self
            .node
            .generate_new_packet(PacketType::MsBack, duration, state.destination_ids());
        state.expected_destinations_number = 0;
        self.account(state, duration + timing.aifs_time());
        Ok(packet)
    }

    /// Frame that follows the BSR/CTS phase.
    fn data_phase(&self, state: &mut ApState) -> Result<Packet, TimingError> {
        match self.node.cx().config.direction {
            Direction::Downlink => {
                let packet = self.build_data_packet(state)?;
                state.type_of_packet_to_wait = PacketType::TbBack;
                Ok(packet)
            }
            Direction::Uplink => {
                let packet = self.build_basic_trigger(state)?;
                state.type_of_packet_to_wait = PacketType::UlAMpdu;
                Ok(packet)
            }
        }
    }

    fn handle_expected_packet(&self, state: &mut ApState, packet: &Packet) -> Result<Option<Packet>, TimingError> {
        let cx = self.node.cx();
        let sifs = cx.timing.sifs_time();
        match packet.packet_type {
            PacketType::Bsr => {
                self.account(state, packet.duration + sifs);
                if cx.config.rts_procedure {
                    state.type_of_packet_to_wait = PacketType::Cts;
                    self.build_mu_rts(state).map(Some)
                } else {
                    self.data_phase(state).map(Some)
                }
            }
            PacketType::Cts => {
                self.account(state, packet.duration + sifs);
                self.data_phase(state).map(Some)
            }
            PacketType::UlAMpdu => {
                let longest = self.longest_data_frame(state, PacketType::UlAMpdu)?;
                self.account(state, longest + sifs);
                state.type_of_packet_to_wait = cx.config.initial_ap_expectation();
                self.build_ms_back(state).map(Some)
            }
            PacketType::TbBack => {
                self.account(state, packet.duration);
                state.type_of_packet_to_wait = cx.config.initial_ap_expectation();
                cx.channel.borrow_mut().set_available(true);
                state.transmission_complete = true;
                Ok(None)
            }
            PacketType::BsrpTrigger
            | PacketType::MuRts
            | PacketType::DlAMpdu
            | PacketType::BasicTrigger
            | PacketType::MsBack => Ok(None),
        }
    }
}

impl Protocol for AccessPoint {
    fn node(&self) -> &Node {
        &self.node
    }

    fn handle_received_packet(&self, packet: &Packet) -> Option<Packet> {
        if !packet.is_addressed_to(self.id()) {
            return None;
        }
        let mut state = self.state.borrow_mut();
        if packet.packet_type != state.type_of_packet_to_wait {
            return None;
        }
        state.received_packets_number += 1;
        assert!(
            state.received_packets_number <= state.expected_destinations_number,
            "{} counted {} {} replies but expected {}",
            self.id(),
            state.received_packets_number,
            packet.packet_type,
            state.expected_destinations_number
        );
        if state.received_packets_number < state.expected_destinations_number {
            return None;
        }
        state.received_packets_number = 0;
        match self.handle_expected_packet(&mut state, packet) {
            Ok(reply) => reply,
            Err(error) => {
                log::error!(
                    "[{}] - [{}] {}, transmission dropped",
                    self.node.now(),
                    self.id(),
                    error
                );
                state.type_of_packet_to_wait = self.node.cx().config.initial_ap_expectation();
                state.abandon();
                self.node.cx().channel.borrow_mut().set_available(true);
                None
            }
        }
    }

    fn packet_sent(&self, packet: &Packet) {
        if packet.packet_type == PacketType::MsBack {
            self.state.borrow_mut().transmission_complete = true;
        }
    }

    fn medium_busy(&self, _packet: &Packet) {
        let backoff = {
            let mut state = self.state.borrow_mut();
            let backoff_process = state.backoff_process;
            match backoff_process {
                Some(pid) if !state.backoff_suspended && self.node.env().is_alive(pid) => {
                    state.backoff_suspended = true;
                    Some(pid)
                }
                _ => None,
            }
        };
        if let Some(pid) = backoff {
            self.node.env().interrupt(pid, Interruption::ChannelBusy);
        }
    }

    fn sensing_process(&self) -> Option<ProcessId> {
        self.state.borrow().sensing_process
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Channel;
    use crate::config::SimulationConfig;
    use crate::scheduler::Scheduler;
    use crate::stats::Stats;
    use crate::timing::Timing;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use std::cell::Cell;

    fn rng() -> ChaCha8Rng {
        ChaCha8Rng::seed_from_u64(42)
    }

    #[test]
    fn selection_is_capped_and_distinct() {
        let mut rng = rng();
        let picked = select_destinations(60, 4, &mut rng);
        assert_eq!(picked.len(), 4);
        let mut sorted = picked.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), 4);
        assert!(picked.iter().all(|i| *i < 60));

        assert_eq!(select_destinations(3, 4, &mut rng), vec![0, 1, 2]);
    }

    #[test]
    fn predefined_units_are_not_reused() {
        let mut rng = rng();
        let ru_list = [2.22, 5.0, 10.0, 20.0];
        let (assigned, remaining) = allocate_predefined(&ru_list, 3, &mut rng);
        assert_eq!(assigned.len(), 3);
        assert_eq!(remaining.len(), 1);
        let mut all: Vec<f64> = assigned.iter().chain(remaining.iter()).copied().collect();
        all.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(all, ru_list.to_vec());
        // the configured list is left alone
        assert_eq!(ru_list, [2.22, 5.0, 10.0, 20.0]);
    }

    #[test]
    fn derived_pool_fills_the_channel() {
        let subchannels = [2.22, 5.0, 10.0, 20.0, 40.0, 80.0, 160.0];
        let mut rng = rng();

        let (assigned, remaining) = allocate_derived(40.0, &subchannels, 4, &mut rng);
        assert!(remaining.is_empty());
        assert_eq!(assigned, vec![10.0; 4]);

        let (assigned, _) = allocate_derived(40.0, &subchannels, 1, &mut rng);
        assert_eq!(assigned, vec![40.0]);

        let (mut assigned, _) = allocate_derived(40.0, &subchannels, 3, &mut rng);
        assigned.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(assigned, vec![10.0, 10.0, 20.0]);
    }

    #[test]
    fn derived_pool_never_exceeds_the_channel() {
        let subchannels = [2.22, 5.0, 10.0, 20.0, 40.0, 80.0, 160.0];
        let mut rng = rng();
        for (bandwidth, max_stations) in [(20.0, 9), (40.0, 18), (80.0, 37), (160.0, 74)] {
            let capacity = max_stations.min(derived_capacity(bandwidth, &subchannels));
            for destinations in 1..=capacity {
                let (assigned, _) = allocate_derived(bandwidth, &subchannels, destinations, &mut rng);
                assert_eq!(assigned.len(), destinations);
                assert!(assigned.iter().all(|w| *w > 0.0));
                let sum: f64 = assigned.iter().sum();
                assert!(
                    sum <= bandwidth + 1e-9,
                    "{} stations on {} MHz got {}",
                    destinations,
                    bandwidth,
                    sum
                );
            }
        }
    }

    #[test]
    fn capacity_counts_the_narrowest_units() {
        let subchannels = [2.22, 5.0, 10.0, 20.0, 40.0, 80.0, 160.0];
        assert_eq!(derived_capacity(20.0, &subchannels), 9);
        assert_eq!(derived_capacity(40.0, &subchannels), 18);
        assert_eq!(derived_capacity(80.0, &subchannels), 36);
        assert_eq!(derived_capacity(160.0, &subchannels), 72);
        assert_eq!(derived_capacity(40.0, &[]), 0);
    }

    fn access_point(
        configure: impl FnOnce(&mut SimulationConfig),
    ) -> (Scheduler<Interruption>, Rc<AccessPoint>) {
        let mut config = SimulationConfig::default();
        configure(&mut config);
        let scheduler = Scheduler::new(200.0);
        let cx = NodeContext {
            env: scheduler.env(),
            timing: Rc::new(Timing::new(&config).unwrap()),
            channel: Rc::new(RefCell::new(Channel::new(&config.channel))),
            stats: Rc::new(RefCell::new(Stats::new(1, 2))),
            rng: Rc::new(RefCell::new(rng())),
            config: Rc::new(config),
        };
        (scheduler, Rc::new(AccessPoint::new(0, cx, Rc::new(Vec::new()))))
    }

    #[test]
    fn round_is_dropped_after_the_retry_limit() {
        let (_scheduler, ap) = access_point(|_| {});
        let packet = Packet::new(PacketType::DlAMpdu, 84.0, ap.id(), vec![NodeId::Station(0)]);
        for attempt in 1..=MAX_RETRANSMISSIONS {
            assert!(!ap.handle_collision(&packet));
            assert_eq!(ap.retransmission_counter(), attempt);
            assert!(!ap.is_transmission_complete());
        }
        assert!(ap.handle_collision(&packet));
        assert_eq!(ap.retransmission_counter(), 0);
        assert!(ap.is_transmission_complete());
        assert!(ap.state.borrow().transmission_abandoned);

        let stats = ap.node.cx().stats.borrow();
        assert_eq!(stats.retransmissions_per_ap(), &[8]);
        // every failed attempt gives back half of the frame's airtime
        assert!((stats.transmission_time() + 8.0 * 50.0).abs() < 1e-9);
    }

    #[test]
    fn busy_medium_suspends_the_backoff_without_redrawing_it() {
        let (mut scheduler, ap) = access_point(|c| {
            c.channel.cw_min = 0;
            c.channel.cw_max = 0;
        });
        let env = ap.node.env().clone();
        let backoff = env.process(Rc::clone(&ap).backoff_procedure());
        ap.state.borrow_mut().backoff_process = Some(backoff);

        let finished_at = Rc::new(Cell::new(None));
        {
            let (env2, finished_at) = (env.clone(), Rc::clone(&finished_at));
            env.process(async move {
                env2.join(backoff).await.ok();
                finished_at.set(Some(env2.now()));
            });
        }
        {
            let (env2, ap) = (env.clone(), Rc::clone(&ap));
            env.process(async move {
                // 43 us drawn, two slots counted, 25 us left
                env2.timeout(20.0).await.ok();
                let foreign = Packet::new(
                    PacketType::DlAMpdu,
                    100.0,
                    NodeId::AccessPoint(1),
                    vec![NodeId::Station(5)],
                );
                ap.node.cx().channel.borrow_mut().set_available(false);
                ap.medium_busy(&foreign);
                ap.medium_busy(&foreign);
                assert!(ap.state.borrow().backoff_suspended);
                env2.timeout(30.0).await.ok();
                ap.node.cx().channel.borrow_mut().set_available(true);
            });
        }
        scheduler.run();

        // released at 50; the 25 us left take three slots
        assert_eq!(finished_at.get(), Some(50.0 + 3.0 * 9.0));
        let state = ap.state.borrow();
        assert!(!state.backoff_suspended);
        assert_eq!(state.backoff_process, None);
        assert_eq!(ap.node.cx().stats.borrow().transmission_time(), 25.0);
    }

    #[test]
    fn failed_data_frame_drops_the_round_and_releases_the_channel() {
        let (_scheduler, ap) = access_point(|c| c.rts_procedure = true);
        let cx = ap.node.cx().clone();
        // no resource unit allocated, so the DL A-MPDU has no duration
        let station = Rc::new(Station::new(0, cx.clone()));
        {
            let mut state = ap.state.borrow_mut();
            state.destination_stations = vec![Rc::clone(&station)];
            state.expected_destinations_number = 1;
        }
        cx.channel.borrow_mut().set_available(false);
        assert_eq!(ap.type_of_packet_to_wait(), PacketType::Cts);

        let cts = Packet::new(PacketType::Cts, 40.0, station.id(), vec![ap.id()]);
        assert!(ap.handle_received_packet(&cts).is_none());

        assert_eq!(ap.type_of_packet_to_wait(), PacketType::Cts);
        assert!(ap.is_transmission_complete());
        assert!(ap.state.borrow().transmission_abandoned);
        assert!(cx.channel.borrow().is_available());
    }
}
