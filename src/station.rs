use std::cell::RefCell;
use std::fmt;

use crate::node::{Node, NodeContext, Protocol};
use crate::packet::{NodeId, Packet, PacketType};

struct StationState {
    /// Resource-unit width for the current round, in MHz.
    allocated_bw: Option<f64>,
    station_associated: bool,
    type_of_packet_to_wait: PacketType,
}

pub struct Station {
    index: usize,
    node: Node,
    state: RefCell<StationState>,
}

impl Station {
    pub fn new(index: usize, cx: NodeContext) -> Station {
        let initial = cx.config.initial_station_expectation();
        Station {
            index,
            node: Node::new(NodeId::Station(index), cx),
            state: RefCell::new(StationState {
                allocated_bw: None,
                station_associated: false,
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

    pub fn is_associated(&self) -> bool {
        self.state.borrow().station_associated
    }

    pub fn associate(&self) {
        self.state.borrow_mut().station_associated = true;
    }

    pub fn allocated_bw(&self) -> Option<f64> {
        self.state.borrow().allocated_bw
    }

    pub fn set_allocated_bw(&self, bandwidth: f64) {
        self.state.borrow_mut().allocated_bw = Some(bandwidth);
    }

    pub fn type_of_packet_to_wait(&self) -> PacketType {
        self.state.borrow().type_of_packet_to_wait
    }

    fn reply(&self, packet_type: PacketType, duration: f64, to: NodeId) -> Packet {
        self.node.generate_new_packet(packet_type, duration, vec![to])
    }

    fn allocated_or_log(&self, state: &StationState, packet: &Packet) -> Option<f64> {
        if state.allocated_bw.is_none() {
            log::error!(
                "[{}] - [{}] {} received without an allocated resource unit",
                self.node.now(),
                self.id(),
                packet.packet_type
            );
        }
        state.allocated_bw
    }
}

impl Protocol for Station {
    fn node(&self) -> &Node {
        &self.node
    }

    fn handle_received_packet(&self, packet: &Packet) -> Option<Packet> {
        if !packet.is_addressed_to(self.id()) {
            return None;
        }
        let cx = self.node.cx();
        let mut state = self.state.borrow_mut();
        if packet.packet_type != state.type_of_packet_to_wait {
            return None;
        }
        let timing = &cx.timing;
        let data_phase = cx.config.data_phase_frame();
        match packet.packet_type {
            PacketType::BsrpTrigger => {
                state.type_of_packet_to_wait = if cx.config.rts_procedure {
                    PacketType::MuRts
                } else {
                    data_phase
                };
                Some(self.reply(PacketType::Bsr, timing.bsr_time(), packet.source))
            }
            PacketType::MuRts => {
                state.type_of_packet_to_wait = data_phase;
                Some(self.reply(PacketType::Cts, timing.cts_time(), packet.source))
            }
            PacketType::DlAMpdu => {
                let bandwidth = self.allocated_or_log(&state, packet)?;
                let destinations = packet.destinations.len();
                let tb_back = timing.tb_back_time(bandwidth);
                let received = timing.sent_data(bandwidth, destinations);
                match (tb_back, received) {
                    (Ok(duration), Ok(bits)) => {
                        state.type_of_packet_to_wait = cx.config.initial_station_expectation();
                        cx.stats.borrow_mut().add_data_transferred(self.index, bits);
                        Some(self.reply(PacketType::TbBack, duration, packet.source))
                    }
                    (Err(e), _) | (_, Err(e)) => {
                        log::error!("[{}] - [{}] {}", self.node.now(), self.id(), e);
                        None
                    }
                }
            }
            PacketType::BasicTrigger => {
                let bandwidth = self.allocated_or_log(&state, packet)?;
                let destinations = packet.destinations.len();
                let duration = timing.packet_time(PacketType::UlAMpdu, Some(bandwidth), destinations);
                let sent = timing.sent_data(bandwidth, destinations);
                match (duration, sent) {
                    (Ok(duration), Ok(bits)) => {
                        state.type_of_packet_to_wait = PacketType::MsBack;
                        cx.stats.borrow_mut().add_data_transferred(self.index, bits);
                        Some(self.reply(PacketType::UlAMpdu, duration, packet.source))
                    }
                    (Err(e), _) | (_, Err(e)) => {
                        log::error!("[{}] - [{}] {}", self.node.now(), self.id(), e);
                        None
                    }
                }
            }
            PacketType::MsBack => {
                state.type_of_packet_to_wait = cx.config.initial_station_expectation();
                cx.channel.borrow_mut().set_available(true);
                None
            }
            PacketType::Bsr | PacketType::Cts | PacketType::UlAMpdu | PacketType::TbBack => None,
        }
    }
}

impl fmt::Debug for Station {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("Station")
            .field("id", &self.id())
            .field("associated", &state.station_associated)
            .field("allocated_bw", &state.allocated_bw)
            .field("waiting_for", &state.type_of_packet_to_wait)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Channel;
    use crate::config::{Direction, SimulationConfig};
    use crate::scheduler::Scheduler;
    use crate::stats::Stats;
    use crate::timing::Timing;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use std::rc::Rc;

    fn station(configure: impl FnOnce(&mut SimulationConfig)) -> (Station, NodeContext) {
        let mut config = SimulationConfig::default();
        configure(&mut config);
        let scheduler = Scheduler::new(10.0);
        let cx = NodeContext {
            env: scheduler.env(),
            timing: Rc::new(Timing::new(&config).unwrap()),
            channel: Rc::new(RefCell::new(Channel::new(&config.channel))),
            stats: Rc::new(RefCell::new(Stats::new(1, 2))),
            rng: Rc::new(RefCell::new(ChaCha8Rng::seed_from_u64(1))),
            config: Rc::new(config),
        };
        (Station::new(1, cx.clone()), cx)
    }

    fn from_ap(packet_type: PacketType, destinations: Vec<NodeId>) -> Packet {
        Packet::new(packet_type, 50.0, NodeId::AccessPoint(0), destinations)
    }

    #[test]
    fn downlink_data_is_acknowledged_and_accounted() {
        let (station, cx) = station(|_| {});
        station.set_allocated_bw(10.0);
        let data = from_ap(
            PacketType::DlAMpdu,
            vec![NodeId::Station(0), NodeId::Station(1)],
        );
        let reply = station.handle_received_packet(&data).unwrap();
        assert_eq!(reply.packet_type, PacketType::TbBack);
        assert_eq!(reply.destinations, vec![NodeId::AccessPoint(0)]);
        assert_eq!(reply.duration, cx.timing.tb_back_time(10.0).unwrap());
        assert_eq!(cx.stats.borrow().data_transferred(1), 12000);
        assert_eq!(station.type_of_packet_to_wait(), PacketType::DlAMpdu);
    }

    #[test]
    fn packets_for_others_or_out_of_order_are_ignored() {
        let (station, cx) = station(|_| {});
        station.set_allocated_bw(10.0);
        let elsewhere = from_ap(PacketType::DlAMpdu, vec![NodeId::Station(0)]);
        assert!(station.handle_received_packet(&elsewhere).is_none());
        let unexpected = from_ap(PacketType::MsBack, vec![NodeId::Station(1)]);
        assert!(station.handle_received_packet(&unexpected).is_none());
        assert_eq!(cx.stats.borrow().data_transferred(1), 0);
        assert_eq!(station.type_of_packet_to_wait(), PacketType::DlAMpdu);
    }

    #[test]
    fn uplink_with_bsrp_and_rts() {
        let (station, cx) = station(|c| {
            c.direction = Direction::Uplink;
            c.bsrp_procedure = true;
            c.rts_procedure = true;
        });
        station.set_allocated_bw(20.0);
        let me = vec![NodeId::Station(1)];

        let bsr = station
            .handle_received_packet(&from_ap(PacketType::BsrpTrigger, me.clone()))
            .unwrap();
        assert_eq!(bsr.packet_type, PacketType::Bsr);
        assert_eq!(station.type_of_packet_to_wait(), PacketType::MuRts);

        let cts = station
            .handle_received_packet(&from_ap(PacketType::MuRts, me.clone()))
            .unwrap();
        assert_eq!(cts.packet_type, PacketType::Cts);
        assert_eq!(station.type_of_packet_to_wait(), PacketType::BasicTrigger);

        let data = station
            .handle_received_packet(&from_ap(PacketType::BasicTrigger, me.clone()))
            .unwrap();
        assert_eq!(data.packet_type, PacketType::UlAMpdu);
        assert_eq!(cx.stats.borrow().data_transferred(1), 12000);
        assert_eq!(station.type_of_packet_to_wait(), PacketType::MsBack);

        cx.channel.borrow_mut().set_available(false);
        assert!(station
            .handle_received_packet(&from_ap(PacketType::MsBack, me))
            .is_none());
        assert!(cx.channel.borrow().is_available());
        assert_eq!(station.type_of_packet_to_wait(), PacketType::BsrpTrigger);
    }

    #[test]
    fn data_without_resource_unit_is_ignored() {
        let (station, cx) = station(|_| {});
        let data = from_ap(PacketType::DlAMpdu, vec![NodeId::Station(1)]);
        assert!(station.handle_received_packet(&data).is_none());
        assert_eq!(cx.stats.borrow().data_transferred(1), 0);
        assert_eq!(station.type_of_packet_to_wait(), PacketType::DlAMpdu);
    }
}
