use std::rc::Rc;

use crate::config::ChannelConfig;
use crate::node::Mailbox;
use crate::packet::{NodeId, Packet};

/// The shared medium of one run.
pub struct Channel {
    bandwidth: f64,
    subchannels: Vec<f64>,
    channel_available: bool,
    transmitting_ap: Vec<NodeId>,
    nodes_in_channel: Vec<(NodeId, Mailbox)>,
    config: ChannelConfig,
}

impl Channel {
    pub fn new(config: &ChannelConfig) -> Channel {
        Channel {
            bandwidth: config.bandwidth,
            subchannels: config.subchannels.clone(),
            channel_available: true,
            transmitting_ap: Vec::new(),
            nodes_in_channel: Vec::new(),
            config: config.clone(),
        }
    }

    pub fn bandwidth(&self) -> f64 {
        self.bandwidth
    }

    /// Sub-channel widths a resource unit can take.
    pub fn possible_subchannels(&self) -> &[f64] {
        &self.subchannels
    }

    pub fn max_stations_in_transmission(&self) -> Option<usize> {
        self.config.max_stations_for(self.bandwidth)
    }

    pub fn is_available(&self) -> bool {
        self.channel_available
    }

    pub fn set_available(&mut self, available: bool) {
        self.channel_available = available;
    }

    /// Registers a node's mailbox for delivery. Registering twice has no effect.
    pub fn start_listening(&mut self, node: NodeId, mailbox: Mailbox) {
        if self.nodes_in_channel.iter().all(|(id, _)| *id != node) {
            self.nodes_in_channel.push((node, mailbox));
        }
    }

    pub fn is_listening(&self, node: NodeId) -> bool {
        self.nodes_in_channel.iter().any(|(id, _)| *id == node)
    }

    pub fn add_transmitting_ap(&mut self, ap: NodeId) {
        self.transmitting_ap.push(ap);
    }

    pub fn remove_transmitting_ap(&mut self, ap: NodeId) {
        if let Some(pos) = self.transmitting_ap.iter().position(|id| *id == ap) {
            self.transmitting_ap.remove(pos);
        }
    }

    pub fn transmitting_ap(&self) -> &[NodeId] {
        &self.transmitting_ap
    }

    pub fn check_if_collision_occurred(&self) -> bool {
        self.transmitting_ap.len() > 1
    }

    /// Puts the packet into the mailbox of every listening node, the sender included.
    pub fn deliver(&self, packet: &Rc<Packet>) {
        for (_, mailbox) in &self.nodes_in_channel {
            mailbox.put(Rc::clone(packet));
        }
    }
}
