//! Behaviour shared by access points and stations: listening on the channel,
//! sending, relaying and collision detection.

use rand_chacha::ChaCha8Rng;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use crate::channel::Channel;
use crate::config::SimulationConfig;
use crate::packet::{NodeId, Packet, PacketType};
use crate::scheduler::{Env, Interrupt, ProcessId, Store, Time};
use crate::stats::Stats;
use crate::timing::Timing;

/// Causes a node process can be interrupted with.
#[derive(Debug, Clone)]
pub enum Interruption {
    /// A packet this node just put on the air, raised into its own receive loop.
    Outgoing(Rc<Packet>),
    /// A foreign packet was heard while the backoff was counting down.
    ChannelBusy,
    /// The packet that collided, raised into the access point's sensing process.
    Collision(Rc<Packet>),
}

impl fmt::Display for Interruption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Interruption::Outgoing(packet) => write!(f, "Outgoing {}", packet.packet_type),
            Interruption::ChannelBusy => write!(f, "Channel busy"),
            Interruption::Collision(packet) => write!(f, "Collision of {}", packet.packet_type),
        }
    }
}

pub type SimEnv = Env<Interruption>;
pub type Mailbox = Store<Rc<Packet>, Interruption>;

/// Handles shared by every node of one simulation.
#[derive(Clone)]
pub struct NodeContext {
    pub env: SimEnv,
    pub config: Rc<SimulationConfig>,
    pub timing: Rc<Timing>,
    pub channel: Rc<RefCell<Channel>>,
    pub stats: Rc<RefCell<Stats>>,
    pub rng: Rc<RefCell<ChaCha8Rng>>,
}

pub struct Node {
    id: NodeId,
    cx: NodeContext,
    mailbox: Mailbox,
    waiting_process: Cell<Option<ProcessId>>,
}

impl Node {
    pub fn new(id: NodeId, cx: NodeContext) -> Node {
        let mailbox = cx.env.store();
        Node {
            id,
            cx,
            mailbox,
            waiting_process: Cell::new(None),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn cx(&self) -> &NodeContext {
        &self.cx
    }

    pub fn env(&self) -> &SimEnv {
        &self.cx.env
    }

    pub fn now(&self) -> Time {
        self.cx.env.now()
    }

    /// The receive loop, once started.
    pub fn waiting_process(&self) -> Option<ProcessId> {
        self.waiting_process.get()
    }

    pub fn generate_new_packet(
        &self,
        packet_type: PacketType,
        duration: f64,
        destinations: Vec<NodeId>,
    ) -> Packet {
        let packet = Packet::new(packet_type, duration, self.id, destinations);
        log::info!("[{}] - New {}", self.now(), packet);
        packet
    }

    fn start_listening(&self) {
        self.cx
            .channel
            .borrow_mut()
            .start_listening(self.id, self.mailbox.clone());
    }
}

/// Role-specific behaviour plugged into the shared receive loop.
pub trait Protocol: 'static {
    fn node(&self) -> &Node;

    /// Reacts to a packet taken from the mailbox; the returned packet is sent as the reply.
    fn handle_received_packet(&self, packet: &Packet) -> Option<Packet>;

    /// Called once `packet` has left this node.
    fn packet_sent(&self, _packet: &Packet) {}

    /// Called before handling a packet sent by another node.
    fn medium_busy(&self, _packet: &Packet) {}

    /// Process to notify when this node's own transmission collides.
    fn sensing_process(&self) -> Option<ProcessId> {
        None
    }
}

/// Waits `delay`; an interruption here is unexpected and only logged.
pub async fn hold(node: &Node, delay: Time) {
    if let Err(Interrupt { cause }) = node.env().timeout(delay).await {
        log::warn!(
            "[{}] - [{}] Unexpected interruption while waiting: {}",
            node.now(),
            node.id(),
            cause
        );
    }
}

/// Starts the receive loop of `protocol`.
pub fn start_receiving<P: Protocol>(protocol: &Rc<P>) -> ProcessId {
    let node = protocol.node();
    let pid = node.env().process(wait_for_new_packet(Rc::clone(protocol)));
    node.waiting_process.set(Some(pid));
    pid
}

/// Puts `packet` on the air after one time unit by handing it to the sender's receive loop.
pub async fn send_packet<P: Protocol>(protocol: Rc<P>, packet: Rc<Packet>) {
    let node = protocol.node();
    hold(node, 1.0).await;
    protocol.packet_sent(&packet);
    match node.waiting_process() {
        Some(receiver) => node
            .env()
            .interrupt(receiver, Interruption::Outgoing(packet)),
        None => log::error!(
            "[{}] - [{}] Not listening, {} dropped",
            node.now(),
            node.id(),
            packet.packet_type
        ),
    }
}

async fn wait_for_new_packet<P: Protocol>(protocol: Rc<P>) {
    let node = protocol.node();
    node.start_listening();
    let mut pending: Option<Interruption> = None;
    loop {
        let cause = match pending.take() {
            Some(cause) => cause,
            None => match receive_packet(&protocol).await {
                Ok(()) => continue,
                Err(Interrupt { cause }) => cause,
            },
        };
        match cause {
            Interruption::Outgoing(packet) => {
                if let Err(Interrupt { cause }) = transmit_in_channel(&protocol, packet).await {
                    log::warn!(
                        "[{}] - [{}] Relay interrupted by {}",
                        node.now(),
                        node.id(),
                        cause
                    );
                    pending = Some(cause);
                }
            }
            other => log::warn!(
                "[{}] - [{}] Unexpected interruption of the receive loop: {}",
                node.now(),
                node.id(),
                other
            ),
        }
    }
}

async fn receive_packet<P: Protocol>(protocol: &Rc<P>) -> Result<(), Interrupt<Interruption>> {
    let node = protocol.node();
    let packet = node.mailbox.get().await?;
    log::debug!("[{}] - [{}] Received {}", node.now(), node.id(), packet);
    if packet.source != node.id() {
        protocol.medium_busy(&packet);
    }
    if let Some(reply) = protocol.handle_received_packet(&packet) {
        node.env()
            .call(send_packet(Rc::clone(protocol), Rc::new(reply)))
            .await?;
    }
    Ok(())
}

/// Relays this node's packet to every listener, or reports a collision to the sensing process.
async fn transmit_in_channel<P: Protocol>(
    protocol: &Rc<P>,
    packet: Rc<Packet>,
) -> Result<(), Interrupt<Interruption>> {
    let node = protocol.node();
    let collision = node.cx.channel.borrow().check_if_collision_occurred();
    if collision {
        if let Some(sensing) = protocol.sensing_process() {
            if node.env().is_alive(sensing) {
                log::debug!(
                    "[{}] - [{}] {} collided",
                    node.now(),
                    node.id(),
                    packet.packet_type
                );
                node.env().interrupt(sensing, Interruption::Collision(packet));
                node.mailbox.clear();
                return Ok(());
            }
        }
    }
    node.env().timeout(1.0).await?;
    let mut channel = node.cx.channel.borrow_mut();
    channel.set_available(false);
    channel.deliver(&packet);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::Scheduler;
    use rand::SeedableRng;

    struct Echo {
        node: Node,
        peer: NodeId,
        received: RefCell<Vec<(Time, PacketType)>>,
        sent: RefCell<Vec<PacketType>>,
        busy: Cell<usize>,
    }

    impl Protocol for Echo {
        fn node(&self) -> &Node {
            &self.node
        }

        fn handle_received_packet(&self, packet: &Packet) -> Option<Packet> {
            if !packet.is_addressed_to(self.node.id()) {
                return None;
            }
            self.received
                .borrow_mut()
                .push((self.node.now(), packet.packet_type));
            (packet.packet_type == PacketType::MuRts).then(|| {
                self.node
                    .generate_new_packet(PacketType::Cts, 40.0, vec![self.peer])
            })
        }

        fn packet_sent(&self, packet: &Packet) {
            self.sent.borrow_mut().push(packet.packet_type);
        }

        fn medium_busy(&self, _packet: &Packet) {
            self.busy.set(self.busy.get() + 1);
        }
    }

    fn context(scheduler: &Scheduler<Interruption>) -> NodeContext {
        let config = SimulationConfig::default();
        NodeContext {
            env: scheduler.env(),
            timing: Rc::new(Timing::new(&config).unwrap()),
            channel: Rc::new(RefCell::new(Channel::new(&config.channel))),
            stats: Rc::new(RefCell::new(Stats::new(1, 1))),
            rng: Rc::new(RefCell::new(ChaCha8Rng::seed_from_u64(1))),
            config: Rc::new(config),
        }
    }

    fn echo(id: NodeId, peer: NodeId, cx: &NodeContext) -> Rc<Echo> {
        Rc::new(Echo {
            node: Node::new(id, cx.clone()),
            peer,
            received: RefCell::default(),
            sent: RefCell::default(),
            busy: Cell::new(0),
        })
    }

    #[test]
    fn request_and_reply_take_two_units_each() {
        let mut scheduler = Scheduler::new(100.0);
        let cx = context(&scheduler);
        let ap = echo(NodeId::AccessPoint(0), NodeId::Station(0), &cx);
        let station = echo(NodeId::Station(0), NodeId::AccessPoint(0), &cx);
        start_receiving(&ap);
        start_receiving(&station);

        let request = ap
            .node
            .generate_new_packet(PacketType::MuRts, 60.0, vec![NodeId::Station(0)]);
        cx.env.process(send_packet(Rc::clone(&ap), Rc::new(request)));
        scheduler.run();

        assert_eq!(*station.received.borrow(), vec![(2.0, PacketType::MuRts)]);
        assert_eq!(*ap.received.borrow(), vec![(4.0, PacketType::Cts)]);
        assert_eq!(*ap.sent.borrow(), vec![PacketType::MuRts]);
        assert_eq!(*station.sent.borrow(), vec![PacketType::Cts]);
        // each side hears exactly one foreign packet
        assert_eq!(ap.busy.get(), 1);
        assert_eq!(station.busy.get(), 1);
        assert!(!cx.channel.borrow().is_available());
    }

    #[test]
    fn nodes_register_once_with_the_channel() {
        let mut scheduler = Scheduler::new(10.0);
        let cx = context(&scheduler);
        let station = echo(NodeId::Station(3), NodeId::AccessPoint(0), &cx);
        assert!(station.node.waiting_process().is_none());
        start_receiving(&station);
        scheduler.run();
        assert!(cx.channel.borrow().is_listening(NodeId::Station(3)));
        assert!(station.node.waiting_process().is_some());
    }

    #[test]
    fn collision_is_reported_instead_of_relayed() {
        struct Contender {
            echo: Rc<Echo>,
            sensing: Cell<Option<ProcessId>>,
        }
        impl Protocol for Contender {
            fn node(&self) -> &Node {
                self.echo.node()
            }
            fn handle_received_packet(&self, packet: &Packet) -> Option<Packet> {
                self.echo.handle_received_packet(packet)
            }
            fn sensing_process(&self) -> Option<ProcessId> {
                self.sensing.get()
            }
        }

        let mut scheduler = Scheduler::new(100.0);
        let cx = context(&scheduler);
        let station = echo(NodeId::Station(0), NodeId::AccessPoint(0), &cx);
        let ap = Rc::new(Contender {
            echo: echo(NodeId::AccessPoint(0), NodeId::Station(0), &cx),
            sensing: Cell::new(None),
        });
        start_receiving(&ap);
        start_receiving(&station);
        cx.channel.borrow_mut().add_transmitting_ap(NodeId::AccessPoint(0));
        cx.channel.borrow_mut().add_transmitting_ap(NodeId::AccessPoint(1));

        let collided = Rc::new(RefCell::new(None));
        let sensing = {
            let (env, ap, collided) = (cx.env.clone(), Rc::clone(&ap), Rc::clone(&collided));
            cx.env.process(async move {
                let packet = ap.node().generate_new_packet(
                    PacketType::DlAMpdu,
                    300.0,
                    vec![NodeId::Station(0)],
                );
                if let Err(Interrupt { cause }) =
                    env.call(send_packet(Rc::clone(&ap), Rc::new(packet))).await
                {
                    *collided.borrow_mut() = Some((env.now(), cause.to_string()));
                }
            })
        };
        ap.sensing.set(Some(sensing));
        scheduler.run();

        assert_eq!(
            *collided.borrow(),
            Some((1.0, "Collision of DL_A_MPDU".to_string()))
        );
        assert!(station.received.borrow().is_empty());
        assert!(cx.channel.borrow().is_available());
    }
}
