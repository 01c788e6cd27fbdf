use std::fmt;

/// Identity of a node attached to the channel.
#[derive(Debug, Hash, Eq, Clone, Copy, PartialEq, PartialOrd, Ord)]
pub enum NodeId {
    AccessPoint(usize),
    Station(usize),
}

impl NodeId {
    pub fn is_access_point(&self) -> bool {
        matches!(self, NodeId::AccessPoint(_))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeId::AccessPoint(i) => write!(f, "AccessPoint{}", i),
            NodeId::Station(i) => write!(f, "Station{}", i),
        }
    }
}

#[derive(Debug, Hash, Eq, Clone, Copy, PartialEq)]
pub enum PacketType {
    BsrpTrigger,
    Bsr,
    MuRts,
    Cts,
    DlAMpdu,
    UlAMpdu,
    BasicTrigger,
    TbBack,
    MsBack,
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketType::BsrpTrigger => write!(f, "BSRP_TRIGGER"),
            PacketType::Bsr => write!(f, "BSR"),
            PacketType::MuRts => write!(f, "MU_RTS"),
            PacketType::Cts => write!(f, "CTS"),
            PacketType::DlAMpdu => write!(f, "DL_A_MPDU"),
            PacketType::UlAMpdu => write!(f, "UL_A_MPDU"),
            PacketType::BasicTrigger => write!(f, "BASIC_TRIGGER"),
            PacketType::TbBack => write!(f, "TB_BACK"),
            PacketType::MsBack => write!(f, "MS_BACK"),
        }
    }
}

/// A MAC frame. Never modified once sent; recipients share it through `Rc`.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub packet_type: PacketType,
    /// Air time in microseconds.
    pub duration: f64,
    pub source: NodeId,
    pub destinations: Vec<NodeId>,
}

impl Packet {
    pub fn new(
        packet_type: PacketType,
        duration: f64,
        source: NodeId,
        destinations: Vec<NodeId>,
    ) -> Packet {
        Packet {
            packet_type,
            duration,
            source,
            destinations,
        }
    }

    pub fn is_addressed_to(&self, node: NodeId) -> bool {
        self.destinations.contains(&node)
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let destinations: Vec<String> = self.destinations.iter().map(|d| d.to_string()).collect();
        write!(
            f,
            "{} packet from {} to [{}]",
            self.packet_type,
            self.source,
            destinations.join(", ")
        )
    }
}
