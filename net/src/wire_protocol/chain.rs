use strum::{EnumIter, IntoEnumIterator};

/// Static description of the network a crawl runs against: the frame magic,
/// the default peer port and the fields we advertise in our own version
/// message. Built once from configuration and shared read-only.
#[derive(Clone, Debug)]
pub struct ChainParams {
    pub name: String,
    pub magic: [u8; 4],
    pub p2p_port: u16,
    pub protocol_version: i32,
    /// Our sub-version string, e.g. `/atlas-crawler:0.1.0/`.
    pub user_agent: String,
    pub services: NodeServiceSet,
    pub start_height: i32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct NodeServiceSet(pub Vec<NodeService>);

impl NodeServiceSet {
    pub fn as_bitmask(&self) -> u64 {
        let mut bitset = 0x0_u64;
        for bit in self.0.iter() {
            bitset |= bit.as_u64();
        }
        bitset
    }

    pub fn from_bitmask(mask: u64) -> Self {
        let mut services = vec![];

        for e in NodeService::iter() {
            if mask & e.as_u64() != 0 {
                services.push(e);
            }
        }

        NodeServiceSet(services)
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
#[repr(u64)]
#[derive(EnumIter)]
pub enum NodeService {
    NodeNetwork = 0x1, // bit mask value
}

impl NodeService {
    pub fn as_u64(self) -> u64 {
        self as u64
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn bitmask_round_trip() {
        let services = NodeServiceSet(vec![NodeService::NodeNetwork]);
        assert_eq!(services.as_bitmask(), 0x1);
        assert_eq!(NodeServiceSet::from_bitmask(0x1), services);
    }

    #[test]
    fn unknown_bits_are_dropped() {
        let services = NodeServiceSet::from_bitmask(0x1 | 0x400);
        assert_eq!(services, NodeServiceSet(vec![NodeService::NodeNetwork]));
    }
}
