//! Shared wire constants for the image stream and the coordination ports

/// Magic tag at offset 0 of every image stream.
pub const MAGIC: &[u8; 6] = b"DVCAST";
pub const VERSION: u16 = 1;

/// Fixed size of the image header on the wire.
pub const HEADER_LEN: usize = 24;

/// Fixed size of one partition descriptor on the wire.
pub const DESC_LEN: usize = 124;

/// A disk image never carries more partitions than this.
pub const MAX_PARTITIONS: u8 = 64;

/// UDP port for chain discovery pings.
pub const PORT_PING: u16 = 7772;

/// TCP port carrying the image payload in every network mode.
pub const PORT_DATA: u16 = 7773;

/// Multicast group shared by chain discovery and multicast transfer.
pub const MULTICAST_GROUP: &str = "225.0.1.2";

/// Maximum number of links in a chain.
pub const LINKS_NUM: usize = 64;

// Coordination commands. One byte on the wire; a single datagram may
// carry more than one bit.
pub mod command {
    pub const C_LINK_SERVER_OK: u8 = 1 << 0;
    pub const C_LINK_CLIENT_OK: u8 = 1 << 1;
    pub const C_NEXT_LINK_IP: u8 = 1 << 2;
    pub const C_SERVER_OK: u8 = 1 << 3;
    pub const C_RECEIVER_OK: u8 = 1 << 4;
}

pub mod timeouts {
    use std::time::Duration;

    /// Window during which the scanner collects discovery replies.
    pub const DISCOVERY_WINDOW: Duration = Duration::from_secs(3);

    /// Settle delay before a node connects to its successor, giving the
    /// successor time to start listening.
    pub const LINK_SETTLE: Duration = Duration::from_secs(1);
}

/// UDP datagram payload size for multicast transfer. Ethernet MTU minus
/// IP and UDP headers, so datagrams are never fragmented.
pub const MULTICAST_CHUNK: usize = 1472;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_bits_are_disjoint() {
        let all = [
            command::C_LINK_SERVER_OK,
            command::C_LINK_CLIENT_OK,
            command::C_NEXT_LINK_IP,
            command::C_SERVER_OK,
            command::C_RECEIVER_OK,
        ];
        for (i, a) in all.iter().enumerate() {
            for b in &all[i + 1..] {
                assert_eq!(a & b, 0);
            }
        }
    }
}
