//! Chain ("link") mode
//!
//! One head node discovers receivers over UDP multicast and strings
//! them into a line: every non-tail node relays the stream to its
//! successor over TCP while also writing its local copy. Discovery
//! runs on the ping port; payload runs on the data port.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4, TcpStream, UdpSocket};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::net::{listen_reuseaddr, tune_socket};
use crate::protocol::{command, timeouts, LINKS_NUM};

/// Per-node lifecycle. Transitions are linear; any failure is fatal to
/// the node and leaves downstream links with a truncated stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    Discover,
    Answer,
    DistributeSuccessors,
    ConnectPeers,
    Transfer,
    TearDown,
}

/// Successor of each collected node: the next reply's address, 0 for
/// the tail.
pub fn chain_successors(links: &[Ipv4Addr]) -> Vec<(Ipv4Addr, Ipv4Addr)> {
    links
        .iter()
        .enumerate()
        .map(|(i, &node)| {
            let next = links.get(i + 1).copied().unwrap_or(Ipv4Addr::UNSPECIFIED);
            (node, next)
        })
        .collect()
}

/// Head-node discovery: announce on the multicast group, collect
/// replies for the discovery window, then unicast each node its
/// successor. Returns the collected chain in reply order; the first
/// entry is the head's own TCP successor.
pub fn net_scan(ping_port: u16, group: Ipv4Addr) -> Result<Vec<Ipv4Addr>> {
    let sock = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .map_err(|e| Error::Connection(Some(e.to_string())))?;
    let group_addr = SocketAddrV4::new(group, ping_port);

    sock.send_to(&[command::C_LINK_SERVER_OK], group_addr)
        .map_err(|e| Error::SendData(e.to_string()))?;

    let mut links: Vec<Ipv4Addr> = Vec::new();
    let started = Instant::now();
    loop {
        let elapsed = started.elapsed();
        if elapsed >= timeouts::DISCOVERY_WINDOW || links.len() >= LINKS_NUM {
            break;
        }
        sock.set_read_timeout(Some(timeouts::DISCOVERY_WINDOW - elapsed))
            .map_err(|e| Error::Connection(Some(e.to_string())))?;

        let mut reply = [0u8; 1];
        match sock.recv_from(&mut reply) {
            Ok((_, SocketAddr::V4(peer))) => {
                if reply[0] & command::C_LINK_CLIENT_OK != 0 {
                    links.push(*peer.ip());
                }
            }
            Ok(_) => {}
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                break;
            }
            Err(e) => return Err(Error::Connection(Some(e.to_string()))),
        }
    }

    if links.is_empty() {
        return Err(Error::Connection(Some("no links answered the scan".into())));
    }

    for (node, successor) in chain_successors(&links) {
        let peer = SocketAddrV4::new(node, ping_port);
        sock.send_to(&[command::C_NEXT_LINK_IP], peer)
            .map_err(|e| Error::SendData(e.to_string()))?;
        sock.send_to(&successor.octets(), peer)
            .map_err(|e| Error::SendData(e.to_string()))?;
    }

    Ok(links)
}

/// Non-head node: join the group, wait for the head's announcement,
/// reply, then receive the successor address. A successor of
/// 0.0.0.0 marks this node as the tail; so does the discovery window
/// running out before the successor datagram arrives.
pub fn answer(ping_port: u16, group: Ipv4Addr) -> Result<Ipv4Addr> {
    let sock = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, ping_port))
        .map_err(|e| Error::Connection(Some(e.to_string())))?;
    sock.set_multicast_loop_v4(false)
        .map_err(|e| Error::Connection(Some(e.to_string())))?;
    sock.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)
        .map_err(|e| Error::Connection(Some(e.to_string())))?;

    // Wait for the head's announcement.
    let head = loop {
        let mut cmd = [0u8; 1];
        let (_, peer) = sock
            .recv_from(&mut cmd)
            .map_err(|e| Error::Connection(Some(e.to_string())))?;
        if cmd[0] & command::C_LINK_SERVER_OK != 0 {
            break peer;
        }
    };

    let _ = sock.leave_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED);

    sock.send_to(&[command::C_LINK_CLIENT_OK], head)
        .map_err(|e| Error::SendData(e.to_string()))?;

    // The successor announcement must land within the discovery
    // window; running out of it makes this node the tail.
    sock.set_read_timeout(Some(timeouts::DISCOVERY_WINDOW))
        .map_err(|e| Error::Connection(Some(e.to_string())))?;

    loop {
        let mut cmd = [0u8; 1];
        match sock.recv_from(&mut cmd) {
            Ok(_) if cmd[0] & command::C_NEXT_LINK_IP != 0 => break,
            Ok(_) => continue,
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                return Ok(Ipv4Addr::UNSPECIFIED);
            }
            Err(e) => return Err(Error::Connection(Some(e.to_string()))),
        }
    }

    let mut raw = [0u8; 4];
    match sock.recv_from(&mut raw) {
        Ok((4, _)) => Ok(Ipv4Addr::from(raw)),
        Ok(_) => Err(Error::Connection(Some("malformed successor datagram".into()))),
        Err(e)
            if e.kind() == std::io::ErrorKind::WouldBlock
                || e.kind() == std::io::ErrorKind::TimedOut =>
        {
            Ok(Ipv4Addr::UNSPECIFIED)
        }
        Err(e) => Err(Error::Connection(Some(e.to_string()))),
    }
}

/// Open the TCP leg to a successor after the settle delay.
pub fn connect_successor(successor: Ipv4Addr, data_port: u16) -> Result<TcpStream> {
    std::thread::sleep(timeouts::LINK_SETTLE);
    let stream = TcpStream::connect((IpAddr::V4(successor), data_port))
        .map_err(|e| Error::Connection(Some(e.to_string())))?;
    tune_socket(&stream);
    Ok(stream)
}

/// Accept the single TCP connection from the predecessor.
pub fn accept_predecessor(data_port: u16) -> Result<(TcpStream, SocketAddr)> {
    let listener = listen_reuseaddr(data_port)?;
    let (stream, peer) = listener
        .accept()
        .map_err(|e| Error::Connection(Some(e.to_string())))?;
    tune_socket(&stream);
    Ok((stream, peer))
}

/// Wiring for one node of the chain.
pub struct LinkChain {
    pub state: LinkState,
    /// TCP leg to the successor; `None` on the tail.
    pub downstream: Option<TcpStream>,
    /// TCP leg from the predecessor; `None` on the head.
    pub upstream: Option<TcpStream>,
    /// Predecessor address, once known.
    pub src_ip: Option<SocketAddr>,
}

impl LinkChain {
    /// Head role: discover the chain and connect to its first link.
    pub fn head(ping_port: u16, data_port: u16, group: Ipv4Addr) -> Result<Self> {
        let mut node = LinkChain {
            state: LinkState::Discover,
            downstream: None,
            upstream: None,
            src_ip: None,
        };
        let links = net_scan(ping_port, group)?;
        node.state = LinkState::DistributeSuccessors;

        node.state = LinkState::ConnectPeers;
        node.downstream = Some(connect_successor(links[0], data_port)?);
        node.state = LinkState::Transfer;
        Ok(node)
    }

    /// Link role: answer discovery, accept the predecessor, and open
    /// the leg to the successor unless this node is the tail.
    pub fn join(ping_port: u16, data_port: u16, group: Ipv4Addr) -> Result<Self> {
        let mut node = LinkChain {
            state: LinkState::Answer,
            downstream: None,
            upstream: None,
            src_ip: None,
        };
        let successor = answer(ping_port, group)?;

        node.state = LinkState::ConnectPeers;
        let (upstream, src) = accept_predecessor(data_port)?;
        node.upstream = Some(upstream);
        node.src_ip = Some(src);

        if !successor.is_unspecified() {
            node.downstream = Some(connect_successor(successor, data_port)?);
        }
        node.state = LinkState::Transfer;
        Ok(node)
    }

    /// Close both legs. Safe to call on every termination path.
    pub fn tear_down(&mut self) {
        self.state = LinkState::TearDown;
        if let Some(s) = self.downstream.take() {
            let _ = s.shutdown(std::net::Shutdown::Both);
        }
        if let Some(s) = self.upstream.take() {
            let _ = s.shutdown(std::net::Shutdown::Both);
        }
    }

    pub fn is_tail(&self) -> bool {
        self.downstream.is_none() && self.upstream.is_some()
    }
}

impl Drop for LinkChain {
    fn drop(&mut self) {
        self.tear_down();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::thread;

    #[test]
    fn successor_order_matches_reply_order() {
        let links: Vec<Ipv4Addr> = (1..=4).map(|i| Ipv4Addr::new(10, 0, 0, i)).collect();
        let pairs = chain_successors(&links);
        assert_eq!(pairs.len(), 4);
        assert_eq!(pairs[0], (links[0], links[1]));
        assert_eq!(pairs[2], (links[2], links[3]));
        assert_eq!(pairs[3], (links[3], Ipv4Addr::UNSPECIFIED), "tail stores 0");
    }

    #[test]
    fn a_full_chain_of_64_has_one_tail() {
        let links: Vec<Ipv4Addr> = (0..64u32)
            .map(|i| Ipv4Addr::from(0x0a000001u32 + i))
            .collect();
        let pairs = chain_successors(&links);
        assert_eq!(pairs.len(), 64);
        let tails = pairs
            .iter()
            .filter(|(_, next)| next.is_unspecified())
            .count();
        assert_eq!(tails, 1);
    }

    #[test]
    fn single_node_chain_is_its_own_tail() {
        let pairs = chain_successors(&[Ipv4Addr::new(192, 168, 1, 7)]);
        assert_eq!(pairs, vec![(Ipv4Addr::new(192, 168, 1, 7), Ipv4Addr::UNSPECIFIED)]);
    }

    #[test]
    fn relay_legs_carry_bytes_end_to_end() {
        // Two TCP legs glued the way an intermediate node glues them:
        // predecessor -> local sink + successor.
        let upstream_port = {
            let sock = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            sock.local_addr().unwrap().port()
        };

        let server = thread::spawn(move || {
            let (mut stream, _) = accept_predecessor(upstream_port).unwrap();
            let mut got = Vec::new();
            stream.read_to_end(&mut got).unwrap();
            got
        });

        for _ in 0..50 {
            if let Ok(mut stream) =
                TcpStream::connect((Ipv4Addr::LOCALHOST, upstream_port))
            {
                stream.write_all(b"chain payload").unwrap();
                break;
            }
            thread::sleep(Duration::from_millis(20));
        }

        assert_eq!(server.join().unwrap(), b"chain payload");
    }
}
