//! Unicast and multicast transport
//!
//! Unicast send binds the data port, accepts up to a configured number
//! of receivers (optionally under a deadline), handshakes each with a
//! one-byte `SERVER_OK` / `RECEIVER_OK` exchange, and hands the
//! accepted sockets to the transfer hub as sinks. Multicast trades the
//! handshake for fire-and-forget datagrams on the shared group; loss
//! shows up at the receiver as a truncated stream.

use std::io::{Read, Write};
use std::net::{
    IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4, TcpListener, TcpStream, UdpSocket,
};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::protocol::{command, MULTICAST_CHUNK};

/// Socket tuning: enlarge buffers, disable Nagle, enable keepalive.
pub fn tune_socket(stream: &TcpStream) {
    let _ = stream.set_nodelay(true);
    use std::os::fd::AsRawFd;
    let fd = stream.as_raw_fd();
    unsafe {
        let keepalive: libc::c_int = 1;
        let _ = libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_KEEPALIVE,
            &keepalive as *const _ as *const libc::c_void,
            std::mem::size_of_val(&keepalive) as libc::socklen_t,
        );

        let sz: libc::c_int = 8 * 1024 * 1024;
        let p = &sz as *const _ as *const libc::c_void;
        let _ = libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_SNDBUF,
            p,
            std::mem::size_of_val(&sz) as libc::socklen_t,
        );
        let _ = libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_RCVBUF,
            p,
            std::mem::size_of_val(&sz) as libc::socklen_t,
        );
    }
}

/// TCP listener with SO_REUSEADDR, so a node can rebind the data port
/// while the previous connection sits in TIME_WAIT.
pub fn listen_reuseaddr(port: u16) -> Result<TcpListener> {
    use std::os::fd::{AsRawFd, FromRawFd};

    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(Error::Connection(Some("socket".into())));
    }
    let listener = unsafe { TcpListener::from_raw_fd(fd) };

    unsafe {
        let on: libc::c_int = 1;
        let _ = libc::setsockopt(
            listener.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &on as *const _ as *const libc::c_void,
            std::mem::size_of_val(&on) as libc::socklen_t,
        );

        let addr = libc::sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: port.to_be(),
            sin_addr: libc::in_addr {
                s_addr: libc::INADDR_ANY.to_be(),
            },
            sin_zero: [0; 8],
        };
        if libc::bind(
            listener.as_raw_fd(),
            &addr as *const _ as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        ) < 0
        {
            return Err(Error::Connection(Some(format!("bind port {port}"))));
        }
        if libc::listen(listener.as_raw_fd(), 16) < 0 {
            return Err(Error::Connection(Some(format!("listen port {port}"))));
        }
    }
    Ok(listener)
}

/// Accept up to `count` receivers on `port`. With a deadline, stops
/// accepting when it expires; zero accepted receivers is a
/// `Connection` failure either way.
pub fn accept_receivers(
    port: u16,
    count: usize,
    deadline: Option<Duration>,
) -> Result<Vec<(TcpStream, SocketAddr)>> {
    if count == 0 {
        return Err(Error::Connection(Some("zero receivers requested".into())));
    }
    let listener = listen_reuseaddr(port)?;
    let started = Instant::now();
    let mut peers = Vec::with_capacity(count);

    if deadline.is_some() {
        listener
            .set_nonblocking(true)
            .map_err(|e| Error::Connection(Some(e.to_string())))?;
    }

    while peers.len() < count {
        match listener.accept() {
            Ok((stream, addr)) => {
                tune_socket(&stream);
                stream
                    .set_nonblocking(false)
                    .map_err(|e| Error::Connection(Some(e.to_string())))?;
                peers.push((stream, addr));
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                if let Some(limit) = deadline {
                    if started.elapsed() >= limit {
                        break;
                    }
                }
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(e) => return Err(Error::Connection(Some(e.to_string()))),
        }
    }

    if peers.is_empty() {
        return Err(Error::Connection(Some("no receivers connected".into())));
    }
    Ok(peers)
}

/// Sender side of the unicast handshake: `SERVER_OK` out,
/// `RECEIVER_OK` back.
pub fn handshake_server(stream: &mut TcpStream) -> Result<()> {
    stream
        .write_all(&[command::C_SERVER_OK])
        .map_err(|e| Error::SendData(e.to_string()))?;
    let mut reply = [0u8; 1];
    stream
        .read_exact(&mut reply)
        .map_err(|e| Error::ReceiveData(e.to_string()))?;
    if reply[0] & command::C_RECEIVER_OK == 0 {
        return Err(Error::Connection(Some("receiver refused handshake".into())));
    }
    Ok(())
}

/// Receiver side: connect to the sender and answer its `SERVER_OK`.
pub fn connect_to_sender(addr: IpAddr, port: u16) -> Result<TcpStream> {
    let mut stream = TcpStream::connect((addr, port))
        .map_err(|e| Error::Connection(Some(e.to_string())))?;
    tune_socket(&stream);

    let mut hello = [0u8; 1];
    stream
        .read_exact(&mut hello)
        .map_err(|e| Error::ReceiveData(e.to_string()))?;
    if hello[0] & command::C_SERVER_OK == 0 {
        return Err(Error::Connection(Some("unexpected server greeting".into())));
    }
    stream
        .write_all(&[command::C_RECEIVER_OK])
        .map_err(|e| Error::SendData(e.to_string()))?;
    Ok(stream)
}

/// Datagram-chunked sink over the multicast group. No handshake; the
/// receiver observes loss as truncation.
pub struct MulticastSender {
    sock: UdpSocket,
    group: SocketAddrV4,
}

impl MulticastSender {
    pub fn open(group: Ipv4Addr, port: u16) -> Result<Self> {
        let sock = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
            .map_err(|e| Error::Connection(Some(e.to_string())))?;
        Ok(MulticastSender {
            sock,
            group: SocketAddrV4::new(group, port),
        })
    }
}

impl Write for MulticastSender {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut sent = 0;
        for chunk in buf.chunks(MULTICAST_CHUNK) {
            self.sock.send_to(chunk, self.group)?;
            sent += chunk.len();
        }
        Ok(sent)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Datagram source joined to the multicast group, surfaced as a
/// byte stream for the hub.
pub struct MulticastReceiver {
    sock: UdpSocket,
    pending: Vec<u8>,
    offset: usize,
}

impl MulticastReceiver {
    pub fn join(group: Ipv4Addr, port: u16) -> Result<Self> {
        let sock = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))
            .map_err(|e| Error::Connection(Some(e.to_string())))?;
        sock.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)
            .map_err(|e| Error::Connection(Some(e.to_string())))?;
        Ok(MulticastReceiver {
            sock,
            pending: Vec::new(),
            offset: 0,
        })
    }
}

impl Read for MulticastReceiver {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.offset >= self.pending.len() {
            let mut datagram = vec![0u8; MULTICAST_CHUNK];
            let (n, _) = self.sock.recv_from(&mut datagram)?;
            datagram.truncate(n);
            self.pending = datagram;
            self.offset = 0;
        }
        let n = (self.pending.len() - self.offset).min(buf.len());
        buf[..n].copy_from_slice(&self.pending[self.offset..self.offset + n]);
        self.offset += n;
        Ok(n)
    }
}
