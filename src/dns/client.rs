//! client for sending DNS queries to other servers

use std::net::{SocketAddr, TcpStream, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use derive_more::{Display, Error, From};

use crate::dns::netutil::{read_framed, write_framed};
use crate::dns::protocol::{DnsPacket, MAX_MESSAGE_SIZE};

#[derive(Debug, Display, From, Error)]
pub enum ClientError {
    Protocol(crate::dns::protocol::ProtocolError),
    Io(std::io::Error),
    #[display(fmt = "could not resolve upstream address {}", server)]
    #[from(ignore)]
    LookupFailed { server: String },
    #[display(fmt = "timed out waiting for a response")]
    TimeOut,
    #[display(fmt = "response id {} does not match query id {}", actual, expected)]
    #[from(ignore)]
    IdMismatch { expected: u16, actual: u16 },
}

type Result<T> = std::result::Result<T, ClientError>;

/// Outcome of a single UDP exchange
#[derive(Debug)]
pub enum UdpResponse {
    Answer(DnsPacket),
    /// The server set TC. The datagram is not parsed, since a truncated
    /// message may end partway through a record.
    Truncated,
}

/// A transport capable of exchanging a single query with a plain DNS server
pub trait DnsClient {
    fn get_sent_count(&self) -> usize;
    fn get_failed_count(&self) -> usize;

    /// Sends `query` to `server` (`host:port`) and waits at most `timeout`
    /// for each transport attempt.
    fn exchange(&self, query: &DnsPacket, server: &str, timeout: Duration) -> Result<DnsPacket>;
}

/// Classic DNS client speaking UDP, retrying over TCP when the UDP answer
/// comes back truncated.
///
/// Every exchange uses its own ephemeral socket, so concurrent queries from
/// different request threads never see each other's replies.
#[derive(Default)]
pub struct DnsNetworkClient {
    total_sent: AtomicUsize,
    total_failed: AtomicUsize,
}

fn resolve(server: &str) -> Result<SocketAddr> {
    server
        .to_socket_addrs()
        .map_err(|_| ClientError::LookupFailed {
            server: server.to_string(),
        })?
        .next()
        .ok_or_else(|| ClientError::LookupFailed {
            server: server.to_string(),
        })
}

/// TC bit within the third header octet
const TRUNCATED_FLAG: u8 = 0x02;

fn is_timeout(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    )
}

impl DnsNetworkClient {
    pub fn new() -> DnsNetworkClient {
        DnsNetworkClient::default()
    }

    /// Send a DNS query using UDP transport
    ///
    /// Datagrams carrying a different transaction id are discarded and the
    /// wait continues until the deadline.
    pub fn send_udp_query(
        &self,
        request: &[u8],
        id: u16,
        server: SocketAddr,
        timeout: Duration,
    ) -> Result<UdpResponse> {
        let local: SocketAddr = if server.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };

        let socket = UdpSocket::bind(local)?;
        socket.connect(server)?;
        socket.set_write_timeout(Some(timeout))?;
        socket.send(request)?;

        let deadline = Instant::now() + timeout;
        let mut res_buffer = vec![0; MAX_MESSAGE_SIZE];
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining == Duration::from_secs(0) {
                return Err(ClientError::TimeOut);
            }
            socket.set_read_timeout(Some(remaining))?;

            let len = match socket.recv(&mut res_buffer) {
                Ok(len) => len,
                Err(ref e) if is_timeout(e) => return Err(ClientError::TimeOut),
                Err(e) => return Err(e.into()),
            };

            if len < 4 {
                continue;
            }

            let response_id = ((res_buffer[0] as u16) << 8) | (res_buffer[1] as u16);
            if response_id != id {
                log::debug!(
                    "discarding udp response with id {} from {}, waiting for {}",
                    response_id,
                    server,
                    id
                );
                continue;
            }

            if res_buffer[2] & TRUNCATED_FLAG != 0 {
                return Ok(UdpResponse::Truncated);
            }

            return Ok(UdpResponse::Answer(DnsPacket::from_bytes(
                &res_buffer[..len],
            )?));
        }
    }

    /// Send a DNS query using TCP transport
    ///
    /// This is much simpler than using UDP, since the kernel will take care of
    /// packet ordering and connection state.
    pub fn send_tcp_query(
        &self,
        request: &[u8],
        id: u16,
        server: SocketAddr,
        timeout: Duration,
    ) -> Result<DnsPacket> {
        let mut socket = TcpStream::connect_timeout(&server, timeout).map_err(|e| {
            if is_timeout(&e) {
                ClientError::TimeOut
            } else {
                e.into()
            }
        })?;
        socket.set_read_timeout(Some(timeout))?;
        socket.set_write_timeout(Some(timeout))?;

        let data = write_framed(&mut socket, request)
            .and_then(|_| read_framed(&mut socket))
            .map_err(|e| {
                if is_timeout(&e) {
                    ClientError::TimeOut
                } else {
                    e.into()
                }
            })?;

        let packet = DnsPacket::from_bytes(&data)?;
        if packet.header.id != id {
            return Err(ClientError::IdMismatch {
                expected: id,
                actual: packet.header.id,
            });
        }

        Ok(packet)
    }

    fn exchange_inner(
        &self,
        query: &DnsPacket,
        server: &str,
        timeout: Duration,
    ) -> Result<DnsPacket> {
        let addr = resolve(server)?;

        let mut query = query.clone();
        let id = query.header.id;
        let request = query.to_bytes()?;

        if let UdpResponse::Answer(packet) = self.send_udp_query(&request, id, addr, timeout)? {
            return Ok(packet);
        }

        log::debug!("truncated response from {}, retrying over tcp", server);
        self.send_tcp_query(&request, id, addr, timeout)
    }
}

impl DnsClient for DnsNetworkClient {
    fn get_sent_count(&self) -> usize {
        self.total_sent.load(Ordering::Acquire)
    }

    fn get_failed_count(&self) -> usize {
        self.total_failed.load(Ordering::Acquire)
    }

    fn exchange(&self, query: &DnsPacket, server: &str, timeout: Duration) -> Result<DnsPacket> {
        let _ = self.total_sent.fetch_add(1, Ordering::Release);

        let result = self.exchange_inner(query, server, timeout);
        if result.is_err() {
            let _ = self.total_failed.fetch_add(1, Ordering::Release);
        }

        result
    }
}
