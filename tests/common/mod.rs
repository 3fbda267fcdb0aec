//! Fake DNS upstreams on loopback for the integration tests
#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use doh_relay::dns::protocol::{DnsPacket, DnsQuestion, DnsRecord, QueryType, TransientTtl};

/// Builds the reply to a query, None to stay silent
pub type Handler = dyn Fn(&DnsPacket) -> Option<DnsPacket> + Send + Sync;

pub struct FakeUpstream {
    pub addr: SocketAddr,
    udp_hits: Arc<AtomicUsize>,
    tcp_hits: Arc<AtomicUsize>,
}

impl FakeUpstream {
    /// UDP only upstream answering with `handler`
    pub fn udp(handler: Box<Handler>) -> FakeUpstream {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = socket.local_addr().unwrap();
        let udp_hits = Arc::new(AtomicUsize::new(0));

        let hits = udp_hits.clone();
        thread::spawn(move || serve_udp(socket, hits, move |query| handler(query)));

        FakeUpstream {
            addr,
            udp_hits,
            tcp_hits: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Answers every UDP query with an empty truncated reply and serves the
    /// real answer from `handler` over TCP on the same port.
    pub fn truncating(handler: Box<Handler>) -> FakeUpstream {
        // UDP and TCP need the same port number
        let (socket, listener) = (0..10)
            .find_map(|_| {
                let udp = UdpSocket::bind("127.0.0.1:0").ok()?;
                let port = udp.local_addr().ok()?.port();
                let tcp = TcpListener::bind(("127.0.0.1", port)).ok()?;
                Some((udp, tcp))
            })
            .unwrap();
        let addr = socket.local_addr().unwrap();
        let udp_hits = Arc::new(AtomicUsize::new(0));
        let tcp_hits = Arc::new(AtomicUsize::new(0));

        let hits = udp_hits.clone();
        thread::spawn(move || {
            serve_udp(socket, hits, |query| {
                let mut reply = DnsPacket::reply_to(query);
                reply.header.truncated_message = true;
                Some(reply)
            })
        });

        let hits = tcp_hits.clone();
        thread::spawn(move || serve_tcp(listener, hits, handler));

        FakeUpstream {
            addr,
            udp_hits,
            tcp_hits,
        }
    }

    pub fn address(&self) -> String {
        self.addr.to_string()
    }

    pub fn udp_hits(&self) -> usize {
        self.udp_hits.load(Ordering::SeqCst)
    }

    pub fn tcp_hits(&self) -> usize {
        self.tcp_hits.load(Ordering::SeqCst)
    }

    pub fn hits(&self) -> usize {
        self.udp_hits() + self.tcp_hits()
    }
}

fn serve_udp<F>(socket: UdpSocket, hits: Arc<AtomicUsize>, handler: F)
where
    F: Fn(&DnsPacket) -> Option<DnsPacket>,
{
    let mut buf = [0u8; 4096];
    loop {
        let (len, peer) = match socket.recv_from(&mut buf) {
            Ok(res) => res,
            Err(_) => return,
        };
        hits.fetch_add(1, Ordering::SeqCst);

        let query = match DnsPacket::from_bytes(&buf[..len]) {
            Ok(query) => query,
            Err(_) => continue,
        };

        if let Some(mut reply) = handler(&query) {
            let _ = socket.send_to(&reply.to_bytes().unwrap(), peer);
        }
    }
}

fn serve_tcp(listener: TcpListener, hits: Arc<AtomicUsize>, handler: Box<Handler>) {
    for stream in listener.incoming() {
        let mut stream = match stream {
            Ok(stream) => stream,
            Err(_) => return,
        };
        hits.fetch_add(1, Ordering::SeqCst);

        let query = match read_framed(&mut stream) {
            Some(data) => match DnsPacket::from_bytes(&data) {
                Ok(query) => query,
                Err(_) => continue,
            },
            None => continue,
        };

        if let Some(mut reply) = handler(&query) {
            let data = reply.to_bytes().unwrap();
            let mut framed = (data.len() as u16).to_be_bytes().to_vec();
            framed.extend_from_slice(&data);
            let _ = stream.write_all(&framed);
        }
    }
}

fn read_framed(stream: &mut TcpStream) -> Option<Vec<u8>> {
    let mut len_buf = [0u8; 2];
    stream.read_exact(&mut len_buf).ok()?;

    let mut data = vec![0; u16::from_be_bytes(len_buf) as usize];
    stream.read_exact(&mut data).ok()?;

    Some(data)
}

pub fn query(name: &str, qtype: QueryType) -> DnsPacket {
    let mut packet = DnsPacket::new();
    packet.header.id = rand::random();
    packet.header.recursion_desired = true;
    packet
        .questions
        .push(DnsQuestion::new(name.to_string(), qtype));

    packet
}

pub fn answer_a(query: &DnsPacket, addr: Ipv4Addr, ttl: u32) -> DnsPacket {
    let mut reply = DnsPacket::reply_to(query);
    reply.header.recursion_available = true;
    reply.answers.push(DnsRecord::A {
        domain: query.questions[0].name.clone(),
        addr,
        ttl: TransientTtl(ttl),
    });

    reply
}

/// Handler answering every query with a single A record
pub fn answering(addr: Ipv4Addr, ttl: u32) -> Box<Handler> {
    Box::new(move |query: &DnsPacket| Some(answer_a(query, addr, ttl)))
}

/// Handler that never answers
pub fn silent() -> Box<Handler> {
    Box::new(|_: &DnsPacket| None)
}
