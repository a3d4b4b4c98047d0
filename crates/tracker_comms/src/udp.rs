use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use byteorder::{ByteOrder, BE};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::{AnnounceEvent, AnnounceRequest, AnnounceResponse, TrackerError};

const CONNECT_MAGIC: u64 = 0x41727101980;
const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const ACTION_ERROR: u32 = 3;

const EVENT_NONE: u32 = 0;
const EVENT_COMPLETED: u32 = 1;
const EVENT_STARTED: u32 = 2;
const EVENT_STOPPED: u32 = 3;

// A connection id may be reused for a minute after the connect exchange.
const CONNECTION_ID_TTL: Duration = Duration::from_secs(60);

// Retransmit schedule: base * 2^n for n = 0..=MAX_RETRANSMITS, then give up.
const RETRANSMIT_BASE: Duration = Duration::from_secs(15);
const MAX_RETRANSMITS: usize = 8;

fn event_code(event: Option<AnnounceEvent>) -> u32 {
    match event {
        None => EVENT_NONE,
        Some(AnnounceEvent::Completed) => EVENT_COMPLETED,
        Some(AnnounceEvent::Started) => EVENT_STARTED,
        Some(AnnounceEvent::Stopped) => EVENT_STOPPED,
    }
}

fn serialize_connect(transaction_id: u32, out: &mut Vec<u8>) {
    out.extend_from_slice(&CONNECT_MAGIC.to_be_bytes());
    out.extend_from_slice(&ACTION_CONNECT.to_be_bytes());
    out.extend_from_slice(&transaction_id.to_be_bytes());
}

fn serialize_announce(
    connection_id: u64,
    transaction_id: u32,
    req: &AnnounceRequest,
    out: &mut Vec<u8>,
) {
    out.extend_from_slice(&connection_id.to_be_bytes());
    out.extend_from_slice(&ACTION_ANNOUNCE.to_be_bytes());
    out.extend_from_slice(&transaction_id.to_be_bytes());
    out.extend_from_slice(&req.info_hash.0);
    out.extend_from_slice(&req.peer_id.0);
    out.extend_from_slice(&req.downloaded.to_be_bytes());
    out.extend_from_slice(&req.left.to_be_bytes());
    out.extend_from_slice(&req.uploaded.to_be_bytes());
    out.extend_from_slice(&event_code(req.event).to_be_bytes());
    out.extend_from_slice(&0u32.to_be_bytes()); // ip: let the tracker use the source
    out.extend_from_slice(&req.key.to_be_bytes());
    out.extend_from_slice(&(-1i32).to_be_bytes()); // num_want
    out.extend_from_slice(&req.port.to_be_bytes());
}

#[derive(Debug)]
enum Response {
    Connect(u64),
    Announce(AnnounceResponse),
}

fn parse_response(buf: &[u8]) -> Result<(u32, Response), TrackerError> {
    if buf.len() < 8 {
        return Err(TrackerError::UdpMalformed);
    }
    let action = BE::read_u32(&buf[0..4]);
    let transaction_id = BE::read_u32(&buf[4..8]);
    let rest = &buf[8..];
    let response = match action {
        ACTION_CONNECT => {
            if rest.len() < 8 {
                return Err(TrackerError::UdpMalformed);
            }
            Response::Connect(BE::read_u64(&rest[0..8]))
        }
        ACTION_ANNOUNCE => {
            if rest.len() < 12 {
                return Err(TrackerError::UdpMalformed);
            }
            let interval = BE::read_u32(&rest[0..4]);
            let leechers = BE::read_u32(&rest[4..8]);
            let seeders = BE::read_u32(&rest[8..12]);
            let mut peers = Vec::new();
            for chunk in rest[12..].chunks_exact(6) {
                let ip = Ipv4Addr::from(BE::read_u32(&chunk[0..4]));
                let port = BE::read_u16(&chunk[4..6]);
                peers.push(SocketAddr::V4(SocketAddrV4::new(ip, port)));
            }
            Response::Announce(AnnounceResponse {
                interval: Some(Duration::from_secs(interval as u64)),
                peers,
                seeders: Some(seeders),
                leechers: Some(leechers),
            })
        }
        ACTION_ERROR => {
            let msg = String::from_utf8_lossy(rest).into_owned();
            return Err(TrackerError::UdpTrackerError(msg));
        }
        _ => return Err(TrackerError::UdpMalformed),
    };
    Ok((transaction_id, response))
}

/// One UDP tracker client per session; connection ids are cached per
/// tracker address.
#[derive(Clone)]
pub struct UdpTrackerClient {
    connections: Arc<Mutex<HashMap<SocketAddr, (u64, Instant)>>>,
    retransmit_base: Duration,
}

impl Default for UdpTrackerClient {
    fn default() -> Self {
        Self::new()
    }
}

impl UdpTrackerClient {
    pub fn new() -> Self {
        Self {
            connections: Arc::new(Mutex::new(HashMap::new())),
            retransmit_base: RETRANSMIT_BASE,
        }
    }

    #[cfg(test)]
    fn with_retransmit_base(base: Duration) -> Self {
        Self {
            connections: Arc::new(Mutex::new(HashMap::new())),
            retransmit_base: base,
        }
    }

    pub async fn announce(
        &self,
        host: &str,
        port: u16,
        req: &AnnounceRequest,
    ) -> Result<AnnounceResponse, TrackerError> {
        let addr = tokio::net::lookup_host((host, port))
            .await?
            .find(SocketAddr::is_ipv4)
            .with_context(|| format!("no IPv4 address for {host}"))?;

        let sock = tokio::net::UdpSocket::bind("0.0.0.0:0").await?;
        sock.connect(addr).await?;

        let connection_id = match self.cached_connection(addr) {
            Some(id) => id,
            None => {
                let id = self.connect(&sock).await?;
                self.connections.lock().insert(addr, (id, Instant::now()));
                id
            }
        };

        let tid: u32 = rand::random();
        let mut out = Vec::with_capacity(98);
        serialize_announce(connection_id, tid, req, &mut out);
        match self.request(&sock, &out, tid).await? {
            Response::Announce(resp) => {
                trace!(peers = resp.peers.len(), "udp announce ok");
                Ok(resp)
            }
            Response::Connect(_) => Err(TrackerError::UdpMalformed),
        }
    }

    fn cached_connection(&self, addr: SocketAddr) -> Option<u64> {
        let mut g = self.connections.lock();
        match g.get(&addr) {
            Some((id, when)) if when.elapsed() < CONNECTION_ID_TTL => Some(*id),
            Some(_) => {
                g.remove(&addr);
                None
            }
            None => None,
        }
    }

    async fn connect(&self, sock: &tokio::net::UdpSocket) -> Result<u64, TrackerError> {
        let tid: u32 = rand::random();
        let mut out = Vec::with_capacity(16);
        serialize_connect(tid, &mut out);
        match self.request(sock, &out, tid).await? {
            Response::Connect(id) => Ok(id),
            Response::Announce(_) => Err(TrackerError::UdpMalformed),
        }
    }

    /// Send and await the matching response, retransmitting on the
    /// 15 * 2^n schedule.
    async fn request(
        &self,
        sock: &tokio::net::UdpSocket,
        packet: &[u8],
        transaction_id: u32,
    ) -> Result<Response, TrackerError> {
        let mut read_buf = vec![0u8; 4096];
        for attempt in 0..=MAX_RETRANSMITS {
            sock.send(packet).await?;
            let wait = self.retransmit_base * (1 << attempt);
            match tokio::time::timeout(wait, sock.recv(&mut read_buf)).await {
                Ok(Ok(size)) => {
                    let (tid, response) = parse_response(&read_buf[..size])?;
                    if tid != transaction_id {
                        return Err(TrackerError::UdpWrongTransaction);
                    }
                    return Ok(response);
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => {
                    debug!(attempt, "udp tracker retransmit");
                }
            }
        }
        Err(TrackerError::UdpTimeout(MAX_RETRANSMITS))
    }
}
