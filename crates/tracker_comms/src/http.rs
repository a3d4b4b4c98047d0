use std::fmt::Write;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use bencode::Value;
use byteorder::{ByteOrder, BE};
use tracing::trace;
use url::Url;

use crate::{AnnounceRequest, AnnounceResponse, TrackerError, ANNOUNCE_TIMEOUT};

pub(crate) fn querystring(req: &AnnounceRequest) -> String {
    use urlencoding as u;
    let mut s = String::new();
    s.push_str("info_hash=");
    s.push_str(u::encode_binary(&req.info_hash.0).as_ref());
    s.push_str("&peer_id=");
    s.push_str(u::encode_binary(&req.peer_id.0).as_ref());
    write!(s, "&port={}", req.port).unwrap();
    write!(s, "&uploaded={}", req.uploaded).unwrap();
    write!(s, "&downloaded={}", req.downloaded).unwrap();
    write!(s, "&left={}", req.left).unwrap();
    write!(s, "&key={}", req.key).unwrap();
    s.push_str("&compact=1");
    if let Some(event) = req.event {
        write!(s, "&event={}", event.name()).unwrap();
    }
    s
}

pub(crate) fn parse_response(buf: &[u8]) -> Result<AnnounceResponse, TrackerError> {
    let root = bencode::decode(buf)?;
    if let Some(reason) = root.get(b"failure reason") {
        let reason = reason
            .as_str()
            .map(str::to_owned)
            .unwrap_or_else(|| "unreadable failure reason".to_string());
        return Err(TrackerError::Failure(reason));
    }

    let mut response = AnnounceResponse {
        interval: root
            .get_int(b"interval")
            .and_then(|i| u64::try_from(i).ok())
            .map(Duration::from_secs),
        seeders: root.get_int(b"complete").and_then(|v| u32::try_from(v).ok()),
        leechers: root
            .get_int(b"incomplete")
            .and_then(|v| u32::try_from(v).ok()),
        peers: Vec::new(),
    };

    match root.get(b"peers") {
        // Compact: 6 bytes per IPv4 peer.
        Some(Value::Bytes(b)) => {
            for chunk in b.chunks_exact(6) {
                let ip = Ipv4Addr::from(BE::read_u32(&chunk[0..4]));
                let port = BE::read_u16(&chunk[4..6]);
                response.peers.push((ip, port).into());
            }
        }
        // Non-compact: a list of {ip, port} dicts.
        Some(Value::List(peers)) => {
            for peer in peers {
                let Some(ip) = peer.get_str(b"ip").and_then(|s| s.parse::<IpAddr>().ok())
                else {
                    continue;
                };
                let Some(port) = peer.get_int(b"port").and_then(|p| u16::try_from(p).ok())
                else {
                    continue;
                };
                response.peers.push(SocketAddr::new(ip, port));
            }
        }
        _ => {}
    }

    // Compact IPv6 peers: 18 bytes each.
    if let Some(b) = root.get_bytes(b"peers6") {
        for chunk in b.chunks_exact(18) {
            let mut ip = [0u8; 16];
            ip.copy_from_slice(&chunk[0..16]);
            let port = BE::read_u16(&chunk[16..18]);
            response.peers.push((Ipv6Addr::from(ip), port).into());
        }
    }

    Ok(response)
}

pub(crate) async fn announce(
    client: &reqwest::Client,
    tracker_url: &Url,
    req: &AnnounceRequest,
) -> Result<AnnounceResponse, TrackerError> {
    let mut url = tracker_url.clone();
    let mut query = querystring(req);
    if let Some(existing) = url.query() {
        query.push('&');
        query.push_str(existing);
    }
    url.set_query(Some(&query));
    trace!(%url, "announcing");

    let fut = async {
        let response = client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(TrackerError::HttpStatus(status.as_u16()));
        }
        let body = response.bytes().await?;
        parse_response(&body)
    };
    match tokio::time::timeout(ANNOUNCE_TIMEOUT, fut).await {
        Ok(res) => res,
        Err(_) => Err(TrackerError::Timeout),
    }
}
