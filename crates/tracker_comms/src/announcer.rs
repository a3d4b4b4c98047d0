use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, trace, Instrument};
use url::Url;

use torq_core::{InfoHash, PeerId};

use crate::{
    http, AnnounceEvent, AnnounceRequest, AnnounceResponse, AnnounceStatsProvider, TrackerError,
    UdpTrackerClient, ANNOUNCE_TIMEOUT, MIN_RETRY_INTERVAL,
};

// `stopped` is a courtesy on the way out; don't hold shutdown for it.
const STOPPED_ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TrackerStatus {
    #[default]
    Queued,
    Announcing,
    Ok,
    Error,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct TrackerStats {
    pub url: String,
    pub kind: &'static str,
    pub status: TrackerStatus,
    pub interval_secs: Option<u64>,
    pub seeders: Option<u32>,
    pub leechers: Option<u32>,
    pub last_error: Option<String>,
    #[serde(skip)]
    started_sent: bool,
}

/// Drives every tracker of one torrent.
///
/// The announce list is a list of tiers. Within a tier URLs are tried in
/// order until one answers, and the winner is promoted to the front of its
/// tier; each tier re-announces independently on the interval its tracker
/// asked for.
pub struct Announcer {
    info_hash: InfoHash,
    peer_id: PeerId,
    port: u16,
    key: u32,
    stats_provider: Box<dyn AnnounceStatsProvider>,
    http_client: reqwest::Client,
    udp_client: UdpTrackerClient,
    tiers: Vec<Mutex<Vec<String>>>,
    tracker_stats: DashMap<String, TrackerStats>,
    peer_tx: mpsc::Sender<SocketAddr>,
    cancel: CancellationToken,
    completed_sent: AtomicBool,
}

impl Announcer {
    #[allow(clippy::too_many_arguments)]
    pub fn start(
        info_hash: InfoHash,
        peer_id: PeerId,
        port: u16,
        tiers: Vec<Vec<String>>,
        stats_provider: Box<dyn AnnounceStatsProvider>,
        http_client: reqwest::Client,
        udp_client: UdpTrackerClient,
        cancel: CancellationToken,
    ) -> (Arc<Self>, mpsc::Receiver<SocketAddr>) {
        let (peer_tx, peer_rx) = mpsc::channel(64);
        let tracker_stats = DashMap::new();
        for url in tiers.iter().flatten() {
            tracker_stats.insert(
                url.clone(),
                TrackerStats {
                    url: url.clone(),
                    kind: kind_of(url),
                    ..Default::default()
                },
            );
        }
        let announcer = Arc::new(Self {
            info_hash,
            peer_id,
            port,
            key: rand::random(),
            stats_provider,
            http_client,
            udp_client,
            tiers: tiers.into_iter().map(Mutex::new).collect(),
            tracker_stats,
            peer_tx,
            cancel,
            completed_sent: AtomicBool::new(false),
        });
        for tier_idx in 0..announcer.tiers.len() {
            let this = announcer.clone();
            let span = debug_span!("tracker_tier", info_hash = %this.info_hash, tier = tier_idx);
            tokio::spawn(this.task_tier(tier_idx).instrument(span));
        }
        (announcer, peer_rx)
    }

    pub fn stats(&self) -> Vec<TrackerStats> {
        self.tracker_stats
            .iter()
            .map(|e| e.value().clone())
            .collect()
    }

    /// Send `completed` to every tier exactly once. Called on the
    /// incomplete -> complete transition.
    pub fn notify_completed(self: &Arc<Self>) {
        if self.completed_sent.swap(true, Ordering::SeqCst) {
            return;
        }
        for tier in &self.tiers {
            let Some(url) = tier.lock().first().cloned() else {
                continue;
            };
            let this = self.clone();
            tokio::spawn(async move {
                if let Err(e) = this
                    .announce_one(&url, Some(AnnounceEvent::Completed))
                    .await
                {
                    debug!(url, "error sending completed: {e:#}");
                }
            });
        }
    }

    /// Best-effort `stopped` to the front tracker of each tier, capped at
    /// five seconds total.
    pub async fn announce_stopped(&self) {
        let urls: Vec<String> = self
            .tiers
            .iter()
            .filter_map(|t| t.lock().first().cloned())
            .collect();
        let work = async {
            for url in urls {
                if let Err(e) = self.announce_one(&url, Some(AnnounceEvent::Stopped)).await {
                    debug!(url, "error sending stopped: {e:#}");
                }
            }
        };
        let _ = tokio::time::timeout(STOPPED_ANNOUNCE_TIMEOUT, work).await;
    }

    async fn task_tier(self: Arc<Self>, tier_idx: usize) {
        loop {
            let urls: Vec<String> = self.tiers[tier_idx].lock().clone();
            if urls.is_empty() {
                return;
            }

            let mut sleep_for = MIN_RETRY_INTERVAL;
            for url in &urls {
                let event = {
                    let started_sent = self
                        .tracker_stats
                        .get(url)
                        .map(|s| s.started_sent)
                        .unwrap_or(false);
                    (!started_sent).then_some(AnnounceEvent::Started)
                };
                match self.announce_one(url, event).await {
                    Ok(response) => {
                        self.promote(tier_idx, url);
                        let peer_count = response.peers.len();
                        for peer in response.peers {
                            if self.peer_tx.send(peer).await.is_err() {
                                return;
                            }
                        }
                        trace!(url, peer_count, "announce ok");
                        sleep_for = response
                            .interval
                            .unwrap_or(MIN_RETRY_INTERVAL)
                            .max(Duration::from_secs(1));
                        break;
                    }
                    Err(e) => {
                        debug!(url, "announce error: {e:#}");
                    }
                }
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(sleep_for) => {}
            }
        }
    }

    fn promote(&self, tier_idx: usize, url: &str) {
        let mut tier = self.tiers[tier_idx].lock();
        if let Some(pos) = tier.iter().position(|u| u == url) {
            if pos > 0 {
                let winner = tier.remove(pos);
                tier.insert(0, winner);
            }
        }
    }

    async fn announce_one(
        &self,
        url: &str,
        event: Option<AnnounceEvent>,
    ) -> Result<AnnounceResponse, TrackerError> {
        let stats = self.stats_provider.get();
        let request = AnnounceRequest {
            info_hash: self.info_hash,
            peer_id: self.peer_id,
            port: self.port,
            uploaded: stats.uploaded,
            downloaded: stats.downloaded,
            left: stats.left,
            event,
            key: self.key,
        };
        self.update_stats(url, |s| s.status = TrackerStatus::Announcing);

        let result = self.dispatch(url, &request).await;
        match &result {
            Ok(response) => self.update_stats(url, |s| {
                s.status = TrackerStatus::Ok;
                s.interval_secs = response.interval.map(|i| i.as_secs());
                s.seeders = response.seeders;
                s.leechers = response.leechers;
                s.last_error = None;
                if event == Some(AnnounceEvent::Started) {
                    s.started_sent = true;
                }
            }),
            Err(e) => {
                let msg = format!("{e:#}");
                self.update_stats(url, |s| {
                    s.status = TrackerStatus::Error;
                    s.last_error = Some(msg);
                });
            }
        }
        result
    }

    async fn dispatch(
        &self,
        url: &str,
        request: &AnnounceRequest,
    ) -> Result<AnnounceResponse, TrackerError> {
        let parsed =
            Url::parse(url).map_err(|_| TrackerError::UnsupportedUrl(url.to_string()))?;
        match parsed.scheme() {
            "http" | "https" => http::announce(&self.http_client, &parsed, request).await,
            "udp" => {
                let host = parsed
                    .host_str()
                    .ok_or_else(|| TrackerError::UnsupportedUrl(url.to_string()))?;
                let port = parsed
                    .port()
                    .ok_or_else(|| TrackerError::UnsupportedUrl(url.to_string()))?;
                match tokio::time::timeout(
                    ANNOUNCE_TIMEOUT,
                    self.udp_client.announce(host, port, request),
                )
                .await
                {
                    Ok(res) => res,
                    Err(_) => Err(TrackerError::Timeout),
                }
            }
            _ => Err(TrackerError::UnsupportedUrl(url.to_string())),
        }
    }

    fn update_stats(&self, url: &str, f: impl FnOnce(&mut TrackerStats)) {
        if let Some(mut entry) = self.tracker_stats.get_mut(url) {
            f(entry.value_mut());
        }
    }
}

fn kind_of(url: &str) -> &'static str {
    if url.starts_with("udp") {
        "udp"
    } else {
        "http"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use torq_core::Id20;

    struct FixedStats(AtomicU64);

    impl AnnounceStatsProvider for FixedStats {
        fn get(&self) -> crate::AnnounceStats {
            crate::AnnounceStats {
                uploaded: 0,
                downloaded: self.0.load(Ordering::Relaxed),
                left: 100,
            }
        }
    }

    /// A single-shot HTTP tracker returning a fixed bencoded body.
    async fn spawn_http_tracker(body: &'static [u8]) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut sock, _)) = listener.accept().await else {
                    return;
                };
                let mut buf = [0u8; 2048];
                let _ = sock.read(&mut buf).await;
                let response = format!(
                    "HTTP/1.1 200 OK\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
                    body.len()
                );
                let _ = sock.write_all(response.as_bytes()).await;
                let _ = sock.write_all(body).await;
                let _ = sock.shutdown().await;
            }
        });
        format!("http://{addr}/announce")
    }

    #[tokio::test]
    async fn test_announce_loop_yields_peers_and_stats() {
        let url = spawn_http_tracker(
            b"d8:completei3e10:incompletei4e8:intervali1800e5:peers6:\x7f\x00\x00\x01\x1a\xe1e",
        )
        .await;
        let cancel = CancellationToken::new();
        let (announcer, mut peers) = Announcer::start(
            Id20::new([1; 20]),
            Id20::new([2; 20]),
            6881,
            vec![vec![url.clone()]],
            Box::new(FixedStats(AtomicU64::new(0))),
            reqwest::Client::new(),
            UdpTrackerClient::new(),
            cancel.clone(),
        );

        let peer = tokio::time::timeout(Duration::from_secs(5), peers.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(peer, "127.0.0.1:6881".parse().unwrap());

        // Stats reflect the successful announce.
        let stats = announcer.stats();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].status, TrackerStatus::Ok);
        assert_eq!(stats[0].seeders, Some(3));
        assert_eq!(stats[0].leechers, Some(4));
        assert_eq!(stats[0].interval_secs, Some(1800));
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_bad_tracker_then_promotion() {
        // First URL refuses connections; second works and gets promoted.
        let dead = {
            // Bind then drop to get a port nothing listens on.
            let l = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = l.local_addr().unwrap();
            drop(l);
            format!("http://{addr}/announce")
        };
        let good = spawn_http_tracker(b"d8:intervali60e5:peers0:e").await;

        let cancel = CancellationToken::new();
        let (announcer, _peers) = Announcer::start(
            Id20::new([1; 20]),
            Id20::new([2; 20]),
            6881,
            vec![vec![dead.clone(), good.clone()]],
            Box::new(FixedStats(AtomicU64::new(0))),
            reqwest::Client::new(),
            UdpTrackerClient::new(),
            cancel.clone(),
        );

        // Wait for the good tracker to be announced.
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let ok = announcer
                    .stats()
                    .into_iter()
                    .any(|s| s.url == good && s.status == TrackerStatus::Ok);
                if ok {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .unwrap();

        // The winner moved to the front of its tier.
        assert_eq!(announcer.tiers[0].lock().first(), Some(&good));
        let dead_stats = announcer
            .stats()
            .into_iter()
            .find(|s| s.url == dead)
            .unwrap();
        assert_eq!(dead_stats.status, TrackerStatus::Error);
        assert!(dead_stats.last_error.is_some());
        cancel.cancel();
    }

    #[test]
    fn test_kind_of() {
        assert_eq!(kind_of("udp://tracker:6969"), "udp");
        assert_eq!(kind_of("https://tracker/announce"), "http");
    }
}
