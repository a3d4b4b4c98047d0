use std::net::IpAddr;
use std::time::{Duration, Instant};

use dashmap::DashMap;

/// Peers that misbehaved (handshake garbage, repeated bad pieces) are
/// refused for a while, by IP.
pub const BAN_DURATION: Duration = Duration::from_secs(600);

#[derive(Default)]
pub struct BanList {
    banned: DashMap<IpAddr, Instant>,
}

impl BanList {
    pub fn ban(&self, ip: IpAddr) {
        self.banned.insert(ip, Instant::now() + BAN_DURATION);
    }

    pub fn is_banned(&self, ip: IpAddr) -> bool {
        let expired = match self.banned.get(&ip) {
            Some(until) => Instant::now() >= *until,
            None => return false,
        };
        if expired {
            self.banned.remove(&ip);
            return false;
        }
        true
    }

    pub fn len(&self) -> usize {
        self.banned.len()
    }

    pub fn is_empty(&self) -> bool {
        self.banned.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ban_and_lookup() {
        let bans = BanList::default();
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        assert!(!bans.is_banned(ip));
        bans.ban(ip);
        assert!(bans.is_banned(ip));
        assert!(!bans.is_banned("10.0.0.2".parse().unwrap()));
    }

    #[test]
    fn test_expired_ban_clears() {
        let bans = BanList::default();
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        bans.banned.insert(ip, Instant::now() - Duration::from_secs(1));
        assert!(!bans.is_banned(ip));
        assert!(bans.is_empty());
    }
}
