use std::net::SocketAddr;
use std::str::FromStr;

use anyhow::Context;

use crate::hash_id::InfoHash;

/// A parsed magnet link.
///
/// `x.pe` hints are direct peer addresses; they get fed straight into the
/// torrent's peer set on add.
#[derive(Debug, Clone)]
pub struct Magnet {
    pub info_hash: InfoHash,
    pub name: Option<String>,
    pub trackers: Vec<String>,
    pub peer_hints: Vec<SocketAddr>,
}

impl Magnet {
    pub fn parse(link: &str) -> anyhow::Result<Magnet> {
        let url = url::Url::parse(link).context("magnet link is not a valid URL")?;
        if url.scheme() != "magnet" {
            anyhow::bail!("expected magnet: scheme, got {}", url.scheme());
        }
        let mut info_hash = None;
        let mut name = None;
        let mut trackers = Vec::new();
        let mut peer_hints = Vec::new();
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "xt" => {
                    let ih = value
                        .as_ref()
                        .strip_prefix("urn:btih:")
                        .context("only urn:btih infohashes are supported")?;
                    info_hash = Some(InfoHash::from_str(ih)?);
                }
                "dn" => name = Some(value.into_owned()),
                "tr" => trackers.push(value.into_owned()),
                "x.pe" => {
                    // Only literal host:port hints are usable without a
                    // resolver; anything else is dropped.
                    if let Ok(addr) = value.as_ref().parse::<SocketAddr>() {
                        peer_hints.push(addr);
                    }
                }
                _ => {}
            }
        }
        Ok(Magnet {
            info_hash: info_hash.context("magnet link has no info-hash")?,
            name,
            trackers,
            peer_hints,
        })
    }
}

impl std::fmt::Display for Magnet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "magnet:?xt=urn:btih:{}", self.info_hash)?;
        if let Some(name) = &self.name {
            write!(f, "&dn={}", urlencode(name))?;
        }
        for tr in &self.trackers {
            write!(f, "&tr={}", urlencode(tr))?;
        }
        for peer in &self.peer_hints {
            write!(f, "&x.pe={peer}")?;
        }
        Ok(())
    }
}

fn urlencode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_basic() {
        let m = Magnet::parse(
            "magnet:?xt=urn:btih:a621779b5e3d486e127c3efbca9b6f8d135f52e5&dn=test&tr=http://t/a",
        )
        .unwrap();
        assert_eq!(
            m.info_hash.to_string(),
            "a621779b5e3d486e127c3efbca9b6f8d135f52e5"
        );
        assert_eq!(m.name.as_deref(), Some("test"));
        assert_eq!(m.trackers, vec!["http://t/a".to_string()]);
    }

    #[test]
    fn test_parse_base32() {
        let m = Magnet::parse("magnet:?xt=urn:btih:Z7QRDHYSJCA4U4HXGBXTFYUSDFGIRQMV").unwrap();
        assert_eq!(
            m.info_hash.to_string(),
            "cfe1119f124881ca70f7306f32e292194c88c195"
        );
    }

    #[test]
    fn test_peer_hints() {
        let m = Magnet::parse(
            "magnet:?xt=urn:btih:a621779b5e3d486e127c3efbca9b6f8d135f52e5&x.pe=127.0.0.1:6881&x.pe=not-an-addr",
        )
        .unwrap();
        assert_eq!(m.peer_hints, vec!["127.0.0.1:6881".parse().unwrap()]);
    }

    #[test]
    fn test_missing_hash() {
        assert!(Magnet::parse("magnet:?dn=test").is_err());
        assert!(Magnet::parse("http://example.com").is_err());
    }

    #[test]
    fn test_display_roundtrip() {
        let s = "magnet:?xt=urn:btih:a621779b5e3d486e127c3efbca9b6f8d135f52e5&x.pe=10.0.0.1:1000";
        let m = Magnet::parse(s).unwrap();
        assert_eq!(m.to_string(), s);
    }
}
