// Message Stream Encryption (a.k.a. Protocol Encryption), the obfuscation
// layer speakable on the peer port. A Diffie-Hellman exchange derives RC4
// keys; the initiator identifies the torrent by a hash of its info-hash so
// a passive observer never sees it.

mod rc4;
mod stream;

pub use rc4::Rc4;
pub use stream::MseStream;

use std::time::Duration;

use bytes::BytesMut;
use num_bigint::BigUint;
use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};
use sha1w::{ISha1, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use torq_core::InfoHash;
use tracing::trace;

// The 768-bit prime every MSE endpoint agrees on, generator 2.
const DH_PRIME_BYTES: [u8; 96] = [
    0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xC9, 0x0F, 0xDA, 0xA2, 0x21, 0x68, 0xC2,
    0x34, 0xC4, 0xC6, 0x62, 0x8B, 0x80, 0xDC, 0x1C, 0xD1, 0x29, 0x02, 0x4E, 0x08, 0x8A, 0x67,
    0xCC, 0x74, 0x02, 0x0B, 0xBE, 0xA6, 0x3B, 0x13, 0x9B, 0x22, 0x51, 0x4A, 0x08, 0x79, 0x8E,
    0x34, 0x04, 0xDD, 0xEF, 0x95, 0x19, 0xB3, 0xCD, 0x3A, 0x43, 0x1B, 0x30, 0x2B, 0x0A, 0x6D,
    0xF2, 0x5F, 0x14, 0x37, 0x4F, 0xE1, 0x35, 0x6D, 0x6D, 0x51, 0xC2, 0x45, 0xE4, 0x85, 0xB5,
    0x76, 0x62, 0x5E, 0x7E, 0xC6, 0xF4, 0x4C, 0x42, 0xE9, 0xA6, 0x3A, 0x36, 0x21, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x09, 0x05, 0x63,
];

const DH_KEY_LEN: usize = 96;
// MSE wants at least 128 random bits; 160 matches deployed clients.
const DH_SECRET_BITS: u64 = 160;

const VC: [u8; 8] = [0u8; 8];
pub const CRYPTO_PLAINTEXT: u32 = 0x01;
pub const CRYPTO_RC4: u32 = 0x02;

const MAX_PADDING: usize = 512;
// How far past the expected position we scan for the sync markers.
const SYNC_WINDOW: usize = MAX_PADDING;

pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-socket encryption policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MseMode {
    Disabled,
    #[default]
    Allow,
    Prefer,
    Required,
}

impl MseMode {
    /// Whether outgoing connections lead with the MSE handshake.
    pub fn initiate_encrypted(&self) -> bool {
        matches!(self, MseMode::Prefer | MseMode::Required)
    }

    /// Whether a plain `\x13BitTorrent` stream is acceptable at all.
    pub fn accepts_plaintext(&self) -> bool {
        !matches!(self, MseMode::Required)
    }

    fn crypto_provide(&self) -> u32 {
        match self {
            MseMode::Required => CRYPTO_RC4,
            _ => CRYPTO_RC4 | CRYPTO_PLAINTEXT,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum MseError {
    #[error("i/o error during encryption handshake: {0}")]
    Io(#[from] std::io::Error),
    #[error("encryption handshake timed out")]
    Timeout,
    #[error("peer closed during encryption handshake")]
    Eof,
    #[error("could not find the sync marker within the allowed window")]
    SyncExceeded,
    #[error("no registered torrent matches the encrypted hash")]
    UnknownInfoHash,
    #[error("verification constant mismatch")]
    BadVc,
    #[error("peer selected {selected:#x}, offered {offered:#x}")]
    InvalidCryptoSelect { selected: u32, offered: u32 },
    #[error("no crypto method in common (provided {0:#x})")]
    NoMutualCrypto(u32),
    #[error("padding length {0} exceeds the protocol maximum")]
    PaddingTooLong(usize),
}

struct DhExchange {
    secret: BigUint,
    public: [u8; DH_KEY_LEN],
}

impl DhExchange {
    fn generate() -> Self {
        let prime = BigUint::from_bytes_be(&DH_PRIME_BYTES);
        let mut secret_bytes = [0u8; (DH_SECRET_BITS / 8) as usize];
        rand::thread_rng().fill_bytes(&mut secret_bytes);
        let secret = BigUint::from_bytes_be(&secret_bytes);
        let public = BigUint::from(2u32).modpow(&secret, &prime);
        Self {
            secret,
            public: to_fixed_be(&public),
        }
    }

    fn shared_secret(&self, remote_public: &[u8]) -> [u8; DH_KEY_LEN] {
        let prime = BigUint::from_bytes_be(&DH_PRIME_BYTES);
        let remote = BigUint::from_bytes_be(remote_public);
        to_fixed_be(&remote.modpow(&self.secret, &prime))
    }
}

fn to_fixed_be(n: &BigUint) -> [u8; DH_KEY_LEN] {
    let bytes = n.to_bytes_be();
    let mut out = [0u8; DH_KEY_LEN];
    out[DH_KEY_LEN - bytes.len()..].copy_from_slice(&bytes);
    out
}

fn hash2(a: &[u8], b: &[u8]) -> [u8; 20] {
    let mut h = Sha1::new();
    h.update(a);
    h.update(b);
    h.finish()
}

fn hash3(a: &[u8], b: &[u8], c: &[u8]) -> [u8; 20] {
    let mut h = Sha1::new();
    h.update(a);
    h.update(b);
    h.update(c);
    h.finish()
}

fn random_padding() -> Vec<u8> {
    let mut rng = rand::thread_rng();
    let len = rng.gen_range(0..=MAX_PADDING);
    let mut pad = vec![0u8; len];
    rng.fill_bytes(&mut pad);
    pad
}

/// Incremental read helper over the handshake phase. Bytes the remote
/// pipelined past the handshake stay in here and are carried into the
/// resulting stream.
struct HsBuf {
    data: Vec<u8>,
    pos: usize,
    cipher: Option<Rc4>,
    decrypted_to: usize,
}

impl HsBuf {
    fn new(prefix: &[u8]) -> Self {
        Self {
            data: prefix.to_vec(),
            pos: 0,
            cipher: None,
            decrypted_to: 0,
        }
    }

    fn available(&self) -> usize {
        self.data.len() - self.pos
    }

    async fn fill_to<S: AsyncRead + Unpin>(
        &mut self,
        stream: &mut S,
        n: usize,
    ) -> Result<(), MseError> {
        while self.available() < n {
            let read = stream.read_buf(&mut self.data).await?;
            if read == 0 {
                return Err(MseError::Eof);
            }
        }
        Ok(())
    }

    async fn fill_some<S: AsyncRead + Unpin>(&mut self, stream: &mut S) -> Result<(), MseError> {
        let read = stream.read_buf(&mut self.data).await?;
        if read == 0 {
            return Err(MseError::Eof);
        }
        Ok(())
    }

    /// Consume `n` raw bytes.
    async fn take<S: AsyncRead + Unpin>(
        &mut self,
        stream: &mut S,
        n: usize,
    ) -> Result<Vec<u8>, MseError> {
        self.fill_to(stream, n).await?;
        let out = self.data[self.pos..self.pos + n].to_vec();
        self.pos += n;
        Ok(out)
    }

    /// From here on incoming bytes are ciphertext; anything unconsumed is
    /// decrypted as it gets taken.
    fn start_decrypting(&mut self, cipher: Rc4) {
        self.decrypted_to = self.pos;
        self.cipher = Some(cipher);
    }

    /// Consume `n` bytes, decrypting them (and nothing past them).
    async fn take_dec<S: AsyncRead + Unpin>(
        &mut self,
        stream: &mut S,
        n: usize,
    ) -> Result<Vec<u8>, MseError> {
        self.fill_to(stream, n).await?;
        let end = self.pos + n;
        if end > self.decrypted_to {
            let cipher = self.cipher.as_mut().expect("cipher must be set");
            cipher.apply(&mut self.data[self.decrypted_to..end]);
            self.decrypted_to = end;
        }
        let out = self.data[self.pos..end].to_vec();
        self.pos = end;
        Ok(out)
    }

    /// Scan forward for `marker`, consuming everything up to and including
    /// it. The marker must start within `window` bytes of the current
    /// position.
    async fn sync_to<S: AsyncRead + Unpin>(
        &mut self,
        stream: &mut S,
        marker: &[u8],
        window: usize,
    ) -> Result<(), MseError> {
        loop {
            let hay = &self.data[self.pos..];
            if let Some(idx) = find(hay, marker) {
                if idx > window {
                    return Err(MseError::SyncExceeded);
                }
                self.pos += idx + marker.len();
                return Ok(());
            }
            if hay.len() > window + marker.len() {
                return Err(MseError::SyncExceeded);
            }
            self.fill_some(stream).await?;
        }
    }

    /// Whatever arrived beyond the handshake. Raw: the caller decides
    /// whether it is ciphertext.
    fn into_rest(self) -> Vec<u8> {
        debug_assert!(self.decrypted_to <= self.pos || self.cipher.is_none());
        self.data[self.pos..].to_vec()
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn rc4_keys(s: &[u8; DH_KEY_LEN], skey: &InfoHash) -> (Rc4, Rc4) {
    let key_a = hash3(b"keyA", s, &skey.0);
    let key_b = hash3(b"keyB", s, &skey.0);
    (Rc4::new_dropped(&key_a), Rc4::new_dropped(&key_b))
}

#[derive(Debug)]
pub struct MseOutcome<S> {
    pub stream: MseStream<S>,
    /// Payload the remote pipelined behind the handshake (already
    /// decrypted).
    pub initial_data: BytesMut,
}

#[derive(Debug)]
pub struct ResponderOutcome<S> {
    pub stream: MseStream<S>,
    pub info_hash: InfoHash,
    pub initial_data: BytesMut,
}

/// Run the initiator side. `initial_payload` is sent inside the encrypted
/// envelope (the IA field) and saves a round-trip when it holds the
/// BitTorrent handshake.
pub async fn initiate<S>(
    stream: S,
    info_hash: InfoHash,
    mode: MseMode,
    initial_payload: &[u8],
) -> Result<MseOutcome<S>, MseError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match tokio::time::timeout(
        HANDSHAKE_TIMEOUT,
        initiate_inner(stream, info_hash, mode, initial_payload),
    )
    .await
    {
        Ok(res) => res,
        Err(_) => Err(MseError::Timeout),
    }
}

async fn initiate_inner<S>(
    mut stream: S,
    info_hash: InfoHash,
    mode: MseMode,
    initial_payload: &[u8],
) -> Result<MseOutcome<S>, MseError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let dh = DhExchange::generate();

    // Step 1: our public key, then noise.
    let mut out = Vec::with_capacity(DH_KEY_LEN + MAX_PADDING);
    out.extend_from_slice(&dh.public);
    out.extend_from_slice(&random_padding());
    stream.write_all(&out).await?;
    stream.flush().await?;

    // Step 2: their public key.
    let mut buf = HsBuf::new(&[]);
    let yb = buf.take(&mut stream, DH_KEY_LEN).await?;
    let s = dh.shared_secret(&yb);

    let (mut enc, mut dec) = rc4_keys(&s, &info_hash);

    // Step 3: prove we know S and name the torrent without revealing it.
    let req2 = hash2(b"req2", &info_hash.0);
    let req3 = hash2(b"req3", &s);
    let mut xored = [0u8; 20];
    for i in 0..20 {
        xored[i] = req2[i] ^ req3[i];
    }

    let crypto_provide = mode.crypto_provide();
    let mut tail = Vec::with_capacity(8 + 4 + 2 + 2 + initial_payload.len());
    tail.extend_from_slice(&VC);
    tail.extend_from_slice(&crypto_provide.to_be_bytes());
    tail.extend_from_slice(&0u16.to_be_bytes()); // len(padC)
    tail.extend_from_slice(&(initial_payload.len() as u16).to_be_bytes());
    tail.extend_from_slice(initial_payload);
    enc.apply(&mut tail);

    let mut out = Vec::with_capacity(20 + 20 + tail.len());
    out.extend_from_slice(&hash2(b"req1", &s));
    out.extend_from_slice(&xored);
    out.extend_from_slice(&tail);
    stream.write_all(&out).await?;
    stream.flush().await?;

    // Step 4: find ENC(VC) behind their padding. The first keystream bytes
    // of the decrypt cipher ARE the marker, and producing them advances the
    // cipher past the VC.
    let mut marker = [0u8; 8];
    dec.keystream(&mut marker);
    buf.sync_to(&mut stream, &marker, SYNC_WINDOW).await?;
    buf.start_decrypting(dec);

    let select = buf.take_dec(&mut stream, 4).await?;
    let select = u32::from_be_bytes(select.try_into().unwrap());
    if select.count_ones() != 1 || select & crypto_provide == 0 {
        return Err(MseError::InvalidCryptoSelect {
            selected: select,
            offered: crypto_provide,
        });
    }
    let pad_d_len = buf.take_dec(&mut stream, 2).await?;
    let pad_d_len = u16::from_be_bytes(pad_d_len.try_into().unwrap()) as usize;
    if pad_d_len > MAX_PADDING {
        return Err(MseError::PaddingTooLong(pad_d_len));
    }
    buf.take_dec(&mut stream, pad_d_len).await?;

    trace!(select, "initiator handshake complete");

    let mut dec = buf.cipher.take().expect("cipher set above");
    let rest = buf.into_rest();
    let mut initial_data = BytesMut::new();
    let stream = if select == CRYPTO_RC4 {
        // Pipelined bytes past the handshake are ciphertext on the same
        // keystream.
        let mut rest = rest;
        dec.apply(&mut rest);
        initial_data.extend_from_slice(&rest);
        MseStream::new(stream, Some(dec), Some(enc), BytesMut::new())
    } else {
        initial_data.extend_from_slice(&rest);
        MseStream::plain(stream)
    };
    Ok(MseOutcome {
        stream,
        initial_data,
    })
}

/// Run the responder side. `prefix` holds bytes the listener already pulled
/// off the socket (at least the first, non-0x13 byte). `known_hashes` are
/// the registered torrents; the remote must name one of them.
pub async fn respond<S>(
    stream: S,
    prefix: &[u8],
    known_hashes: Vec<InfoHash>,
    mode: MseMode,
) -> Result<ResponderOutcome<S>, MseError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match tokio::time::timeout(
        HANDSHAKE_TIMEOUT,
        respond_inner(stream, prefix, known_hashes, mode),
    )
    .await
    {
        Ok(res) => res,
        Err(_) => Err(MseError::Timeout),
    }
}

async fn respond_inner<S>(
    mut stream: S,
    prefix: &[u8],
    known_hashes: Vec<InfoHash>,
    mode: MseMode,
) -> Result<ResponderOutcome<S>, MseError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = HsBuf::new(prefix);

    let ya = buf.take(&mut stream, DH_KEY_LEN).await?;
    let dh = DhExchange::generate();
    let s = dh.shared_secret(&ya);

    let mut out = Vec::with_capacity(DH_KEY_LEN + MAX_PADDING);
    out.extend_from_slice(&dh.public);
    out.extend_from_slice(&random_padding());
    stream.write_all(&out).await?;
    stream.flush().await?;

    // Step 5: sync on HASH("req1"|S), then resolve the obfuscated torrent
    // identity.
    let req1 = hash2(b"req1", &s);
    buf.sync_to(&mut stream, &req1, SYNC_WINDOW).await?;

    let xored = buf.take(&mut stream, 20).await?;
    let req3 = hash2(b"req3", &s);
    let mut req2 = [0u8; 20];
    for i in 0..20 {
        req2[i] = xored[i] ^ req3[i];
    }
    let info_hash = known_hashes
        .into_iter()
        .find(|h| hash2(b"req2", &h.0) == req2)
        .ok_or(MseError::UnknownInfoHash)?;

    let (dec_their, mut enc) = {
        // The initiator encrypts with keyA; we decrypt with it and encrypt
        // with keyB.
        let (key_a_cipher, key_b_cipher) = rc4_keys(&s, &info_hash);
        (key_a_cipher, key_b_cipher)
    };
    buf.start_decrypting(dec_their);

    let vc = buf.take_dec(&mut stream, 8).await?;
    if vc != VC {
        return Err(MseError::BadVc);
    }
    let provide = buf.take_dec(&mut stream, 4).await?;
    let provide = u32::from_be_bytes(provide.try_into().unwrap());
    let pad_c_len = buf.take_dec(&mut stream, 2).await?;
    let pad_c_len = u16::from_be_bytes(pad_c_len.try_into().unwrap()) as usize;
    if pad_c_len > MAX_PADDING {
        return Err(MseError::PaddingTooLong(pad_c_len));
    }
    buf.take_dec(&mut stream, pad_c_len).await?;
    let ia_len = buf.take_dec(&mut stream, 2).await?;
    let ia_len = u16::from_be_bytes(ia_len.try_into().unwrap()) as usize;
    let ia = buf.take_dec(&mut stream, ia_len).await?;

    // Step 6: pick exactly one of the offered methods.
    let select = if provide & CRYPTO_RC4 != 0 {
        CRYPTO_RC4
    } else if provide & CRYPTO_PLAINTEXT != 0 && mode.accepts_plaintext() {
        CRYPTO_PLAINTEXT
    } else {
        return Err(MseError::NoMutualCrypto(provide));
    };

    let mut reply = Vec::with_capacity(8 + 4 + 2);
    reply.extend_from_slice(&VC);
    reply.extend_from_slice(&select.to_be_bytes());
    reply.extend_from_slice(&0u16.to_be_bytes()); // len(padD)
    enc.apply(&mut reply);
    stream.write_all(&reply).await?;
    stream.flush().await?;

    trace!(select, ?info_hash, "responder handshake complete");

    let mut dec = buf.cipher.take().expect("cipher set above");
    let rest = buf.into_rest();
    let mut initial_data = BytesMut::new();
    initial_data.extend_from_slice(&ia);
    let stream = if select == CRYPTO_RC4 {
        let mut rest = rest;
        dec.apply(&mut rest);
        initial_data.extend_from_slice(&rest);
        MseStream::new(stream, Some(dec), Some(enc), BytesMut::new())
    } else {
        initial_data.extend_from_slice(&rest);
        MseStream::plain(stream)
    };
    Ok(ResponderOutcome {
        stream,
        info_hash,
        initial_data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn hash(n: u8) -> InfoHash {
        InfoHash::new([n; 20])
    }

    #[tokio::test]
    async fn test_loopback_rc4() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (init, resp) = tokio::join!(
            initiate(a, hash(7), MseMode::Prefer, b""),
            respond(b, &[], vec![hash(1), hash(7), hash(9)], MseMode::Allow),
        );
        let init = init.unwrap();
        let resp = resp.unwrap();
        assert_eq!(resp.info_hash, hash(7));
        assert!(init.stream.is_encrypted());
        assert!(resp.stream.is_encrypted());
        assert!(init.initial_data.is_empty());
        assert!(resp.initial_data.is_empty());

        // Application bytes survive the wrapped streams both ways.
        let (mut i, mut r) = (init.stream, resp.stream);
        i.write_all(b"ping from initiator").await.unwrap();
        i.flush().await.unwrap();
        let mut out = [0u8; 19];
        r.read_exact(&mut out).await.unwrap();
        assert_eq!(&out, b"ping from initiator");

        r.write_all(b"pong").await.unwrap();
        r.flush().await.unwrap();
        let mut out = [0u8; 4];
        i.read_exact(&mut out).await.unwrap();
        assert_eq!(&out, b"pong");
    }

    #[tokio::test]
    async fn test_initial_payload_delivered() {
        let payload = b"\x13BitTorrent protocol.....";
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (init, resp) = tokio::join!(
            initiate(a, hash(7), MseMode::Required, payload),
            respond(b, &[], vec![hash(7)], MseMode::Required),
        );
        init.unwrap();
        let resp = resp.unwrap();
        assert_eq!(&resp.initial_data[..], payload);
    }

    #[tokio::test]
    async fn test_unknown_info_hash() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (init, resp) = tokio::join!(
            initiate(a, hash(42), MseMode::Prefer, b""),
            respond(b, &[], vec![hash(1), hash(2)], MseMode::Allow),
        );
        assert!(matches!(resp.unwrap_err(), MseError::UnknownInfoHash));
        // The initiator sees a dead pipe, not a protocol-level answer.
        assert!(init.is_err());
    }

    #[tokio::test]
    async fn test_responder_prefix_is_honored() {
        // The listener peeks bytes before deciding the stream is MSE; the
        // responder must treat them as part of the key.
        let (a, mut b) = tokio::io::duplex(64 * 1024);

        let responder = tokio::spawn(async move {
            let mut first = [0u8; 1];
            b.read_exact(&mut first).await.unwrap();
            respond(b, &first, vec![hash(7)], MseMode::Allow).await
        });
        let init = initiate(a, hash(7), MseMode::Prefer, b"IA").await;
        let resp = responder.await.unwrap();
        init.unwrap();
        assert_eq!(&resp.unwrap().initial_data[..], b"IA");
    }

    #[tokio::test]
    async fn test_garbage_fails_sync() {
        let (a, mut b) = tokio::io::duplex(64 * 1024);
        let writer = tokio::spawn(async move {
            let junk = vec![0x55u8; 2048];
            let _ = b.write_all(&junk).await;
            let _ = b.flush().await;
            // Keep the pipe open so the responder fails on sync, not EOF.
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(b);
        });
        let res = respond(a, &[], vec![hash(7)], MseMode::Allow).await;
        assert!(matches!(res.unwrap_err(), MseError::SyncExceeded));
        writer.abort();
    }
}
