// The engine and the MSE handshake call SHA-1 through this trait so the
// backend can be swapped without touching protocol code.

pub trait ISha1 {
    fn new() -> Self;
    fn update(&mut self, buf: &[u8]);
    fn finish(self) -> [u8; 20];
}

pub struct Sha1 {
    inner: sha1::Sha1,
}

impl ISha1 for Sha1 {
    fn new() -> Self {
        use sha1::Digest;
        Self {
            inner: sha1::Sha1::new(),
        }
    }

    fn update(&mut self, buf: &[u8]) {
        use sha1::Digest;
        self.inner.update(buf);
    }

    fn finish(self) -> [u8; 20] {
        use sha1::Digest;
        self.inner.finalize().into()
    }
}

/// One-shot digest.
pub fn sha1(buf: &[u8]) -> [u8; 20] {
    let mut h = Sha1::new();
    h.update(buf);
    h.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_digest() {
        assert_eq!(
            sha1(b"abc"),
            [
                0xa9, 0x99, 0x3e, 0x36, 0x47, 0x06, 0x81, 0x6a, 0xba, 0x3e, 0x25, 0x71, 0x78,
                0x50, 0xc2, 0x6c, 0x9c, 0xd0, 0xd8, 0x9d
            ]
        );
    }
}
