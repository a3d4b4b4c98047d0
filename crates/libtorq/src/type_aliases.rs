use std::net::SocketAddr;

/// Piece/block bitfields, MSB-first to match the wire format.
pub type BF = bitvec::vec::BitVec<u8, bitvec::order::Msb0>;

/// Peers are addressed by their socket address everywhere.
pub type PeerHandle = SocketAddr;

pub fn bf_with_bits(bits: usize) -> BF {
    let mut bf = BF::from_vec(vec![0u8; bits.div_ceil(8)]);
    bf.truncate(bits);
    bf
}

pub fn bf_from_vec(bytes: Vec<u8>, bits: usize) -> BF {
    let mut bf = BF::from_vec(bytes);
    bf.truncate(bits);
    bf
}
