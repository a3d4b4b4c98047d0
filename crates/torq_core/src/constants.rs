/// The request unit within a piece. Larger requests are refused by most
/// clients, smaller ones waste round-trips.
pub const BLOCK_SIZE: u32 = 16384;
