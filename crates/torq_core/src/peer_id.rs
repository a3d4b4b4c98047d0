use rand::RngCore;

use crate::hash_id::PeerId;

/// Azureus-style client prefix decoded from a remote peer id, for logging.
#[derive(Debug, PartialEq, Eq)]
pub struct ClientId {
    pub client: [u8; 2],
    pub version: [u8; 4],
}

pub fn generate_peer_id() -> PeerId {
    let mut id = [0u8; 20];
    id[..8].copy_from_slice(b"-TQ0001-");
    rand::thread_rng().fill_bytes(&mut id[8..]);
    PeerId::new(id)
}

pub fn try_decode_client(peer_id: &PeerId) -> Option<ClientId> {
    let b = peer_id.0;
    if b[0] != b'-' || b[7] != b'-' {
        return None;
    }
    Some(ClientId {
        client: [b[1], b[2]],
        version: [b[3], b[4], b[5], b[6]],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_id_decodes() {
        let id = generate_peer_id();
        let client = try_decode_client(&id).unwrap();
        assert_eq!(&client.client, b"TQ");
        assert_eq!(&client.version, b"0001");
    }

    #[test]
    fn test_random_ids_differ() {
        assert_ne!(generate_peer_id(), generate_peer_id());
    }
}
