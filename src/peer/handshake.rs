//! The BitTorrent peer handshake.
//!
//! The handshake is the first message exchanged between two peers. It verifies
//! that both peers are participating in the same torrent (via info_hash) and
//! advertises protocol extensions through the reserved field.
use super::{PeerError, PeerResult};

/// Reserved-field bit advertising extension protocol support (BEP 10).
pub const EXTENSION_PROTOCOL: u64 = 1 << 20;

const PSTR: &[u8; 19] = b"BitTorrent protocol";

/// Wire length of a serialized handshake.
pub const HANDSHAKE_LENGTH: usize = 68;

/// A BitTorrent handshake message.
///
/// Unlike every later message, the handshake has no length prefix: it is a
/// fixed 68 bytes of protocol string, reserved field, info hash, and peer id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub reserved: u64,
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn new(reserved: u64, info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Self {
            reserved,
            info_hash,
            peer_id,
        }
    }

    /// Whether the reserved field advertises the extension protocol.
    pub fn supports_extensions(&self) -> bool {
        self.reserved & EXTENSION_PROTOCOL != 0
    }

    /// Serializes the handshake into its fixed 68-byte wire form.
    pub fn to_bytes(&self) -> [u8; HANDSHAKE_LENGTH] {
        let mut buf = [0u8; HANDSHAKE_LENGTH];
        buf[0] = PSTR.len() as u8;
        buf[1..20].copy_from_slice(PSTR);
        buf[20..28].copy_from_slice(&self.reserved.to_be_bytes());
        buf[28..48].copy_from_slice(&self.info_hash);
        buf[48..68].copy_from_slice(&self.peer_id);
        buf
    }

    /// Parses a 68-byte handshake, validating the protocol string.
    pub fn from_bytes(data: &[u8; HANDSHAKE_LENGTH]) -> PeerResult<Self> {
        if data[0] != PSTR.len() as u8 || &data[1..20] != PSTR {
            return Err(PeerError::Protocol(
                "Invalid handshake protocol string".to_string(),
            ));
        }
        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&data[20..28]);
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&data[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&data[48..68]);
        Ok(Self {
            reserved: u64::from_be_bytes(reserved),
            info_hash,
            peer_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let handshake = Handshake::new(EXTENSION_PROTOCOL, [1; 20], [2; 20]);
        let bytes = handshake.to_bytes();
        assert_eq!(bytes.len(), HANDSHAKE_LENGTH);
        assert_eq!(Handshake::from_bytes(&bytes).unwrap(), handshake);
    }

    #[test]
    fn reference_bytes() {
        let mut expected = Vec::new();
        expected.push(19u8);
        expected.extend_from_slice(b"BitTorrent protocol");
        expected.extend_from_slice(&[0, 0, 0, 0, 0, 0x10, 0, 0]);
        expected.extend_from_slice(&[0xab; 20]);
        expected.extend_from_slice(&[0xcd; 20]);

        let handshake = Handshake::new(EXTENSION_PROTOCOL, [0xab; 20], [0xcd; 20]);
        assert_eq!(handshake.to_bytes().as_slice(), expected.as_slice());

        let parsed = Handshake::from_bytes(&expected.try_into().unwrap()).unwrap();
        assert!(parsed.supports_extensions());
        assert_eq!(parsed.info_hash, [0xab; 20]);
        assert_eq!(parsed.peer_id, [0xcd; 20]);
    }

    #[test]
    fn rejects_wrong_protocol_string() {
        let mut bytes = Handshake::new(0, [0; 20], [0; 20]).to_bytes();
        bytes[1] = b'X';
        assert!(Handshake::from_bytes(&bytes).is_err());
    }
}
