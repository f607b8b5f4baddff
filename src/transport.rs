//! Byte-in/byte-out session layer.
//!
//! A `Transport` sits between the socket and the protocol parser on a
//! single connection: inbound ciphertext is unwrapped before it reaches
//! `on_data`, outbound plaintext is wrapped before it enters the write
//! queue. TLS is the intended occupant of this seam; the engine itself
//! ships only the seam and an identity implementation.

use crate::error::SquallResult;

pub trait Transport {
    /// Transform raw bytes read from the socket into protocol payload.
    /// May return an empty vector while the layer is buffering (e.g. a
    /// partial TLS record).
    fn unwrap_inbound(&mut self, raw: &[u8]) -> SquallResult<Vec<u8>>;

    /// Transform protocol payload into the bytes that go on the wire.
    fn wrap_outbound(&mut self, plain: &[u8]) -> SquallResult<Vec<u8>>;
}

/// Pass-through transport.
pub struct Identity;

impl Transport for Identity {
    fn unwrap_inbound(&mut self, raw: &[u8]) -> SquallResult<Vec<u8>> {
        Ok(raw.to_vec())
    }

    fn wrap_outbound(&mut self, plain: &[u8]) -> SquallResult<Vec<u8>> {
        Ok(plain.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_round_trip() {
        let mut t = Identity;
        assert_eq!(t.unwrap_inbound(b"abc").unwrap(), b"abc");
        assert_eq!(t.wrap_outbound(b"xyz").unwrap(), b"xyz");
    }
}
