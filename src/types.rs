use std::fmt;

use alloy::primitives::B256;

/// Domain separation tag mixed into a signing root so that a signature over
/// one message type can never be replayed as another.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DomainType(pub [u8; 4]);

impl DomainType {
    pub const LENGTH: usize = 4;

    pub fn as_bytes(&self) -> &[u8; 4] {
        &self.0
    }
}

impl From<[u8; 4]> for DomainType {
    fn from(bytes: [u8; 4]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for DomainType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for DomainType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DomainType(0x{})", hex::encode(self.0))
    }
}

/// A movement of the beacon chain head, as reported by a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadUpdate {
    pub slot: u64,
    pub block_root: B256,
    /// Not every node implementation reports the head state root.
    pub state_root: Option<B256>,
    /// True when this head crossed an epoch boundary relative to the
    /// previously observed head.
    pub epoch_transition: bool,
}

#[cfg(test)]
mod tests {
    use super::DomainType;

    #[test]
    fn domain_type_formats_as_hex() {
        let domain = DomainType([0x01, 0x00, 0x00, 0x00]);
        assert_eq!(domain.to_string(), "0x01000000");
        assert_eq!(format!("{domain:?}"), "DomainType(0x01000000)");
    }

    #[test]
    fn domain_type_equality_is_bytewise() {
        assert_eq!(DomainType([1, 2, 3, 4]), DomainType::from([1, 2, 3, 4]));
        assert_ne!(DomainType([1, 2, 3, 4]), DomainType([4, 3, 2, 1]));
    }
}
