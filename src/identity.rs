//! Node identity: the 6-byte sender id every frame is stamped with.

use core::fmt;
use std::path::Path;

use rand::RngCore;

use crate::error::FreakMeshError;

/// Length in bytes of a node's sender id on the wire.
pub const NODE_ID_LEN: usize = 6;

/// Opaque node identity, derived once from an immutable per-device id.
///
/// The reference firmware takes the last 6 bytes of the MCU's unique
/// silicon id (`machine.unique_id()` in `message.py`). A host binary has
/// no equivalent, so [`NodeId::load_or_create`] generates one at random on
/// first run and persists it so it survives restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub [u8; NODE_ID_LEN]);

impl NodeId {
    /// Build a node id directly from bytes (used in tests and for frames
    /// decoded off the wire).
    pub fn from_bytes(bytes: [u8; NODE_ID_LEN]) -> Self {
        NodeId(bytes)
    }

    /// Generate a fresh random node id.
    pub fn random() -> Self {
        let mut bytes = [0u8; NODE_ID_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        NodeId(bytes)
    }

    /// Load the persisted node id from `path`, creating and persisting a
    /// new random one if the file doesn't exist yet.
    pub fn load_or_create(path: &Path) -> Result<Self, FreakMeshError> {
        match std::fs::read(path) {
            Ok(bytes) if bytes.len() >= NODE_ID_LEN => {
                let mut id = [0u8; NODE_ID_LEN];
                id.copy_from_slice(&bytes[..NODE_ID_LEN]);
                Ok(NodeId(id))
            }
            _ => {
                let id = Self::random();
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(path, id.0)?;
                Ok(id)
            }
        }
    }
}

impl AsRef<[u8]> for NodeId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_lowercase_hex() {
        let id = NodeId::from_bytes([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0x01]);
        assert_eq!(id.to_string(), "aabbccddee01");
    }

    #[test]
    fn load_or_create_persists_across_calls() {
        let dir = std::env::temp_dir().join(format!("freakmesh-test-{}", rand::random::<u64>()));
        let path = dir.join("node_id");
        let first = NodeId::load_or_create(&path).unwrap();
        let second = NodeId::load_or_create(&path).unwrap();
        assert_eq!(first, second);
        std::fs::remove_dir_all(&dir).ok();
    }
}
