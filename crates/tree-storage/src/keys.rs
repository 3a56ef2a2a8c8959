//! Key encoding and decoding for storage layer.
//!
//! Numeric ids are zero-padded to 20 digits (the width of `u64::MAX`) so
//! that RocksDB's lexicographic order equals numeric order. Node ids are
//! issued monotonically, which makes key order equal creation order.
//!
//! - node / frontier / expansion keys: `{node_id:020}`
//! - assignment / vector keys: `{item_id:020}`
//! - member keys: `{node_id:020}:{item_id:020}`

use tree_types::{ItemId, NodeId};

use crate::error::StorageError;

const ID_WIDTH: usize = 20;

fn parse_id(s: &str, what: &str) -> Result<u64, StorageError> {
    if s.len() != ID_WIDTH {
        return Err(StorageError::Key(format!("Invalid {} width: {}", what, s)));
    }
    s.parse()
        .map_err(|e| StorageError::Key(format!("Invalid {}: {}", what, e)))
}

fn as_str(bytes: &[u8]) -> Result<&str, StorageError> {
    std::str::from_utf8(bytes).map_err(|e| StorageError::Key(format!("Invalid UTF-8: {}", e)))
}

/// Key for node-addressed column families (nodes, frontier, expansions)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct NodeKey(pub NodeId);

impl NodeKey {
    pub fn to_bytes(&self) -> Vec<u8> {
        format!("{:020}", self.0).into_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StorageError> {
        Ok(Self(parse_id(as_str(bytes)?, "node id")?))
    }
}

/// Key for item-addressed column families (assignments, vectors)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ItemKey(pub ItemId);

impl ItemKey {
    pub fn to_bytes(&self) -> Vec<u8> {
        format!("{:020}", self.0).into_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StorageError> {
        Ok(Self(parse_id(as_str(bytes)?, "item id")?))
    }
}

/// Key for the node -> item reverse index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemberKey {
    pub node_id: NodeId,
    pub item_id: ItemId,
}

impl MemberKey {
    pub fn new(node_id: NodeId, item_id: ItemId) -> Self {
        Self { node_id, item_id }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        format!("{:020}:{:020}", self.node_id, self.item_id).into_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StorageError> {
        let s = as_str(bytes)?;
        let (node, item) = s
            .split_once(':')
            .ok_or_else(|| StorageError::Key(format!("Invalid member key format: {}", s)))?;
        Ok(Self {
            node_id: parse_id(node, "node id")?,
            item_id: parse_id(item, "item id")?,
        })
    }

    /// Prefix covering every member of `node_id`
    pub fn prefix(node_id: NodeId) -> Vec<u8> {
        format!("{:020}:", node_id).into_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_key_lexicographic_order() {
        assert!(NodeKey(9).to_bytes() < NodeKey(10).to_bytes());
        assert!(NodeKey(999).to_bytes() < NodeKey(1000).to_bytes());
    }

    #[test]
    fn test_node_key_max() {
        let key = NodeKey(u64::MAX);
        assert_eq!(NodeKey::from_bytes(&key.to_bytes()).unwrap(), key);
    }

    #[test]
    fn test_member_key_prefix() {
        let key = MemberKey::new(12, 345);
        assert!(key.to_bytes().starts_with(&MemberKey::prefix(12)));
        assert!(!key.to_bytes().starts_with(&MemberKey::prefix(1)));

        let decoded = MemberKey::from_bytes(&key.to_bytes()).unwrap();
        assert_eq!(decoded, key);
    }

    #[test]
    fn test_rejects_malformed_keys() {
        assert!(NodeKey::from_bytes(b"12").is_err());
        assert!(MemberKey::from_bytes(b"00000000000000000001").is_err());
        assert!(ItemKey::from_bytes(b"0000000000000000000x").is_err());
    }
}
