//! Cache tree extension (TREE).
//!
//! Caches tree hashes per directory. Each node records the number of index
//! entries it covers and, while valid, the tree hash. Any mutation under a
//! directory invalidates that directory and every ancestor (entry count -1).

use bstr::{BStr, BString, ByteSlice};
use dirc_hash::{ContentHash, HashAlgorithm};

use crate::IndexError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheTree {
    pub root: CacheTreeNode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheTreeNode {
    /// Last path component (empty for root).
    pub name: BString,
    /// Entries covered by this tree, -1 when invalid.
    pub entry_count: i32,
    /// Tree hash, present only while `entry_count >= 0`.
    pub hash: Option<ContentHash>,
    pub children: Vec<CacheTreeNode>,
}

impl CacheTreeNode {
    pub fn new(name: impl Into<BString>) -> Self {
        Self {
            name: name.into(),
            entry_count: -1,
            hash: None,
            children: Vec::new(),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.entry_count >= 0
    }

    fn invalidate(&mut self) {
        self.entry_count = -1;
        self.hash = None;
    }
}

fn bad(reason: impl Into<String>) -> IndexError {
    IndexError::corrupt(format!("TREE extension: {}", reason.into()))
}

impl CacheTree {
    pub const SIGNATURE: &'static [u8; 4] = b"TREE";

    pub fn new(root: CacheTreeNode) -> Self {
        Self { root }
    }

    pub fn parse(data: &[u8], algo: HashAlgorithm) -> Result<Self, IndexError> {
        let mut cursor = 0;
        let root = Self::parse_node(data, &mut cursor, algo)?;
        if cursor != data.len() {
            return Err(bad("trailing bytes"));
        }
        Ok(CacheTree { root })
    }

    fn parse_node(
        data: &[u8],
        cursor: &mut usize,
        algo: HashAlgorithm,
    ) -> Result<CacheTreeNode, IndexError> {
        let name = read_until(data, cursor, 0).ok_or_else(|| bad("missing name"))?;
        let name = BString::from(name);

        let count = read_until(data, cursor, b' ').ok_or_else(|| bad("missing entry count"))?;
        let entry_count: i32 = parse_ascii(count).ok_or_else(|| bad("invalid entry count"))?;

        let subtrees =
            read_until(data, cursor, b'\n').ok_or_else(|| bad("missing subtree count"))?;
        let subtree_count: usize =
            parse_ascii(subtrees).ok_or_else(|| bad("invalid subtree count"))?;

        let hash = if entry_count >= 0 {
            let len = algo.digest_len();
            let raw = data
                .get(*cursor..*cursor + len)
                .ok_or_else(|| bad("truncated hash"))?;
            *cursor += len;
            Some(ContentHash::from_bytes(raw, algo)?)
        } else {
            None
        };

        let mut children = Vec::with_capacity(subtree_count.min(1024));
        for _ in 0..subtree_count {
            children.push(Self::parse_node(data, cursor, algo)?);
        }

        Ok(CacheTreeNode {
            name,
            entry_count,
            hash,
            children,
        })
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        Self::serialize_node(&self.root, &mut buf);
        buf
    }

    fn serialize_node(node: &CacheTreeNode, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&node.name);
        buf.push(0);
        buf.extend_from_slice(node.entry_count.to_string().as_bytes());
        buf.push(b' ');
        buf.extend_from_slice(node.children.len().to_string().as_bytes());
        buf.push(b'\n');
        if let (true, Some(hash)) = (node.is_valid(), &node.hash) {
            buf.extend_from_slice(hash.as_bytes());
        }
        for child in &node.children {
            Self::serialize_node(child, buf);
        }
    }

    /// Invalidate every node from the root down to the directory holding `path`.
    pub fn invalidate(&mut self, path: &BStr) {
        let mut node = &mut self.root;
        node.invalidate();
        let mut rest = path.as_bytes();
        while let Some(slash) = rest.find_byte(b'/') {
            let component = &rest[..slash];
            rest = &rest[slash + 1..];
            match node
                .children
                .iter_mut()
                .find(|c| c.name.as_bytes() == component)
            {
                Some(child) => {
                    child.invalidate();
                    node = child;
                }
                None => return,
            }
        }
    }

    /// Node for directory `dir` (no trailing slash, empty for root).
    pub fn find(&self, dir: &[u8]) -> Option<&CacheTreeNode> {
        let mut node = &self.root;
        if dir.is_empty() {
            return Some(node);
        }
        for component in dir.split(|&b| b == b'/') {
            node = node
                .children
                .iter()
                .find(|c| c.name.as_bytes() == component)?;
        }
        Some(node)
    }

    pub fn root_hash(&self) -> Option<&ContentHash> {
        if self.root.is_valid() {
            self.root.hash.as_ref()
        } else {
            None
        }
    }
}

fn read_until<'a>(data: &'a [u8], cursor: &mut usize, delim: u8) -> Option<&'a [u8]> {
    let rest = data.get(*cursor..)?;
    let end = rest.find_byte(delim)?;
    *cursor += end + 1;
    Some(&rest[..end])
}

fn parse_ascii<T: std::str::FromStr>(raw: &[u8]) -> Option<T> {
    std::str::from_utf8(raw).ok()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> CacheTree {
        let algo = HashAlgorithm::Sha1;
        let mut sub = CacheTreeNode::new("src");
        sub.entry_count = 2;
        sub.hash = Some(ContentHash::Sha1([0x22; 20]));
        let mut docs = CacheTreeNode::new("docs");
        docs.entry_count = 1;
        docs.hash = Some(ContentHash::Sha1([0x33; 20]));
        let mut root = CacheTreeNode::new("");
        root.entry_count = 4;
        root.hash = Some(algo.null_hash());
        root.children = vec![docs, sub];
        CacheTree::new(root)
    }

    #[test]
    fn serialize_then_parse() {
        let tree = sample();
        let parsed = CacheTree::parse(&tree.serialize(), HashAlgorithm::Sha1).unwrap();
        assert_eq!(parsed, tree);
    }

    #[test]
    fn invalid_node_has_no_hash_on_disk() {
        let mut tree = sample();
        tree.root.children[0].invalidate();
        let bytes = tree.serialize();
        let parsed = CacheTree::parse(&bytes, HashAlgorithm::Sha1).unwrap();
        assert_eq!(parsed.root.children[0].entry_count, -1);
        assert_eq!(parsed.root.children[0].hash, None);
    }

    #[test]
    fn invalidate_walks_ancestors_only() {
        let mut tree = sample();
        tree.invalidate(b"src/new/file.rs".as_bstr());
        assert!(!tree.root.is_valid());
        assert!(!tree.find(b"src").unwrap().is_valid());
        assert!(tree.find(b"docs").unwrap().is_valid());
        assert_eq!(tree.root_hash(), None);
    }

    #[test]
    fn invalidate_top_level_file_only_touches_root() {
        let mut tree = sample();
        tree.invalidate(b"README".as_bstr());
        assert!(!tree.root.is_valid());
        assert!(tree.find(b"src").unwrap().is_valid());
    }

    #[test]
    fn truncated_payload_is_corrupt() {
        let bytes = sample().serialize();
        let err = CacheTree::parse(&bytes[..bytes.len() - 3], HashAlgorithm::Sha1).unwrap_err();
        assert!(matches!(err, IndexError::Corrupt { .. }));
    }
}
