use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::ids::NodeId;

const NODE_ID_LEN: usize = 16;

/// Kind of a discovered source unit.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    File,
    Class,
    Function,
    Method,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Class => "class",
            Self::Function => "function",
            Self::Method => "method",
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A discovered unit of source code. Immutable once produced by discovery.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeNode {
    pub id: NodeId,
    pub kind: NodeKind,
    pub name: String,
    pub file_path: PathBuf,
    pub start_byte: usize,
    pub end_byte: usize,
    pub start_line: usize,
    pub end_line: usize,
    pub text: String,
}

impl CodeNode {
    /// Stable id over location and content: first 16 hex chars of a SHA-256.
    pub fn compute_id(
        file_path: &Path,
        kind: NodeKind,
        name: &str,
        start_byte: usize,
        text: &str,
    ) -> NodeId {
        let mut hasher = Sha256::new();
        hasher.update(file_path.to_string_lossy().as_bytes());
        hasher.update([0]);
        hasher.update(kind.as_str().as_bytes());
        hasher.update([0]);
        hasher.update(name.as_bytes());
        hasher.update([0]);
        hasher.update(start_byte.to_le_bytes());
        hasher.update([0]);
        hasher.update(text.as_bytes());
        let digest = hasher.finalize();
        let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
        NodeId::new(&hex[..NODE_ID_LEN])
    }

    /// Metadata handed to tool scripts alongside the node text.
    pub fn metadata(&self) -> serde_json::Value {
        serde_json::json!({
            "node_id": self.id,
            "node_type": self.kind,
            "name": self.name,
            "file_path": self.file_path,
            "start_byte": self.start_byte,
            "end_byte": self.end_byte,
            "start_line": self.start_line,
            "end_line": self.end_line,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compute_id_is_stable() {
        let a = CodeNode::compute_id(Path::new("src/a.py"), NodeKind::Function, "f", 10, "def f(): pass");
        let b = CodeNode::compute_id(Path::new("src/a.py"), NodeKind::Function, "f", 10, "def f(): pass");
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 16);
    }

    #[test]
    fn compute_id_changes_with_content_or_location() {
        let base = CodeNode::compute_id(Path::new("a.py"), NodeKind::Function, "f", 0, "x");
        let moved = CodeNode::compute_id(Path::new("a.py"), NodeKind::Function, "f", 4, "x");
        let edited = CodeNode::compute_id(Path::new("a.py"), NodeKind::Function, "f", 0, "y");
        assert_ne!(base, moved);
        assert_ne!(base, edited);
    }

    #[test]
    fn kind_serde() {
        assert_eq!(serde_json::to_string(&NodeKind::Method).unwrap(), r#""method""#);
        let parsed: NodeKind = serde_json::from_str(r#""class""#).unwrap();
        assert_eq!(parsed, NodeKind::Class);
    }
}
