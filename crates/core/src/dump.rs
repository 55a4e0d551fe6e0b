//! Compact serialized form of a path tree
//!
//! The dump is a pre-order list of trie nodes. Every distinct string
//! (component or object name) appears once in a shared string table and nodes
//! refer to it by index. Node 0 is the root and has no component of its own.
//! Children always have a larger index than their parent.
//!
//! Standalone format (version 1):
//! - magic: "PFD1" (4 bytes)
//! - version: u8
//! - body: bincode-encoded string table and node list

use crate::codec::{decode_framed, encode_framed};
use crate::error::CodecError;
use ahash::AHashMap;
use serde::{Deserialize, Serialize};

const DUMP_MAGIC: [u8; 4] = *b"PFD1";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct DumpNode {
    component: u32,
    objects: Vec<u32>,
    children: Vec<u32>,
}

/// A full encoding of a tree's object→paths state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathsDump {
    strings: Vec<String>,
    nodes: Vec<DumpNode>,
}

impl PathsDump {
    /// Number of trie nodes, root included
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Number of distinct strings in the table
    pub fn string_count(&self) -> usize {
        self.strings.len()
    }

    /// Encode the dump on its own, outside of an update
    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        encode_framed(DUMP_MAGIC, self)
    }

    /// Decode a dump produced by [`PathsDump::to_bytes`]
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        decode_framed(DUMP_MAGIC, "dump", bytes)
    }

    fn string(&self, idx: u32) -> Result<&str, CodecError> {
        self.strings
            .get(idx as usize)
            .map(String::as_str)
            .ok_or_else(|| CodecError::CorruptDump(format!("string index {} out of range", idx)))
    }

    /// Walk every (object, path) pair, checking the node structure on the way
    pub(crate) fn for_each_entry<F>(&self, mut f: F) -> Result<(), CodecError>
    where
        F: FnMut(&str, &[&str]),
    {
        if self.nodes.is_empty() {
            return Err(CodecError::CorruptDump("no root node".to_string()));
        }

        let mut visited = vec![false; self.nodes.len()];
        let mut stack = vec![(0usize, 0usize)];
        let mut path: Vec<&str> = Vec::new();

        while let Some((idx, depth)) = stack.pop() {
            if visited[idx] {
                return Err(CodecError::CorruptDump(format!(
                    "node {} is reachable twice",
                    idx
                )));
            }
            visited[idx] = true;

            let node = &self.nodes[idx];
            path.truncate(depth.saturating_sub(1));
            if depth > 0 {
                path.push(self.string(node.component)?);
            }

            for &object in &node.objects {
                f(self.string(object)?, &path);
            }

            for &child in &node.children {
                let child = child as usize;
                if child <= idx || child >= self.nodes.len() {
                    return Err(CodecError::CorruptDump(format!(
                        "node {} has invalid child {}",
                        idx, child
                    )));
                }
                stack.push((child, depth + 1));
            }
        }

        if let Some(orphan) = visited.iter().position(|v| !v) {
            return Err(CodecError::CorruptDump(format!(
                "node {} is unreachable",
                orphan
            )));
        }
        Ok(())
    }
}

/// Incremental construction of a dump in pre-order
pub(crate) struct DumpBuilder<'a> {
    strings: Vec<String>,
    index: AHashMap<&'a str, u32>,
    nodes: Vec<DumpNode>,
}

impl<'a> DumpBuilder<'a> {
    /// Start a dump whose root carries `root_objects`
    pub(crate) fn new(root_objects: &[&'a str]) -> Self {
        let mut builder = Self {
            strings: Vec::new(),
            index: AHashMap::new(),
            nodes: Vec::new(),
        };
        let root_component = builder.string("");
        let objects = builder.strings_for(root_objects);
        builder.nodes.push(DumpNode {
            component: root_component,
            objects,
            children: Vec::new(),
        });
        builder
    }

    fn string(&mut self, s: &'a str) -> u32 {
        if let Some(&idx) = self.index.get(s) {
            return idx;
        }
        let idx = self.strings.len() as u32;
        self.strings.push(s.to_string());
        self.index.insert(s, idx);
        idx
    }

    fn strings_for(&mut self, values: &[&'a str]) -> Vec<u32> {
        values.iter().map(|v| self.string(v)).collect()
    }

    /// Append a node under `parent` and return its index
    pub(crate) fn push_child(&mut self, parent: u32, component: &'a str, objects: &[&'a str]) -> u32 {
        let component = self.string(component);
        let objects = self.strings_for(objects);
        let idx = self.nodes.len() as u32;
        self.nodes.push(DumpNode {
            component,
            objects,
            children: Vec::new(),
        });
        self.nodes[parent as usize].children.push(idx);
        idx
    }

    pub(crate) fn finish(self) -> PathsDump {
        PathsDump {
            strings: self.strings,
            nodes: self.nodes,
        }
    }
}
