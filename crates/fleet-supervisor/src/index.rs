//! Seam for the tool-index collaborator.
//!
//! The supervisor pushes tool-metadata deltas; search and ranking live
//! elsewhere. Upserts are keyed `(server, tool)` so discovery results
//! arriving in any order converge.

use std::collections::HashMap;
use std::sync::RwLock;

use fleet_core::ToolDescriptor;

pub trait ToolIndex: Send + Sync {
    fn upsert_server_tools(&self, server: &str, tools: &[ToolDescriptor]);
    fn remove_server_tools(&self, server: &str);
}

/// In-process index used by the binary and tests.
#[derive(Default)]
pub struct MemoryIndex {
    tools: RwLock<HashMap<String, Vec<ToolDescriptor>>>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn server_tools(&self, server: &str) -> Vec<ToolDescriptor> {
        self.tools
            .read()
            .map(|map| map.get(server).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    /// Union across all servers, sorted by qualified name for stable output.
    pub fn all_tools(&self) -> Vec<ToolDescriptor> {
        let mut all: Vec<ToolDescriptor> = self
            .tools
            .read()
            .map(|map| map.values().flatten().cloned().collect())
            .unwrap_or_default();
        all.sort_by(|a, b| a.qualified_name().cmp(&b.qualified_name()));
        all
    }
}

impl ToolIndex for MemoryIndex {
    fn upsert_server_tools(&self, server: &str, tools: &[ToolDescriptor]) {
        if let Ok(mut map) = self.tools.write() {
            map.insert(server.to_string(), tools.to_vec());
        }
    }

    fn remove_server_tools(&self, server: &str) {
        if let Ok(mut map) = self.tools.write() {
            map.remove(server);
        }
    }
}
