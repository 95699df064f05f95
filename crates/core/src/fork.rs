// crates/core/src/fork.rs
//! Fork relations between sessions.
//!
//! A session whose header carries `parentSession` is a fork of that session.
//! The graph is built from headers alone so it stays cheap to refresh.

use crate::session::SessionHeader;
use std::collections::HashMap;

/// Parent/child relations between session ids.
#[derive(Debug, Default, Clone)]
pub struct ForkGraph {
    parent_of: HashMap<String, String>,
    children_of: HashMap<String, Vec<String>>,
}

impl ForkGraph {
    /// Build the graph from a set of session headers.
    pub fn from_headers<'a>(headers: impl IntoIterator<Item = &'a SessionHeader>) -> Self {
        let mut graph = Self::default();
        for header in headers {
            if let Some(parent) = &header.parent_session {
                graph.insert(&header.id, parent);
            }
        }
        graph
    }

    /// Record one fork relation.
    pub fn insert(&mut self, child: &str, parent: &str) {
        self.parent_of.insert(child.to_string(), parent.to_string());
        let children = self.children_of.entry(parent.to_string()).or_default();
        if !children.iter().any(|c| c == child) {
            children.push(child.to_string());
        }
    }

    /// Direct parent of a session, if it is a fork.
    pub fn parent(&self, session_id: &str) -> Option<&str> {
        self.parent_of.get(session_id).map(String::as_str)
    }

    /// Direct forks of a session.
    pub fn children(&self, session_id: &str) -> &[String] {
        self.children_of
            .get(session_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Ancestors from nearest parent to the root, cycle-safe.
    pub fn ancestors(&self, session_id: &str) -> Vec<String> {
        let mut out = Vec::new();
        let mut current = session_id;
        while let Some(parent) = self.parent(current) {
            if out.iter().any(|a| a == parent) || parent == session_id {
                break;
            }
            out.push(parent.to_string());
            current = self.parent_of.get(current).map(String::as_str).unwrap_or("");
        }
        out
    }

    /// All descendants, breadth-first.
    pub fn descendants(&self, session_id: &str) -> Vec<String> {
        let mut out = Vec::new();
        let mut queue: Vec<&str> = self.children(session_id).iter().map(String::as_str).collect();
        while let Some(next) = queue.pop() {
            if out.iter().any(|d| d == next) {
                continue;
            }
            out.push(next.to_string());
            queue.extend(self.children(next).iter().map(String::as_str));
        }
        out
    }
}
