//! Pairwise interconnect locality between physical devices.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::library::TopologyLevel;

/// How two physical devices are connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub level: TopologyLevel,
    pub nvlinks: u32,
}

impl Link {
    /// Locality score; higher means closer.
    pub fn score(&self) -> u32 {
        let level = match self.level {
            TopologyLevel::Internal => 60,
            TopologyLevel::Single => 50,
            TopologyLevel::Multiple => 40,
            TopologyLevel::HostBridge => 30,
            TopologyLevel::Node => 20,
            TopologyLevel::System => 10,
        };
        self.nvlinks * 100 + level
    }
}

/// Symmetric link table keyed by device id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkMatrix {
    links: HashMap<(String, String), Link>,
}

impl LinkMatrix {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, a: &str, b: &str, link: Link) {
        self.links.insert(Self::key(a, b), link);
    }

    pub fn get(&self, a: &str, b: &str) -> Option<&Link> {
        self.links.get(&Self::key(a, b))
    }

    /// Score of the pair, 0 when the link is unknown.
    pub fn score(&self, a: &str, b: &str) -> u32 {
        self.get(a, b).map(Link::score).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    fn key(a: &str, b: &str) -> (String, String) {
        if a <= b {
            (a.to_string(), b.to_string())
        } else {
            (b.to_string(), a.to_string())
        }
    }
}
