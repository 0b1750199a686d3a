use std::path::Path;

use async_trait::async_trait;

use super::{PositionMap, PositionStore, Positions};
use crate::Result;

/// Keeps positions in memory only; nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryPositions {
    map: PositionMap,
}

impl MemoryPositions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_positions(positions: Positions) -> Self {
        MemoryPositions {
            map: PositionMap::new(positions),
        }
    }
}

#[async_trait]
impl PositionStore for MemoryPositions {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn get(&self, path: &Path) -> u64 {
        self.map.get(path)
    }

    fn put(&self, path: &Path, offset: u64) -> Result<()> {
        self.map.put(path, offset);
        Ok(())
    }

    fn get_all(&self) -> Positions {
        self.map.snapshot()
    }

    fn replace(&self, positions: Positions) {
        self.map.replace(positions);
    }

    fn remove(&self, path: &Path) {
        self.map.remove(path);
    }

    async fn stop(&self) {}
}
