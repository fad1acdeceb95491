use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use super::chunk::Chunk;
use super::config::CanvasConfig;
use super::error::CanvasError;
use crate::geometry::{ChunkCoordinate, ChunkRect, Point, Rect};
use crate::sync::{read_lock, write_lock};

/// Sparse chunk storage. Lookups take the shared lock, creation and removal the exclusive one.
#[derive(Debug)]
pub(crate) struct ChunkMap {
    config: CanvasConfig,
    chunks: RwLock<HashMap<ChunkCoordinate, Arc<Chunk>>>,
    created: AtomicU64,
}

impl ChunkMap {
    pub(crate) fn new(config: CanvasConfig) -> Self {
        Self {
            config,
            chunks: RwLock::new(HashMap::new()),
            created: AtomicU64::new(0),
        }
    }

    pub(crate) fn config(&self) -> &CanvasConfig {
        &self.config
    }

    pub(crate) fn len(&self) -> usize {
        read_lock(&self.chunks, "chunk map").len()
    }

    pub(crate) fn created_total(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
    }

    pub(crate) fn chunk_coord(&self, pos: Point) -> ChunkCoordinate {
        self.config.chunk_size.chunk_coord(pos, self.config.origin)
    }

    pub(crate) fn outer_rect(&self, rect: Rect) -> ChunkRect {
        self.config.chunk_size.outer_chunk_rect(rect, self.config.origin)
    }

    pub(crate) fn inner_rect(&self, rect: Rect) -> ChunkRect {
        self.config.chunk_size.inner_chunk_rect(rect, self.config.origin)
    }

    pub(crate) fn pixel_rect(&self, coord: ChunkCoordinate) -> Rect {
        coord.pixel_rect(self.config.chunk_size, self.config.origin)
    }

    pub(crate) fn get(&self, coord: ChunkCoordinate, create: bool) -> Result<Arc<Chunk>, CanvasError> {
        if let Some(chunk) = read_lock(&self.chunks, "chunk map").get(&coord) {
            return Ok(Arc::clone(chunk));
        }
        if !create {
            return Err(CanvasError::NotFound { coord });
        }

        let rect = self.pixel_rect(coord);
        if !self.config.world_rect.intersects(&rect) {
            return Err(CanvasError::NotFound { coord });
        }

        let mut chunks = write_lock(&self.chunks, "chunk map");
        let chunk = chunks.entry(coord).or_insert_with(|| {
            self.created.fetch_add(1, Ordering::Relaxed);
            Arc::new(Chunk::new(coord, rect, self.config.palette.as_ref()))
        });
        Ok(Arc::clone(chunk))
    }

    /// Row-major lookup of every chunk in `rect`.
    ///
    /// A missing chunk aborts the whole batch with `NotFound` unless
    /// `ignore_missing` is set, in which case it is skipped.
    pub(crate) fn get_many(
        &self,
        rect: ChunkRect,
        create: bool,
        ignore_missing: bool,
    ) -> Result<Vec<Arc<Chunk>>, CanvasError> {
        if !create && rect.len() > self.len() {
            return self.existing_in(rect, ignore_missing);
        }

        let mut chunks = Vec::with_capacity(rect.len().min(1024));
        for coord in rect.iter() {
            match self.get(coord, create) {
                Ok(chunk) => chunks.push(chunk),
                Err(CanvasError::NotFound { .. }) if ignore_missing => {}
                Err(error) => return Err(error),
            }
        }
        Ok(chunks)
    }

    /// Sparse variant of `get_many` for rectangles larger than the map.
    fn existing_in(&self, rect: ChunkRect, ignore_missing: bool) -> Result<Vec<Arc<Chunk>>, CanvasError> {
        let chunks = read_lock(&self.chunks, "chunk map");
        if !ignore_missing {
            // More coordinates than chunks: one of the first len()+1 is missing.
            if let Some(coord) = rect.iter().find(|coord| !chunks.contains_key(coord)) {
                return Err(CanvasError::NotFound { coord });
            }
        }
        let mut found = chunks
            .iter()
            .filter(|(coord, _)| rect.contains(**coord))
            .map(|(_, chunk)| Arc::clone(chunk))
            .collect::<Vec<_>>();
        found.sort_by_key(|chunk| (chunk.coord().y, chunk.coord().x));
        Ok(found)
    }

    pub(crate) fn snapshot(&self) -> Vec<Arc<Chunk>> {
        read_lock(&self.chunks, "chunk map").values().cloned().collect()
    }

    /// Removes `chunk` unless it was already replaced by a newer one.
    pub(crate) fn remove_if_same(&self, chunk: &Arc<Chunk>) -> bool {
        let mut chunks = write_lock(&self.chunks, "chunk map");
        match chunks.get(&chunk.coord()) {
            Some(current) if Arc::ptr_eq(current, chunk) => {
                chunks.remove(&chunk.coord());
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::PixelSize;

    fn map() -> ChunkMap {
        ChunkMap::new(CanvasConfig {
            world_rect: Rect::new(-128, -128, 128, 128),
            ..CanvasConfig::with_chunk_size(PixelSize::new(64, 64))
        })
    }

    fn rect(x0: i32, y0: i32, x1: i32, y1: i32) -> ChunkRect {
        ChunkRect {
            min: ChunkCoordinate::new(x0, y0),
            max: ChunkCoordinate::new(x1, y1),
        }
    }

    #[test]
    fn get_creates_lazily_inside_world_only() {
        let map = map();
        assert!(matches!(
            map.get(ChunkCoordinate::new(0, 0), false),
            Err(CanvasError::NotFound { .. })
        ));
        let chunk = map.get(ChunkCoordinate::new(-2, 1), true).expect("create");
        assert_eq!(chunk.rect(), Rect::new(-128, 64, -64, 128));
        assert!(matches!(
            map.get(ChunkCoordinate::new(2, 0), true),
            Err(CanvasError::NotFound { .. })
        ));
        assert_eq!(map.len(), 1);
        assert_eq!(map.created_total(), 1);

        let again = map.get(ChunkCoordinate::new(-2, 1), true).expect("lookup");
        assert!(Arc::ptr_eq(&chunk, &again));
        assert_eq!(map.created_total(), 1);
    }

    #[test]
    fn get_many_is_row_major_and_aborts_on_missing() {
        let map = map();
        map.get_many(rect(-1, -1, 1, 1), true, false).expect("create");
        let chunks = map.get_many(rect(-1, -1, 1, 1), false, false).expect("lookup");
        let coords = chunks.iter().map(|chunk| chunk.coord()).collect::<Vec<_>>();
        assert_eq!(
            coords,
            vec![
                ChunkCoordinate::new(-1, -1),
                ChunkCoordinate::new(0, -1),
                ChunkCoordinate::new(-1, 0),
                ChunkCoordinate::new(0, 0),
            ]
        );

        assert_eq!(
            map.get_many(rect(-1, -1, 2, 1), false, false).map(|chunks| chunks.len()),
            Err(CanvasError::NotFound {
                coord: ChunkCoordinate::new(1, -1)
            })
        );
        assert_eq!(
            map.get_many(rect(-1, -1, 2, 1), false, true).expect("ignore").len(),
            4
        );
    }

    #[test]
    fn huge_rect_lookup_uses_existing_chunks() {
        let map = map();
        map.get(ChunkCoordinate::new(1, 1), true).expect("create");
        map.get(ChunkCoordinate::new(-1, 0), true).expect("create");
        let everything = map.outer_rect(Rect::everything());
        let chunks = map.get_many(everything, false, true).expect("sparse");
        let coords = chunks.iter().map(|chunk| chunk.coord()).collect::<Vec<_>>();
        assert_eq!(coords, vec![ChunkCoordinate::new(-1, 0), ChunkCoordinate::new(1, 1)]);
        assert!(matches!(
            map.get_many(everything, false, false),
            Err(CanvasError::NotFound { .. })
        ));
    }

    #[test]
    fn remove_if_same_ignores_replaced_chunks() {
        let map = map();
        let old = map.get(ChunkCoordinate::new(0, 0), true).expect("create");
        assert!(map.remove_if_same(&old));
        let new = map.get(ChunkCoordinate::new(0, 0), true).expect("recreate");
        assert!(!map.remove_if_same(&old));
        assert!(map.remove_if_same(&new));
        assert_eq!(map.len(), 0);
    }
}
