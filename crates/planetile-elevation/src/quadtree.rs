//! Distance-driven terrain quad tree and the sampler that keeps its tiles resident.

use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use glam::{DVec2, DVec3};
use planetile_tile::{Tile, TileError, TileProducer};

use crate::terrain::TerrainNode;

/// A quad of the terrain tree.
#[derive(Clone, Debug, PartialEq)]
pub struct TerrainQuad {
    pub level: u32,
    pub x: u32,
    pub y: u32,
    children: Option<Box<[TerrainQuad; 4]>>,
}

impl TerrainQuad {
    fn new(level: u32, x: u32, y: u32) -> Self {
        Self {
            level,
            x,
            y,
            children: None,
        }
    }

    #[must_use]
    pub fn is_leaf(&self) -> bool {
        self.children.is_none()
    }

    #[must_use]
    pub fn children(&self) -> Option<&[TerrainQuad; 4]> {
        self.children.as_deref()
    }

    /// Face-space centre of this quad.
    #[must_use]
    pub fn center(&self, root_size: f64) -> DVec2 {
        let scale = 2f64.powi(self.level as i32);
        DVec2::new(
            ((f64::from(self.x) + 0.5) / scale - 0.5) * root_size,
            ((f64::from(self.y) + 0.5) / scale - 0.5) * root_size,
        )
    }

    fn subdivide(&mut self) {
        let (l, x, y) = (self.level + 1, self.x * 2, self.y * 2);
        self.children = Some(Box::new([
            Self::new(l, x, y),
            Self::new(l, x + 1, y),
            Self::new(l, x, y + 1),
            Self::new(l, x + 1, y + 1),
        ]));
    }
}

/// Quad tree over one terrain face. A quad is split while the camera is closer
/// to its centre than `split_factor` times its size.
pub struct TerrainQuadTree {
    terrain: Rc<TerrainNode>,
    root: TerrainQuad,
    max_level: u32,
    split_factor: f64,
}

impl TerrainQuadTree {
    pub fn new(terrain: Rc<TerrainNode>, max_level: u32, split_factor: f64) -> Self {
        Self {
            terrain,
            root: TerrainQuad::new(0, 0, 0),
            max_level,
            split_factor,
        }
    }

    #[must_use]
    pub fn root(&self) -> &TerrainQuad {
        &self.root
    }

    #[must_use]
    pub fn max_level(&self) -> u32 {
        self.max_level
    }

    /// Split and merge quads for a camera at `camera` in face space
    /// (`x`, `y` on the face plane, `z` above it).
    pub fn update(&mut self, camera: DVec3) {
        let root_size = self.terrain.quad_root_size;
        Self::update_quad(&mut self.root, camera, root_size, self.max_level, self.split_factor);
    }

    fn update_quad(quad: &mut TerrainQuad, camera: DVec3, root_size: f64, max_level: u32, split_factor: f64) {
        let center = quad.center(root_size).extend(0.0);
        let size = root_size / 2f64.powi(quad.level as i32);
        let split = quad.level < max_level && camera.distance(center) < split_factor * size;

        if !split {
            quad.children = None;
            return;
        }
        if quad.is_leaf() {
            quad.subdivide();
        }
        if let Some(children) = quad.children.as_mut() {
            for child in children.iter_mut() {
                Self::update_quad(child, camera, root_size, max_level, split_factor);
            }
        }
    }

    /// Every quad of the tree as `(level, x, y)`, coarse to fine.
    #[must_use]
    pub fn quads(&self) -> Vec<(u32, u32, u32)> {
        let mut out = Vec::new();
        let mut frontier = vec![&self.root];
        while !frontier.is_empty() {
            let mut next = Vec::new();
            for quad in frontier {
                out.push((quad.level, quad.x, quad.y));
                if let Some(children) = quad.children() {
                    next.extend(children.iter());
                }
            }
            frontier = next;
        }
        out
    }

    /// Leaf quads as `(level, x, y)`.
    #[must_use]
    pub fn leaves(&self) -> Vec<(u32, u32, u32)> {
        fn collect(quad: &TerrainQuad, out: &mut Vec<(u32, u32, u32)>) {
            match quad.children() {
                Some(children) => children.iter().for_each(|c| collect(c, out)),
                None => out.push((quad.level, quad.x, quad.y)),
            }
        }
        let mut out = Vec::new();
        collect(&self.root, &mut out);
        out
    }
}

/// Result of one [`TileSampler::update`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SamplerUpdate {
    pub acquired: usize,
    pub released: usize,
}

/// Holds one tile of `producer` for every quad of a [`TerrainQuadTree`].
pub struct TileSampler {
    producer: Rc<dyn TileProducer>,
    held: HashMap<(u32, u32, u32), Rc<Tile>>,
    deferred: bool,
}

impl TileSampler {
    pub fn new(producer: Rc<dyn TileProducer>) -> Self {
        Self {
            producer,
            held: HashMap::new(),
            deferred: false,
        }
    }

    /// Request tiles instead of generating them immediately; they are generated
    /// by the producer's per-tick update.
    #[must_use]
    pub fn deferred(mut self, deferred: bool) -> Self {
        self.deferred = deferred;
        self
    }

    #[must_use]
    pub fn producer(&self) -> &Rc<dyn TileProducer> {
        &self.producer
    }

    /// The tile held for quad `(level, x, y)`.
    #[must_use]
    pub fn tile(&self, level: u32, x: u32, y: u32) -> Option<&Rc<Tile>> {
        self.held.get(&(level, x, y))
    }

    #[must_use]
    pub fn held(&self) -> usize {
        self.held.len()
    }

    /// Release tiles of quads that left `tree`, then acquire tiles for new
    /// quads, coarse to fine.
    pub fn update(&mut self, tree: &TerrainQuadTree) -> Result<SamplerUpdate, TileError> {
        let quads = tree.quads();
        let visible: HashSet<_> = quads.iter().copied().collect();
        let mut result = SamplerUpdate::default();

        let stale: Vec<_> = self
            .held
            .keys()
            .filter(|k| !visible.contains(*k))
            .copied()
            .collect();
        for key in stale {
            if let Some(tile) = self.held.remove(&key) {
                self.producer.put_tile(&tile)?;
                result.released += 1;
            }
        }

        for (level, x, y) in quads {
            if self.held.contains_key(&(level, x, y)) || !self.producer.has_tile(level, x, y) {
                continue;
            }
            let tile = if self.deferred {
                self.producer.request_tile(level, x, y)?
            } else {
                self.producer.get_tile(level, x, y)?
            };
            self.held.insert((level, x, y), tile);
            result.acquired += 1;
        }

        if result != SamplerUpdate::default() {
            tracing::debug!(
                producer = self.producer.name(),
                acquired = result.acquired,
                released = result.released,
                held = self.held.len(),
                "sampler updated"
            );
        }
        Ok(result)
    }

    /// Release every held tile.
    pub fn release_all(&mut self) -> Result<usize, TileError> {
        let count = self.held.len();
        for (_, tile) in self.held.drain() {
            self.producer.put_tile(&tile)?;
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::terrain::BodyShape;
    use planetile_tile::{CpuTileStorage, ProducerCore, TileCache, TileSlot};

    struct FlatProducer {
        core: ProducerCore,
    }

    impl TileProducer for FlatProducer {
        fn core(&self) -> &ProducerCore {
            &self.core
        }

        fn do_create_tile(&self, _: u32, _: u32, _: u32, _: &[TileSlot]) -> Result<(), TileError> {
            Ok(())
        }
    }

    fn terrain() -> Rc<TerrainNode> {
        Rc::new(TerrainNode::new(BodyShape::default()).with_quad_root_size(1000.0))
    }

    fn flat_producer(capacity: usize) -> Rc<dyn TileProducer> {
        let storage = CpuTileStorage::new(4, 1, capacity).unwrap();
        let cache = Rc::new(TileCache::new("flat", vec![Box::new(storage)]).unwrap());
        Rc::new(FlatProducer {
            core: ProducerCore::new("flat", cache),
        })
    }

    #[test]
    fn test_far_camera_keeps_only_the_root() {
        let mut tree = TerrainQuadTree::new(terrain(), 4, 2.0);
        tree.update(DVec3::new(0.0, 0.0, 1.0e6));
        assert_eq!(tree.quads(), vec![(0, 0, 0)]);
        assert!(tree.root().is_leaf());
    }

    #[test]
    fn test_close_camera_splits_to_max_level() {
        let mut tree = TerrainQuadTree::new(terrain(), 3, 2.0);
        tree.update(DVec3::new(10.0, 10.0, 1.0));
        let leaves = tree.leaves();
        assert!(leaves.iter().any(|&(l, _, _)| l == 3));
        assert!(leaves.iter().all(|&(l, _, _)| l <= 3));

        // Quads come out coarse to fine.
        let levels: Vec<_> = tree.quads().iter().map(|q| q.0).collect();
        assert!(levels.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_moving_away_merges() {
        let mut tree = TerrainQuadTree::new(terrain(), 3, 2.0);
        tree.update(DVec3::new(0.0, 0.0, 1.0));
        assert!(tree.quads().len() > 1);
        tree.update(DVec3::new(0.0, 0.0, 1.0e7));
        assert_eq!(tree.quads().len(), 1);
    }

    #[test]
    fn test_quad_centres() {
        let quad = TerrainQuad::new(1, 1, 0);
        assert_eq!(quad.center(1000.0), DVec2::new(250.0, -250.0));
    }

    #[test]
    fn test_sampler_tracks_the_tree() {
        let producer = flat_producer(64);
        let mut sampler = TileSampler::new(Rc::clone(&producer));
        let mut tree = TerrainQuadTree::new(terrain(), 2, 2.0);

        tree.update(DVec3::new(0.0, 0.0, 1.0));
        let first = sampler.update(&tree).unwrap();
        assert_eq!(first.acquired, tree.quads().len());
        assert!(sampler.tile(0, 0, 0).unwrap().is_ready());

        // Nothing changes on a repeated tick.
        assert_eq!(sampler.update(&tree).unwrap(), SamplerUpdate::default());

        tree.update(DVec3::new(0.0, 0.0, 1.0e7));
        let second = sampler.update(&tree).unwrap();
        assert_eq!(second.released, first.acquired - 1);
        assert_eq!(sampler.held(), 1);
        assert_eq!(producer.cache().stats().unused, first.acquired - 1);

        assert_eq!(sampler.release_all().unwrap(), 1);
        assert_eq!(producer.cache().stats().used, 0);
    }

    #[test]
    fn test_deferred_sampler_requests_tiles() {
        let producer = flat_producer(64);
        let mut sampler = TileSampler::new(Rc::clone(&producer)).deferred(true);
        let mut tree = TerrainQuadTree::new(terrain(), 1, 2.0);
        tree.update(DVec3::new(0.0, 0.0, 1.0));

        let update = sampler.update(&tree).unwrap();
        assert_eq!(update.acquired, 5);
        assert!(!sampler.tile(0, 0, 0).unwrap().is_ready());

        assert_eq!(producer.update(3).unwrap(), 3);
        assert_eq!(producer.update(3).unwrap(), 2);
        assert!(sampler.tile(1, 1, 1).unwrap().is_ready());
    }
}
