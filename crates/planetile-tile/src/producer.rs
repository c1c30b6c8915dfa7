//! The tile producer contract.
//!
//! A producer knows how to fill the slots of one tile ([`TileProducer::do_create_tile`]).
//! Everything else (lookup, allocation, eviction, dependency bookkeeping) is
//! provided on top of the producer's [`TileCache`].

use std::rc::Rc;

use crate::cache::TileCache;
use crate::error::TileError;
use crate::key::ProducerId;
use crate::slot::TileSlot;
use crate::tile::{Tile, TileLease};

/// State every producer carries: its id, a name and its cache.
pub struct ProducerCore {
    id: ProducerId,
    name: String,
    cache: Rc<TileCache>,
}

impl ProducerCore {
    /// Register a new producer named `name` with `cache`.
    pub fn new(name: impl Into<String>, cache: Rc<TileCache>) -> Self {
        let id = cache.register_producer();
        Self {
            id,
            name: name.into(),
            cache,
        }
    }

    #[must_use]
    pub fn id(&self) -> ProducerId {
        self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn cache(&self) -> &Rc<TileCache> {
        &self.cache
    }
}

/// Produces quad-tree tiles into the slots of a [`TileCache`].
///
/// Implementors provide [`core`](Self::core) and
/// [`do_create_tile`](Self::do_create_tile); producers with upstream inputs
/// also override [`acquire_dependencies`](Self::acquire_dependencies).
pub trait TileProducer {
    fn core(&self) -> &ProducerCore;

    fn id(&self) -> ProducerId {
        self.core().id()
    }

    fn name(&self) -> &str {
        self.core().name()
    }

    fn cache(&self) -> &Rc<TileCache> {
        self.core().cache()
    }

    /// Ghost texels around the valid data on each edge.
    fn border(&self) -> u32 {
        0
    }

    /// Tile width in texels at `level`, border included.
    fn tile_size(&self, _level: u32) -> u32 {
        self.cache().tile_size()
    }

    /// Whether this producer can produce `(level, x, y)`.
    fn has_tile(&self, level: u32, x: u32, y: u32) -> bool {
        level < 32 && x < (1 << level) && y < (1 << level)
    }

    /// Look up a resident tile without acquiring it. See [`TileCache::find_tile`].
    fn find_tile(
        &self,
        level: u32,
        x: u32,
        y: u32,
        include_pending: bool,
        deferred_generation: bool,
    ) -> Result<Option<Rc<Tile>>, TileError> {
        self.cache()
            .find_tile(self, level, x, y, include_pending, deferred_generation)
    }

    /// Acquire `(level, x, y)`, generating it on a miss.
    fn get_tile(&self, level: u32, x: u32, y: u32) -> Result<Rc<Tile>, TileError> {
        match self.cache().get_tile(self.id(), level, x, y) {
            Some(tile) => Ok(tile),
            None => self.cache().create_tile(self, level, x, y),
        }
    }

    /// Release a tile obtained from [`get_tile`](Self::get_tile) or
    /// [`request_tile`](Self::request_tile).
    fn put_tile(&self, tile: &Tile) -> Result<(), TileError> {
        self.cache().release_tile(tile)
    }

    /// Acquire `(level, x, y)` and defer its generation to [`update`](Self::update).
    fn request_tile(&self, level: u32, x: u32, y: u32) -> Result<Rc<Tile>, TileError> {
        self.cache().request_tile(self.id(), level, x, y)
    }

    /// Per-frame tick: generate up to `budget` requested tiles.
    fn update(&self, budget: usize) -> Result<usize, TileError> {
        self.cache().update(self, budget)
    }

    /// Mark all ready tiles stale; each is regenerated the next time it is acquired.
    fn invalidate_tiles(&self) -> usize {
        self.cache().invalidate(self.id())
    }

    /// Acquire the upstream tiles `(level, x, y)` needs. The leases are held by
    /// the tile until it is evicted.
    fn acquire_dependencies(
        &self,
        _level: u32,
        _x: u32,
        _y: u32,
    ) -> Result<Vec<TileLease>, TileError> {
        Ok(Vec::new())
    }

    /// Fill `slots` (one per cache storage) with the content of `(level, x, y)`.
    fn do_create_tile(&self, level: u32, x: u32, y: u32, slots: &[TileSlot])
    -> Result<(), TileError>;
}

/// Check that the valid part of a tile maps onto a whole number of grid cells:
/// `(tile_size - 2 * border - 1) % (grid_resolution - 1) == 0`.
pub fn check_tile_alignment(
    tile_size: u32,
    border: u32,
    grid_resolution: u32,
) -> Result<(), TileError> {
    if grid_resolution < 2 {
        return Err(TileError::InvalidParameter(format!(
            "grid resolution must be at least 2, got {grid_resolution}"
        )));
    }
    let inner = tile_size
        .checked_sub(2 * border + 1)
        .ok_or_else(|| {
            TileError::InvalidParameter(format!(
                "tile size {tile_size} is too small for border {border}"
            ))
        })?;
    if inner % (grid_resolution - 1) != 0 {
        return Err(TileError::InvalidParameter(format!(
            "tile size - border * 2 - 1 must be divisible by grid resolution - 1: \
             {tile_size}-{border} with grid {grid_resolution}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::storage::CpuTileStorage;
    use crate::tile::TileState;
    use std::cell::Cell;

    struct LeafProducer {
        core: ProducerCore,
    }

    impl TileProducer for LeafProducer {
        fn core(&self) -> &ProducerCore {
            &self.core
        }

        fn do_create_tile(&self, level: u32, _x: u32, _y: u32, slots: &[TileSlot])
        -> Result<(), TileError> {
            slots[0].as_cpu().unwrap().fill(level as f32);
            Ok(())
        }
    }

    /// Copies its upstream tile's value plus one.
    struct DerivedProducer {
        core: ProducerCore,
        upstream: Rc<dyn TileProducer>,
    }

    impl TileProducer for DerivedProducer {
        fn core(&self) -> &ProducerCore {
            &self.core
        }

        fn acquire_dependencies(&self, level: u32, x: u32, y: u32)
        -> Result<Vec<TileLease>, TileError> {
            Ok(vec![TileLease::acquire(&self.upstream, level, x, y)?])
        }

        fn do_create_tile(&self, level: u32, x: u32, y: u32, slots: &[TileSlot])
        -> Result<(), TileError> {
            let key = crate::TileKey::new(self.id(), level, x, y);
            let upstream = self
                .upstream
                .find_tile(level, x, y, false, true)?
                .ok_or_else(|| TileError::missing(key, "upstream tile not resident"))?;
            let value = upstream.slot(0).unwrap().as_cpu().unwrap().data()[0];
            slots[0].as_cpu().unwrap().fill(value + 1.0);
            Ok(())
        }
    }

    /// Requests its own tile while generating it.
    struct SelfReferencing {
        core: ProducerCore,
        attempts: Cell<u32>,
    }

    impl TileProducer for SelfReferencing {
        fn core(&self) -> &ProducerCore {
            &self.core
        }

        fn do_create_tile(&self, level: u32, x: u32, y: u32, _slots: &[TileSlot])
        -> Result<(), TileError> {
            self.attempts.set(self.attempts.get() + 1);
            self.get_tile(level, x, y).map(|_| ())
        }
    }

    fn cpu_cache(name: &str, capacity: usize) -> Rc<TileCache> {
        let storage = CpuTileStorage::new(4, 1, capacity).unwrap();
        Rc::new(TileCache::new(name, vec![Box::new(storage)]).unwrap())
    }

    #[test]
    fn test_alignment_accepts_valid_layouts() {
        // 101 - 2*2 - 1 = 96, divisible by 24, 32, 48, 96.
        for grid in [25, 33, 49, 97] {
            assert!(check_tile_alignment(101, 2, grid).is_ok(), "grid {grid}");
        }
        assert!(check_tile_alignment(197, 2, 25).is_ok());
        assert!(check_tile_alignment(17, 0, 17).is_ok());
    }

    #[test]
    fn test_alignment_rejects_invalid_layouts() {
        for (tile, border, grid) in [(100, 2, 25), (101, 1, 25), (101, 2, 30), (4, 2, 3), (101, 2, 1)] {
            let err = check_tile_alignment(tile, border, grid).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Configuration, "{tile}/{border}/{grid}");
        }
    }

    #[test]
    fn test_alignment_matches_formula_exhaustively() {
        for tile in 5..80u32 {
            for border in 0..3u32 {
                for grid in 2..20u32 {
                    let expected = tile >= 2 * border + 1 && (tile - 2 * border - 1) % (grid - 1) == 0;
                    assert_eq!(check_tile_alignment(tile, border, grid).is_ok(), expected);
                }
            }
        }
    }

    #[test]
    fn test_default_has_tile_checks_bounds() {
        let producer = LeafProducer {
            core: ProducerCore::new("leaf", cpu_cache("leaf", 2)),
        };
        assert!(producer.has_tile(0, 0, 0));
        assert!(producer.has_tile(2, 3, 3));
        assert!(!producer.has_tile(2, 4, 0));
        assert!(!producer.has_tile(0, 0, 1));
        assert_eq!(producer.border(), 0);
        assert_eq!(producer.tile_size(5), 4);
    }

    #[test]
    fn test_dependency_is_generated_and_held() {
        let leaf: Rc<dyn TileProducer> = Rc::new(LeafProducer {
            core: ProducerCore::new("leaf", cpu_cache("leaf", 2)),
        });
        let derived = DerivedProducer {
            core: ProducerCore::new("derived", cpu_cache("derived", 2)),
            upstream: Rc::clone(&leaf),
        };

        let tile = derived.get_tile(3, 1, 2).unwrap();
        assert_eq!(tile.slot(0).unwrap().as_cpu().unwrap().data()[0], 4.0);
        assert_eq!(tile.dependency_count(), 1);
        assert_eq!(leaf.cache().users(leaf.id(), 3, 1, 2), Some(1));

        // Releasing the derived tile keeps the lease until eviction.
        derived.put_tile(&tile).unwrap();
        assert_eq!(leaf.cache().users(leaf.id(), 3, 1, 2), Some(1));

        derived.cache().evict_unused().unwrap();
        assert_eq!(tile.state(), TileState::Evicted);
        assert_eq!(leaf.cache().users(leaf.id(), 3, 1, 2), Some(0));
    }

    #[test]
    fn test_shared_cache_dependency_chain() {
        let shared = cpu_cache("shared", 4);
        let leaf: Rc<dyn TileProducer> = Rc::new(LeafProducer {
            core: ProducerCore::new("leaf", Rc::clone(&shared)),
        });
        let derived = DerivedProducer {
            core: ProducerCore::new("derived", Rc::clone(&shared)),
            upstream: Rc::clone(&leaf),
        };

        let tile = derived.get_tile(1, 0, 0).unwrap();
        assert!(tile.is_ready());
        assert_eq!(shared.stats().used, 2);

        derived.put_tile(&tile).unwrap();
        // One pass evicts the derived tile, the next its now-unused upstream tile.
        assert_eq!(shared.evict_unused().unwrap(), 2);
        assert_eq!(shared.stats().used + shared.stats().unused, 0);
    }

    #[test]
    fn test_dependency_capacity_failure_discards_tile() {
        let leaf: Rc<dyn TileProducer> = Rc::new(LeafProducer {
            core: ProducerCore::new("leaf", cpu_cache("leaf", 1)),
        });
        let derived = DerivedProducer {
            core: ProducerCore::new("derived", cpu_cache("derived", 4)),
            upstream: Rc::clone(&leaf),
        };

        let _held = derived.get_tile(1, 0, 0).unwrap();
        // The single upstream slot is leased by the first tile.
        let err = derived.get_tile(1, 1, 0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Capacity);
        assert!(!derived.cache().contains(derived.id(), 1, 1, 0));
        assert_eq!(derived.cache().stats().used, 1);
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let producer = SelfReferencing {
            core: ProducerCore::new("cyclic", cpu_cache("cyclic", 2)),
            attempts: Cell::new(0),
        };
        let err = producer.get_tile(0, 0, 0).unwrap_err();
        assert!(matches!(err, TileError::DependencyCycle(_)));
        assert_eq!(err.kind(), ErrorKind::DependencyLookup);
        assert_eq!(producer.attempts.get(), 1);
        assert!(!producer.cache().contains(producer.id(), 0, 0, 0));
    }
}
