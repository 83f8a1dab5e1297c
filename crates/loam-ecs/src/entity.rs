//! Entity identifiers with generational indices, and the entity index.
//!
//! An entity packs a 32-bit slot index and a 16-bit generation into the low
//! 48 bits of a `u64`. The entity index maps each live slot to the table and
//! row that currently store its components.

use std::fmt;

use bitflags::bitflags;

use crate::{id::Id, table::TableId};

/// Generation counter to detect stale entity references.
/// Incremented each time an entity slot is recycled.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Generation(u16);

impl Generation {
    #[must_use]
    pub const fn new() -> Self {
        Self(0)
    }

    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }

    #[must_use]
    pub const fn get(self) -> u16 {
        self.0
    }
}

impl fmt::Debug for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gen{}", self.0)
    }
}

/// A unique identifier for an entity in the world.
///
/// Entities are represented as a combination of:
/// - `index`: slot in the entity index
/// - `generation`: version counter to detect stale references
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Entity {
    index: u32,
    generation: Generation,
}

impl Entity {
    /// Build an entity from a slot index and generation.
    #[must_use]
    pub const fn new(index: u32, generation: Generation) -> Self {
        Self { index, generation }
    }

    /// Entity in slot `index` with generation zero. Used for builtins.
    #[must_use]
    pub const fn from_index(index: u32) -> Self {
        Self::new(index, Generation::new())
    }

    #[must_use]
    pub const fn index(self) -> u32 {
        self.index
    }

    #[must_use]
    pub const fn generation(self) -> Generation {
        self.generation
    }

    /// Pack into the 64-bit id space.
    #[must_use]
    pub const fn to_bits(self) -> u64 {
        ((self.generation.0 as u64) << 32) | (self.index as u64)
    }

    /// Unpack from the 64-bit id space. Flag bits are ignored.
    #[must_use]
    pub const fn from_bits(bits: u64) -> Self {
        Self {
            index: bits as u32,
            generation: Generation((bits >> 32) as u16),
        }
    }

    /// This entity as a plain component id.
    #[must_use]
    pub const fn id(self) -> Id {
        Id::from_raw(self.to_bits())
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Entity({}v{})", self.index, self.generation.0)
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation.0)
    }
}

bitflags! {
    /// Per-entity flags stored next to its location.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct EntityFlags: u32 {
        /// The entity is the target of a traversable relationship, so moving
        /// it can change what up-traversal resolves to.
        const TRAVERSABLE = 1 << 0;
    }
}

/// Location of a live entity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EntityRecord {
    pub table: TableId,
    pub row: u32,
    pub flags: EntityFlags,
}

impl Default for EntityRecord {
    fn default() -> Self {
        Self {
            table: TableId::ROOT,
            row: 0,
            flags: EntityFlags::empty(),
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct Slot {
    generation: Generation,
    alive: bool,
    record: EntityRecord,
}

/// Generational entity allocator plus the `(table, row)` record of every
/// live entity.
///
/// Slot 0 is reserved so that id 0 never names an entity.
#[derive(Debug)]
pub struct EntityIndex {
    slots: Vec<Slot>,
    free_list: Vec<u32>,
    alive_count: usize,
}

impl Default for EntityIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityIndex {
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: vec![Slot {
                generation: Generation::new(),
                alive: false,
                record: EntityRecord::default(),
            }],
            free_list: Vec::new(),
            alive_count: 0,
        }
    }

    /// Allocate a new entity, recycling a free slot when possible.
    ///
    /// The new entity's record points at row 0 of the root table; the caller
    /// places it for real.
    pub fn allocate(&mut self) -> Entity {
        self.alive_count += 1;

        if let Some(index) = self.free_list.pop() {
            let slot = &mut self.slots[index as usize];
            slot.alive = true;
            slot.record = EntityRecord::default();
            Entity::new(index, slot.generation)
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(Slot {
                generation: Generation::new(),
                alive: true,
                record: EntityRecord::default(),
            });
            Entity::new(index, Generation::new())
        }
    }

    /// Release an entity. Returns `false` if it was not alive.
    pub fn deallocate(&mut self, entity: Entity) -> bool {
        if !self.is_alive(entity) {
            return false;
        }

        let slot = &mut self.slots[entity.index() as usize];
        slot.alive = false;
        slot.generation = slot.generation.next();
        self.free_list.push(entity.index());
        self.alive_count -= 1;
        true
    }

    #[must_use]
    pub fn is_alive(&self, entity: Entity) -> bool {
        self.slots
            .get(entity.index() as usize)
            .is_some_and(|slot| slot.alive && slot.generation == entity.generation())
    }

    /// The live entity currently occupying `index`, if any.
    ///
    /// Pair ids only store indices, so this is how a pair half is turned back
    /// into an entity.
    #[must_use]
    pub fn alive_at(&self, index: u32) -> Option<Entity> {
        let slot = self.slots.get(index as usize)?;
        slot.alive.then(|| Entity::new(index, slot.generation))
    }

    #[must_use]
    pub fn record(&self, entity: Entity) -> Option<&EntityRecord> {
        self.is_alive(entity)
            .then(|| &self.slots[entity.index() as usize].record)
    }

    #[must_use]
    pub fn record_mut(&mut self, entity: Entity) -> Option<&mut EntityRecord> {
        if self.is_alive(entity) {
            Some(&mut self.slots[entity.index() as usize].record)
        } else {
            None
        }
    }

    /// Number of live entities.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.alive_count
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.alive_count == 0
    }
}
