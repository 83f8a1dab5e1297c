//! Component ids and relationship pairs.
//!
//! An [`Id`] is either a plain entity used as a component or tag, or a pair
//! `(relationship, target)`. Pairs set bit 63 and pack the relationship
//! index in bits 32..63 and the target index in bits 0..32. Generations are
//! not part of a pair; the halves are resolved through the entity index.
//!
//! Wildcard ([`WILDCARD`]) and [`ANY`] only appear in query patterns and as
//! the key of the wildcard component records. They are never stored on an
//! entity.

use std::fmt;

use crate::entity::Entity;

/// Marks an id as a `(relationship, target)` pair.
pub const PAIR_FLAG: u64 = 1 << 63;

const INDEX_MASK: u64 = 0xFFFF_FFFF;
const FIRST_MASK: u64 = 0x7FFF_FFFF;

// Builtin entities, reserved in this order when a world is created.

/// Matches any id, once per matching id.
pub const WILDCARD: Entity = Entity::from_index(1);
/// Matches any id, at most once per table.
pub const ANY: Entity = Entity::from_index(2);
/// Hierarchy relationship. Exclusive and traversable.
pub const CHILD_OF: Entity = Entity::from_index(3);
/// Inheritance relationship. Traversable.
pub const IS_A: Entity = Entity::from_index(4);
/// Trait for parents whose children keep an explicit order.
pub const ORDERED_CHILDREN: Entity = Entity::from_index(5);
/// Trait for relationships that up/down traversal may walk.
pub const TRAVERSABLE: Entity = Entity::from_index(6);
/// Trait for components that instances inherit from their `IsA` base.
pub const INHERITABLE: Entity = Entity::from_index(7);
/// Trait for components stored in a sparse set instead of table columns.
pub const SPARSE: Entity = Entity::from_index(8);
/// Trait for relationships that allow a single target per entity.
pub const EXCLUSIVE: Entity = Entity::from_index(9);
/// Tables with this tag are skipped unless a query asks for it.
pub const PREFAB: Entity = Entity::from_index(10);
/// Tables with this tag are skipped unless a query asks for it.
pub const DISABLED: Entity = Entity::from_index(11);
/// Equality predicate for query variables.
pub const PRED_EQ: Entity = Entity::from_index(12);
/// Inequality predicate for query variables.
pub const PRED_NEQ: Entity = Entity::from_index(13);

/// Index of the last builtin entity.
pub(crate) const LAST_BUILTIN: u32 = 13;

/// A component, tag or pair identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Id(u64);

impl Id {
    /// The invalid id.
    pub const NULL: Id = Id(0);

    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// `(rel, tgt)` pair.
    #[must_use]
    pub const fn pair(rel: Entity, tgt: Entity) -> Self {
        Self::pair_from_indices(rel.index(), tgt.index())
    }

    #[must_use]
    pub const fn pair_from_indices(first: u32, second: u32) -> Self {
        Self(PAIR_FLAG | (((first as u64) & FIRST_MASK) << 32) | second as u64)
    }

    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub const fn is_pair(self) -> bool {
        self.0 & PAIR_FLAG != 0
    }

    /// Relationship index of a pair.
    #[must_use]
    pub const fn first(self) -> u32 {
        debug_assert!(self.is_pair());
        ((self.0 >> 32) & FIRST_MASK) as u32
    }

    /// Target index of a pair.
    #[must_use]
    pub const fn second(self) -> u32 {
        debug_assert!(self.is_pair());
        (self.0 & INDEX_MASK) as u32
    }

    /// The entity this id names, for ids that are not pairs.
    #[must_use]
    pub const fn entity(self) -> Option<Entity> {
        if self.is_pair() || self.0 == 0 {
            None
        } else {
            Some(Entity::from_bits(self.0))
        }
    }

    /// Relationship-or-self: the pair's relationship index, or the entity
    /// index of a plain id.
    #[must_use]
    pub const fn first_or_self(self) -> u32 {
        if self.is_pair() {
            self.first()
        } else {
            self.0 as u32
        }
    }

    const fn is_pattern_index(index: u32) -> bool {
        index == WILDCARD.index() || index == ANY.index()
    }

    /// Whether the id contains a wildcard or any in some position.
    #[must_use]
    pub const fn is_wildcard(self) -> bool {
        if self.is_pair() {
            Self::is_pattern_index(self.first()) || Self::is_pattern_index(self.second())
        } else {
            self.0 == WILDCARD.to_bits() || self.0 == ANY.to_bits()
        }
    }

    /// Whether the id uses [`ANY`] in some position.
    #[must_use]
    pub const fn has_any(self) -> bool {
        if self.is_pair() {
            self.first() == ANY.index() || self.second() == ANY.index()
        } else {
            self.0 == ANY.to_bits()
        }
    }

    /// Same id with [`ANY`] replaced by [`WILDCARD`]. Both share the
    /// wildcard component records.
    #[must_use]
    pub const fn any_to_wildcard(self) -> Self {
        if self.is_pair() {
            let first = if self.first() == ANY.index() {
                WILDCARD.index()
            } else {
                self.first()
            };
            let second = if self.second() == ANY.index() {
                WILDCARD.index()
            } else {
                self.second()
            };
            Self::pair_from_indices(first, second)
        } else if self.0 == ANY.to_bits() {
            WILDCARD.id()
        } else {
            self
        }
    }

    /// Whether a stored id satisfies a pattern.
    ///
    /// A plain `*` matches plain ids only. Pairs are matched by `(*, *)`.
    #[must_use]
    pub const fn matches(self, pattern: Id) -> bool {
        if self.0 == pattern.0 {
            return true;
        }
        if !pattern.is_pair() {
            return !self.is_pair()
                && Self::is_pattern_index(pattern.0 as u32)
                && pattern.0 >> 32 == 0;
        }
        if !self.is_pair() {
            return false;
        }

        let first_ok = Self::is_pattern_index(pattern.first()) || pattern.first() == self.first();
        let second_ok =
            Self::is_pattern_index(pattern.second()) || pattern.second() == self.second();
        first_ok && second_ok
    }
}

impl From<Entity> for Id {
    fn from(entity: Entity) -> Self {
        entity.id()
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_pair() {
            write!(f, "({}, {})", self.first(), self.second())
        } else {
            write!(f, "Id({})", self.0)
        }
    }
}
