//! Query terms as the caller describes them, before compilation.

use bitflags::bitflags;

use crate::{
    entity::Entity,
    id::{ANY, Id, WILDCARD},
};

/// One slot of a term: the component/relationship, the target or the source.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TermRef {
    /// The default iteration variable. Binds a table range.
    This,
    Entity(Entity),
    /// A named variable (`$name`). Binds a single entity.
    Var(Box<str>),
    Wildcard,
    Any,
}

impl TermRef {
    #[must_use]
    pub fn var(name: &str) -> Self {
        if name == "this" {
            Self::This
        } else {
            Self::Var(name.into())
        }
    }

    /// The fixed entity index, with wildcard and any mapped to their
    /// builtins. `None` for variables.
    pub(crate) fn fixed_index(&self) -> Option<u32> {
        match self {
            Self::Entity(e) => Some(e.index()),
            Self::Wildcard => Some(WILDCARD.index()),
            Self::Any => Some(ANY.index()),
            Self::This | Self::Var(_) => None,
        }
    }

    pub(crate) const fn is_pattern(&self) -> bool {
        matches!(self, Self::Wildcard | Self::Any)
    }

    pub(crate) const fn is_var(&self) -> bool {
        matches!(self, Self::This | Self::Var(_))
    }
}

impl From<Entity> for TermRef {
    fn from(entity: Entity) -> Self {
        Self::Entity(entity)
    }
}

/// How a term combines with the rest of the query.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Oper {
    #[default]
    And,
    /// Consecutive `Or` terms form one chain that matches if any member does.
    Or,
    Not,
    Optional,
}

/// Declared access to a field.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum InOut {
    /// Read-write for `$this` fields, read-only for other sources.
    #[default]
    Default,
    In,
    InOut,
    Out,
    /// The field is matched but never accessed.
    None,
}

bitflags! {
    /// Where a term looks for its id.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct TravFlags: u8 {
        /// On the source itself.
        const SELF = 1 << 0;
        /// On ancestors of the source, following [`Term::trav`].
        const UP = 1 << 1;
        /// Like `UP`, and group cached results by hierarchy depth so
        /// parents are iterated before their children.
        const CASCADE = 1 << 2;
        /// With `CASCADE`, iterate the deepest tables first.
        const DESC = 1 << 3;
    }
}

/// A single query term.
///
/// The id is `first` for plain terms or `(first, second)` for pairs. An empty
/// `flags` lets the compiler pick the traversal: `self|up(IsA)` for
/// inheritable components, `self` otherwise.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Term {
    pub first: TermRef,
    pub second: Option<TermRef>,
    pub src: TermRef,
    pub oper: Oper,
    pub inout: InOut,
    /// Relationship walked for `up`.
    pub trav: Option<Entity>,
    pub flags: TravFlags,
}

impl Term {
    /// Term for a plain id on `$this`.
    #[must_use]
    pub fn new(first: impl Into<TermRef>) -> Self {
        Self {
            first: first.into(),
            second: None,
            src: TermRef::This,
            oper: Oper::And,
            inout: InOut::Default,
            trav: None,
            flags: TravFlags::empty(),
        }
    }

    /// Term for a pair on `$this`.
    #[must_use]
    pub fn pair(first: impl Into<TermRef>, second: impl Into<TermRef>) -> Self {
        Self {
            second: Some(second.into()),
            ..Self::new(first)
        }
    }

    /// Term for an existing id. Pair halves become entity references with
    /// generation 0, which is what pairs store.
    #[must_use]
    pub fn from_id(id: Id) -> Self {
        let slot = |index: u32| {
            if index == WILDCARD.index() {
                TermRef::Wildcard
            } else if index == ANY.index() {
                TermRef::Any
            } else {
                TermRef::Entity(Entity::from_index(index))
            }
        };
        if id.is_pair() {
            Self::pair(slot(id.first()), slot(id.second()))
        } else if id == WILDCARD.id() {
            Self::new(TermRef::Wildcard)
        } else if id == ANY.id() {
            Self::new(TermRef::Any)
        } else {
            Self::new(Entity::from_bits(id.raw()))
        }
    }

    #[must_use]
    pub fn src(mut self, src: impl Into<TermRef>) -> Self {
        self.src = src.into();
        self
    }

    #[must_use]
    pub const fn oper(mut self, oper: Oper) -> Self {
        self.oper = oper;
        self
    }

    #[must_use]
    pub const fn inout(mut self, inout: InOut) -> Self {
        self.inout = inout;
        self
    }

    /// Match on ancestors via `rel` only.
    #[must_use]
    pub const fn up(mut self, rel: Entity) -> Self {
        self.trav = Some(rel);
        self.flags = TravFlags::UP;
        self
    }

    /// Match on the source, or on ancestors via `rel` if the source does not
    /// have the id.
    #[must_use]
    pub const fn self_up(mut self, rel: Entity) -> Self {
        self.trav = Some(rel);
        self.flags = TravFlags::SELF.union(TravFlags::UP);
        self
    }

    /// Match on ancestors via `rel` and iterate tables breadth-first by
    /// their depth in the `rel` hierarchy.
    #[must_use]
    pub const fn cascade(mut self, rel: Entity) -> Self {
        self.trav = Some(rel);
        self.flags = TravFlags::UP.union(TravFlags::CASCADE);
        self
    }

    /// Reverse the order of a cascade term.
    #[must_use]
    pub const fn desc(mut self) -> Self {
        self.flags = self.flags.union(TravFlags::DESC);
        self
    }

    /// Match on the source only, even for inheritable components.
    #[must_use]
    pub const fn self_only(mut self) -> Self {
        self.trav = None;
        self.flags = TravFlags::SELF;
        self
    }

    /// The id when both halves are fixed.
    #[must_use]
    pub fn fixed_id(&self) -> Option<Id> {
        match &self.second {
            None => match &self.first {
                TermRef::Entity(e) => Some(e.id()),
                TermRef::Wildcard => Some(WILDCARD.id()),
                TermRef::Any => Some(ANY.id()),
                TermRef::This | TermRef::Var(_) => None,
            },
            Some(second) => Some(Id::pair_from_indices(
                self.first.fixed_index()?,
                second.fixed_index()?,
            )),
        }
    }

    /// `$x == e` / `$x != e` style comparison.
    #[must_use]
    pub fn is_predicate(&self) -> bool {
        matches!(&self.first, TermRef::Entity(e) if e.index() == crate::id::PRED_EQ.index()
            || e.index() == crate::id::PRED_NEQ.index())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::CHILD_OF;

    #[test]
    fn test_fixed_id() {
        let e = Entity::from_index(42);
        assert_eq!(Term::new(e).fixed_id(), Some(e.id()));
        assert_eq!(
            Term::pair(CHILD_OF, TermRef::Wildcard).fixed_id(),
            Some(Id::pair(CHILD_OF, WILDCARD))
        );
        assert_eq!(Term::pair(CHILD_OF, TermRef::var("p")).fixed_id(), None);
    }

    #[test]
    fn test_from_id_round_trips_pairs() {
        let id = Id::pair(CHILD_OF, Entity::from_index(77));
        assert_eq!(Term::from_id(id).fixed_id(), Some(id));
        assert_eq!(Term::from_id(WILDCARD.id()).first, TermRef::Wildcard);
    }

    #[test]
    fn test_cascade_implies_up() {
        let term = Term::new(Entity::from_index(42)).cascade(CHILD_OF).desc();
        assert!(term.flags.contains(TravFlags::UP | TravFlags::CASCADE | TravFlags::DESC));
        assert!(!term.flags.contains(TravFlags::SELF));
        assert_eq!(term.trav, Some(CHILD_OF));
    }

    #[test]
    fn test_this_var_name() {
        assert_eq!(TermRef::var("this"), TermRef::This);
        assert_eq!(TermRef::var("x"), TermRef::Var("x".into()));
    }
}
