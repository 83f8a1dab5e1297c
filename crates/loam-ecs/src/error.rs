//! ECS error types.

use thiserror::Error;

use crate::{entity::Entity, id::Id};

/// Semantic errors reported by the query compiler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryError {
    #[error("query has no terms")]
    NoTerms,

    #[error("query has {0} fields, at most 64 are supported")]
    TooManyFields(usize),

    /// `$this` is referenced but no positive term binds it.
    #[error("$this is used but never bound by a positive term")]
    UnboundThis,

    #[error("term {0} uses a wildcard as its source")]
    WildcardSource(usize),

    #[error("term {0} traverses a relationship that is not traversable")]
    NotTraversable(usize),

    #[error("term {0} traverses with a wildcard id")]
    WildcardTraversal(usize),

    #[error("or chain at term {0} mixes sources or uses traversal")]
    InvalidOr(usize),

    #[error("predicate at term {0} must compare a named variable")]
    InvalidPredicate(usize),

    #[error("unknown variable `{0}`")]
    UnknownVariable(String),

    #[error("term {0} has an invalid id")]
    InvalidTermId(usize),

    #[error("query uses {0} variables, at most 64 are supported")]
    TooManyVariables(usize),

    /// The query asked for a full cache but term {0} cannot be cached.
    #[error("term {0} cannot be cached")]
    NotCacheable(usize),

    /// A second cascade term, `desc` without `cascade`, a cascade that is
    /// not on `$this`, or cascade combined with `group_by`.
    #[error("invalid cascade at term {0}")]
    InvalidCascade(usize),

    /// The `order_by` component is not a self term on `$this`.
    #[error("order_by component {0:?} is not queried on $this")]
    InvalidOrderBy(Id),

    /// Cascade and `order_by` need a query cache.
    #[error("query needs a cache but caching is disabled")]
    CacheRequired,
}

/// ECS error type.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EcsError {
    /// The entity is not alive.
    #[error("entity not alive: {0:?}")]
    NotAlive(Entity),

    /// Id 0, a wildcard, or a pair with a zero half.
    #[error("invalid id: {0:?}")]
    InvalidId(Id),

    /// A data component was added without a value and has no constructor.
    #[error("component {0:?} has no default constructor")]
    MissingConstructor(Id),

    /// The Rust type does not match the registered component.
    #[error("type mismatch for component {0:?}")]
    TypeMismatch(Id),

    /// The id is a tag and carries no data.
    #[error("component {0:?} has no data")]
    NoData(Id),

    /// A child order is not a permutation of the existing children.
    #[error("invalid child order for {0:?}")]
    InvalidChildOrder(Entity),

    /// The parent does not keep its children ordered.
    #[error("{0:?} does not have ordered children")]
    NotOrdered(Entity),

    /// Another entity already has this name.
    #[error("name already in use: {0}")]
    NameInUse(String),

    /// A storage trait was changed for an id already in use.
    #[error("trait cannot change after {0:?} is in use")]
    TraitAfterUse(Id),

    /// The query handle was destroyed.
    #[error("query does not exist")]
    NoSuchQuery,

    /// The component has no clone hook and is not plain data.
    #[error("component {0:?} cannot be cloned")]
    MissingClone(Id),

    #[error("stage index {0} out of range")]
    NoSuchStage(usize),

    #[error(transparent)]
    Query(#[from] QueryError),
}

/// Result type for ECS operations.
pub type EcsResult<T> = Result<T, EcsError>;
