// Allow unsafe code in ECS - column storage is type-erased
#![allow(unsafe_code)]
#![allow(missing_docs)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_safety_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_fields_in_debug)]
#![allow(clippy::manual_let_else)]
#![allow(clippy::ptr_as_ptr)]
#![allow(clippy::ref_as_ptr)]
#![allow(clippy::cast_ptr_alignment)]
#![allow(clippy::float_cmp)]

//! loam ECS - archetype storage and query engine
//!
//! Entities with the same set of ids share a table. Ids are components,
//! tags or `(relationship, target)` pairs, and component records index
//! which tables hold each id and each id pattern.
//!
//! # Key Concepts
//!
//! - **Entity**: a generational handle; also usable as an id.
//! - **Id**: a component, tag or pair. `Wildcard` and `Any` form patterns.
//! - **Table**: rows of entities with the same type, one column per data
//!   component.
//! - **Component record**: the tables of one id or pattern, split into empty
//!   and non-empty lists.
//! - **Query**: terms compiled into a small program, optionally backed by a
//!   cache that the world updates as tables come and go.
//! - **Traits**: builtin tags such as `Traversable`, `Exclusive` or
//!   `Sparse` that change how an id behaves when added to it.
//!
//! # Example
//!
//! ```ignore
//! let mut world = World::new();
//! let e = world.new_entity();
//! world.set(e, Position { x: 10.0, y: 20.0 })?;
//!
//! let query = world.query().with::<Position>().cache_kind(CacheKind::Auto).build()?;
//! let mut it = query.iter(&world);
//! while it.next() {
//!     for pos in it.field::<Position>(0).unwrap().iter() {
//!         // ...
//!     }
//! }
//! ```

mod component;
mod component_record;
mod entity;
mod error;
mod id;
mod ordered_children;
pub mod query;
mod sparse;
mod stage;
mod storage;
mod table;
mod table_cache;
mod world;

pub use component::{CloneFn, Component, ComponentInfo, CtorFn, DtorFn, TypeHooks};
pub use component_record::{ComponentIndex, ComponentRecord, ComponentRecordFlags, TableRecord};
pub use entity::{Entity, EntityFlags, EntityIndex, EntityRecord, Generation};
pub use error::{EcsError, EcsResult, QueryError};
pub use id::{
    ANY, CHILD_OF, DISABLED, EXCLUSIVE, INHERITABLE, IS_A, Id, ORDERED_CHILDREN, PRED_EQ, PRED_NEQ,
    PREFAB, SPARSE, TRAVERSABLE, WILDCARD,
};
pub use ordered_children::OrderedChildren;
pub use query::{
    CacheKind, Field, FieldMut, InOut, Oper, Query, QueryBuilder, QueryDesc, QueryId, QueryIter,
    Term, TermRef, TravFlags,
};
pub use sparse::SparseStorage;
pub use stage::{Command, SetFn, Stage};
pub use storage::Column;
pub use table::{Table, TableFlags, TableId};
pub use table_cache::{CacheCursor, CacheIter, CacheIterKind, TableCache};
pub use world::{World, WorldConfig};

/// Route `tracing` output of a test through the test harness. Filtered by
/// `RUST_LOG`.
#[cfg(test)]
pub(crate) fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::{
        CHILD_OF, CacheKind, Component, EcsError, EcsResult, Entity, IS_A, Id, Query, QueryIter,
        TermRef, World, WorldConfig,
    };
}
