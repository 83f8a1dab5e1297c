//! World - the container for all entities, tables and query caches.
//!
//! The world owns the entity index, the component records (one per id and
//! id pattern), the tables and the caches of cached queries. Every
//! structural change goes through a single commit step that moves a row
//! between tables and keeps component records, ordered children, traversal
//! flags and query caches in sync.
//!
//! Builtin entities (`Wildcard`, `ChildOf`, the traits, ...) are created by
//! [`World::new`] and occupy the lowest entity indices.

use std::{alloc::Layout, any::TypeId, cell::RefCell, fmt};

use hashbrown::HashSet;
use loam_collections::{Allocator, HashMap, Map, OsApi, StackAllocator, hash_of};
use rustc_hash::FxHashMap;
use smallvec::{SmallVec, smallvec};
use tracing::{debug, trace, warn};

use crate::{
    component::{Component, ComponentInfo, TypeHooks},
    component_record::{ComponentIndex, ComponentRecord, ComponentRecordFlags},
    entity::{Entity, EntityFlags, EntityIndex, EntityRecord},
    error::{EcsError, EcsResult},
    id::{
        CHILD_OF, DISABLED, EXCLUSIVE, INHERITABLE, IS_A, Id, LAST_BUILTIN, ORDERED_CHILDREN,
        PREFAB, SPARSE, TRAVERSABLE, WILDCARD,
    },
    ordered_children::OrderedChildren,
    query::{Query, QueryBuilder, QueryCache, QueryDesc, QueryId, compiler},
    sparse::SparseStorage,
    stage::{Command, Stage},
    table::{Table, TableFlags, TableId, table_records},
};

/// Names of the builtin entities, in index order starting at 1.
const BUILTIN_NAMES: [&str; LAST_BUILTIN as usize] = [
    "Wildcard",
    "Any",
    "ChildOf",
    "IsA",
    "OrderedChildren",
    "Traversable",
    "Inheritable",
    "Sparse",
    "Exclusive",
    "Prefab",
    "Disabled",
    "PredEq",
    "PredNeq",
];

/// Builtin entities that change how an id is stored or traversed when added
/// to its relationship or component entity.
const TRAITS: [Entity; 5] = [TRAVERSABLE, INHERITABLE, EXCLUSIVE, SPARSE, ORDERED_CHILDREN];

/// World construction options.
#[derive(Clone, Copy)]
pub struct WorldConfig {
    /// Allocation primitives for column storage and query scratch memory.
    pub os: OsApi,
    /// Number of command stages, including the main stage.
    pub stage_count: usize,
    /// Whether queries match empty tables unless they say otherwise.
    pub default_match_empty: bool,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            os: OsApi::system(),
            stage_count: 1,
            default_match_empty: false,
        }
    }
}

impl fmt::Debug for WorldConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorldConfig")
            .field("stage_count", &self.stage_count)
            .field("default_match_empty", &self.default_match_empty)
            .finish_non_exhaustive()
    }
}

#[allow(clippy::borrowed_box)]
fn hash_type(type_: &Box<[Id]>) -> u64 {
    hash_of(&**type_)
}

#[allow(clippy::borrowed_box)]
fn eq_type(a: &Box<[Id]>, b: &Box<[Id]>) -> bool {
    a == b
}

#[allow(clippy::borrowed_box)]
fn hash_name(name: &Box<str>) -> u64 {
    hash_of(&**name)
}

#[allow(clippy::borrowed_box)]
fn eq_name(a: &Box<str>, b: &Box<str>) -> bool {
    a == b
}

fn trait_of(id: Id) -> Option<Entity> {
    id.entity().filter(|e| TRAITS.contains(e))
}

/// Whether `id` is `entity` itself or a pair with `entity` as relationship.
fn owned_by(id: Id, entity: Entity) -> bool {
    if id.is_pair() {
        id.first() == entity.index()
    } else {
        id == entity.id()
    }
}

/// Whether `id` refers to `entity` in any position.
fn refers_to(id: Id, entity: Entity) -> bool {
    owned_by(id, entity) || (id.is_pair() && id.second() == entity.index())
}

fn trait_flag(trait_: Entity) -> ComponentRecordFlags {
    if trait_ == TRAVERSABLE {
        ComponentRecordFlags::TRAVERSABLE
    } else if trait_ == INHERITABLE {
        ComponentRecordFlags::INHERITABLE
    } else if trait_ == EXCLUSIVE {
        ComponentRecordFlags::EXCLUSIVE
    } else {
        ComponentRecordFlags::empty()
    }
}

/// Ids only in `dst` and ids only in `src`. Both types are sorted.
fn type_diff(src: &[Id], dst: &[Id]) -> (SmallVec<[Id; 4]>, SmallVec<[Id; 4]>) {
    let added = dst
        .iter()
        .copied()
        .filter(|id| src.binary_search(id).is_err())
        .collect();
    let removed = src
        .iter()
        .copied()
        .filter(|id| dst.binary_search(id).is_err())
        .collect();
    (added, removed)
}

fn table_at(tables: &mut [Option<Table>], id: TableId) -> &mut Table {
    match tables.get_mut(id.index()).and_then(Option::as_mut) {
        Some(table) => table,
        None => unreachable!("table {id:?} does not exist"),
    }
}

/// Mutable access to two distinct tables.
fn table_pair(tables: &mut [Option<Table>], a: TableId, b: TableId) -> (&mut Table, &mut Table) {
    debug_assert_ne!(a, b);
    let (lo, hi) = (a.index().min(b.index()), a.index().max(b.index()));
    let (left, right) = tables.split_at_mut(hi);
    match (left[lo].as_mut(), right[0].as_mut()) {
        (Some(low), Some(high)) if a.index() < b.index() => (low, high),
        (Some(low), Some(high)) => (high, low),
        _ => unreachable!("table {a:?} or {b:?} does not exist"),
    }
}

/// The ECS world.
pub struct World {
    alloc: Allocator,
    stack: StackAllocator,
    entities: EntityIndex,
    components: ComponentIndex,
    /// Type info of data components, keyed by component entity index.
    type_infos: Map<ComponentInfo>,
    type_ids: FxHashMap<TypeId, Entity>,
    /// Deleted tables leave a hole; table ids are never reused.
    tables: Vec<Option<Table>>,
    table_index: HashMap<Box<[Id]>, TableId>,
    names: HashMap<Box<str>, Entity>,
    entity_names: Map<Box<str>>,
    queries: Vec<Option<RefCell<QueryCache>>>,
    stages: Vec<Stage>,
    defer_depth: u32,
    defer_suspended: bool,
    config: WorldConfig,
}

impl Default for World {
    fn default() -> Self {
        Self::new()
    }
}

impl World {
    /// Create a world with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(WorldConfig::default())
    }

    #[must_use]
    pub fn with_config(config: WorldConfig) -> Self {
        let root = Table::new(
            TableId::ROOT,
            Box::new([]),
            Vec::new(),
            TableFlags::empty(),
            None,
        );
        let mut table_index = HashMap::new(hash_type, eq_type);
        table_index.insert(Box::default(), TableId::ROOT);

        let mut world = Self {
            alloc: Allocator::with_os(config.os),
            stack: StackAllocator::with_os(config.os),
            entities: EntityIndex::new(),
            components: ComponentIndex::new(),
            type_infos: Map::new(),
            type_ids: FxHashMap::default(),
            tables: vec![Some(root)],
            table_index,
            names: HashMap::new(hash_name, eq_name),
            entity_names: Map::new(),
            queries: Vec::new(),
            stages: (0..config.stage_count.max(1)).map(Stage::new).collect(),
            defer_depth: 0,
            defer_suspended: false,
            config,
        };
        world.init_builtins();
        world
    }

    fn init_builtins(&mut self) {
        for name in BUILTIN_NAMES {
            let entity = self.new_entity();
            self.insert_name(entity, name);
        }
        for (entity, trait_) in [
            (CHILD_OF, TRAVERSABLE),
            (CHILD_OF, EXCLUSIVE),
            (IS_A, TRAVERSABLE),
        ] {
            if let Err(err) = self.add_id_now(entity, trait_.id()) {
                unreachable!("builtin trait rejected: {err}");
            }
        }
        debug!(builtins = LAST_BUILTIN, "world initialized");
    }

    #[must_use]
    pub const fn config(&self) -> &WorldConfig {
        &self.config
    }

    /// Scratch allocator for query iteration.
    #[must_use]
    pub const fn stack(&self) -> &StackAllocator {
        &self.stack
    }

    // ==================== Entity Operations ====================

    /// Create an empty entity in the root table.
    pub fn new_entity(&mut self) -> Entity {
        let entity = self.entities.allocate();
        let root = table_at(&mut self.tables, TableId::ROOT);
        // SAFETY: the root table has no columns
        let row = unsafe { root.append(&mut self.alloc, entity, None) };
        if let Some(record) = self.entities.record_mut(entity) {
            *record = EntityRecord {
                table: TableId::ROOT,
                row,
                flags: EntityFlags::empty(),
            };
        }
        trace!(%entity, "new entity");
        entity
    }

    /// Delete an entity.
    ///
    /// Children (`ChildOf` the entity) are deleted first. Pairs targeting the
    /// entity are removed from other entities, and when the entity was used
    /// as a component or relationship, those ids are removed too and the
    /// tables that referenced it are deleted.
    pub fn delete(&mut self, entity: Entity) -> EcsResult<()> {
        self.check_alive(entity)?;
        if entity.index() <= LAST_BUILTIN {
            return Err(EcsError::InvalidId(entity.id()));
        }
        if self.is_deferred() {
            self.stages[0].delete(entity);
            return Ok(());
        }
        self.delete_now(entity);
        Ok(())
    }

    /// Delete `entity` and its `ChildOf` subtree, deepest entities first.
    fn delete_now(&mut self, entity: Entity) {
        if !self.is_alive(entity) {
            return;
        }
        let mut subtree = vec![entity];
        let mut seen = HashSet::new();
        seen.insert(entity);
        let mut i = 0;
        while i < subtree.len() {
            let node = subtree[i];
            i += 1;
            for child in self.holders(Id::pair(CHILD_OF, node)) {
                if seen.insert(child) {
                    subtree.push(child);
                }
            }
        }
        debug!(%entity, count = subtree.len(), "deleting entity");

        for node in subtree.into_iter().rev() {
            self.delete_single(node);
        }
    }

    fn delete_single(&mut self, entity: Entity) {
        if !self.is_alive(entity) {
            return;
        }
        let used_as_id = [
            entity.id(),
            Id::pair(entity, WILDCARD),
            Id::pair(WILDCARD, entity),
        ]
        .into_iter()
        .any(|id| self.components.contains(id));
        if used_as_id {
            self.strip_id(Id::pair(WILDCARD, entity));
            self.strip_id(entity.id());
            self.strip_id(Id::pair(entity, WILDCARD));
        }

        self.remove_row(entity);

        if used_as_id {
            self.delete_references(entity);
        }

        self.remove_name(entity);
        if self.type_infos.remove(u64::from(entity.index())).is_some() {
            self.type_ids.retain(|_, component| *component != entity);
        }
        self.entities.deallocate(entity);
        trace!(%entity, "deleted entity");
    }

    /// Remove every id matching `pattern` from all entities that have it.
    fn strip_id(&mut self, pattern: Id) {
        let tables: Vec<TableId> = match self.components.get(pattern) {
            Some(record) => record.cache.iter_fill().map(|(table, _)| table).collect(),
            None => return,
        };
        for table in tables {
            let ids: SmallVec<[Id; 4]> = self
                .table_ref(table)
                .type_ids()
                .iter()
                .copied()
                .filter(|id| id.matches(pattern))
                .collect();
            let dst = self.table_without(table, &ids);
            while let Some(holder) = self.table_ref(table).entities().last().copied() {
                self.commit(holder, dst, None);
            }
        }
    }

    /// Remove the row of a live entity from its table.
    fn remove_row(&mut self, entity: Entity) {
        let Some(record) = self.entities.record(entity).copied() else {
            return;
        };
        let sparse: SmallVec<[Id; 4]> = self
            .table_ref(record.table)
            .type_ids()
            .iter()
            .copied()
            .filter(|id| self.components.get(*id).is_some_and(ComponentRecord::is_sparse))
            .collect();
        for id in sparse {
            if let Some(storage) = self.components.get_mut(id).and_then(|r| r.sparse.as_mut()) {
                storage.remove(entity);
            }
        }

        let table = table_at(&mut self.tables, record.table);
        let parent = table.parent();
        let swapped = table.delete_row(record.row);
        if record.flags.contains(EntityFlags::TRAVERSABLE) {
            table.add_traversable(-1);
        }
        let now_empty = table.is_empty();

        if let Some(swapped) = swapped
            && let Some(swapped_record) = self.entities.record_mut(swapped)
        {
            swapped_record.row = record.row;
        }
        if now_empty {
            self.set_table_empty(record.table, true);
        }
        if let Some(parent) = parent {
            self.components.unparent(entity, parent);
        }
    }

    /// Delete the tables and component records of ids that refer to a
    /// deleted entity. All such tables are empty at this point.
    fn delete_references(&mut self, entity: Entity) {
        let ids: Vec<Id> = self
            .components
            .ids()
            .into_iter()
            .filter(|id| refers_to(*id, entity))
            .collect();

        let mut tables: Vec<TableId> = Vec::new();
        for id in &ids {
            if let Some(record) = self.components.get(*id) {
                tables.extend(record.cache.iter_all().map(|(table, _)| table));
            }
        }
        tables.sort_unstable();
        tables.dedup();
        for table in tables {
            self.delete_table(table);
        }

        for id in ids {
            if let Some(mut record) = self.components.remove(id)
                && let Some(storage) = record.sparse.as_mut()
            {
                storage.fini(&mut self.alloc);
            }
        }
    }

    /// Remove all ids from an entity.
    pub fn clear(&mut self, entity: Entity) -> EcsResult<()> {
        self.check_alive(entity)?;
        if self.is_deferred() {
            self.stages[0].clear(entity);
            return Ok(());
        }
        let src = self.record_of(entity)?.table;
        let removed: SmallVec<[Id; 8]> = self.table_ref(src).type_ids().iter().copied().collect();
        for id in &removed {
            self.check_trait_change(entity, *id)?;
        }
        self.commit(entity, TableId::ROOT, None);
        for trait_ in removed.into_iter().filter_map(trait_of) {
            self.on_trait_removed(entity, trait_);
        }
        Ok(())
    }

    /// Create a new entity with the ids of `entity`. Values are cloned when
    /// `copy_values` is set and default-constructed otherwise.
    ///
    /// While deferred the clone is created empty right away and filled in
    /// when the stage merges.
    pub fn clone_entity(&mut self, entity: Entity, copy_values: bool) -> EcsResult<Entity> {
        self.check_clone(entity, copy_values)?;
        if self.is_deferred() {
            let clone = self.new_entity();
            self.stages[0].clone_entity(entity, clone, copy_values);
            return Ok(clone);
        }
        let clone = self.entities.allocate();
        self.clone_row(entity, clone, copy_values);
        Ok(clone)
    }

    /// Replace the ids and values of `dst` with those of `entity`.
    pub(crate) fn clone_into(&mut self, entity: Entity, dst: Entity, copy_values: bool) -> EcsResult<()> {
        self.check_alive(dst)?;
        self.check_clone(entity, copy_values)?;
        self.clear(dst)?;
        let traversable = self
            .record_of(dst)?
            .flags
            .contains(EntityFlags::TRAVERSABLE);
        self.remove_row(dst);
        self.clone_row(entity, dst, copy_values);
        if traversable {
            self.mark_traversable(dst);
        }
        Ok(())
    }

    /// Every column and sparse value of `entity` supports the clone.
    fn check_clone(&self, entity: Entity, copy_values: bool) -> EcsResult<()> {
        let table = self.table_ref(self.record_of(entity)?.table);
        let check = |id: Id, info: &ComponentInfo| {
            if copy_values && !info.can_clone() {
                return Err(EcsError::MissingClone(id));
            }
            if !copy_values && !info.has_ctor() {
                return Err(EcsError::MissingConstructor(id));
            }
            Ok(())
        };
        for column in 0..table.column_count() {
            check(table.column_id(column), table.column(column).info())?;
        }
        for &id in table.type_ids() {
            if let Some(record) = self.components.get(id).filter(|r| r.is_sparse())
                && let Some(info) = record.type_info()
            {
                check(id, info)?;
            }
        }
        Ok(())
    }

    /// Append a copy of the row of `entity` for `clone`, which has no row.
    fn clone_row(&mut self, entity: Entity, clone: Entity, copy_values: bool) {
        let Some(record) = self.entities.record(entity).copied() else {
            return;
        };
        let table = self.table_ref(record.table);
        let sparse: SmallVec<[Id; 4]> = table
            .type_ids()
            .iter()
            .copied()
            .filter(|id| self.components.get(*id).is_some_and(ComponentRecord::is_sparse))
            .collect();
        let parent = table.parent();

        let table = table_at(&mut self.tables, record.table);
        // SAFETY: every column supports the requested operation
        let row = unsafe { table.clone_row(&mut self.alloc, record.row, clone, copy_values) };
        if let Some(clone_record) = self.entities.record_mut(clone) {
            *clone_record = EntityRecord {
                table: record.table,
                row,
                flags: EntityFlags::empty(),
            };
        }

        for id in sparse {
            let Some(storage) = self.components.get_mut(id).and_then(|r| r.sparse.as_mut()) else {
                continue;
            };
            let (slot, _) = storage.ensure(&mut self.alloc, clone);
            let src = storage.get(entity);
            if let (Some(dst), Some(info)) = (slot, storage.info()) {
                // SAFETY: checked by `check_clone`; `dst` is a fresh slot
                let done = unsafe {
                    match src {
                        Some(src) if copy_values => info.clone_into(src, dst),
                        _ => info.construct(dst),
                    }
                };
                debug_assert!(done);
            }
        }

        self.components.reparent(clone, None, parent);
        trace!(%entity, %clone, "cloned entity");
    }

    #[must_use]
    pub fn is_alive(&self, entity: Entity) -> bool {
        self.entities.is_alive(entity)
    }

    /// Number of live entities, builtins included.
    #[must_use]
    pub const fn entity_count(&self) -> usize {
        self.entities.len()
    }

    /// The live entity at an index, used to resolve pair halves.
    #[must_use]
    pub fn entity_at(&self, index: u32) -> Option<Entity> {
        self.entities.alive_at(index)
    }

    #[must_use]
    pub fn entity_record(&self, entity: Entity) -> Option<&EntityRecord> {
        self.entities.record(entity)
    }

    /// Table that stores `entity`.
    #[must_use]
    pub fn table_of(&self, entity: Entity) -> Option<TableId> {
        self.entities.record(entity).map(|record| record.table)
    }

    fn record_of(&self, entity: Entity) -> EcsResult<&EntityRecord> {
        self.entities
            .record(entity)
            .ok_or(EcsError::NotAlive(entity))
    }

    fn check_alive(&self, entity: Entity) -> EcsResult<()> {
        if self.is_alive(entity) {
            Ok(())
        } else {
            Err(EcsError::NotAlive(entity))
        }
    }

    /// Ids that can be added: not null, not a pattern, naming live entities.
    fn check_id(&self, id: Id) -> EcsResult<()> {
        let valid = if id.is_null() || id.is_wildcard() {
            false
        } else if id.is_pair() {
            id.first() != 0
                && id.second() != 0
                && self.entity_at(id.first()).is_some()
                && self.entity_at(id.second()).is_some()
        } else {
            id.entity().is_some_and(|entity| self.is_alive(entity))
        };
        if valid {
            Ok(())
        } else {
            Err(EcsError::InvalidId(id))
        }
    }

    // ==================== Named Entity Operations ====================

    /// Create an entity with a unique name.
    pub fn new_named(&mut self, name: &str) -> EcsResult<Entity> {
        if self.lookup(name).is_some() {
            return Err(EcsError::NameInUse(name.to_owned()));
        }
        let entity = self.new_entity();
        self.insert_name(entity, name);
        Ok(entity)
    }

    /// Name an entity, replacing its previous name.
    pub fn set_name(&mut self, entity: Entity, name: &str) -> EcsResult<()> {
        self.check_alive(entity)?;
        match self.lookup(name) {
            Some(owner) if owner == entity => return Ok(()),
            Some(_) => return Err(EcsError::NameInUse(name.to_owned())),
            None => {}
        }
        self.remove_name(entity);
        self.insert_name(entity, name);
        Ok(())
    }

    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<Entity> {
        self.names.get(&Box::from(name)).copied()
    }

    #[must_use]
    pub fn name(&self, entity: Entity) -> Option<&str> {
        if !self.is_alive(entity) {
            return None;
        }
        self.entity_names
            .get(u64::from(entity.index()))
            .map(|name| &**name)
    }

    fn insert_name(&mut self, entity: Entity, name: &str) {
        self.names.insert(name.into(), entity);
        self.entity_names
            .insert(u64::from(entity.index()), name.into());
    }

    fn remove_name(&mut self, entity: Entity) {
        if let Some(name) = self.entity_names.remove(u64::from(entity.index())) {
            self.names.remove(&name);
        }
    }

    // ==================== Component Registration ====================

    /// Component entity for `T`, registered on first use.
    ///
    /// Data components get a destructor but no constructor, so they can
    /// only be added with a value. See [`World::component_default`].
    pub fn component<T: Component>(&mut self) -> Entity {
        if let Some(&entity) = self.type_ids.get(&TypeId::of::<T>()) {
            return entity;
        }
        let entity = self.new_entity();
        let info = ComponentInfo::of::<T>();
        if info.size() > 0 {
            self.type_infos.insert(u64::from(entity.index()), info);
        }
        self.type_ids.insert(TypeId::of::<T>(), entity);
        debug!(%entity, name = std::any::type_name::<T>(), "registered component");
        entity
    }

    /// Register `T` with a `T::default()` constructor, so it can be added
    /// without a value.
    pub fn component_default<T: Component + Default>(&mut self) -> Entity {
        let entity = self.component::<T>();
        if let Some(info) = self.type_info(entity)
            && !info.has_ctor()
        {
            let hooks = TypeHooks {
                ctor: TypeHooks::of::<T>().with_default::<T>().ctor,
                ..*info.hooks()
            };
            self.update_hooks(entity, hooks);
        }
        entity
    }

    /// Register `T` with a clone hook, for [`World::clone_entity`].
    pub fn component_clone<T: Component + Clone>(&mut self) -> Entity {
        let entity = self.component::<T>();
        if let Some(info) = self.type_info(entity)
            && info.hooks().clone.is_none()
        {
            let hooks = TypeHooks {
                clone: TypeHooks::of::<T>().with_clone::<T>().clone,
                ..*info.hooks()
            };
            self.update_hooks(entity, hooks);
        }
        entity
    }

    fn update_hooks(&mut self, component: Entity, hooks: TypeHooks) {
        if let Err(err) = self.set_hooks(component, hooks) {
            warn!(%component, %err, "component hooks not updated");
        }
    }

    /// Register a component that has no Rust type.
    pub fn register_component(
        &mut self,
        name: &str,
        layout: Layout,
        hooks: TypeHooks,
    ) -> EcsResult<Entity> {
        let entity = self.new_named(name)?;
        if layout.size() > 0 {
            self.type_infos.insert(
                u64::from(entity.index()),
                ComponentInfo::new(name, layout, hooks),
            );
        }
        debug!(%entity, name, size = layout.size(), "registered component");
        Ok(entity)
    }

    /// Replace the hooks of a data component. Only allowed before the
    /// component is stored anywhere.
    pub fn set_hooks(&mut self, component: Entity, hooks: TypeHooks) -> EcsResult<()> {
        self.check_alive(component)?;
        if self.id_in_use(component) {
            return Err(EcsError::TraitAfterUse(component.id()));
        }
        let Some(info) = self.type_infos.get_mut(u64::from(component.index())) else {
            return Err(EcsError::NoData(component.id()));
        };
        info.set_hooks(hooks);
        let info = info.clone();

        for record in self
            .components
            .iter_mut()
            .filter(|r| owned_by(r.id(), component) && !r.id().is_wildcard())
        {
            record.type_info = Some(info.clone());
            if record.sparse.is_some() {
                record.sparse = Some(SparseStorage::new(Some(info.clone())));
            }
        }
        Ok(())
    }

    /// Type info of a data component entity.
    #[must_use]
    pub fn type_info(&self, component: Entity) -> Option<&ComponentInfo> {
        if !self.is_alive(component) {
            return None;
        }
        self.type_infos.get(u64::from(component.index()))
    }

    // ==================== Id Operations ====================

    /// Add an id to an entity. Data components need a constructor.
    pub fn add_id(&mut self, entity: Entity, id: Id) -> EcsResult<()> {
        self.check_alive(entity)?;
        self.check_id(id)?;
        if self.is_deferred() {
            self.stages[0].add_id(entity, id);
            return Ok(());
        }
        self.add_id_now(entity, id)
    }

    fn add_id_now(&mut self, entity: Entity, id: Id) -> EcsResult<()> {
        let src = self.record_of(entity)?.table;
        if self.table_ref(src).has(id) {
            return Ok(());
        }
        self.check_trait_change(entity, id)?;
        self.ensure_record(id);
        if let Some(info) = self.components.get(id).and_then(ComponentRecord::type_info)
            && !info.has_ctor()
        {
            return Err(EcsError::MissingConstructor(id));
        }

        let dst = self.table_with(src, id);
        self.commit(entity, dst, None);
        if let Some(trait_) = trait_of(id) {
            self.on_trait_added(entity, trait_);
        }
        Ok(())
    }

    /// Remove an id from an entity. Wildcard ids remove every match.
    pub fn remove_id(&mut self, entity: Entity, id: Id) -> EcsResult<()> {
        self.check_alive(entity)?;
        if id.is_null() {
            return Err(EcsError::InvalidId(id));
        }
        if self.is_deferred() {
            self.stages[0].remove_id(entity, id);
            return Ok(());
        }

        let src = self.record_of(entity)?.table;
        let table = self.table_ref(src);
        let removed: SmallVec<[Id; 4]> = if id.is_wildcard() {
            table
                .type_ids()
                .iter()
                .copied()
                .filter(|t| t.matches(id))
                .collect()
        } else if table.has(id) {
            smallvec![id]
        } else {
            SmallVec::new()
        };
        if removed.is_empty() {
            return Ok(());
        }
        for id in &removed {
            self.check_trait_change(entity, *id)?;
        }

        let dst = self.table_without(src, &removed);
        self.commit(entity, dst, None);
        for trait_ in removed.into_iter().filter_map(trait_of) {
            self.on_trait_removed(entity, trait_);
        }
        Ok(())
    }

    /// Whether the entity has `id` itself. Inherited ids do not count.
    #[must_use]
    pub fn has_id(&self, entity: Entity, id: Id) -> bool {
        let Some(record) = self.entities.record(entity) else {
            return false;
        };
        if id.is_wildcard() {
            return self
                .components
                .get(id.any_to_wildcard())
                .is_some_and(|r| r.table_record(record.table).is_some());
        }
        self.table(record.table).is_some_and(|table| table.has(id))
    }

    /// Whether `entity` has `trait_` (one of the builtin trait entities).
    #[must_use]
    pub fn has_trait(&self, entity: Entity, trait_: Entity) -> bool {
        self.has_id(entity, trait_.id())
    }

    /// Whether instances see `id` on their `IsA` bases.
    #[must_use]
    pub fn is_inheritable(&self, id: Id) -> bool {
        let owner = if id.is_pair() {
            self.entity_at(id.first())
        } else {
            id.entity()
        };
        owner.is_some_and(|owner| self.has_trait(owner, INHERITABLE))
    }

    pub fn add<T: Component>(&mut self, entity: Entity) -> EcsResult<()> {
        let component = self.component::<T>();
        self.add_id(entity, component.id())
    }

    pub fn remove<T: Component>(&mut self, entity: Entity) -> EcsResult<()> {
        let component = self.component::<T>();
        self.remove_id(entity, component.id())
    }

    #[must_use]
    pub fn has<T: Component>(&self, entity: Entity) -> bool {
        self.type_ids
            .get(&TypeId::of::<T>())
            .is_some_and(|component| self.has_id(entity, component.id()))
    }

    // ==================== Component Values ====================

    /// Set the value of component `T`, adding it if needed.
    pub fn set<T: Component>(&mut self, entity: Entity, value: T) -> EcsResult<()> {
        let component = self.component::<T>();
        self.set_id(entity, component.id(), value)
    }

    /// Set the value of the pair `(T, target)`. The pair stores a `T`.
    pub fn set_pair<T: Component>(&mut self, entity: Entity, target: Entity, value: T) -> EcsResult<()> {
        self.check_alive(target)?;
        let component = self.component::<T>();
        self.set_id(entity, Id::pair(component, target), value)
    }

    /// Set the value of `id`, whose type must be `T`.
    pub fn set_id<T: Component>(&mut self, entity: Entity, id: Id, value: T) -> EcsResult<()> {
        self.check_alive(entity)?;
        self.check_id(id)?;
        if self.is_deferred() {
            self.stages[0].set(entity, id, value);
            return Ok(());
        }

        self.ensure_record(id);
        match self.components.get(id).and_then(ComponentRecord::type_info) {
            None if size_of::<T>() == 0 => return self.add_id_now(entity, id),
            None => return Err(EcsError::NoData(id)),
            Some(info) if !info.is::<T>() => return Err(EcsError::TypeMismatch(id)),
            Some(_) => {}
        }

        let src = self.record_of(entity)?.table;
        if let Some(ptr) = self.own_ptr(entity, id) {
            // SAFETY: the slot holds an initialized T
            unsafe { *ptr.cast::<T>() = value };
        } else {
            let dst = self.table_with(src, id);
            self.commit(entity, dst, Some(id));
            let Some(ptr) = self
                .own_ptr(entity, id)
                .or_else(|| self.sparse_slot(entity, id))
            else {
                unreachable!("no storage for {id:?} after adding it");
            };
            // SAFETY: the slot was skipped by the move and is uninitialized
            unsafe { ptr.cast::<T>().write(value) };
        }
        self.mark_modified(entity, id);
        Ok(())
    }

    /// Value of `T`, falling back to `IsA` bases for inheritable components.
    #[must_use]
    pub fn get<T: Component>(&self, entity: Entity) -> Option<&T> {
        let component = *self.type_ids.get(&TypeId::of::<T>())?;
        self.get_id(entity, component.id())
    }

    #[must_use]
    pub fn get_pair<T: Component>(&self, entity: Entity, target: Entity) -> Option<&T> {
        let component = *self.type_ids.get(&TypeId::of::<T>())?;
        self.get_id(entity, Id::pair(component, target))
    }

    /// Value of `id`, or `None` if the entity lacks it or it is not a `T`.
    #[must_use]
    pub fn get_id<T: Component>(&self, entity: Entity, id: Id) -> Option<&T> {
        let info = self.components.get(id)?.type_info()?;
        if !info.is::<T>() {
            return None;
        }
        let ptr = self.find_ptr(entity, id)?;
        // SAFETY: the slot holds an initialized T
        Some(unsafe { &*ptr.cast::<T>() })
    }

    /// Mutable value of `T` owned by the entity. Marks the value modified.
    pub fn get_mut<T: Component>(&mut self, entity: Entity) -> Option<&mut T> {
        let component = *self.type_ids.get(&TypeId::of::<T>())?;
        self.get_id_mut(entity, component.id())
    }

    pub fn get_id_mut<T: Component>(&mut self, entity: Entity, id: Id) -> Option<&mut T> {
        let info = self.components.get(id)?.type_info()?;
        if !info.is::<T>() {
            return None;
        }
        let ptr = self.own_ptr(entity, id)?;
        self.mark_modified(entity, id);
        // SAFETY: the slot holds an initialized T and `self` is borrowed
        // mutably for the lifetime of the reference
        Some(unsafe { &mut *ptr.cast::<T>() })
    }

    /// Signal that `T` changed through a path the world does not see.
    pub fn modified<T: Component>(&mut self, entity: Entity) -> EcsResult<()> {
        let component = self.component::<T>();
        self.modified_id(entity, component.id())
    }

    pub fn modified_id(&mut self, entity: Entity, id: Id) -> EcsResult<()> {
        self.check_alive(entity)?;
        if self.is_deferred() {
            self.stages[0].modified(entity, id);
            return Ok(());
        }
        self.mark_modified(entity, id);
        Ok(())
    }

    fn mark_modified(&self, entity: Entity, id: Id) {
        let Some(record) = self.entities.record(entity) else {
            return;
        };
        if let Some(table) = self.table(record.table)
            && let Some(column) = table.column_of(id)
        {
            table.mark_dirty(column);
        }
    }

    /// Storage slot of an id the entity has itself.
    fn own_ptr(&self, entity: Entity, id: Id) -> Option<*mut u8> {
        let record = self.entities.record(entity)?;
        let table = self.table(record.table)?;
        if let Some(column) = table.column_of(id) {
            return Some(table.ptr(column, record.row));
        }
        self.components.get(id)?.sparse()?.get(entity)
    }

    fn sparse_slot(&mut self, entity: Entity, id: Id) -> Option<*mut u8> {
        self.components
            .get_mut(id)?
            .sparse
            .as_mut()?
            .ensure(&mut self.alloc, entity)
            .0
    }

    /// Own value of `entity`, else the first inherited one found through
    /// `IsA`, depth-first in type order.
    fn find_ptr(&self, entity: Entity, id: Id) -> Option<*mut u8> {
        if let Some(ptr) = self.own_ptr(entity, id) {
            return Some(ptr);
        }
        if !self.is_inheritable(id) {
            return None;
        }
        let isa = self.components.get(Id::pair(IS_A, WILDCARD))?;

        let mut visited = HashSet::new();
        let mut stack = vec![entity];
        while let Some(current) = stack.pop() {
            if current != entity
                && let Some(ptr) = self.own_ptr(current, id)
            {
                return Some(ptr);
            }
            let Some(record) = self.entities.record(current) else {
                continue;
            };
            if !visited.insert(record.table) {
                continue;
            }
            let (Some(table), Some(tr)) = (self.table(record.table), isa.table_record(record.table)) else {
                continue;
            };
            let start = usize::from(tr.index);
            let bases = &table.type_ids()[start..start + usize::from(tr.count)];
            stack.extend(bases.iter().rev().filter_map(|base| self.entity_at(base.second())));
        }
        None
    }

    // ==================== Relation/Pair Operations ====================

    pub fn add_pair(&mut self, entity: Entity, rel: Entity, target: Entity) -> EcsResult<()> {
        self.check_alive(rel)?;
        self.check_alive(target)?;
        self.add_id(entity, Id::pair(rel, target))
    }

    pub fn remove_pair(&mut self, entity: Entity, rel: Entity, target: Entity) -> EcsResult<()> {
        self.remove_id(entity, Id::pair(rel, target))
    }

    #[must_use]
    pub fn has_pair(&self, entity: Entity, rel: Entity, target: Entity) -> bool {
        self.has_id(entity, Id::pair(rel, target))
    }

    /// The `index`-th target of `rel` on the entity, in type order.
    #[must_use]
    pub fn target(&self, entity: Entity, rel: Entity, index: usize) -> Option<Entity> {
        let record = self.entities.record(entity)?;
        let table = self.table(record.table)?;
        let tr = self
            .components
            .get(Id::pair(rel, WILDCARD))?
            .table_record(record.table)?;
        if index >= usize::from(tr.count) {
            return None;
        }
        self.entity_at(table.type_ids()[usize::from(tr.index) + index].second())
    }

    /// `ChildOf` target of the entity.
    #[must_use]
    pub fn parent(&self, entity: Entity) -> Option<Entity> {
        let record = self.entities.record(entity)?;
        self.table(record.table)?.parent()
    }

    /// Children of `parent`, in their explicit order when the parent has
    /// `OrderedChildren`, else in table order.
    #[must_use]
    pub fn children(&self, parent: Entity) -> Vec<Entity> {
        let id = Id::pair(CHILD_OF, parent);
        match self.components.get(id).and_then(ComponentRecord::ordered_children) {
            Some(ordered) => ordered.to_vec(),
            None => self.holders(id),
        }
    }

    /// Reorder the children of a parent with `OrderedChildren`. `order` must
    /// be a permutation of the current children; on error the order is
    /// unchanged.
    pub fn set_child_order(&mut self, parent: Entity, order: &[Entity]) -> EcsResult<()> {
        self.check_alive(parent)?;
        if !self.has_trait(parent, ORDERED_CHILDREN) {
            return Err(EcsError::NotOrdered(parent));
        }
        let ordered = self
            .components
            .get_mut(Id::pair(CHILD_OF, parent))
            .and_then(|record| record.ordered.as_mut());
        let reordered = match ordered {
            Some(ordered) => ordered.reorder(order),
            None => order.is_empty(),
        };
        if reordered {
            Ok(())
        } else {
            Err(EcsError::InvalidChildOrder(parent))
        }
    }

    /// Entities in non-empty tables with `id`.
    fn holders(&self, id: Id) -> Vec<Entity> {
        let Some(record) = self.components.get(id) else {
            return Vec::new();
        };
        record
            .cache
            .iter_fill()
            .filter_map(|(table, _)| self.table(table))
            .flat_map(|table| table.entities().iter().copied())
            .collect()
    }

    // ==================== Traits ====================

    fn id_in_use(&self, entity: Entity) -> bool {
        [entity.id(), Id::pair(entity, WILDCARD)]
            .into_iter()
            .any(|id| self.components.get(id).is_some_and(ComponentRecord::in_use))
    }

    fn check_trait_change(&self, entity: Entity, id: Id) -> EcsResult<()> {
        if trait_of(id) == Some(SPARSE) && self.id_in_use(entity) {
            return Err(EcsError::TraitAfterUse(entity.id()));
        }
        Ok(())
    }

    fn on_trait_added(&mut self, entity: Entity, trait_: Entity) {
        if trait_ == SPARSE {
            self.drop_unused_records(entity);
        } else if trait_ == ORDERED_CHILDREN {
            self.enable_child_order(entity);
        } else {
            let flag = trait_flag(trait_);
            for record in self.components.iter_mut().filter(|r| owned_by(r.id(), entity)) {
                record.flags |= flag;
            }
            if trait_ == TRAVERSABLE {
                for target in self.targets_of(entity) {
                    self.mark_traversable(target);
                }
            }
            if trait_ == EXCLUSIVE {
                self.clear_edges();
            }
        }
        debug!(%entity, %trait_, "trait added");
    }

    fn on_trait_removed(&mut self, entity: Entity, trait_: Entity) {
        if trait_ == SPARSE {
            self.drop_unused_records(entity);
        } else if trait_ == ORDERED_CHILDREN {
            let id = Id::pair(CHILD_OF, entity);
            let Some(record) = self.components.get_mut(id) else {
                return;
            };
            record.flags.remove(ComponentRecordFlags::ORDERED_CHILDREN);
            record.ordered = None;
            let tables: Vec<TableId> = record.cache.iter_all().map(|(t, _)| t).collect();
            for table in tables {
                table_at(&mut self.tables, table).set_flag(TableFlags::HAS_ORDERED_CHILDREN, false);
            }
        } else {
            let flag = trait_flag(trait_);
            for record in self.components.iter_mut().filter(|r| owned_by(r.id(), entity)) {
                record.flags.remove(flag);
            }
            if trait_ == EXCLUSIVE {
                self.clear_edges();
            }
        }
        debug!(%entity, %trait_, "trait removed");
    }

    /// Unused records are recreated with the current traits on next use.
    fn drop_unused_records(&mut self, entity: Entity) {
        for id in self.components.ids() {
            if owned_by(id, entity)
                && !self.components.get(id).is_some_and(ComponentRecord::in_use)
            {
                self.components.remove(id);
            }
        }
    }

    fn enable_child_order(&mut self, parent: Entity) {
        let id = Id::pair(CHILD_OF, parent);
        let children = self.holders(id);
        let Some(record) = self.components.get_mut(id) else {
            return;
        };
        record.flags |= ComponentRecordFlags::ORDERED_CHILDREN;
        let mut ordered = OrderedChildren::new();
        for child in children {
            ordered.push(child);
        }
        record.ordered = Some(ordered);
        let tables: Vec<TableId> = record.cache.iter_all().map(|(t, _)| t).collect();
        for table in tables {
            table_at(&mut self.tables, table).set_flag(TableFlags::HAS_ORDERED_CHILDREN, true);
        }
    }

    /// Targets of all `(rel, *)` pairs in use.
    fn targets_of(&self, rel: Entity) -> Vec<Entity> {
        let Some(record) = self.components.get(Id::pair(rel, WILDCARD)) else {
            return Vec::new();
        };
        let mut targets: Vec<Entity> = record
            .cache
            .iter_all()
            .filter_map(|(table, tr)| Some((self.table(table)?, tr)))
            .flat_map(|(table, tr)| {
                let start = usize::from(tr.index);
                table.type_ids()[start..start + usize::from(tr.count)].to_vec()
            })
            .filter_map(|pair| self.entity_at(pair.second()))
            .collect();
        targets.sort_unstable();
        targets.dedup();
        targets
    }

    fn mark_traversable(&mut self, target: Entity) {
        let Some(record) = self.entities.record_mut(target) else {
            return;
        };
        if record.flags.contains(EntityFlags::TRAVERSABLE) {
            return;
        }
        record.flags |= EntityFlags::TRAVERSABLE;
        let table = record.table;
        table_at(&mut self.tables, table).add_traversable(1);
        trace!(entity = %target, "entity is traversable");
    }

    fn clear_edges(&mut self) {
        for table in self.tables.iter_mut().flatten() {
            table.add_edges.clear();
            table.remove_edges.clear();
        }
    }

    // ==================== Component Records ====================

    #[must_use]
    pub fn component_record(&self, id: Id) -> Option<&ComponentRecord> {
        self.components.get(id)
    }

    /// Create the record of `id` with flags from the traits of its
    /// relationship or component entity.
    fn ensure_record(&mut self, id: Id) {
        if self.components.contains(id) {
            return;
        }
        let owner = if id.is_pair() {
            self.entity_at(id.first())
        } else {
            id.entity().filter(|e| self.is_alive(*e))
        };

        let mut flags = ComponentRecordFlags::empty();
        let mut type_info = None;
        if let Some(owner) = owner {
            for trait_ in [TRAVERSABLE, INHERITABLE, EXCLUSIVE] {
                if self.has_trait(owner, trait_) {
                    flags |= trait_flag(trait_);
                }
            }
            if !id.is_wildcard() {
                if self.has_trait(owner, SPARSE) {
                    flags |= ComponentRecordFlags::SPARSE;
                }
                type_info = self.type_infos.get(u64::from(owner.index())).cloned();
            }
        }

        let ordered = id.is_pair()
            && id.first() == CHILD_OF.index()
            && !id.is_wildcard()
            && self
                .entity_at(id.second())
                .is_some_and(|parent| self.has_trait(parent, ORDERED_CHILDREN));
        if ordered {
            flags |= ComponentRecordFlags::ORDERED_CHILDREN;
        }

        let mut record = ComponentRecord::new(id, flags, type_info);
        if ordered {
            record.ordered = Some(OrderedChildren::new());
        }
        self.components.ensure_with(id, || record);
        trace!(?id, "created component record");
    }

    // ==================== Table Graph ====================

    #[must_use]
    pub fn table(&self, id: TableId) -> Option<&Table> {
        self.tables.get(id.index()).and_then(Option::as_ref)
    }

    /// All live tables, the root included.
    pub fn tables(&self) -> impl Iterator<Item = &Table> {
        self.tables.iter().flatten()
    }

    #[must_use]
    pub fn table_count(&self) -> usize {
        self.tables().count()
    }

    /// Table with the given type, if it exists. `type_` need not be sorted.
    #[must_use]
    pub fn find_table(&self, type_: &[Id]) -> Option<TableId> {
        let mut key: Box<[Id]> = type_.into();
        key.sort_unstable();
        self.table_index.get(&key).copied()
    }

    fn table_ref(&self, id: TableId) -> &Table {
        match self.table(id) {
            Some(table) => table,
            None => unreachable!("table {id:?} does not exist"),
        }
    }

    /// Table for the type of `src` plus `id`. For exclusive relationships the
    /// previous target is replaced.
    fn table_with(&mut self, src: TableId, id: Id) -> TableId {
        let table = self.table_ref(src);
        if let Some(dst) = table.add_edge(id) {
            return dst;
        }
        if table.has(id) {
            return src;
        }

        let mut type_ = table.type_ids().to_vec();
        if id.is_pair()
            && self
                .entity_at(id.first())
                .is_some_and(|rel| self.has_trait(rel, EXCLUSIVE))
        {
            type_.retain(|t| !(t.is_pair() && t.first() == id.first()));
        }
        if let Err(pos) = type_.binary_search(&id) {
            type_.insert(pos, id);
        }

        let dst = self.find_or_create_table(type_);
        table_at(&mut self.tables, src).add_edges.insert(id, dst);
        dst
    }

    /// Table for the type of `src` minus `ids`.
    fn table_without(&mut self, src: TableId, ids: &[Id]) -> TableId {
        let table = self.table_ref(src);
        if let [id] = ids
            && let Some(dst) = table.remove_edge(*id)
        {
            return dst;
        }

        let type_: Vec<Id> = table
            .type_ids()
            .iter()
            .copied()
            .filter(|id| !ids.contains(id))
            .collect();
        let dst = self.find_or_create_table(type_);
        if let [id] = ids {
            table_at(&mut self.tables, src).remove_edges.insert(*id, dst);
        }
        dst
    }

    fn find_or_create_table(&mut self, type_: Vec<Id>) -> TableId {
        let key = type_.into_boxed_slice();
        if let Some(&table) = self.table_index.get(&key) {
            return table;
        }
        self.create_table(key)
    }

    fn create_table(&mut self, type_: Box<[Id]>) -> TableId {
        let id = TableId::from_raw(self.tables.len() as u32);
        for &t in &*type_ {
            self.ensure_record(t);
        }

        let mut flags = TableFlags::empty();
        let mut parent = None;
        let mut column_infos = Vec::new();
        for (index, &t) in type_.iter().enumerate() {
            if t.is_pair() {
                flags |= TableFlags::HAS_PAIRS;
                if t.first() == CHILD_OF.index() {
                    flags |= TableFlags::HAS_CHILD_OF;
                    parent = self.entity_at(t.second());
                } else if t.first() == IS_A.index() {
                    flags |= TableFlags::HAS_IS_A;
                }
            } else if t == PREFAB.id() {
                flags |= TableFlags::IS_PREFAB;
            } else if t == DISABLED.id() {
                flags |= TableFlags::IS_DISABLED;
            }

            let Some(record) = self.components.get(t) else {
                continue;
            };
            if record.flags().contains(ComponentRecordFlags::ORDERED_CHILDREN) {
                flags |= TableFlags::HAS_ORDERED_CHILDREN;
            }
            if record.is_sparse() {
                flags |= TableFlags::HAS_SPARSE;
            } else if let Some(info) = record.type_info().filter(|info| info.size() > 0) {
                column_infos.push((index, info.clone()));
            }
        }

        let mut table = Table::new(id, type_.clone(), column_infos, flags, parent);
        let records = table_records(table.type_ids(), |i| table.column_of_index(i));
        for (record_id, _) in &records {
            self.ensure_record(*record_id);
        }
        for (record_id, tr) in &records {
            if let Some(record) = self.components.get_mut(*record_id) {
                record.cache.insert(id, true, *tr);
            }
        }
        table.records = records.iter().map(|(record_id, _)| *record_id).collect();

        debug!(table = id.as_raw(), type_ = ?table.type_ids(), "created table");
        self.tables.push(Some(table));
        self.table_index.insert(type_, id);

        for cache in self.queries.iter().flatten() {
            cache.borrow_mut().on_table_create(self, id);
        }
        id
    }

    fn delete_table(&mut self, id: TableId) {
        if id == TableId::ROOT {
            return;
        }
        let Some(mut table) = self.tables.get_mut(id.index()).and_then(Option::take) else {
            return;
        };
        assert!(table.is_empty(), "table {id:?} deleted with live rows");

        for record_id in &*table.records {
            if let Some(record) = self.components.get_mut(*record_id) {
                record.cache.remove(id);
            }
        }
        self.table_index.remove(&Box::from(table.type_ids()));
        for other in self.tables.iter_mut().flatten() {
            other.add_edges.retain(|_, dst| *dst != id);
            other.remove_edges.retain(|_, dst| *dst != id);
        }
        for cache in self.queries.iter().flatten() {
            cache.borrow_mut().on_table_delete(id);
        }
        table.fini(&mut self.alloc);
        debug!(table = id.as_raw(), "deleted table");
    }

    /// Delete every empty table except the root. Returns how many were
    /// deleted.
    pub fn delete_empty_tables(&mut self) -> usize {
        let empty: Vec<TableId> = self
            .tables()
            .filter(|table| table.id() != TableId::ROOT && table.is_empty())
            .map(Table::id)
            .collect();
        for &table in &empty {
            self.delete_table(table);
        }
        debug!(count = empty.len(), "deleted empty tables");
        empty.len()
    }

    fn set_table_empty(&mut self, id: TableId, empty: bool) {
        let Some(table) = self.tables.get(id.index()).and_then(Option::as_ref) else {
            return;
        };
        for record_id in &*table.records {
            if let Some(record) = self.components.get_mut(*record_id) {
                record.cache.set_empty(id, empty);
            }
        }
    }

    /// Move an entity to `dst`.
    ///
    /// Columns only in `dst` are default-constructed except `skip`, which
    /// the caller writes. Sparse values follow the same rule.
    fn commit(&mut self, entity: Entity, dst: TableId, skip: Option<Id>) {
        let Some(record) = self.entities.record(entity).copied() else {
            return;
        };
        let src = record.table;
        if src == dst {
            return;
        }
        let (added, removed) = type_diff(
            self.table_ref(src).type_ids(),
            self.table_ref(dst).type_ids(),
        );

        for id in &removed {
            if let Some(storage) = self.components.get_mut(*id).and_then(|r| r.sparse.as_mut()) {
                storage.remove(entity);
            }
        }

        let (src_table, dst_table) = table_pair(&mut self.tables, src, dst);
        let dst_was_empty = dst_table.is_empty();
        // SAFETY: constructors of added columns were checked by the caller,
        // which also writes `skip`
        let (row, swapped) =
            unsafe { Table::move_row(&mut self.alloc, src_table, record.row, dst_table, skip) };
        if record.flags.contains(EntityFlags::TRAVERSABLE) {
            src_table.add_traversable(-1);
            dst_table.add_traversable(1);
        }
        let src_now_empty = src_table.is_empty();
        let (old_parent, new_parent) = (src_table.parent(), dst_table.parent());

        if let Some(moved) = self.entities.record_mut(entity) {
            moved.table = dst;
            moved.row = row;
        }
        if let Some(swapped) = swapped
            && let Some(swapped_record) = self.entities.record_mut(swapped)
        {
            swapped_record.row = record.row;
        }

        for id in added.iter().filter(|id| Some(**id) != skip) {
            let Some(storage) = self.components.get_mut(*id).and_then(|r| r.sparse.as_mut()) else {
                continue;
            };
            if let (Some(slot), true) = storage.ensure(&mut self.alloc, entity)
                && let Some(info) = storage.info()
            {
                // SAFETY: fresh slot; the caller checked for a constructor
                let constructed = unsafe { info.construct(slot) };
                debug_assert!(constructed);
            }
        }

        if src_now_empty {
            self.set_table_empty(src, true);
        }
        if dst_was_empty {
            self.set_table_empty(dst, false);
        }
        self.components.reparent(entity, old_parent, new_parent);

        for id in added.iter().filter(|id| id.is_pair()) {
            let traversable = self
                .components
                .get(*id)
                .is_some_and(|r| r.flags().contains(ComponentRecordFlags::TRAVERSABLE));
            if traversable && let Some(target) = self.entity_at(id.second()) {
                self.mark_traversable(target);
            }
        }
        if record.flags.contains(EntityFlags::TRAVERSABLE) {
            self.rematch_up_caches(&added, &removed);
        }
        trace!(%entity, from = src.as_raw(), to = dst.as_raw(), "moved entity");
    }

    /// Rematch caches whose up fields may resolve differently now that a
    /// traversable entity gained or lost some of `added` and `removed`.
    fn rematch_up_caches(&self, added: &[Id], removed: &[Id]) {
        for cache in self.queries.iter().flatten() {
            let touched = {
                let cache = cache.borrow();
                cache.has_up()
                    && cache.monitored_ids().iter().any(|monitored| {
                        added
                            .iter()
                            .chain(removed)
                            .any(|id| id.matches(*monitored))
                    })
            };
            if touched {
                cache.borrow_mut().rematch(self);
            }
        }
    }

    // ==================== Query ====================

    /// Start building a query.
    pub fn query(&mut self) -> QueryBuilder<'_> {
        QueryBuilder::new(self)
    }

    /// Compile a query. Cacheable terms get a cache owned by the world.
    pub fn create_query(&mut self, desc: QueryDesc) -> EcsResult<Query> {
        let compiled = compiler::compile(self, &desc)?;
        let mut query = compiled.query;
        if let Some(cache_query) = compiled.cache {
            let id = QueryId(self.queries.len() as u32);
            let cache = QueryCache::new(self, cache_query);
            self.queries.push(Some(RefCell::new(cache)));
            query.cache = Some(id);
        }
        Ok(query)
    }

    /// Drop the cache of a cached query. The query can no longer be
    /// iterated.
    pub fn destroy_query(&mut self, query: &Query) -> EcsResult<()> {
        let id = query.cache.ok_or(EcsError::NoSuchQuery)?;
        let slot = self
            .queries
            .get_mut(id.0 as usize)
            .ok_or(EcsError::NoSuchQuery)?;
        if slot.take().is_none() {
            return Err(EcsError::NoSuchQuery);
        }
        debug!(query = id.as_raw(), "destroyed query cache");
        Ok(())
    }

    #[must_use]
    pub fn query_cache(&self, id: QueryId) -> Option<&RefCell<QueryCache>> {
        self.queries.get(id.0 as usize).and_then(Option::as_ref)
    }

    /// Apply the `order_by` of a cache to the tables it matched. Returns the
    /// number of tables whose rows moved.
    pub(crate) fn sort_cached_tables(&mut self, id: QueryId) -> usize {
        let Some(cache) = self.queries.get(id.0 as usize).and_then(Option::as_ref) else {
            return 0;
        };
        let sorted = cache
            .borrow_mut()
            .sort_tables(&mut self.tables, &mut self.entities);
        if sorted > 0 {
            debug!(query = id.as_raw(), tables = sorted, "sorted query tables");
        }
        sorted
    }

    // ==================== Deferred Operations ====================

    /// Start deferring mutations. Returns `true` for the outermost call.
    pub const fn defer_begin(&mut self) -> bool {
        self.defer_depth += 1;
        self.defer_depth == 1
    }

    /// End a [`World::defer_begin`]. The outermost call merges all stages
    /// and returns `true`.
    pub fn defer_end(&mut self) -> bool {
        if self.defer_depth == 0 {
            return false;
        }
        self.defer_depth -= 1;
        if self.defer_depth > 0 {
            return false;
        }
        self.merge();
        true
    }

    /// Apply mutations immediately while deferred.
    pub const fn defer_suspend(&mut self) {
        self.defer_suspended = true;
    }

    pub const fn defer_resume(&mut self) {
        self.defer_suspended = false;
    }

    #[must_use]
    pub const fn is_deferred(&self) -> bool {
        self.defer_depth > 0 && !self.defer_suspended
    }

    /// Command stage `index`. Stage 0 is the main stage.
    pub fn stage(&self, index: usize) -> EcsResult<&Stage> {
        self.stages.get(index).ok_or(EcsError::NoSuchStage(index))
    }

    #[must_use]
    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Replay the commands of every stage in order, main stage first.
    ///
    /// Commands for entities deleted earlier in the merge are skipped.
    /// Failed commands are logged and dropped.
    pub fn merge(&mut self) {
        let suspended = std::mem::replace(&mut self.defer_suspended, true);
        let mut count = 0usize;
        for index in 0..self.stages.len() {
            let commands = self.stages[index].drain();
            count += commands.len();
            for command in commands {
                self.apply(command);
            }
        }
        self.defer_suspended = suspended;
        debug!(commands = count, "merged stages");
    }

    fn apply(&mut self, command: Command) {
        let entity = command.entity();
        if !self.is_alive(entity) {
            trace!(%entity, "skipped command for deleted entity");
            return;
        }
        let result = match command {
            Command::Add { entity, id } => self.add_id(entity, id),
            Command::Remove { entity, id } => self.remove_id(entity, id),
            Command::Set {
                entity,
                id,
                value,
                apply,
            } => apply(self, entity, id, value),
            Command::Delete { entity } => self.delete(entity),
            Command::Clear { entity } => self.clear(entity),
            Command::Modified { entity, id } => self.modified_id(entity, id),
            Command::Clone {
                entity,
                dst,
                copy_values,
            } => self.clone_into(entity, dst, copy_values),
        };
        if let Err(err) = result {
            warn!(%entity, %err, "deferred command failed");
        }
    }
}

impl Drop for World {
    fn drop(&mut self) {
        self.queries.clear();
        for table in self.tables.iter_mut().flatten() {
            table.fini(&mut self.alloc);
        }
        for record in self.components.iter_mut() {
            if let Some(storage) = record.sparse.as_mut() {
                storage.fini(&mut self.alloc);
            }
        }
    }
}

impl fmt::Debug for World {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("World")
            .field("entities", &self.entity_count())
            .field("tables", &self.table_count())
            .field("components", &self.components.len())
            .field("queries", &self.queries.iter().flatten().count())
            .field("defer_depth", &self.defer_depth)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::query::{CacheKind, TermRef};

    #[derive(Debug, Default, Clone, Copy, PartialEq)]
    struct Position {
        x: f32,
        y: f32,
    }

    #[derive(Debug, Default, Clone, Copy, PartialEq)]
    struct Velocity(f32);

    #[derive(Debug, Default, Clone, PartialEq)]
    struct Label(String);

    #[derive(Debug, Default, Clone, Copy, PartialEq)]
    struct Tag;

    #[test]
    fn test_builtins_are_named_and_have_traits() {
        let world = World::new();
        assert_eq!(world.lookup("ChildOf"), Some(CHILD_OF));
        assert_eq!(world.name(IS_A), Some("IsA"));
        assert!(world.has_trait(CHILD_OF, TRAVERSABLE));
        assert!(world.has_trait(CHILD_OF, EXCLUSIVE));
        assert!(world.has_trait(IS_A, TRAVERSABLE));
        assert!(!world.has_trait(IS_A, EXCLUSIVE));
    }

    #[test]
    fn test_set_get_and_overwrite() {
        let mut world = World::new();
        let e = world.new_entity();
        world.set(e, Position { x: 1.0, y: 2.0 }).unwrap();
        world.set(e, Velocity(3.0)).unwrap();
        assert_eq!(world.get::<Position>(e), Some(&Position { x: 1.0, y: 2.0 }));

        world.set(e, Position { x: 5.0, y: 6.0 }).unwrap();
        assert_eq!(world.get::<Position>(e), Some(&Position { x: 5.0, y: 6.0 }));
        assert_eq!(world.get::<Velocity>(e), Some(&Velocity(3.0)));

        world.get_mut::<Velocity>(e).unwrap().0 = 4.0;
        assert_eq!(world.get::<Velocity>(e), Some(&Velocity(4.0)));
    }

    #[test]
    fn test_values_survive_swap_remove() {
        let mut world = World::new();
        let a = world.new_entity();
        let b = world.new_entity();
        world.set(a, Label("a".into())).unwrap();
        world.set(b, Label("b".into())).unwrap();

        world.remove::<Label>(a).unwrap();
        assert_eq!(world.get::<Label>(b), Some(&Label("b".into())));
        assert_eq!(world.get::<Label>(a), None);
    }

    #[test]
    fn test_add_without_constructor_fails() {
        let mut world = World::new();
        let e = world.new_entity();
        world.component::<Position>();
        assert!(matches!(world.add::<Position>(e), Err(EcsError::MissingConstructor(_))));

        world.component_default::<Position>();
        world.add::<Position>(e).unwrap();
        assert_eq!(world.get::<Position>(e), Some(&Position::default()));

        world.add::<Tag>(e).unwrap();
        assert!(world.has::<Tag>(e));
    }

    #[test]
    fn test_invalid_ids_are_rejected() {
        let mut world = World::new();
        let e = world.new_entity();
        assert!(matches!(world.add_id(e, Id::NULL), Err(EcsError::InvalidId(_))));
        assert!(matches!(world.add_id(e, WILDCARD.id()), Err(EcsError::InvalidId(_))));
        assert!(matches!(
            world.add_id(e, Id::pair(CHILD_OF, WILDCARD)),
            Err(EcsError::InvalidId(_))
        ));

        let dead = world.new_entity();
        world.delete(dead).unwrap();
        assert!(matches!(world.add_id(dead, TRAVERSABLE.id()), Err(EcsError::NotAlive(_))));
        assert!(matches!(world.add_pair(e, CHILD_OF, dead), Err(EcsError::NotAlive(_))));
    }

    #[test]
    fn test_delete_recycles_with_new_generation() {
        let mut world = World::new();
        let e = world.new_entity();
        world.delete(e).unwrap();
        let f = world.new_entity();
        assert_eq!(e.index(), f.index());
        assert_ne!(e, f);
        assert!(!world.is_alive(e));
        assert!(matches!(world.delete(CHILD_OF), Err(EcsError::InvalidId(_))));
    }

    #[test]
    fn test_names() {
        let mut world = World::new();
        let e = world.new_named("player").unwrap();
        assert_eq!(world.lookup("player"), Some(e));
        assert!(matches!(world.new_named("player"), Err(EcsError::NameInUse(_))));

        world.set_name(e, "hero").unwrap();
        assert_eq!(world.lookup("player"), None);
        assert_eq!(world.name(e), Some("hero"));

        world.delete(e).unwrap();
        assert_eq!(world.lookup("hero"), None);
    }

    #[test]
    fn test_cached_query_sees_add_and_remove() {
        let mut world = World::new();
        let e1 = world.new_entity();
        world.set(e1, Position { x: 10.0, y: 20.0 }).unwrap();
        let query = world
            .query()
            .with::<Position>()
            .cache_kind(CacheKind::Auto)
            .build()
            .unwrap();

        let mut seen = Vec::new();
        let mut it = query.iter(&world);
        while it.next() {
            seen.extend(it.field::<Position>(0).unwrap().iter().copied());
        }
        drop(it);
        assert_eq!(seen, vec![Position { x: 10.0, y: 20.0 }]);

        world.remove::<Position>(e1).unwrap();
        assert_eq!(query.count(&world), 0);
    }

    #[test]
    fn test_ordered_children_reorder() {
        let mut world = World::new();
        let p = world.new_entity();
        world.add_id(p, ORDERED_CHILDREN.id()).unwrap();
        let c1 = world.new_entity();
        let c2 = world.new_entity();
        world.add_pair(c1, CHILD_OF, p).unwrap();
        world.add_pair(c2, CHILD_OF, p).unwrap();
        assert_eq!(world.children(p), vec![c1, c2]);

        world.set_child_order(p, &[c2, c1]).unwrap();
        assert_eq!(world.children(p), vec![c2, c1]);

        assert!(matches!(
            world.set_child_order(p, &[c1]),
            Err(EcsError::InvalidChildOrder(_))
        ));
        assert_eq!(world.children(p), vec![c2, c1]);

        world.delete(c2).unwrap();
        assert_eq!(world.children(p), vec![c1]);
    }

    #[test]
    fn test_ordered_children_enabled_after_children_exist() {
        let mut world = World::new();
        let p = world.new_entity();
        let c1 = world.new_entity();
        let c2 = world.new_entity();
        world.add_pair(c1, CHILD_OF, p).unwrap();
        world.add_pair(c2, CHILD_OF, p).unwrap();
        assert!(matches!(world.set_child_order(p, &[c2, c1]), Err(EcsError::NotOrdered(_))));

        world.add_id(p, ORDERED_CHILDREN.id()).unwrap();
        let table = world.table_of(c1).unwrap();
        assert!(world.table(table).unwrap().flags().contains(TableFlags::HAS_ORDERED_CHILDREN));
        world.set_child_order(p, &[c2, c1]).unwrap();
        assert_eq!(world.children(p), vec![c2, c1]);

        world.remove_id(p, ORDERED_CHILDREN.id()).unwrap();
        assert!(matches!(world.set_child_order(p, &[c1, c2]), Err(EcsError::NotOrdered(_))));
    }

    #[test]
    fn test_exclusive_relationship_replaces_target() {
        let mut world = World::new();
        let p1 = world.new_entity();
        let p2 = world.new_entity();
        world.add_id(p2, ORDERED_CHILDREN.id()).unwrap();
        let c = world.new_entity();

        world.add_pair(c, CHILD_OF, p1).unwrap();
        world.add_pair(c, CHILD_OF, p2).unwrap();
        assert_eq!(world.parent(c), Some(p2));
        assert!(!world.has_pair(c, CHILD_OF, p1));
        assert_eq!(world.target(c, CHILD_OF, 0), Some(p2));
        assert_eq!(world.target(c, CHILD_OF, 1), None);
        assert_eq!(world.children(p2), vec![c]);
        assert!(world.children(p1).is_empty());
    }

    #[test]
    fn test_non_exclusive_relationship_keeps_targets() {
        let mut world = World::new();
        let likes = world.new_entity();
        let a = world.new_entity();
        let b = world.new_entity();
        let e = world.new_entity();
        world.add_pair(e, likes, a).unwrap();
        world.add_pair(e, likes, b).unwrap();

        assert_eq!(world.target(e, likes, 0), Some(a));
        assert_eq!(world.target(e, likes, 1), Some(b));
        assert!(world.has_id(e, Id::pair(likes, WILDCARD)));

        world.remove_id(e, Id::pair(likes, WILDCARD)).unwrap();
        assert_eq!(world.target(e, likes, 0), None);
    }

    #[test]
    fn test_delete_parent_deletes_children_recursively() {
        let mut world = World::new();
        let root = world.new_entity();
        let child = world.new_entity();
        let grandchild = world.new_entity();
        world.add_pair(child, CHILD_OF, root).unwrap();
        world.add_pair(grandchild, CHILD_OF, child).unwrap();

        world.delete(root).unwrap();
        assert!(!world.is_alive(child));
        assert!(!world.is_alive(grandchild));
        assert!(world.component_record(Id::pair(CHILD_OF, root)).is_none());
    }

    #[test]
    fn test_delete_deep_hierarchy() {
        crate::init_test_tracing();
        let mut world = World::new();
        let before = world.entity_count();
        let root = world.new_entity();
        let mut chain = vec![root];
        for _ in 0..10_000 {
            let child = world.new_entity();
            world.add_pair(child, CHILD_OF, *chain.last().unwrap()).unwrap();
            chain.push(child);
        }
        let sibling = world.new_entity();
        world.add_pair(sibling, CHILD_OF, chain[5_000]).unwrap();

        world.delete(root).unwrap();
        assert!(chain.iter().all(|&e| !world.is_alive(e)));
        assert!(!world.is_alive(sibling));
        assert_eq!(world.entity_count(), before);
    }

    #[test]
    fn test_delete_target_removes_pairs() {
        let mut world = World::new();
        let likes = world.new_entity();
        let bob = world.new_entity();
        let alice = world.new_entity();
        world.set(alice, Position { x: 1.0, y: 1.0 }).unwrap();
        world.add_pair(alice, likes, bob).unwrap();
        let old_table = world.table_of(alice).unwrap();

        world.delete(bob).unwrap();
        assert!(world.is_alive(alice));
        assert!(!world.has_id(alice, Id::pair(likes, WILDCARD)));
        assert_eq!(world.get::<Position>(alice), Some(&Position { x: 1.0, y: 1.0 }));
        assert!(world.table(old_table).is_none());
    }

    #[test]
    fn test_delete_component_removes_it_everywhere() {
        let mut world = World::new();
        let e = world.new_entity();
        world.set(e, Position::default()).unwrap();
        world.set(e, Velocity(1.0)).unwrap();
        let position = world.component::<Position>();

        world.delete(position).unwrap();
        assert!(world.is_alive(e));
        assert!(!world.has_id(e, position.id()));
        assert_eq!(world.get::<Velocity>(e), Some(&Velocity(1.0)));

        // Registering again creates a fresh component entity.
        let again = world.component::<Position>();
        assert_ne!(again, position);
    }

    #[test]
    fn test_delete_empty_tables_keeps_root() {
        crate::init_test_tracing();
        let mut world = World::new();
        let e = world.new_entity();
        world.set(e, Position::default()).unwrap();
        world.set(e, Velocity(0.0)).unwrap();
        let before = world.table_count();
        world.clear(e).unwrap();
        assert_eq!(world.table_of(e), Some(TableId::ROOT));

        let deleted = world.delete_empty_tables();
        assert!(deleted >= 2);
        assert_eq!(world.table_count(), before - deleted);
        assert!(world.table(TableId::ROOT).is_some());

        // Tables are recreated on demand.
        world.set(e, Position::default()).unwrap();
        assert!(world.has::<Position>(e));
    }

    #[test]
    fn test_table_edges_are_reused() {
        let mut world = World::new();
        let a = world.new_entity();
        let b = world.new_entity();
        world.set(a, Position::default()).unwrap();
        let tables = world.table_count();
        world.set(b, Position::default()).unwrap();
        assert_eq!(world.table_count(), tables);
        assert_eq!(world.table_of(a), world.table_of(b));
        let position = world.component::<Position>();
        assert_eq!(
            world.table(TableId::ROOT).unwrap().add_edge(position.id()),
            world.table_of(a)
        );
    }

    #[test]
    fn test_defer_queues_until_end() {
        crate::init_test_tracing();
        let mut world = World::new();
        let e = world.new_entity();
        world.component_default::<Position>();

        assert!(world.defer_begin());
        assert!(!world.defer_begin());
        world.add::<Position>(e).unwrap();
        world.set(e, Velocity(2.0)).unwrap();
        assert!(!world.has::<Position>(e));
        assert_eq!(world.stage(0).unwrap().len(), 2);

        assert!(!world.defer_end());
        assert!(!world.has::<Position>(e));
        assert!(world.defer_end());
        assert!(world.has::<Position>(e));
        assert_eq!(world.get::<Velocity>(e), Some(&Velocity(2.0)));
        assert!(world.stage(0).unwrap().is_empty());
    }

    #[test]
    fn test_merge_skips_deleted_entities() {
        let mut world = World::new();
        let e = world.new_entity();
        world.defer_begin();
        world.delete(e).unwrap();
        world.add::<Tag>(e).unwrap();
        world.defer_end();
        assert!(!world.is_alive(e));
    }

    #[test]
    fn test_suspend_applies_immediately() {
        let mut world = World::new();
        let e = world.new_entity();
        world.defer_begin();
        world.defer_suspend();
        world.add::<Tag>(e).unwrap();
        assert!(world.has::<Tag>(e));
        world.defer_resume();
        world.remove::<Tag>(e).unwrap();
        assert!(world.has::<Tag>(e));
        world.defer_end();
        assert!(!world.has::<Tag>(e));
    }

    #[test]
    fn test_extra_stages_merge_after_main() {
        let mut world = World::with_config(WorldConfig {
            stage_count: 2,
            ..WorldConfig::default()
        });
        let e = world.new_entity();
        let velocity = world.component::<Velocity>();

        world.stage(1).unwrap().set(e, velocity.id(), Velocity(2.0));
        world.stage(0).unwrap().set(e, velocity.id(), Velocity(1.0));
        assert!(matches!(world.stage(2), Err(EcsError::NoSuchStage(2))));

        world.merge();
        assert_eq!(world.get::<Velocity>(e), Some(&Velocity(2.0)));
    }

    #[test]
    fn test_clone_entity() {
        let mut world = World::new();
        world.component_clone::<Label>();
        let parent = world.new_entity();
        world.add_id(parent, ORDERED_CHILDREN.id()).unwrap();
        let e = world.new_entity();
        world.set(e, Position { x: 3.0, y: 4.0 }).unwrap();
        world.set(e, Label("original".into())).unwrap();
        world.add_pair(e, CHILD_OF, parent).unwrap();

        let copy = world.clone_entity(e, true).unwrap();
        assert_eq!(world.table_of(copy), world.table_of(e));
        assert_eq!(world.get::<Position>(copy), Some(&Position { x: 3.0, y: 4.0 }));
        assert_eq!(world.get::<Label>(copy), Some(&Label("original".into())));
        assert_eq!(world.children(parent), vec![e, copy]);

        assert!(matches!(world.clone_entity(e, false), Err(EcsError::MissingConstructor(_))));
    }

    #[test]
    fn test_clone_entity_while_deferred() {
        crate::init_test_tracing();
        let mut world = World::new();
        let parent = world.new_entity();
        let e = world.new_entity();
        world.set(e, Position { x: 1.0, y: 2.0 }).unwrap();
        world.add_pair(e, CHILD_OF, parent).unwrap();

        world.defer_begin();
        let copy = world.clone_entity(e, true).unwrap();
        world.set(copy, Velocity(4.0)).unwrap();
        assert!(world.is_alive(copy));
        assert_eq!(world.table_of(copy), Some(TableId::ROOT));
        assert!(!world.has::<Position>(copy));
        world.defer_end();

        assert_eq!(world.get::<Position>(copy), Some(&Position { x: 1.0, y: 2.0 }));
        assert_eq!(world.get::<Velocity>(copy), Some(&Velocity(4.0)));
        assert_eq!(world.parent(copy), Some(parent));
        assert_eq!(world.children(parent), vec![e, copy]);
    }

    #[test]
    fn test_clone_without_hook_fails_for_drop_types() {
        let mut world = World::new();
        let e = world.new_entity();
        world.set(e, Label("x".into())).unwrap();
        assert!(matches!(world.clone_entity(e, true), Err(EcsError::MissingClone(_))));
    }

    #[test]
    fn test_sparse_component() {
        let mut world = World::new();
        let velocity = world.component::<Velocity>();
        world.add_id(velocity, SPARSE.id()).unwrap();

        let e = world.new_entity();
        world.set(e, Velocity(1.5)).unwrap();
        world.set(e, Position::default()).unwrap();
        let table = world.table(world.table_of(e).unwrap()).unwrap();
        assert!(table.has(velocity.id()));
        assert_eq!(table.column_of(velocity.id()), None);
        assert!(table.flags().contains(TableFlags::HAS_SPARSE));
        assert_eq!(world.get::<Velocity>(e), Some(&Velocity(1.5)));

        world.remove::<Position>(e).unwrap();
        assert_eq!(world.get::<Velocity>(e), Some(&Velocity(1.5)));

        world.remove::<Velocity>(e).unwrap();
        assert_eq!(world.get::<Velocity>(e), None);
        let record = world.component_record(velocity.id()).unwrap();
        assert!(record.sparse().unwrap().is_empty());
    }

    #[test]
    fn test_sparse_after_use_is_rejected() {
        let mut world = World::new();
        let e = world.new_entity();
        world.set(e, Velocity(1.0)).unwrap();
        let velocity = world.component::<Velocity>();
        assert!(matches!(
            world.add_id(velocity, SPARSE.id()),
            Err(EcsError::TraitAfterUse(_))
        ));
    }

    #[test]
    fn test_get_falls_back_to_inheritable_base() {
        let mut world = World::new();
        let position = world.component::<Position>();
        world.add_id(position, INHERITABLE.id()).unwrap();
        let velocity = world.component::<Velocity>();

        let base = world.new_entity();
        world.set(base, Position { x: 7.0, y: 8.0 }).unwrap();
        world.set(base, Velocity(1.0)).unwrap();
        let instance = world.new_entity();
        world.add_pair(instance, IS_A, base).unwrap();

        assert_eq!(world.get::<Position>(instance), Some(&Position { x: 7.0, y: 8.0 }));
        assert_eq!(world.get::<Velocity>(instance), None);
        assert!(!world.has_id(instance, position.id()));
        assert!(world.get_mut::<Position>(instance).is_none());

        world.set(instance, Position { x: 0.0, y: 0.0 }).unwrap();
        assert_eq!(world.get::<Position>(instance), Some(&Position { x: 0.0, y: 0.0 }));
        assert!(world.has_id(base, velocity.id()));
    }

    #[test]
    fn test_get_follows_long_isa_chain() {
        let mut world = World::new();
        let position = world.component::<Position>();
        world.add_id(position, INHERITABLE.id()).unwrap();

        let base = world.new_entity();
        world.set(base, Position { x: 5.0, y: 6.0 }).unwrap();
        let mut derived = base;
        for _ in 0..500 {
            let next = world.new_entity();
            world.add_pair(next, IS_A, derived).unwrap();
            derived = next;
        }
        assert_eq!(world.get::<Position>(derived), Some(&Position { x: 5.0, y: 6.0 }));
    }

    #[test]
    fn test_pair_values_use_relationship_type() {
        let mut world = World::new();
        let target = world.new_entity();
        let e = world.new_entity();
        world.set_pair(e, target, Velocity(9.0)).unwrap();
        assert_eq!(world.get_pair::<Velocity>(e, target), Some(&Velocity(9.0)));

        let velocity = world.component::<Velocity>();
        assert!(matches!(
            world.set_id(e, Id::pair(velocity, target), Position::default()),
            Err(EcsError::TypeMismatch(_))
        ));
        let tag = world.new_entity();
        assert!(matches!(world.set_id(e, tag.id(), Velocity(1.0)), Err(EcsError::NoData(_))));
    }

    #[test]
    fn test_traversable_targets_are_flagged() {
        let mut world = World::new();
        let parent = world.new_entity();
        let child = world.new_entity();
        world.add_pair(child, CHILD_OF, parent).unwrap();

        let record = world.entity_record(parent).unwrap();
        assert!(record.flags.contains(EntityFlags::TRAVERSABLE));
        let table = world.table(record.table).unwrap();
        assert_eq!(table.traversable_count(), 1);

        world.set(parent, Position::default()).unwrap();
        let table = world.table(world.table_of(parent).unwrap()).unwrap();
        assert!(table.flags().contains(TableFlags::HAS_TRAVERSABLE));
    }

    #[test]
    fn test_up_cache_rematches_when_ancestor_changes() {
        let mut world = World::new();
        let parent = world.new_entity();
        let child = world.new_entity();
        world.add_pair(child, CHILD_OF, parent).unwrap();
        world.set(child, Velocity(1.0)).unwrap();

        let query = world
            .query()
            .with::<Velocity>()
            .with::<Position>()
            .up(CHILD_OF)
            .cache_kind(CacheKind::All)
            .build()
            .unwrap();
        assert_eq!(query.count(&world), 0);

        world.set(parent, Position { x: 1.0, y: 1.0 }).unwrap();
        assert_eq!(query.count(&world), 1);

        let mut it = query.iter(&world);
        assert!(it.next());
        assert_eq!(it.field_src(1), Some(parent));
        assert_eq!(it.field::<Position>(1).unwrap()[0], Position { x: 1.0, y: 1.0 });
        drop(it);

        world.remove::<Position>(parent).unwrap();
        assert_eq!(query.count(&world), 0);
    }

    #[test]
    fn test_destroy_query() {
        let mut world = World::new();
        let query = world
            .query()
            .with::<Position>()
            .cache_kind(CacheKind::Auto)
            .build()
            .unwrap();
        assert!(query.is_cached());
        world.destroy_query(&query).unwrap();
        assert!(matches!(world.destroy_query(&query), Err(EcsError::NoSuchQuery)));

        let uncached = world.query().with::<Position>().build().unwrap();
        assert!(matches!(world.destroy_query(&uncached), Err(EcsError::NoSuchQuery)));
    }

    #[test]
    fn test_query_with_pair_wildcard_reports_target() {
        let mut world = World::new();
        let parent = world.new_entity();
        let child = world.new_entity();
        world.add_pair(child, CHILD_OF, parent).unwrap();

        let query = world
            .query()
            .with_pair(CHILD_OF, TermRef::Wildcard)
            .build()
            .unwrap();
        let mut it = query.iter(&world);
        assert!(it.next());
        assert_eq!(it.entities(), &[child]);
        assert_eq!(it.field_id(0), Some(Id::pair(CHILD_OF, parent)));
        assert!(!it.next());
    }

    #[test]
    fn test_custom_os_api_is_used() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        static CALLS: AtomicUsize = AtomicUsize::new(0);
        unsafe fn counting_alloc(layout: Layout) -> *mut u8 {
            CALLS.fetch_add(1, Ordering::Relaxed);
            // SAFETY: forwarded from the caller
            unsafe { std::alloc::alloc(layout) }
        }

        let config = WorldConfig {
            os: OsApi {
                alloc: counting_alloc,
                ..OsApi::system()
            },
            ..WorldConfig::default()
        };
        let mut world = World::with_config(config);
        let e = world.new_entity();
        world.set(e, Position::default()).unwrap();
        assert!(CALLS.load(Ordering::Relaxed) > 0);
    }

    proptest! {
        #[test]
        fn test_table_identity_ignores_insertion_order(order in Just((0..5usize).collect::<Vec<_>>()).prop_shuffle()) {
            let mut world = World::new();
            let tags: Vec<Entity> = (0..5).map(|_| world.new_entity()).collect();

            let a = world.new_entity();
            for tag in &tags {
                world.add_id(a, tag.id()).unwrap();
            }
            let b = world.new_entity();
            for &i in &order {
                world.add_id(b, tags[i].id()).unwrap();
            }

            prop_assert_eq!(world.table_of(a), world.table_of(b));
            let type_: Vec<Id> = tags.iter().map(|t| t.id()).collect();
            prop_assert_eq!(world.find_table(&type_), world.table_of(a));
        }
    }
}
