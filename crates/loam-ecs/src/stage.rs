//! Command stages for deferred mutation.
//!
//! A [`Stage`] records structural changes instead of applying them. The
//! world replays every stage in FIFO order when it merges, so code that only
//! holds `&World` (an iterator, a worker thread) can still queue changes.
//! Each stage owns its own lock, so workers that push to different stages
//! never contend.

use std::{any::Any, fmt};

use parking_lot::Mutex;

use crate::{
    World,
    component::Component,
    entity::Entity,
    error::{EcsError, EcsResult},
    id::Id,
};

/// Writes a boxed value into the world at merge time.
pub type SetFn = fn(&mut World, Entity, Id, Box<dyn Any + Send>) -> EcsResult<()>;

fn apply_set<T: Component>(
    world: &mut World,
    entity: Entity,
    id: Id,
    value: Box<dyn Any + Send>,
) -> EcsResult<()> {
    let value = value
        .downcast::<T>()
        .map_err(|_| EcsError::TypeMismatch(id))?;
    world.set_id(entity, id, *value)
}

/// A recorded mutation.
pub enum Command {
    Add {
        entity: Entity,
        id: Id,
    },
    Remove {
        entity: Entity,
        id: Id,
    },
    Set {
        entity: Entity,
        id: Id,
        value: Box<dyn Any + Send>,
        apply: SetFn,
    },
    Delete {
        entity: Entity,
    },
    Clear {
        entity: Entity,
    },
    Modified {
        entity: Entity,
        id: Id,
    },
    /// Fill `dst`, created empty when the command was recorded, with the
    /// ids of `entity`.
    Clone {
        entity: Entity,
        dst: Entity,
        copy_values: bool,
    },
}

impl Command {
    /// The entity the command mutates.
    #[must_use]
    pub const fn entity(&self) -> Entity {
        match self {
            Self::Add { entity, .. }
            | Self::Remove { entity, .. }
            | Self::Set { entity, .. }
            | Self::Delete { entity }
            | Self::Clear { entity }
            | Self::Modified { entity, .. }
            | Self::Clone { entity, .. } => *entity,
        }
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Add { entity, id } => write!(f, "Add({entity}, {id:?})"),
            Self::Remove { entity, id } => write!(f, "Remove({entity}, {id:?})"),
            Self::Set { entity, id, .. } => write!(f, "Set({entity}, {id:?})"),
            Self::Delete { entity } => write!(f, "Delete({entity})"),
            Self::Clear { entity } => write!(f, "Clear({entity})"),
            Self::Modified { entity, id } => write!(f, "Modified({entity}, {id:?})"),
            Self::Clone { entity, dst, .. } => write!(f, "Clone({entity} -> {dst})"),
        }
    }
}

/// A FIFO queue of commands.
///
/// Stage 0 is the main stage, used by the world's own mutators while
/// deferred. Stages are `Sync`: a `&Stage` can be handed to a worker thread.
pub struct Stage {
    index: usize,
    queue: Mutex<Vec<Command>>,
}

impl Stage {
    #[must_use]
    pub const fn new(index: usize) -> Self {
        Self {
            index,
            queue: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub const fn index(&self) -> usize {
        self.index
    }

    /// Number of queued commands.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    fn push(&self, command: Command) {
        self.queue.lock().push(command);
    }

    pub fn add_id(&self, entity: Entity, id: Id) {
        self.push(Command::Add { entity, id });
    }

    pub fn remove_id(&self, entity: Entity, id: Id) {
        self.push(Command::Remove { entity, id });
    }

    /// Queue a value for `id`, which must be registered for `T` when the
    /// command is replayed.
    pub fn set<T: Component>(&self, entity: Entity, id: Id, value: T) {
        self.push(Command::Set {
            entity,
            id,
            value: Box::new(value),
            apply: apply_set::<T>,
        });
    }

    pub fn delete(&self, entity: Entity) {
        self.push(Command::Delete { entity });
    }

    pub fn clear(&self, entity: Entity) {
        self.push(Command::Clear { entity });
    }

    pub fn modified(&self, entity: Entity, id: Id) {
        self.push(Command::Modified { entity, id });
    }

    pub fn clone_entity(&self, entity: Entity, dst: Entity, copy_values: bool) {
        self.push(Command::Clone {
            entity,
            dst,
            copy_values,
        });
    }

    /// Take all queued commands, oldest first.
    pub(crate) fn drain(&self) -> Vec<Command> {
        std::mem::take(&mut *self.queue.lock())
    }
}

impl fmt::Debug for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage")
            .field("index", &self.index)
            .field("queued", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::WorldConfig;

    #[derive(Debug, Clone, Copy, PartialEq)]
    struct Health(u32);

    #[test]
    fn test_commands_queue_in_order() {
        let stage = Stage::new(1);
        let e = Entity::from_index(100);
        stage.add_id(e, Id::from_raw(20));
        stage.delete(e);
        stage.set(e, Id::from_raw(21), Health(3));

        assert_eq!(stage.len(), 3);
        let commands = stage.drain();
        assert!(stage.is_empty());
        assert!(matches!(commands[0], Command::Add { .. }));
        assert!(matches!(commands[1], Command::Delete { .. }));
        assert!(matches!(commands[2], Command::Set { .. }));
        assert!(commands.iter().all(|c| c.entity() == e));
    }

    #[test]
    fn test_deferred_set_applies_on_merge() {
        let mut world = World::new();
        let e = world.new_entity();
        let health = world.component::<Health>();

        world.stage(0).unwrap().set(e, health.id(), Health(7));
        assert_eq!(world.get::<Health>(e), None);

        world.merge();
        assert_eq!(world.get::<Health>(e), Some(&Health(7)));
    }

    #[test]
    fn test_set_with_wrong_type_is_dropped() {
        let mut world = World::new();
        let e = world.new_entity();
        let health = world.component::<Health>();

        world.stage(0).unwrap().set(e, health.id(), 5u64);
        world.merge();
        assert!(!world.has::<Health>(e));
    }

    #[test]
    fn test_stage_is_sync() {
        fn assert_sync<T: Sync + Send>() {}
        assert_sync::<Stage>();
    }

    #[test]
    fn test_workers_record_on_their_own_stage() {
        crate::init_test_tracing();
        const WORKERS: usize = 4;
        const PER_WORKER: u32 = 16;

        let mut world = World::with_config(WorldConfig {
            stage_count: WORKERS + 1,
            ..WorldConfig::default()
        });
        let health = world.component::<Health>();
        let entities: Vec<Entity> = (0..WORKERS as u32 * PER_WORKER)
            .map(|_| world.new_entity())
            .collect();

        std::thread::scope(|scope| {
            for worker in 0..WORKERS {
                let stage = world.stage(worker + 1).unwrap();
                let chunk = &entities[worker * PER_WORKER as usize..][..PER_WORKER as usize];
                scope.spawn(move || {
                    for (i, &e) in chunk.iter().enumerate() {
                        stage.set(e, health.id(), Health(i as u32));
                    }
                });
            }
        });

        for worker in 0..WORKERS {
            assert_eq!(world.stage(worker + 1).unwrap().len(), PER_WORKER as usize);
        }
        world.merge();

        for chunk in entities.chunks(PER_WORKER as usize) {
            for (i, &e) in chunk.iter().enumerate() {
                assert_eq!(world.get::<Health>(e), Some(&Health(i as u32)));
            }
        }
        assert!((0..world.stage_count()).all(|i| world.stage(i).unwrap().is_empty()));
    }

    #[test]
    fn test_workers_share_one_stage() {
        crate::init_test_tracing();
        let mut world = World::with_config(WorldConfig {
            stage_count: 2,
            ..WorldConfig::default()
        });
        let tag = world.new_entity();
        let entities: Vec<Entity> = (0..64).map(|_| world.new_entity()).collect();

        let stage = world.stage(1).unwrap();
        std::thread::scope(|scope| {
            for chunk in entities.chunks(16) {
                scope.spawn(move || {
                    for &e in chunk {
                        stage.add_id(e, tag.id());
                    }
                });
            }
        });
        assert_eq!(stage.len(), entities.len());

        world.merge();
        assert!(entities.iter().all(|&e| world.has_id(e, tag.id())));
    }
}
