//! Component type information and lifecycle hooks.
//!
//! A component with data carries a [`ComponentInfo`]: its layout plus the
//! hooks the storage layer calls when values are created, destroyed or
//! copied. Moves are always bitwise. Components without hooks are treated as
//! plain old data.

use std::{alloc::Layout, any::TypeId, fmt, sync::Arc};

/// Marker trait for types that can be used as components.
///
/// Types implementing this trait must be safe to move in memory
/// (no self-referential pointers).
pub trait Component: Send + Sync + 'static {}

impl<T: Send + Sync + 'static> Component for T {}

/// Default-constructs a value in place.
pub type CtorFn = unsafe fn(*mut u8);
/// Drops a value in place.
pub type DtorFn = unsafe fn(*mut u8);
/// Clones the value at `src` into the uninitialized slot at `dst`.
pub type CloneFn = unsafe fn(src: *const u8, dst: *mut u8);

unsafe fn ctor_impl<T: Default>(ptr: *mut u8) {
    // SAFETY: caller passes an aligned, writable slot for T
    unsafe { ptr.cast::<T>().write(T::default()) };
}

unsafe fn dtor_impl<T>(ptr: *mut u8) {
    // SAFETY: caller passes an initialized T
    unsafe { std::ptr::drop_in_place(ptr.cast::<T>()) };
}

unsafe fn clone_impl<T: Clone>(src: *const u8, dst: *mut u8) {
    // SAFETY: caller passes an initialized T and a writable slot
    unsafe { dst.cast::<T>().write((*src.cast::<T>()).clone()) };
}

/// Optional lifecycle callbacks for a component type.
#[derive(Clone, Copy, Default)]
pub struct TypeHooks {
    pub ctor: Option<CtorFn>,
    pub dtor: Option<DtorFn>,
    pub clone: Option<CloneFn>,
}

impl TypeHooks {
    /// Hooks every Rust type gets: a destructor when `T` needs drop.
    #[must_use]
    pub fn of<T: 'static>() -> Self {
        Self {
            ctor: None,
            dtor: std::mem::needs_drop::<T>().then_some(dtor_impl::<T> as DtorFn),
            clone: None,
        }
    }

    /// Add a constructor that writes `T::default()`.
    #[must_use]
    pub fn with_default<T: Default>(mut self) -> Self {
        self.ctor = Some(ctor_impl::<T>);
        self
    }

    /// Add a clone hook for `T`.
    #[must_use]
    pub fn with_clone<T: Clone>(mut self) -> Self {
        self.clone = Some(clone_impl::<T>);
        self
    }
}

impl fmt::Debug for TypeHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeHooks")
            .field("ctor", &self.ctor.is_some())
            .field("dtor", &self.dtor.is_some())
            .field("clone", &self.clone.is_some())
            .finish()
    }
}

/// Runtime information about a component type.
#[derive(Clone)]
pub struct ComponentInfo {
    /// Type name for debugging.
    name: Arc<str>,
    /// Memory layout of one value.
    layout: Layout,
    hooks: TypeHooks,
    /// Set for components registered from a Rust type.
    type_id: Option<TypeId>,
}

impl ComponentInfo {
    /// Component info for a concrete type.
    #[must_use]
    pub fn of<T: Component>() -> Self {
        Self {
            name: Arc::from(std::any::type_name::<T>()),
            layout: Layout::new::<T>(),
            hooks: TypeHooks::of::<T>(),
            type_id: Some(TypeId::of::<T>()),
        }
    }

    /// Component info for a type only known at runtime.
    #[must_use]
    pub fn new(name: &str, layout: Layout, hooks: TypeHooks) -> Self {
        Self {
            name: Arc::from(name),
            layout,
            hooks,
            type_id: None,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn layout(&self) -> Layout {
        self.layout
    }

    #[must_use]
    pub const fn size(&self) -> usize {
        self.layout.size()
    }

    #[must_use]
    pub const fn align(&self) -> usize {
        self.layout.align()
    }

    #[must_use]
    pub const fn hooks(&self) -> &TypeHooks {
        &self.hooks
    }

    pub(crate) fn set_hooks(&mut self, hooks: TypeHooks) {
        self.hooks = hooks;
    }

    /// Check if this info is for the given type.
    #[must_use]
    pub fn is<T: 'static>(&self) -> bool {
        self.type_id == Some(TypeId::of::<T>())
    }

    #[must_use]
    pub const fn type_id(&self) -> Option<TypeId> {
        self.type_id
    }

    #[must_use]
    pub const fn needs_drop(&self) -> bool {
        self.hooks.dtor.is_some()
    }

    #[must_use]
    pub const fn has_ctor(&self) -> bool {
        self.hooks.ctor.is_some()
    }

    /// Whether values can be copied, through a hook or bitwise.
    #[must_use]
    pub const fn can_clone(&self) -> bool {
        self.hooks.clone.is_some() || !self.needs_drop()
    }

    /// Drop a component at the given pointer.
    ///
    /// # Safety
    ///
    /// `ptr` must point to an initialized value of this type, which must not
    /// be accessed afterwards.
    pub unsafe fn drop_in_place(&self, ptr: *mut u8) {
        if let Some(dtor) = self.hooks.dtor {
            // SAFETY: forwarded to the caller
            unsafe { dtor(ptr) };
        }
    }

    /// Default-construct a value. Returns `false` if there is no constructor.
    ///
    /// # Safety
    ///
    /// `ptr` must be a writable, aligned slot for this type.
    pub unsafe fn construct(&self, ptr: *mut u8) -> bool {
        match self.hooks.ctor {
            Some(ctor) => {
                // SAFETY: forwarded to the caller
                unsafe { ctor(ptr) };
                true
            }
            None => false,
        }
    }

    /// Copy the value at `src` into `dst`. Types without a clone hook are
    /// copied bitwise when they need no drop. Returns `false` otherwise.
    ///
    /// # Safety
    ///
    /// `src` must hold an initialized value and `dst` must be a writable,
    /// aligned slot that does not overlap it.
    pub unsafe fn clone_into(&self, src: *const u8, dst: *mut u8) -> bool {
        if let Some(clone) = self.hooks.clone {
            // SAFETY: forwarded to the caller
            unsafe { clone(src, dst) };
            true
        } else if !self.needs_drop() {
            // SAFETY: forwarded to the caller
            unsafe { std::ptr::copy_nonoverlapping(src, dst, self.size()) };
            true
        } else {
            false
        }
    }
}

impl fmt::Debug for ComponentInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentInfo")
            .field("name", &self.name)
            .field("size", &self.layout.size())
            .field("align", &self.layout.align())
            .field("hooks", &self.hooks)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::mem::MaybeUninit;

    use super::*;

    #[derive(Default, Clone, PartialEq, Debug)]
    struct Name(String);

    #[derive(Clone, Copy)]
    struct Position {
        x: f32,
        y: f32,
    }

    #[test]
    fn test_info_of_pod() {
        let info = ComponentInfo::of::<Position>();
        assert_eq!(info.size(), std::mem::size_of::<Position>());
        assert_eq!(info.align(), std::mem::align_of::<Position>());
        assert!(!info.needs_drop());
        assert!(!info.has_ctor());
        assert!(info.can_clone());
        assert!(info.is::<Position>());
        assert!(!info.is::<Name>());
    }

    #[test]
    fn test_hooks_construct_and_clone() {
        let mut info = ComponentInfo::of::<Name>();
        assert!(info.needs_drop());
        assert!(!info.can_clone());

        info.set_hooks(TypeHooks::of::<Name>().with_default::<Name>().with_clone::<Name>());

        let mut a = MaybeUninit::<Name>::uninit();
        let mut b = MaybeUninit::<Name>::uninit();
        // SAFETY: both slots are valid for Name and dropped below
        unsafe {
            assert!(info.construct(a.as_mut_ptr().cast()));
            a.assume_init_mut().0.push_str("bob");
            assert!(info.clone_into(a.as_ptr().cast(), b.as_mut_ptr().cast()));
            assert_eq!(b.assume_init_ref(), &Name("bob".into()));
            info.drop_in_place(a.as_mut_ptr().cast());
            info.drop_in_place(b.as_mut_ptr().cast());
        }
    }

    #[test]
    fn test_pod_clone_is_bitwise() {
        let info = ComponentInfo::of::<Position>();
        let src = Position { x: 1.0, y: 2.0 };
        let mut dst = MaybeUninit::<Position>::uninit();
        // SAFETY: src is initialized and dst is a valid slot
        let dst = unsafe {
            assert!(info.clone_into(std::ptr::from_ref(&src).cast(), dst.as_mut_ptr().cast()));
            dst.assume_init()
        };
        assert_eq!((dst.x, dst.y), (1.0, 2.0));
    }
}
