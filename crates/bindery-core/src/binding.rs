#![forbid(unsafe_code)]

//! Bindings.
//!
//! A binding is a closure that computes a property's value. While the
//! closure runs, every tracked read registers the binding as an observer of
//! the slot being read; the previous evaluation's dependencies are dropped
//! first, so the dependency set always reflects the most recent evaluation.
//!
//! # Invariants
//!
//! 1. A binding is installed on at most one slot at a time.
//! 2. `updating` is set for the whole duration of an evaluation (including
//!    the walk over the binding's dependents) and of its deferred
//!    notification. Re-entering evaluation while it is set is a binding
//!    loop.
//! 3. A failed or looping evaluation never writes the target and reports
//!    "unchanged".
//!
//! # Failure Modes
//!
//! - Re-entry through a dependency cycle: the re-entered binding records
//!   [`BindingErrorKind::BindingLoop`], its value stays at the last completed
//!   evaluation.
//! - Fallible closure returns `Err`: the error is recorded, value kept.

use std::any::{Any, TypeId};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::marker::PhantomData;
use std::ops::Deref;
use std::panic::Location;
use std::rc::{Rc, Weak};

use smallvec::SmallVec;

use crate::binding_data::UntypedPropertyData;
use crate::error::{BindingError, BindingErrorKind};
use crate::observer::{evaluate_bindings, notify_change_handlers};
use crate::property::PropertyData;
use crate::status::{
    BindingKey, EvaluationScope, Graph, ObserverKey, SlotKey, release_binding_later, with_graph,
};

/// Dependencies a binding tracks without spilling to the heap.
pub const INLINE_DEPENDENCIES: usize = 4;

/// Bindings whose handlers still need to run after an evaluation walk.
pub(crate) type PendingBindingObservers = SmallVec<[Rc<BindingCore>; 4]>;

type EvaluateFn = dyn Fn(&dyn Any) -> Result<bool, BindingError>;

/// Graph-side bookkeeping of a binding.
pub(crate) struct BindingNode {
    /// Observers of the slot the binding is installed on.
    pub(crate) first_observer: Option<ObserverKey>,
    /// Dependency observers this binding placed on the slots it read.
    pub(crate) dependencies: SmallVec<[ObserverKey; INLINE_DEPENDENCIES]>,
    pub(crate) slot: Option<SlotKey>,
    pub(crate) owner: Weak<BindingCore>,
}

impl BindingNode {
    pub(crate) fn detached(owner: Weak<BindingCore>) -> Self {
        Self {
            first_observer: None,
            dependencies: SmallVec::new(),
            slot: None,
            owner,
        }
    }
}

impl Graph {
    pub(crate) fn clear_dependencies(&mut self, binding: BindingKey) {
        let Some(node) = self.bindings.get_mut(binding) else {
            return;
        };
        for dependency in std::mem::take(&mut node.dependencies) {
            self.release_observer(dependency);
        }
    }

    pub(crate) fn release_binding(&mut self, binding: BindingKey) {
        let Some(node) = self.bindings.remove(binding) else {
            return;
        };
        for dependency in node.dependencies {
            self.release_observer(dependency);
        }
        self.detach_list(node.first_observer);
    }
}

/// Sets a flag for the guard's lifetime.
struct FlagGuard<'a> {
    flag: &'a Cell<bool>,
    previous: bool,
}

impl<'a> FlagGuard<'a> {
    fn set(flag: &'a Cell<bool>) -> Self {
        let previous = flag.replace(true);
        Self { flag, previous }
    }
}

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.flag.set(self.previous);
    }
}

pub(crate) struct BindingCore {
    pub(crate) key: BindingKey,
    evaluate: Box<EvaluateFn>,
    target_type: TypeId,
    value_type_name: &'static str,
    location: &'static Location<'static>,
    property: RefCell<Option<Weak<dyn UntypedPropertyData>>>,
    updating: Cell<bool>,
    pending_notify: Cell<bool>,
    sticky: Cell<bool>,
    error: RefCell<BindingError>,
}

impl BindingCore {
    fn new(
        evaluate: Box<EvaluateFn>,
        target_type: TypeId,
        value_type_name: &'static str,
        location: &'static Location<'static>,
    ) -> Rc<Self> {
        Rc::new_cyclic(|owner| {
            let key = with_graph(|graph| graph.bindings.insert(BindingNode::detached(owner.clone())));
            Self {
                key,
                evaluate,
                target_type,
                value_type_name,
                location,
                property: RefCell::new(None),
                updating: Cell::new(false),
                pending_notify: Cell::new(false),
                sticky: Cell::new(false),
                error: RefCell::new(BindingError::none()),
            }
        })
    }

    pub(crate) fn target_type(&self) -> TypeId {
        self.target_type
    }

    pub(crate) fn value_type_name(&self) -> &'static str {
        self.value_type_name
    }

    pub(crate) fn location(&self) -> &'static Location<'static> {
        self.location
    }

    pub(crate) fn is_updating(&self) -> bool {
        self.updating.get()
    }

    pub(crate) fn is_sticky(&self) -> bool {
        self.sticky.get()
    }

    pub(crate) fn set_error(&self, error: BindingError) {
        *self.error.borrow_mut() = error;
    }

    pub(crate) fn attach(&self, target: Weak<dyn UntypedPropertyData>) {
        *self.property.borrow_mut() = Some(target);
    }

    /// Drop the dependencies and the target of a binding that just left
    /// its slot.
    pub(crate) fn detach_from_property(&self) {
        with_graph(|graph| {
            graph.clear_dependencies(self.key);
            if let Some(node) = graph.bindings.get_mut(self.key) {
                node.slot = None;
            }
        });
        self.property.borrow_mut().take();
    }

    /// Evaluate, then re-evaluate every dependent binding if the value
    /// changed. Bindings needing a deferred notification end up in
    /// `pending`.
    pub(crate) fn evaluate_recursive(&self, pending: &mut PendingBindingObservers) {
        if self.updating.get() {
            tracing::debug!(location = %self.location, "binding loop detected");
            self.set_error(BindingError::binding_loop());
            return;
        }
        #[cfg(feature = "tracing")]
        let _span = tracing::trace_span!(
            "binding_evaluate",
            location = %self.location,
            value_type = self.value_type_name
        )
        .entered();

        let _updating = FlagGuard::set(&self.updating);
        let changed = self.evaluate_once();
        self.pending_notify.set(self.pending_notify.get() || changed);
        if !changed {
            return;
        }
        let first = with_graph(|graph| graph.bindings.get(self.key).and_then(|b| b.first_observer));
        evaluate_bindings(first, pending);
    }

    fn evaluate_once(&self) -> bool {
        let Some(target) = self.property.borrow().as_ref().and_then(Weak::upgrade) else {
            return false;
        };
        with_graph(|graph| graph.clear_dependencies(self.key));
        if self.error.borrow().is_error() {
            self.set_error(BindingError::none());
        }
        let result = {
            let _scope = EvaluationScope::enter(self.key);
            (self.evaluate)(target.property_data())
        };
        match result {
            Ok(changed) => changed,
            Err(error) => {
                tracing::debug!(location = %self.location, %error, "binding evaluation failed");
                self.set_error(error);
                false
            }
        }
    }

    /// Deliver a notification recorded by an earlier evaluation. Returns
    /// whether anything was delivered.
    pub(crate) fn notify_non_recursive(&self) -> bool {
        if !self.pending_notify.replace(false) {
            return false;
        }
        let _updating = FlagGuard::set(&self.updating);
        let (first, static_observer) = with_graph(|graph| {
            let Some(node) = graph.bindings.get(self.key) else {
                return (None, None);
            };
            let static_observer = node.slot.and_then(|slot| graph.static_observer(slot));
            (node.first_observer, static_observer)
        });
        notify_change_handlers(first);
        if let Some(static_observer) = static_observer {
            static_observer();
        }
        true
    }

    /// Forget a recorded notification without delivering it.
    pub(crate) fn discard_pending_notify(&self) {
        self.pending_notify.set(false);
    }
}

impl Drop for BindingCore {
    fn drop(&mut self) {
        release_binding_later(self.key);
    }
}

/// A type-erased, possibly null, shared handle to a binding.
#[derive(Clone, Default)]
pub struct UntypedPropertyBinding {
    core: Option<Rc<BindingCore>>,
}

impl UntypedPropertyBinding {
    /// The null binding.
    #[must_use]
    pub fn null() -> Self {
        Self::default()
    }

    pub(crate) fn from_core(core: Option<Rc<BindingCore>>) -> Self {
        Self { core }
    }

    pub(crate) fn core(&self) -> Option<&Rc<BindingCore>> {
        self.core.as_ref()
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        self.core.is_none()
    }

    /// The error recorded by the most recent evaluation.
    #[must_use]
    pub fn error(&self) -> BindingError {
        self.core
            .as_ref()
            .map(|core| core.error.borrow().clone())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn has_error(&self) -> bool {
        self.core
            .as_ref()
            .is_some_and(|core| core.error.borrow().is_error())
    }

    /// Name of the value type the binding produces.
    #[must_use]
    pub fn value_type_name(&self) -> Option<&'static str> {
        self.core.as_ref().map(|core| core.value_type_name)
    }

    /// Where the binding was created.
    #[must_use]
    pub fn location(&self) -> Option<&'static Location<'static>> {
        self.core.as_ref().map(|core| core.location)
    }

    #[must_use]
    pub fn is_sticky(&self) -> bool {
        self.core.as_ref().is_some_and(|core| core.sticky.get())
    }

    /// A sticky binding survives value writes and `remove_binding` on its
    /// property; only an explicit `set_binding` replaces it.
    pub fn set_sticky(&self, sticky: bool) {
        if let Some(core) = &self.core {
            core.sticky.set(sticky);
        }
    }

    /// Whether the binding is currently installed on a property.
    #[must_use]
    pub fn is_installed(&self) -> bool {
        self.core.as_ref().is_some_and(|core| {
            with_graph(|graph| graph.bindings.get(core.key).is_some_and(|b| b.slot.is_some()))
        })
    }

    /// Whether both handles refer to the same binding (two nulls compare
    /// equal).
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        match (&self.core, &other.core) {
            (Some(a), Some(b)) => Rc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        }
    }
}

impl fmt::Debug for UntypedPropertyBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.core {
            None => f.write_str("UntypedPropertyBinding(null)"),
            Some(core) => f
                .debug_struct("UntypedPropertyBinding")
                .field("value_type", &core.value_type_name)
                .field("location", &format_args!("{}", core.location))
                .field("sticky", &core.sticky.get())
                .field("error", &*core.error.borrow())
                .finish(),
        }
    }
}

/// A binding producing values of type `T`.
pub struct PropertyBinding<T> {
    untyped: UntypedPropertyBinding,
    _value: PhantomData<fn() -> T>,
}

impl<T: 'static> PropertyBinding<T> {
    /// Create a binding from an infallible closure.
    ///
    /// Every tracked property read inside `f` becomes a dependency.
    #[track_caller]
    pub fn new(f: impl Fn() -> T + 'static) -> Self {
        Self::try_new(move || Ok(f()))
    }

    /// Create a binding from a fallible closure. An `Err` leaves the
    /// property's value untouched and is reported through
    /// [`UntypedPropertyBinding::error`].
    #[track_caller]
    pub fn try_new(f: impl Fn() -> Result<T, BindingError> + 'static) -> Self {
        let location = Location::caller();
        let evaluate: Box<EvaluateFn> = Box::new(move |target: &dyn Any| {
            let Some(data) = target.downcast_ref::<PropertyData<T>>() else {
                return Err(BindingError::new(
                    BindingErrorKind::UnknownError,
                    "binding target has a different value type",
                ));
            };
            Ok(data.write(f()?))
        });
        let core = BindingCore::new(
            evaluate,
            TypeId::of::<PropertyData<T>>(),
            std::any::type_name::<T>(),
            location,
        );
        Self::from_untyped_unchecked(UntypedPropertyBinding::from_core(Some(core)))
    }

    #[must_use]
    pub fn null() -> Self {
        Self::from_untyped_unchecked(UntypedPropertyBinding::null())
    }

    pub(crate) fn from_untyped_unchecked(untyped: UntypedPropertyBinding) -> Self {
        Self {
            untyped,
            _value: PhantomData,
        }
    }

    #[must_use]
    pub fn untyped(&self) -> &UntypedPropertyBinding {
        &self.untyped
    }

    #[must_use]
    pub fn into_untyped(self) -> UntypedPropertyBinding {
        self.untyped
    }
}

impl<T> Clone for PropertyBinding<T> {
    fn clone(&self) -> Self {
        Self {
            untyped: self.untyped.clone(),
            _value: PhantomData,
        }
    }
}

impl<T> Deref for PropertyBinding<T> {
    type Target = UntypedPropertyBinding;

    fn deref(&self) -> &UntypedPropertyBinding {
        &self.untyped
    }
}

impl<T> fmt::Debug for PropertyBinding<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.untyped.fmt(f)
    }
}

impl<T> From<PropertyBinding<T>> for UntypedPropertyBinding {
    fn from(binding: PropertyBinding<T>) -> Self {
        binding.untyped
    }
}

impl<T: 'static> TryFrom<UntypedPropertyBinding> for PropertyBinding<T> {
    type Error = BindingError;

    /// Succeeds for null bindings and bindings producing `T`.
    fn try_from(untyped: UntypedPropertyBinding) -> Result<Self, BindingError> {
        match untyped.core() {
            Some(core) if core.target_type != TypeId::of::<PropertyData<T>>() => {
                Err(BindingError::new(
                    BindingErrorKind::UnknownError,
                    format!(
                        "binding produces {}, not {}",
                        core.value_type_name,
                        std::any::type_name::<T>()
                    ),
                ))
            }
            _ => Ok(Self::from_untyped_unchecked(untyped)),
        }
    }
}
