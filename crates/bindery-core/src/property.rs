#![forbid(unsafe_code)]

//! Observable properties.
//!
//! [`Property<T>`] couples a value with a binding slot. Reads register a
//! dependency of whatever binding is being evaluated; writes remove a
//! non-sticky binding, compare against the stored value, and notify
//! observers only if the value actually changed.
//!
//! Properties are shared handles (`Clone` is cheap). Closures that need to
//! refer back to their own property should capture a [`WeakProperty`] to
//! avoid a reference cycle.
//!
//! # Example
//!
//! ```
//! use bindery_core::{Property, PropertyBinding};
//!
//! let a = Property::new(1);
//! let a2 = a.clone();
//! let b = Property::new(0);
//! b.set_binding(PropertyBinding::new(move || a2.value() * 2));
//! assert_eq!(b.value(), 2);
//!
//! a.set_value(5);
//! assert_eq!(b.value(), 10);
//! ```

use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use crate::binding::PropertyBinding;
use crate::binding_data::{BindingDataRef, PropertyBindingData, UntypedPropertyData};
use crate::observer::ChangeHandler;

/// Value storage a binding writes into.
pub struct PropertyData<T> {
    value: RefCell<T>,
    equal: Option<fn(&T, &T) -> bool>,
}

impl<T: 'static> PropertyData<T> {
    /// Storage comparing writes with `PartialEq`.
    #[must_use]
    pub fn new(value: T) -> Self
    where
        T: PartialEq,
    {
        Self {
            value: RefCell::new(value),
            equal: Some(<T as PartialEq>::eq),
        }
    }

    /// Storage treating every write as a change.
    #[must_use]
    pub fn without_equality(value: T) -> Self {
        Self {
            value: RefCell::new(value),
            equal: None,
        }
    }

    /// Whether `value` equals the stored value. Always `false` for types
    /// without an equality check.
    pub(crate) fn is_equal(&self, value: &T) -> bool {
        self.equal
            .is_some_and(|eq| eq(&self.value.borrow(), value))
    }

    /// Store `value` unless it equals the current one; reports whether the
    /// stored value changed.
    pub fn write(&self, value: T) -> bool {
        if self.is_equal(&value) {
            return false;
        }
        *self.value.borrow_mut() = value;
        true
    }

    /// Untracked read by reference.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.value.borrow())
    }
}

pub(crate) struct PropertyInner<T: 'static> {
    data: PropertyData<T>,
    bindings: PropertyBindingData,
}

impl<T: 'static> UntypedPropertyData for PropertyInner<T> {
    fn property_data(&self) -> &dyn std::any::Any {
        &self.data
    }
}

/// An observable value with an optional binding.
pub struct Property<T: 'static> {
    inner: Rc<PropertyInner<T>>,
}

impl<T: 'static> Property<T> {
    /// Create a property. Writes of an equal value are not notified.
    #[must_use]
    pub fn new(value: T) -> Self
    where
        T: PartialEq,
    {
        Self::from_data(PropertyData::new(value))
    }

    /// Create a property for a type without `PartialEq`: every write
    /// notifies.
    #[must_use]
    pub fn without_equality(value: T) -> Self {
        Self::from_data(PropertyData::without_equality(value))
    }

    /// Create a property driven by `binding`.
    #[must_use]
    pub fn from_binding(binding: PropertyBinding<T>) -> Self
    where
        T: Default + PartialEq,
    {
        let property = Self::new(T::default());
        property.set_binding(binding);
        property
    }

    /// Create a property bound to `f`.
    #[track_caller]
    #[must_use]
    pub fn bound(f: impl Fn() -> T + 'static) -> Self
    where
        T: Default + PartialEq,
    {
        Self::from_binding(PropertyBinding::new(f))
    }

    fn from_data(data: PropertyData<T>) -> Self {
        Self {
            inner: Rc::new(PropertyInner {
                data,
                bindings: PropertyBindingData::new(),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Rc<PropertyInner<T>>) -> Self {
        Self { inner }
    }

    /// Read the value, registering a dependency of the binding being
    /// evaluated.
    #[must_use]
    pub fn value(&self) -> T
    where
        T: Clone,
    {
        self.with(T::clone)
    }

    /// Read the value by reference (tracked like [`value`](Self::value)).
    ///
    /// The property must not be written from inside `f`.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        self.binding_data().register_with_currently_evaluating_binding();
        self.inner.data.with(f)
    }

    /// Write the value.
    ///
    /// Removes a non-sticky binding first. Observers are notified only if
    /// the new value differs from the stored one.
    pub fn set_value(&self, value: T) {
        let data = self.binding_data();
        data.remove_binding();
        if self.inner.data.write(value) {
            data.notify_observers();
        }
    }

    /// Install `binding`, returning the previous one.
    pub fn set_binding(&self, binding: PropertyBinding<T>) -> PropertyBinding<T> {
        let previous = self
            .binding_data()
            .set_binding(binding.untyped(), self.target());
        PropertyBinding::from_untyped_unchecked(previous)
    }

    /// Install a binding built from `f`, returning the previous one.
    #[track_caller]
    pub fn bind(&self, f: impl Fn() -> T + 'static) -> PropertyBinding<T> {
        self.set_binding(PropertyBinding::new(f))
    }

    /// The installed binding, or a null binding.
    #[must_use]
    pub fn binding(&self) -> PropertyBinding<T> {
        PropertyBinding::from_untyped_unchecked(self.binding_data().binding())
    }

    /// Uninstall and return the binding; the value keeps its last result.
    pub fn take_binding(&self) -> PropertyBinding<T> {
        self.set_binding(PropertyBinding::null())
    }

    /// Uninstall a non-sticky binding.
    pub fn remove_binding(&self) {
        self.binding_data().remove_binding();
    }

    #[must_use]
    pub fn has_binding(&self) -> bool {
        self.binding_data().has_binding()
    }

    /// Run `f` after every change of the value.
    pub fn on_value_changed(&self, f: impl Fn() + 'static) -> ChangeHandler {
        ChangeHandler::attach(Some(self.binding_data()), Rc::new(f))
    }

    /// Run `f` now and after every change of the value.
    pub fn subscribe(&self, f: impl Fn() + 'static) -> ChangeHandler {
        f();
        self.on_value_changed(f)
    }

    /// Handle to the property's binding slot.
    #[must_use]
    pub fn binding_data(&self) -> BindingDataRef {
        self.inner.bindings.handle()
    }

    #[must_use]
    pub fn downgrade(&self) -> WeakProperty<T> {
        WeakProperty {
            inner: Rc::downgrade(&self.inner),
        }
    }

    /// Whether both handles refer to the same property.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    fn target(&self) -> Weak<dyn UntypedPropertyData> {
        let weak: Weak<PropertyInner<T>> = Rc::downgrade(&self.inner);
        weak
    }
}

impl<T: 'static> Clone for Property<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T: Default + PartialEq + 'static> Default for Property<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: fmt::Debug + 'static> fmt::Debug for Property<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.inner.data.with(|value| {
            f.debug_struct("Property")
                .field("value", value)
                .field("has_binding", &self.has_binding())
                .finish()
        })
    }
}

/// Non-owning handle to a [`Property`].
pub struct WeakProperty<T: 'static> {
    inner: Weak<PropertyInner<T>>,
}

impl<T: 'static> WeakProperty<T> {
    #[must_use]
    pub fn upgrade(&self) -> Option<Property<T>> {
        self.inner.upgrade().map(Property::from_inner)
    }
}

impl<T: 'static> Clone for WeakProperty<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Weak::clone(&self.inner),
        }
    }
}

impl<T: 'static> fmt::Debug for WeakProperty<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakProperty")
            .field("alive", &(self.inner.strong_count() > 0))
            .finish()
    }
}
