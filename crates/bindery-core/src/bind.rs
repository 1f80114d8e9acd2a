#![forbid(unsafe_code)]

//! Ergonomic helpers for building bindings from properties.
//!
//! [`bind_property`], [`bind_mapped`] and [`bind_mapped2`] build
//! [`PropertyBinding`]s that track their source properties; the [`bind!`],
//! [`bind_map!`] and [`bind_map2!`] macros are shorthands for them.
//! [`BindingScope`] collects the change handlers of one logical owner (a
//! widget, a view model) and releases them together.
//!
//! # Usage
//!
//! ```
//! use bindery_core::{Property, bind_map2};
//!
//! let width = Property::new(10);
//! let height = Property::new(20);
//! let area = Property::new(0);
//! area.set_binding(bind_map2!(width, height, |w, h| w * h));
//! assert_eq!(area.value(), 200);
//!
//! width.set_value(5);
//! assert_eq!(area.value(), 100);
//! ```
//!
//! # Invariants
//!
//! 1. Helper bindings read their sources through tracked reads, so they
//!    re-evaluate whenever a source changes.
//! 2. Handlers held by a [`BindingScope`] are released in reverse
//!    registration order on `clear()` and on drop.
//! 3. After a scope is cleared or dropped, none of its callbacks fire.

use std::fmt;

use crate::binding::PropertyBinding;
use crate::observer::ChangeHandler;
use crate::property::Property;

/// A binding that mirrors `source`.
#[track_caller]
pub fn bind_property<T: Clone + 'static>(source: &Property<T>) -> PropertyBinding<T> {
    let src = source.clone();
    PropertyBinding::new(move || src.value())
}

/// A binding computing `map(source)`.
#[track_caller]
pub fn bind_mapped<S: 'static, T: 'static>(
    source: &Property<S>,
    map: impl Fn(&S) -> T + 'static,
) -> PropertyBinding<T> {
    let src = source.clone();
    PropertyBinding::new(move || src.with(|v| map(v)))
}

/// A binding computing `map(s1, s2)`.
#[track_caller]
pub fn bind_mapped2<S1: 'static, S2: 'static, T: 'static>(
    s1: &Property<S1>,
    s2: &Property<S2>,
    map: impl Fn(&S1, &S2) -> T + 'static,
) -> PropertyBinding<T> {
    let src1 = s1.clone();
    let src2 = s2.clone();
    PropertyBinding::new(move || src1.with(|v1| src2.with(|v2| map(v1, v2))))
}

/// Create a [`PropertyBinding`] mirroring a property.
///
/// # Examples
///
/// ```
/// use bindery_core::{Property, bind};
///
/// let source = Property::new(3);
/// let mirror = Property::new(0);
/// mirror.set_binding(bind!(source));
/// assert_eq!(mirror.value(), 3);
/// ```
#[macro_export]
macro_rules! bind {
    ($property:expr) => {
        $crate::bind::bind_property(&$property)
    };
}

/// Create a mapped [`PropertyBinding`] from a property.
///
/// # Examples
///
/// ```
/// use bindery_core::{Property, bind_map};
///
/// let count = Property::new(2);
/// let label = Property::new(String::new());
/// label.set_binding(bind_map!(count, |c| format!("Count: {c}")));
/// assert_eq!(label.value(), "Count: 2");
/// ```
#[macro_export]
macro_rules! bind_map {
    ($property:expr, $f:expr) => {
        $crate::bind::bind_mapped(&$property, $f)
    };
}

/// Create a mapped [`PropertyBinding`] from two properties.
#[macro_export]
macro_rules! bind_map2 {
    ($s1:expr, $s2:expr, $f:expr) => {
        $crate::bind::bind_mapped2(&$s1, &$s2, $f)
    };
}

/// Owns the change handlers of one logical scope.
pub struct BindingScope {
    handlers: Vec<ChangeHandler>,
}

impl BindingScope {
    #[must_use]
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    /// Keep `handler` registered until the scope is cleared or dropped.
    pub fn hold(&mut self, handler: ChangeHandler) {
        self.handlers.push(handler);
    }

    /// Run `callback` on every change of `source`, for the scope's lifetime.
    ///
    /// Returns the scope for chaining.
    pub fn on_value_changed<T: 'static>(
        &mut self,
        source: &Property<T>,
        callback: impl Fn() + 'static,
    ) -> &mut Self {
        self.handlers.push(source.on_value_changed(callback));
        self
    }

    /// Run `callback` now and on every change of `source`.
    pub fn subscribe<T: 'static>(
        &mut self,
        source: &Property<T>,
        callback: impl Fn() + 'static,
    ) -> &mut Self {
        self.handlers.push(source.subscribe(callback));
        self
    }

    #[must_use]
    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Release every handler now; the scope stays usable.
    pub fn clear(&mut self) {
        while self.handlers.pop().is_some() {}
    }
}

impl Default for BindingScope {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for BindingScope {
    fn drop(&mut self) {
        self.clear();
    }
}

impl fmt::Debug for BindingScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BindingScope")
            .field("handler_count", &self.handlers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    #[test]
    fn mirror_binding_follows_source() {
        let source = Property::new(42);
        let mirror = Property::new(0);
        mirror.set_binding(bind_property(&source));
        assert_eq!(mirror.value(), 42);
        source.set_value(100);
        assert_eq!(mirror.value(), 100);
    }

    #[test]
    fn mapped_binding() {
        let count = Property::new(3);
        let label = Property::new(String::new());
        label.set_binding(bind_mapped(&count, |c| format!("items: {c}")));
        assert_eq!(label.value(), "items: 3");
        count.set_value(7);
        assert_eq!(label.value(), "items: 7");
    }

    #[test]
    fn mapped2_tracks_both_sources() {
        let w = Property::new(10);
        let h = Property::new(20);
        let area = Property::new(0);
        area.set_binding(bind_mapped2(&w, &h, |a, b| a * b));
        assert_eq!(area.value(), 200);
        w.set_value(5);
        assert_eq!(area.value(), 100);
        h.set_value(2);
        assert_eq!(area.value(), 10);
    }

    #[test]
    fn macros_expand_to_helpers() {
        let a = Property::new(2);
        let b = Property::new(3);
        let mirror = Property::new(0);
        let doubled = Property::new(0);
        let sum = Property::new(0);
        mirror.set_binding(bind!(a));
        doubled.set_binding(bind_map!(a, |v| v * 2));
        sum.set_binding(bind_map2!(a, b, |x, y| x + y));
        a.set_value(4);
        assert_eq!((mirror.value(), doubled.value(), sum.value()), (4, 8, 7));
    }

    #[test]
    fn helper_binding_location_is_call_site() {
        let a = Property::new(1);
        let line = line!() + 1;
        let binding = bind!(a);
        assert_eq!(binding.location().unwrap().line(), line);
    }

    #[test]
    fn scope_releases_in_reverse_order() {
        let source = Property::new(0);
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut scope = BindingScope::new();
        for i in 0..3 {
            let log = Rc::clone(&log);
            scope.on_value_changed(&source, move || log.borrow_mut().push(i));
        }
        assert_eq!(scope.handler_count(), 3);
        source.set_value(1);
        assert_eq!(*log.borrow(), vec![0, 1, 2]);

        scope.clear();
        assert!(scope.is_empty());
        source.set_value(2);
        assert_eq!(log.borrow().len(), 3);
    }

    #[test]
    fn dropped_scope_silences_callbacks() {
        let source = Property::new(0);
        let fired = Rc::new(Cell::new(0));
        {
            let mut scope = BindingScope::new();
            let f = Rc::clone(&fired);
            scope.subscribe(&source, move || f.set(f.get() + 1));
            assert_eq!(fired.get(), 1);
            source.set_value(1);
            assert_eq!(fired.get(), 2);
        }
        source.set_value(2);
        assert_eq!(fired.get(), 2);
        assert_eq!(source.binding_data().observer_count(), 0);
    }
}
