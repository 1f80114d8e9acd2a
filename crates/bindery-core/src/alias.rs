#![forbid(unsafe_code)]

//! Property aliases.
//!
//! A [`PropertyAlias`] forwards every operation to a target property while
//! tracking its liveness through an alias observer node placed in the
//! target's observer list. When the target's slot is released the node is
//! unlinked and the alias becomes invalid: queries return `None`, writes
//! report `false`.

use std::fmt;
use std::rc::Rc;

use crate::binding::PropertyBinding;
use crate::observer::{ChangeHandler, ObserverKind};
use crate::property::{Property, WeakProperty};
use crate::status::{ObserverKey, try_with_graph, with_graph};

pub struct PropertyAlias<T: 'static> {
    node: ObserverKey,
    target: WeakProperty<T>,
}

impl<T: 'static> PropertyAlias<T> {
    /// Alias `property`.
    #[must_use]
    pub fn new(property: &Property<T>) -> Self {
        let slot = property.binding_data().key();
        let node = with_graph(|graph| {
            let node = graph.new_observer(ObserverKind::IsAlias);
            graph.append_observer(slot, node);
            node
        });
        Self {
            node,
            target: property.downgrade(),
        }
    }

    /// Whether the aliased property is still alive.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        with_graph(|graph| graph.is_linked(self.node))
    }

    fn target(&self) -> Option<Property<T>> {
        if !self.is_valid() {
            return None;
        }
        self.target.upgrade()
    }

    #[must_use]
    pub fn value(&self) -> Option<T>
    where
        T: Clone,
    {
        self.target().map(|p| p.value())
    }

    /// Write through to the target. Returns `false` if the alias is invalid.
    pub fn set_value(&self, value: T) -> bool {
        let Some(property) = self.target() else {
            return false;
        };
        property.set_value(value);
        true
    }

    pub fn set_binding(&self, binding: PropertyBinding<T>) -> Option<PropertyBinding<T>> {
        self.target().map(|p| p.set_binding(binding))
    }

    #[must_use]
    pub fn binding(&self) -> Option<PropertyBinding<T>> {
        self.target().map(|p| p.binding())
    }

    pub fn take_binding(&self) -> Option<PropertyBinding<T>> {
        self.target().map(|p| p.take_binding())
    }

    #[must_use]
    pub fn has_binding(&self) -> bool {
        self.target().is_some_and(|p| p.has_binding())
    }

    pub fn on_value_changed(&self, f: impl Fn() + 'static) -> Option<ChangeHandler> {
        self.target().map(|p| p.on_value_changed(f))
    }

    pub fn subscribe(&self, f: impl Fn() + 'static) -> Option<ChangeHandler> {
        self.target().map(|p| p.subscribe(f))
    }
}

impl<T: 'static> Clone for PropertyAlias<T> {
    /// The clone gets its own alias node; cloning an invalid alias yields an
    /// invalid alias.
    fn clone(&self) -> Self {
        match self.target() {
            Some(property) => Self::new(&property),
            None => Self {
                node: with_graph(|graph| graph.new_observer(ObserverKind::IsAlias)),
                target: self.target.clone(),
            },
        }
    }
}

impl<T: 'static> fmt::Debug for PropertyAlias<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PropertyAlias")
            .field("valid", &self.is_valid())
            .finish()
    }
}

impl<T: 'static> Drop for PropertyAlias<T> {
    fn drop(&mut self) {
        try_with_graph(|graph| graph.release_observer(self.node));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn alias_forwards_reads_and_writes() {
        let p = Property::new(1);
        let alias = PropertyAlias::new(&p);
        assert!(alias.is_valid());
        assert_eq!(alias.value(), Some(1));
        assert!(alias.set_value(4));
        assert_eq!(p.value(), 4);
    }

    #[test]
    fn alias_binding_round_trip() {
        let source = Property::new(2);
        let s = source.clone();
        let p = Property::new(0);
        let alias = PropertyAlias::new(&p);
        alias.set_binding(PropertyBinding::new(move || s.value() + 1));
        assert!(alias.has_binding());
        assert_eq!(p.value(), 3);
        // Rebinding keeps the alias attached.
        assert!(alias.is_valid());
        let taken = alias.take_binding().unwrap();
        assert!(!taken.is_null());
        assert!(!p.has_binding());
    }

    #[test]
    fn alias_invalidates_when_target_dies() {
        let p = Property::new(1);
        let alias = PropertyAlias::new(&p);
        let copy = alias.clone();
        drop(p);
        assert!(!alias.is_valid());
        assert!(!copy.is_valid());
        assert_eq!(alias.value(), None);
        assert!(!alias.set_value(3));
        assert!(alias.binding().is_none());
        assert!(alias.on_value_changed(|| {}).is_none());
        let dead_copy = alias.clone();
        assert!(!dead_copy.is_valid());
    }

    #[test]
    fn alias_handlers_fire() {
        let p = Property::new(1);
        let alias = PropertyAlias::new(&p);
        let count = Rc::new(Cell::new(0));
        let c = Rc::clone(&count);
        let _h = alias.on_value_changed(move || c.set(c.get() + 1));
        p.set_value(2);
        assert_eq!(count.get(), 1);
        assert_eq!(p.binding_data().observer_count(), 2);
    }
}
