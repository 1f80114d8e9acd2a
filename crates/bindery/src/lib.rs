#![forbid(unsafe_code)]

//! Bindery public facade and prelude.
//!
//! Re-exports the binding engine from `bindery-core`. Most code only needs
//! the prelude:
//!
//! ```
//! use bindery::prelude::*;
//!
//! let a = Property::new(1);
//! let b = Property::new(0);
//! b.set_binding(bind_map!(a, |v| v * 2));
//!
//! a.set_value(5);
//! assert_eq!(b.value(), 10);
//! ```

pub use bindery_core::{
    BindingDataRef, BindingError, BindingErrorKind, BindingScope, BindingStorage, ChangeHandler,
    DELAYED_PAGE_CAPACITY, INLINE_DEPENDENCIES, Property, PropertyAlias, PropertyBinding,
    PropertyBindingData, PropertyData, PropertyId, PropertyUpdateGroup, STORAGE_INITIAL_CAPACITY,
    StoredProperty, UntypedPropertyBinding, UntypedPropertyData, WeakProperty,
    begin_property_update_group, bind, bind_map, bind_map2, bind_mapped, bind_mapped2,
    bind_property, end_property_update_group, is_evaluating, is_update_group_active,
    live_bindings, live_observer_nodes, live_slots, untracked, update_group,
};

/// Commonly used types and helpers.
pub mod prelude {
    pub use bindery_core::{
        BindingError, BindingErrorKind, BindingScope, BindingStorage, ChangeHandler, Property,
        PropertyAlias, PropertyBinding, PropertyId, PropertyUpdateGroup, StoredProperty,
        WeakProperty, bind, bind_map, bind_map2, untracked, update_group,
    };
}
