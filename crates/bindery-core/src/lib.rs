#![forbid(unsafe_code)]

//! Reactive property bindings.
//!
//! This crate provides the binding engine behind Bindery:
//!
//! - [`Property`]: a shared, observable value with an optional binding.
//! - [`PropertyBinding`]: a closure computing a property's value; every
//!   property it reads becomes a dependency and triggers re-evaluation.
//! - [`ChangeHandler`]: RAII registration of a change callback.
//! - [`PropertyUpdateGroup`]: RAII bracket that settles several writes
//!   before any notification is delivered.
//! - [`BindingStorage`] / [`StoredProperty`]: binding state kept outside the
//!   value, keyed by [`PropertyId`].
//! - [`PropertyAlias`]: a forwarding handle that notices when its target
//!   dies.
//!
//! # Architecture
//!
//! All graph state of a thread (observer nodes, binding slots, binding
//! bookkeeping, the active update group) lives in generation-checked arenas
//! inside a thread-local binding status. Public handles carry arena keys and
//! `Rc`s, so nothing here is `Send`.
//!
//! A write notifies in two stages: dependent bindings are re-evaluated
//! depth-first, then change handlers run breadth-first, each binding's
//! handlers only after all of its dependents have been re-evaluated.
//!
//! # Invariants
//!
//! 1. Writing a value equal to the current one notifies nobody.
//! 2. A binding's dependencies are exactly the properties read by its most
//!    recent evaluation.
//! 3. Change handlers on one property run in registration order.
//! 4. A binding re-entering its own evaluation is aborted and marked with
//!    [`BindingErrorKind::BindingLoop`]; evaluation never recurses forever.
//! 5. Inside an update group each touched property notifies at most once,
//!    when the outermost group ends.

pub mod alias;
pub mod bind;
pub mod binding;
pub mod binding_data;
pub mod error;
pub mod group;
pub mod observer;
pub mod property;
pub mod status;
pub mod storage;

mod arena;

pub use alias::PropertyAlias;
pub use bind::{BindingScope, bind_mapped, bind_mapped2, bind_property};
pub use binding::{INLINE_DEPENDENCIES, PropertyBinding, UntypedPropertyBinding};
pub use binding_data::{BindingDataRef, PropertyBindingData, UntypedPropertyData};
pub use error::{BindingError, BindingErrorKind};
pub use group::{
    DELAYED_PAGE_CAPACITY, PropertyUpdateGroup, begin_property_update_group,
    end_property_update_group, is_update_group_active, update_group,
};
pub use observer::ChangeHandler;
pub use property::{Property, PropertyData, WeakProperty};
pub use status::{is_evaluating, live_bindings, live_observer_nodes, live_slots, untracked};
pub use storage::{BindingStorage, PropertyId, STORAGE_INITIAL_CAPACITY, StoredProperty};
