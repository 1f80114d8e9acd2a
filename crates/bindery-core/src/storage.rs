#![forbid(unsafe_code)]

//! Out-of-line binding storage.
//!
//! A [`BindingStorage`] keeps binding slots for properties whose value lives
//! elsewhere (typically a field of a host aggregate that should not carry a
//! slot per field). Slots are keyed by a process-unique [`PropertyId`] and
//! created lazily: a property that is never bound, subscribed to, or read
//! by a binding never allocates one.
//!
//! The table is open-addressed with linear probing. Its capacity is a power
//! of two, starts at [`STORAGE_INITIAL_CAPACITY`] on the first insertion and
//! doubles once half of it is in use. Growing moves entries but never
//! changes which slot an id resolves to.

use std::cell::RefCell;
use std::fmt;
use std::hash::BuildHasher;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use ahash::RandomState;

use crate::binding::PropertyBinding;
use crate::binding_data::{BindingDataRef, PropertyBindingData, UntypedPropertyData};
use crate::observer::ChangeHandler;
use crate::property::PropertyData;
use crate::status;

/// Capacity of a table's first allocation.
pub const STORAGE_INITIAL_CAPACITY: usize = 8;

static NEXT_PROPERTY_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a stored property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PropertyId(u64);

impl PropertyId {
    /// Allocate a fresh id.
    #[must_use]
    pub fn new() -> Self {
        Self(NEXT_PROPERTY_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl Default for PropertyId {
    fn default() -> Self {
        Self::new()
    }
}

struct StorageEntry {
    id: PropertyId,
    data: PropertyBindingData,
}

struct StorageTable {
    entries: Vec<Option<StorageEntry>>,
    used: usize,
    first_allocation: usize,
    hasher: RandomState,
}

impl StorageTable {
    fn new(first_allocation: usize) -> Self {
        Self {
            entries: Vec::new(),
            used: 0,
            first_allocation,
            hasher: RandomState::with_seeds(
                0x243f_6a88_85a3_08d3,
                0x1319_8a2e_0370_7344,
                0xa409_3822_299f_31d0,
                0x082e_fa98_ec4e_6c89,
            ),
        }
    }

    fn mask(&self) -> usize {
        self.entries.len() - 1
    }

    fn ideal_index(&self, id: PropertyId) -> usize {
        (self.hasher.hash_one(id.0) as usize) & self.mask()
    }

    /// Index holding `id`, or the empty index where it would go.
    fn locate(&self, id: PropertyId) -> (usize, bool) {
        let mut index = self.ideal_index(id);
        loop {
            match &self.entries[index] {
                Some(entry) if entry.id == id => return (index, true),
                Some(_) => index = (index + 1) & self.mask(),
                None => return (index, false),
            }
        }
    }

    fn lookup(&self, id: PropertyId) -> Option<BindingDataRef> {
        if self.entries.is_empty() {
            return None;
        }
        match self.locate(id) {
            (index, true) => self.entries[index].as_ref().map(|e| e.data.handle()),
            (_, false) => None,
        }
    }

    fn get_or_create(&mut self, id: PropertyId) -> BindingDataRef {
        if self.entries.is_empty() {
            self.entries = empty_entries(self.first_allocation);
        } else if self.used * 2 >= self.entries.len() {
            self.grow();
        }
        let (index, found) = self.locate(id);
        if found && let Some(entry) = &self.entries[index] {
            return entry.data.handle();
        }
        let data = PropertyBindingData::new();
        let handle = data.handle();
        self.entries[index] = Some(StorageEntry { id, data });
        self.used += 1;
        handle
    }

    fn grow(&mut self) {
        let capacity = self.entries.len() * 2;
        tracing::trace!(from = self.entries.len(), to = capacity, "binding storage grows");
        let old = std::mem::replace(&mut self.entries, empty_entries(capacity));
        for entry in old.into_iter().flatten() {
            let (index, _) = self.locate(entry.id);
            self.entries[index] = Some(entry);
        }
    }

    /// Remove `id`, closing the gap by shifting later entries back.
    fn remove(&mut self, id: PropertyId) -> Option<PropertyBindingData> {
        if self.entries.is_empty() {
            return None;
        }
        let (mut hole, true) = self.locate(id) else {
            return None;
        };
        let removed = self.entries[hole].take().map(|e| e.data);
        self.used -= 1;
        let mask = self.mask();
        let mut next = (hole + 1) & mask;
        while let Some(entry) = &self.entries[next] {
            let ideal = self.ideal_index(entry.id);
            if (next.wrapping_sub(ideal) & mask) >= (next.wrapping_sub(hole) & mask) {
                self.entries[hole] = self.entries[next].take();
                hole = next;
            }
            next = (next + 1) & mask;
        }
        removed
    }
}

fn empty_entries(capacity: usize) -> Vec<Option<StorageEntry>> {
    std::iter::repeat_with(|| None).take(capacity).collect()
}

/// Table of binding slots keyed by [`PropertyId`].
pub struct BindingStorage {
    table: RefCell<StorageTable>,
}

impl BindingStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(STORAGE_INITIAL_CAPACITY)
    }

    /// A table whose first allocation holds at least `capacity` entries
    /// (rounded up to a power of two).
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let first_allocation = capacity.max(STORAGE_INITIAL_CAPACITY).next_power_of_two();
        Self {
            table: RefCell::new(StorageTable::new(first_allocation)),
        }
    }

    /// Look up the slot of `id`, creating it when `create` is set.
    ///
    /// Returns `None` for an unknown id without `create`.
    pub fn get(&self, id: PropertyId, create: bool) -> Option<BindingDataRef> {
        if create {
            Some(self.table.borrow_mut().get_or_create(id))
        } else {
            self.table.borrow().lookup(id)
        }
    }

    /// Release the slot of `id`, detaching its binding and observers.
    pub fn remove(&self, id: PropertyId) -> bool {
        let removed = self.table.borrow_mut().remove(id);
        removed.is_some()
    }

    /// Register a read of `id` with the binding being evaluated, creating
    /// the slot if needed.
    pub fn register_dependency(&self, id: PropertyId) {
        if !status::is_evaluating() {
            return;
        }
        if let Some(data) = self.get(id, true) {
            data.register_with_currently_evaluating_binding();
        }
    }

    /// Number of slots in the table.
    #[must_use]
    pub fn len(&self) -> usize {
        self.table.borrow().used
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current number of table entries (0 before the first insertion).
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.table.borrow().entries.len()
    }
}

impl Default for BindingStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for BindingStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BindingStorage")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .finish()
    }
}

struct StoredInner<T: 'static> {
    data: PropertyData<T>,
    id: PropertyId,
    storage: Weak<BindingStorage>,
}

impl<T: 'static> UntypedPropertyData for StoredInner<T> {
    fn property_data(&self) -> &dyn std::any::Any {
        &self.data
    }
}

impl<T: 'static> Drop for StoredInner<T> {
    fn drop(&mut self) {
        if let Some(storage) = self.storage.upgrade() {
            storage.remove(self.id);
        }
    }
}

/// A property whose binding state lives in a shared [`BindingStorage`].
///
/// The property holds the storage weakly: once the storage is gone the
/// value stays readable and writable but bindings, handlers and signals no
/// longer apply.
pub struct StoredProperty<T: 'static> {
    inner: Rc<StoredInner<T>>,
}

impl<T: 'static> StoredProperty<T> {
    #[must_use]
    pub fn new(storage: &Rc<BindingStorage>, value: T) -> Self
    where
        T: PartialEq,
    {
        Self::from_data(storage, PropertyData::new(value))
    }

    #[must_use]
    pub fn without_equality(storage: &Rc<BindingStorage>, value: T) -> Self {
        Self::from_data(storage, PropertyData::without_equality(value))
    }

    /// Create a property whose `signal` runs after its change handlers on
    /// every delivered change.
    #[must_use]
    pub fn with_signal(storage: &Rc<BindingStorage>, value: T, signal: impl Fn() + 'static) -> Self
    where
        T: PartialEq,
    {
        let property = Self::new(storage, value);
        if let Some(data) = property.binding_data(true) {
            data.set_static_observer(Some(Rc::new(signal)));
        }
        property
    }

    fn from_data(storage: &Rc<BindingStorage>, data: PropertyData<T>) -> Self {
        Self {
            inner: Rc::new(StoredInner {
                data,
                id: PropertyId::new(),
                storage: Rc::downgrade(storage),
            }),
        }
    }

    #[must_use]
    pub fn id(&self) -> PropertyId {
        self.inner.id
    }

    /// The property's slot, created on demand when `create` is set.
    #[must_use]
    pub fn binding_data(&self, create: bool) -> Option<BindingDataRef> {
        self.inner.storage.upgrade()?.get(self.inner.id, create)
    }

    /// Tracked read.
    #[must_use]
    pub fn value(&self) -> T
    where
        T: Clone,
    {
        self.with(T::clone)
    }

    /// Tracked read by reference.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        if let Some(storage) = self.inner.storage.upgrade() {
            storage.register_dependency(self.inner.id);
        }
        self.inner.data.with(f)
    }

    /// Read without registering a dependency.
    #[must_use]
    pub fn value_bypassing_bindings(&self) -> T
    where
        T: Clone,
    {
        self.inner.data.with(T::clone)
    }

    /// Write, removing a non-sticky binding; notifies only on change.
    pub fn set_value(&self, value: T) {
        if let Some(data) = self.binding_data(false) {
            data.remove_binding();
        }
        if self.inner.data.write(value) {
            self.notify();
        }
    }

    /// Write without touching the binding and without notifying. Pair with
    /// [`notify`](Self::notify) to publish several raw writes at once.
    pub fn set_value_bypassing_bindings(&self, value: T) {
        self.inner.data.write(value);
    }

    /// Deliver a change notification for the current value.
    pub fn notify(&self) {
        if let Some(data) = self.binding_data(false) {
            data.notify_observers();
        }
    }

    /// Install `binding`, returning the previous one. Without a live
    /// storage the binding is not installed and a null binding is returned.
    pub fn set_binding(&self, binding: PropertyBinding<T>) -> PropertyBinding<T> {
        let Some(data) = self.binding_data(!binding.is_null()) else {
            return PropertyBinding::null();
        };
        let weak: Weak<StoredInner<T>> = Rc::downgrade(&self.inner);
        let target: Weak<dyn UntypedPropertyData> = weak;
        PropertyBinding::from_untyped_unchecked(data.set_binding(binding.untyped(), target))
    }

    #[must_use]
    pub fn binding(&self) -> PropertyBinding<T> {
        self.binding_data(false)
            .map(|data| PropertyBinding::from_untyped_unchecked(data.binding()))
            .unwrap_or_else(PropertyBinding::null)
    }

    pub fn take_binding(&self) -> PropertyBinding<T> {
        self.set_binding(PropertyBinding::null())
    }

    pub fn remove_binding(&self) {
        if let Some(data) = self.binding_data(false) {
            data.remove_binding();
        }
    }

    #[must_use]
    pub fn has_binding(&self) -> bool {
        self.binding_data(false).is_some_and(BindingDataRef::has_binding)
    }

    pub fn on_value_changed(&self, f: impl Fn() + 'static) -> ChangeHandler {
        ChangeHandler::attach(self.binding_data(true), Rc::new(f))
    }

    pub fn subscribe(&self, f: impl Fn() + 'static) -> ChangeHandler {
        f();
        self.on_value_changed(f)
    }
}

impl<T: 'static> Clone for StoredProperty<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T: fmt::Debug + 'static> fmt::Debug for StoredProperty<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.inner.data.with(|value| {
            f.debug_struct("StoredProperty")
                .field("id", &self.inner.id)
                .field("value", value)
                .finish()
        })
    }
}
