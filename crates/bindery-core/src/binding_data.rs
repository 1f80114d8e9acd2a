#![forbid(unsafe_code)]

//! Binding slots.
//!
//! A binding slot is the per-property word that holds either nothing, the
//! head of an observer list, or the installed binding (which then owns the
//! observer list). While an update group is active the word may instead
//! point at a delayed-notification record that holds the displaced word;
//! every read here resolves through that record.
//!
//! [`PropertyBindingData`] owns a slot and releases it on drop.
//! [`BindingDataRef`] is a `Copy` handle used to operate on a slot.

use std::any::Any;
use std::fmt;
use std::rc::{Rc, Weak};

use ahash::AHashSet;

use crate::binding::{BindingCore, PendingBindingObservers, UntypedPropertyBinding};
use crate::error::{BindingError, BindingErrorKind};
use crate::group::DelayedIndex;
use crate::observer::{
    HandlerFn, ObserverKind, Prev, evaluate_bindings, notify_change_handlers,
};
use crate::status::{self, BindingKey, Graph, ObserverKey, SlotKey, try_with_graph, with_graph};

/// Type-erased view of a property's value storage.
///
/// Bindings hold a weak reference to their target through this trait and
/// write the evaluated value by downcasting [`property_data`] to the
/// concrete storage type.
///
/// [`property_data`]: UntypedPropertyData::property_data
pub trait UntypedPropertyData: 'static {
    fn property_data(&self) -> &dyn Any;
}

#[derive(Default)]
pub(crate) enum SlotWord {
    #[default]
    Empty,
    Observers(ObserverKey),
    Binding(Rc<BindingCore>),
    Delayed(DelayedIndex),
}

#[derive(Default)]
pub(crate) struct SlotState {
    pub(crate) word: SlotWord,
    /// Called after the slot's change handlers (the "signal").
    pub(crate) static_observer: Option<HandlerFn>,
}

pub(crate) enum InstallOutcome {
    Stale,
    AttachedElsewhere,
    /// The slot was left untouched; carries its installed binding.
    Kept(Rc<BindingCore>),
    Replaced(Option<Rc<BindingCore>>),
}

impl Graph {
    pub(crate) fn resolved_word(&self, slot: SlotKey) -> Option<&SlotWord> {
        let state = self.slots.get(slot)?;
        match &state.word {
            SlotWord::Delayed(index) => self.group.as_ref()?.record(*index).map(|r| &r.word),
            word => Some(word),
        }
    }

    pub(crate) fn resolved_word_mut(&mut self, slot: SlotKey) -> Option<&mut SlotWord> {
        let delayed = match &self.slots.get(slot)?.word {
            SlotWord::Delayed(index) => Some(*index),
            _ => None,
        };
        match delayed {
            Some(index) => self.group.as_mut()?.record_mut(index).map(|r| &mut r.word),
            None => self.slots.get_mut(slot).map(|s| &mut s.word),
        }
    }

    pub(crate) fn slot_binding(&self, slot: SlotKey) -> Option<&Rc<BindingCore>> {
        match self.resolved_word(slot)? {
            SlotWord::Binding(binding) => Some(binding),
            _ => None,
        }
    }

    /// Head of the slot's own list (only meaningful without a binding).
    pub(crate) fn slot_observers(&self, slot: SlotKey) -> Option<ObserverKey> {
        match self.resolved_word(slot)? {
            SlotWord::Observers(first) => Some(*first),
            _ => None,
        }
    }

    pub(crate) fn set_slot_observers(&mut self, slot: SlotKey, first: Option<ObserverKey>) {
        let Some(word) = self.resolved_word_mut(slot) else {
            return;
        };
        match word {
            SlotWord::Empty | SlotWord::Observers(_) => {
                *word = first.map_or(SlotWord::Empty, SlotWord::Observers);
            }
            SlotWord::Binding(_) | SlotWord::Delayed(_) => {
                debug_assert!(false, "slot list head written while a binding owns the list");
            }
        }
    }

    /// Where the slot's observer list is anchored.
    pub(crate) fn list_head(&self, slot: SlotKey) -> Option<Prev> {
        match self.resolved_word(slot)? {
            SlotWord::Binding(binding) => Some(Prev::Binding(binding.key)),
            _ => Some(Prev::Slot(slot)),
        }
    }

    pub(crate) fn first_observer(&self, slot: SlotKey) -> Option<ObserverKey> {
        self.read_link(self.list_head(slot)?)
    }

    pub(crate) fn static_observer(&self, slot: SlotKey) -> Option<HandlerFn> {
        self.slots.get(slot)?.static_observer.clone()
    }

    /// Free `slot`, detaching every observer and the installed binding.
    ///
    /// The returned state still owns the binding and the static observer;
    /// the caller drops them outside the graph borrow.
    pub(crate) fn release_slot(&mut self, slot: SlotKey) -> Option<SlotState> {
        let mut state = self.slots.remove(slot)?;
        if let SlotWord::Delayed(index) = state.word {
            state.word = match self.group.as_mut().and_then(|g| g.record_mut(index)) {
                Some(record) => {
                    record.slot = None;
                    std::mem::take(&mut record.word)
                }
                None => SlotWord::Empty,
            };
        }
        match &state.word {
            SlotWord::Observers(first) => self.detach_list(Some(*first)),
            SlotWord::Binding(binding) => {
                let first = self.bindings.get_mut(binding.key).and_then(|b| {
                    b.slot = None;
                    b.first_observer.take()
                });
                self.detach_list(first);
            }
            SlotWord::Empty | SlotWord::Delayed(_) => {}
        }
        Some(state)
    }

    fn install_binding(&mut self, slot: SlotKey, new: Option<&Rc<BindingCore>>) -> InstallOutcome {
        let Some(word) = self.resolved_word(slot) else {
            return InstallOutcome::Stale;
        };
        let current = match word {
            SlotWord::Binding(binding) => Some(Rc::clone(binding)),
            _ => None,
        };
        if let Some(current) = &current {
            if new.is_some_and(|n| Rc::ptr_eq(n, current)) {
                return InstallOutcome::Kept(Rc::clone(current));
            }
            if current.is_updating() {
                tracing::debug!(
                    location = %current.location(),
                    "binding replaced while it is being evaluated"
                );
                current.set_error(BindingError::new(
                    BindingErrorKind::BindingLoop,
                    "Binding set during binding evaluation!",
                ));
                return InstallOutcome::Kept(Rc::clone(current));
            }
        }
        if let Some(new) = new
            && self
                .bindings
                .get(new.key)
                .and_then(|b| b.slot)
                .is_some_and(|other| other != slot)
        {
            return InstallOutcome::AttachedElsewhere;
        }

        let observers = match &current {
            Some(current) => self.bindings.get_mut(current.key).and_then(|b| {
                b.slot = None;
                b.first_observer.take()
            }),
            None => self.slot_observers(slot),
        };
        let Some(word) = self.resolved_word_mut(slot) else {
            return InstallOutcome::Stale;
        };
        // `current` keeps the displaced binding alive past this write.
        match new {
            Some(new) => {
                *word = SlotWord::Binding(Rc::clone(new));
                if let Some(b) = self.bindings.get_mut(new.key) {
                    b.slot = Some(slot);
                }
                if let Some(first) = observers {
                    self.splice_front(Prev::Binding(new.key), first);
                }
            }
            None => {
                *word = SlotWord::Empty;
                if let Some(first) = observers {
                    self.splice_front(Prev::Slot(slot), first);
                }
            }
        }
        InstallOutcome::Replaced(current)
    }

    fn uninstall_binding(&mut self, slot: SlotKey) -> Option<Rc<BindingCore>> {
        let word = self.resolved_word_mut(slot)?;
        match word {
            SlotWord::Binding(binding) if !binding.is_sticky() => {}
            _ => return None,
        }
        let SlotWord::Binding(binding) = std::mem::take(word) else {
            return None;
        };
        let observers = self.bindings.get_mut(binding.key).and_then(|b| {
            b.slot = None;
            b.first_observer.take()
        });
        if let Some(first) = observers {
            self.splice_front(Prev::Slot(slot), first);
        }
        Some(binding)
    }
}

/// Handle to a binding slot.
///
/// Operations on a handle whose slot has been released are no-ops (queries
/// report "no binding", "not delayed", zero observers).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct BindingDataRef {
    key: SlotKey,
}

impl BindingDataRef {
    pub(crate) fn from_key(key: SlotKey) -> Self {
        Self { key }
    }

    pub(crate) fn key(self) -> SlotKey {
        self.key
    }

    /// Whether the slot still exists.
    #[must_use]
    pub fn is_valid(self) -> bool {
        with_graph(|graph| graph.slots.contains(self.key))
    }

    #[must_use]
    pub fn has_binding(self) -> bool {
        with_graph(|graph| graph.slot_binding(self.key).is_some())
    }

    /// The installed binding, or a null binding.
    #[must_use]
    pub fn binding(self) -> UntypedPropertyBinding {
        UntypedPropertyBinding::from_core(with_graph(|graph| graph.slot_binding(self.key).cloned()))
    }

    /// Install `binding` (or clear the slot's binding if it is null), with
    /// `target` as the storage the binding writes to.
    ///
    /// The new binding is evaluated immediately and the slot's observers are
    /// notified if the value changed. Returns the previously installed
    /// binding, detached from the property.
    ///
    /// # Failure Modes
    ///
    /// - `binding` targets another value type: a warning is logged and a null
    ///   binding is returned; the slot is unchanged.
    /// - `binding` is already installed on another property: it records an
    ///   [`BindingErrorKind::UnknownError`] and the request is ignored.
    /// - The installed binding is mid-evaluation: it records a
    ///   [`BindingErrorKind::BindingLoop`] and is returned unchanged.
    pub fn set_binding(
        self,
        binding: &UntypedPropertyBinding,
        target: Weak<dyn UntypedPropertyData>,
    ) -> UntypedPropertyBinding {
        let new = binding.core().cloned();
        if let Some(new) = &new
            && let Some(target) = target.upgrade()
        {
            let data: &dyn Any = target.property_data();
            if data.type_id() != new.target_type() {
                tracing::warn!(
                    binding_type = new.value_type_name(),
                    location = %new.location(),
                    "binding value type does not match the property"
                );
                return UntypedPropertyBinding::null();
            }
        }

        match with_graph(|graph| graph.install_binding(self.key, new.as_ref())) {
            InstallOutcome::Stale => UntypedPropertyBinding::null(),
            InstallOutcome::AttachedElsewhere => {
                if let Some(new) = &new {
                    tracing::debug!(
                        location = %new.location(),
                        "binding is already installed on another property"
                    );
                    new.set_error(BindingError::new(
                        BindingErrorKind::UnknownError,
                        "binding is already installed on another property",
                    ));
                }
                UntypedPropertyBinding::null()
            }
            InstallOutcome::Kept(existing) => UntypedPropertyBinding::from_core(Some(existing)),
            InstallOutcome::Replaced(old) => {
                if let Some(new) = &new {
                    new.attach(target);
                    let mut pending = PendingBindingObservers::new();
                    new.evaluate_recursive(&mut pending);
                    pending.insert(0, Rc::clone(new));
                    // Inside a group the notifications wait for its end.
                    let pending = with_graph(|graph| graph.defer_binding_notifications(pending));
                    for binding in &pending {
                        binding.notify_non_recursive();
                    }
                }
                if let Some(old) = &old {
                    old.detach_from_property();
                }
                UntypedPropertyBinding::from_core(old)
            }
        }
    }

    /// Uninstall the current binding, keeping the slot's observers.
    /// Sticky bindings stay installed.
    pub fn remove_binding(self) {
        if let Some(binding) = with_graph(|graph| graph.uninstall_binding(self.key)) {
            binding.detach_from_property();
        }
    }

    /// Record a read of this slot: the binding currently being evaluated
    /// (if any) becomes an observer of it.
    pub fn register_with_currently_evaluating_binding(self) {
        let Some(binding) = status::capture_dependency(self.key) else {
            return;
        };
        with_graph(|graph| {
            if !graph.slots.contains(self.key) || !graph.bindings.contains(binding) {
                return;
            }
            let node = graph.new_observer(ObserverKind::NotifiesBinding(binding));
            if let Some(b) = graph.bindings.get_mut(binding) {
                b.dependencies.push(node);
            }
            graph.prepend_observer(self.key, node);
        });
    }

    /// Propagate a change of this slot's value.
    ///
    /// Inside an update group the notification is recorded and delivered
    /// when the outermost group ends. Otherwise dependent bindings are
    /// re-evaluated first, then the slot's change handlers run, then the
    /// dependents that changed notify their own handlers, and finally the
    /// static observer runs.
    pub fn notify_observers(self) {
        let first = with_graph(|graph| {
            if !graph.slots.contains(self.key) || graph.is_notification_delayed(self.key) {
                return None;
            }
            if graph.group.is_some() {
                graph.delay_notification(self.key);
                return None;
            }
            Some(graph.first_observer(self.key))
        });
        let Some(first) = first else {
            return;
        };

        let mut pending = PendingBindingObservers::new();
        evaluate_bindings(first, &mut pending);
        // Re-fetch: evaluation may have rewired the list.
        let (first, static_observer) = with_graph(|graph| {
            (graph.first_observer(self.key), graph.static_observer(self.key))
        });
        notify_change_handlers(first);
        for binding in &pending {
            binding.notify_non_recursive();
        }
        if let Some(static_observer) = static_observer {
            static_observer();
        }
    }

    /// Final phase of a grouped update: run the slot's handlers and static
    /// observer unless its binding already delivered them.
    pub(crate) fn notify_after_group(self, delivered: &AHashSet<BindingKey>) {
        let targets = with_graph(|graph| {
            if !graph.slots.contains(self.key) {
                return None;
            }
            if let Some(binding) = graph.slot_binding(self.key)
                && delivered.contains(&binding.key)
            {
                return None;
            }
            Some((graph.first_observer(self.key), graph.static_observer(self.key)))
        });
        let Some((first, static_observer)) = targets else {
            return;
        };
        notify_change_handlers(first);
        if let Some(static_observer) = static_observer {
            static_observer();
        }
    }

    /// Whether a notification for this slot is parked in the active group.
    #[must_use]
    pub fn is_notification_delayed(self) -> bool {
        with_graph(|graph| graph.is_notification_delayed(self.key))
    }

    /// Number of observers currently attached (dependent bindings, change
    /// handlers, aliases).
    #[must_use]
    pub fn observer_count(self) -> usize {
        with_graph(|graph| {
            graph
                .list_head(self.key)
                .map_or(0, |head| graph.count_observers(head))
        })
    }

    pub(crate) fn set_static_observer(self, observer: Option<HandlerFn>) {
        let previous = with_graph(|graph| {
            graph
                .slots
                .get_mut(self.key)
                .and_then(|s| std::mem::replace(&mut s.static_observer, observer))
        });
        drop(previous);
    }
}

impl fmt::Debug for BindingDataRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("BindingDataRef").field(&self.key).finish()
    }
}

/// Owner of a binding slot.
pub struct PropertyBindingData {
    data: BindingDataRef,
}

impl PropertyBindingData {
    #[must_use]
    pub fn new() -> Self {
        let key = with_graph(|graph| graph.slots.insert(SlotState::default()));
        Self {
            data: BindingDataRef { key },
        }
    }

    #[must_use]
    pub fn handle(&self) -> BindingDataRef {
        self.data
    }
}

impl Default for PropertyBindingData {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PropertyBindingData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PropertyBindingData")
            .field("slot", &self.data.key)
            .finish()
    }
}

impl Drop for PropertyBindingData {
    fn drop(&mut self) {
        let released = try_with_graph(|graph| graph.release_slot(self.data.key)).flatten();
        if let Some(state) = released
            && let SlotWord::Binding(binding) = &state.word
        {
            binding.detach_from_property();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::ChangeHandler;
    use crate::status::live_observer_nodes;
    use std::cell::Cell;

    #[test]
    fn fresh_slot_is_empty() {
        let data = PropertyBindingData::new();
        let handle = data.handle();
        assert!(handle.is_valid());
        assert!(!handle.has_binding());
        assert!(handle.binding().is_null());
        assert_eq!(handle.observer_count(), 0);
        assert!(!handle.is_notification_delayed());
    }

    #[test]
    fn released_slot_handle_is_inert() {
        let handle = PropertyBindingData::new().handle();
        assert!(!handle.is_valid());
        assert!(!handle.has_binding());
        handle.notify_observers();
        handle.remove_binding();
        assert_eq!(handle.observer_count(), 0);
    }

    #[test]
    fn dropping_slot_detaches_handlers() {
        let fired = Rc::new(Cell::new(0));
        let data = PropertyBindingData::new();
        let f = Rc::clone(&fired);
        let handler = ChangeHandler::attach(Some(data.handle()), Rc::new(move || f.set(f.get() + 1)));
        let nodes = live_observer_nodes();
        assert!(handler.is_connected());
        drop(data);
        assert!(!handler.is_connected());
        // The node itself lives until the handler is dropped.
        assert_eq!(live_observer_nodes(), nodes);
        drop(handler);
        assert_eq!(live_observer_nodes(), nodes - 1);
        assert_eq!(fired.get(), 0);
    }

    #[test]
    fn static_observer_runs_after_handlers() {
        let order = Rc::new(std::cell::RefCell::new(Vec::new()));
        let data = PropertyBindingData::new();
        let o = Rc::clone(&order);
        data.handle()
            .set_static_observer(Some(Rc::new(move || o.borrow_mut().push("signal"))));
        let o = Rc::clone(&order);
        let _h = ChangeHandler::attach(
            Some(data.handle()),
            Rc::new(move || o.borrow_mut().push("handler")),
        );
        data.handle().notify_observers();
        assert_eq!(*order.borrow(), vec!["handler", "signal"]);
    }
}
