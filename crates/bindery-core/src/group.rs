#![forbid(unsafe_code)]

//! Grouped updates.
//!
//! Between [`begin_property_update_group`] and the matching
//! [`end_property_update_group`], writes still store their values but their
//! notifications are parked: the slot's word is moved into a delayed
//! record and replaced by the record's index. When the outermost group ends
//! every parked slot is restored and notified in three phases:
//!
//! 1. re-evaluate the dependent bindings of every parked slot,
//! 2. let every binding that changed notify its handlers, including
//!    bindings installed while the group was open,
//! 3. run the change handlers of every parked slot whose binding (if any)
//!    did not already deliver in phase 2.
//!
//! A slot is parked at most once per outermost group, so its handlers fire
//! at most once however often it was written. No handler runs before the
//! outermost group ends.

use std::marker::PhantomData;
use std::rc::Rc;

use ahash::AHashSet;

use crate::binding::{BindingCore, PendingBindingObservers};
use crate::binding_data::{BindingDataRef, SlotWord};
use crate::observer::evaluate_bindings;
use crate::status::{Graph, SlotKey, with_graph};

/// Records per delayed-notification page.
pub const DELAYED_PAGE_CAPACITY: usize = 64;

/// Position of a record inside the active group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DelayedIndex {
    page: usize,
    offset: usize,
}

pub(crate) struct DelayedRecord {
    /// The slot's displaced word.
    pub(crate) word: SlotWord,
    /// `None` once the slot has been released.
    pub(crate) slot: Option<SlotKey>,
}

pub(crate) struct GroupUpdateData {
    depth: usize,
    pages: Vec<Vec<DelayedRecord>>,
    /// Bindings evaluated while the group was open, in evaluation order.
    /// Their notifications are delivered in phase 2.
    deferred: Vec<Rc<BindingCore>>,
}

impl GroupUpdateData {
    fn new() -> Self {
        Self {
            depth: 1,
            pages: Vec::new(),
            deferred: Vec::new(),
        }
    }

    pub(crate) fn record(&self, index: DelayedIndex) -> Option<&DelayedRecord> {
        self.pages.get(index.page)?.get(index.offset)
    }

    pub(crate) fn record_mut(&mut self, index: DelayedIndex) -> Option<&mut DelayedRecord> {
        self.pages.get_mut(index.page)?.get_mut(index.offset)
    }

    fn push(&mut self, record: DelayedRecord) -> DelayedIndex {
        if self
            .pages
            .last()
            .is_none_or(|page| page.len() == DELAYED_PAGE_CAPACITY)
        {
            self.pages.push(Vec::with_capacity(DELAYED_PAGE_CAPACITY));
        }
        let page = self.pages.len() - 1;
        let records = &mut self.pages[page];
        records.push(record);
        DelayedIndex {
            page,
            offset: records.len() - 1,
        }
    }
}

impl Graph {
    pub(crate) fn is_notification_delayed(&self, slot: SlotKey) -> bool {
        self.slots
            .get(slot)
            .is_some_and(|s| matches!(s.word, SlotWord::Delayed(_)))
    }

    /// Park `slot` in the active group. No-op without a group or when the
    /// slot is already parked.
    pub(crate) fn delay_notification(&mut self, slot: SlotKey) {
        let Some(group) = self.group.as_mut() else {
            return;
        };
        let Some(state) = self.slots.get_mut(slot) else {
            return;
        };
        if matches!(state.word, SlotWord::Delayed(_)) {
            return;
        }
        let word = std::mem::take(&mut state.word);
        state.word = SlotWord::Delayed(group.push(DelayedRecord {
            word,
            slot: Some(slot),
        }));
    }

    /// Hand the notifications of `bindings` to the active group. Without a
    /// group they are returned for immediate delivery.
    pub(crate) fn defer_binding_notifications(
        &mut self,
        bindings: PendingBindingObservers,
    ) -> PendingBindingObservers {
        match self.group.as_mut() {
            Some(group) => {
                group.deferred.extend(bindings);
                PendingBindingObservers::new()
            }
            None => bindings,
        }
    }

    /// Move every parked word back into its slot, returning the live slots.
    fn restore_delayed(&mut self, pages: Vec<Vec<DelayedRecord>>) -> Vec<SlotKey> {
        let mut restored = Vec::with_capacity(pages.iter().map(Vec::len).sum());
        for record in pages.into_iter().flatten() {
            let Some(slot) = record.slot else {
                continue;
            };
            if let Some(state) = self.slots.get_mut(slot) {
                state.word = record.word;
                restored.push(slot);
            }
        }
        restored
    }
}

/// Open an update group (groups nest).
pub fn begin_property_update_group() {
    with_graph(|graph| match graph.group.as_mut() {
        Some(group) => group.depth += 1,
        None => graph.group = Some(GroupUpdateData::new()),
    });
    tracing::trace!("property update group opened");
}

/// Close an update group; closing the outermost one delivers every parked
/// notification.
///
/// Calling this without a matching [`begin_property_update_group`] is a
/// no-op (and a debug assertion).
pub fn end_property_update_group() {
    end_group(true);
}

/// Whether an update group is open on this thread.
#[must_use]
pub fn is_update_group_active() -> bool {
    with_graph(|graph| graph.group.is_some())
}

fn end_group(deliver: bool) {
    let restored = with_graph(|graph| {
        let Some(group) = graph.group.as_mut() else {
            debug_assert!(false, "end_property_update_group without a matching begin");
            return None;
        };
        group.depth -= 1;
        if group.depth > 0 {
            return None;
        }
        let group = graph.group.take()?;
        let deferred = group.deferred;
        Some((graph.restore_delayed(group.pages), deferred))
    });
    let Some((slots, deferred)) = restored else {
        return;
    };
    tracing::trace!(
        delayed = slots.len(),
        deferred = deferred.len(),
        deliver,
        "property update group closed"
    );
    if !deliver {
        for binding in &deferred {
            binding.discard_pending_notify();
        }
        return;
    }

    let mut pending: PendingBindingObservers = deferred.into_iter().collect();
    for &slot in &slots {
        let first = with_graph(|graph| graph.first_observer(slot));
        evaluate_bindings(first, &mut pending);
    }
    let mut delivered = AHashSet::with_capacity(pending.len());
    for binding in &pending {
        if binding.notify_non_recursive() {
            delivered.insert(binding.key);
        }
    }
    for slot in slots {
        BindingDataRef::from_key(slot).notify_after_group(&delivered);
    }
}

/// RAII update group.
///
/// Dropping the guard closes the group. If the drop happens while
/// unwinding, parked words are restored but no notification is delivered.
#[must_use = "the group closes when this guard is dropped"]
pub struct PropertyUpdateGroup {
    _not_send: PhantomData<*const ()>,
}

impl PropertyUpdateGroup {
    #[must_use]
    pub fn new() -> Self {
        begin_property_update_group();
        Self {
            _not_send: PhantomData,
        }
    }
}

impl Default for PropertyUpdateGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PropertyUpdateGroup {
    fn drop(&mut self) {
        end_group(!std::thread::panicking());
    }
}

/// Run `f` inside an update group.
pub fn update_group<R>(f: impl FnOnce() -> R) -> R {
    let _group = PropertyUpdateGroup::new();
    f()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding_data::PropertyBindingData;
    use crate::observer::ChangeHandler;
    use std::cell::Cell;
    use std::rc::Rc;

    fn counting_handler(data: &PropertyBindingData) -> (ChangeHandler, Rc<Cell<u32>>) {
        let count = Rc::new(Cell::new(0));
        let c = Rc::clone(&count);
        let handler = ChangeHandler::attach(Some(data.handle()), Rc::new(move || c.set(c.get() + 1)));
        (handler, count)
    }

    #[test]
    fn notifications_are_parked_until_outermost_end() {
        let data = PropertyBindingData::new();
        let (_handler, count) = counting_handler(&data);

        begin_property_update_group();
        begin_property_update_group();
        data.handle().notify_observers();
        data.handle().notify_observers();
        assert!(data.handle().is_notification_delayed());
        end_property_update_group();
        assert_eq!(count.get(), 0);
        assert!(is_update_group_active());
        end_property_update_group();

        assert!(!is_update_group_active());
        assert!(!data.handle().is_notification_delayed());
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn observers_survive_parking() {
        let data = PropertyBindingData::new();
        let (_handler, _count) = counting_handler(&data);
        update_group(|| {
            data.handle().notify_observers();
            assert_eq!(data.handle().observer_count(), 1);
        });
        assert_eq!(data.handle().observer_count(), 1);
    }

    #[test]
    fn slot_released_inside_group_is_skipped() {
        let data = PropertyBindingData::new();
        update_group(|| {
            data.handle().notify_observers();
            let handle = data.handle();
            drop(data);
            assert!(!handle.is_valid());
        });
    }

    #[test]
    fn many_slots_span_pages() {
        let slots: Vec<_> = (0..DELAYED_PAGE_CAPACITY * 2 + 3)
            .map(|_| PropertyBindingData::new())
            .collect();
        let counters: Vec<_> = slots.iter().map(counting_handler).collect();
        update_group(|| {
            for slot in &slots {
                slot.handle().notify_observers();
            }
        });
        assert!(counters.iter().all(|(_, c)| c.get() == 1));
    }

    #[test]
    fn unwinding_guard_drops_notifications() {
        let data = PropertyBindingData::new();
        let (_handler, count) = counting_handler(&data);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _group = PropertyUpdateGroup::new();
            data.handle().notify_observers();
            panic!("abort the update");
        }));
        assert!(result.is_err());
        assert!(!is_update_group_active());
        assert!(!data.handle().is_notification_delayed());
        assert_eq!(count.get(), 0);
    }
}
