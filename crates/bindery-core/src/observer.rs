#![forbid(unsafe_code)]

//! Observer nodes and the walks over observer lists.
//!
//! Every slot (or the binding installed in it) heads a doubly-linked list of
//! [`ObserverNode`]s. A node's back-link is a [`Prev`]: either the list head
//! (a slot or a binding) or the previous node. Unlinking therefore never has
//! to search the list.
//!
//! # Invariants
//!
//! 1. A node is in at most one list at a time. `Prev::Detached` means "in no
//!    list" and implies `next == None`.
//! 2. Dependency observers are prepended; change handlers and aliases are
//!    appended, so handlers run in registration order.
//! 3. Walks never hold a graph borrow while running a callback. Before a
//!    callback runs, a placeholder is spliced in right after the node being
//!    visited and the walk resumes from the placeholder.
//! 4. A change handler whose successor is a placeholder is already running
//!    further up the stack and is skipped.
//!
//! # Failure Modes
//!
//! - A callback that unlinks the node being visited, its successor, or the
//!   whole list: the placeholder keeps the walk position valid; a placeholder
//!   unlinked by slot destruction simply ends the walk.
//! - A callback that panics: the placeholder is removed by its drop guard.

use std::fmt;
use std::rc::Rc;

use crate::binding::{BindingCore, PendingBindingObservers};
use crate::binding_data::BindingDataRef;
use crate::status::{BindingKey, Graph, ObserverKey, SlotKey, try_with_graph, with_graph};

/// A change-handler callback.
pub(crate) type HandlerFn = Rc<dyn Fn()>;

/// Back-link of an observer node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Prev {
    Detached,
    /// First node of a slot's own list.
    Slot(SlotKey),
    /// First node of an installed binding's list.
    Binding(BindingKey),
    Node(ObserverKey),
}

pub(crate) enum ObserverKind {
    /// Re-evaluate this binding when the observed slot changes.
    NotifiesBinding(BindingKey),
    NotifiesChangeHandler(HandlerFn),
    /// Tracks target liveness; carries no callback.
    IsAlias,
    /// Walk-position marker; carries no callback.
    IsPlaceholder,
}

impl fmt::Debug for ObserverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotifiesBinding(key) => f.debug_tuple("NotifiesBinding").field(key).finish(),
            Self::NotifiesChangeHandler(_) => f.write_str("NotifiesChangeHandler"),
            Self::IsAlias => f.write_str("IsAlias"),
            Self::IsPlaceholder => f.write_str("IsPlaceholder"),
        }
    }
}

#[derive(Debug)]
pub(crate) struct ObserverNode {
    pub(crate) next: Option<ObserverKey>,
    pub(crate) prev: Prev,
    pub(crate) kind: ObserverKind,
}

impl Graph {
    pub(crate) fn new_observer(&mut self, kind: ObserverKind) -> ObserverKey {
        self.observers.insert(ObserverNode {
            next: None,
            prev: Prev::Detached,
            kind,
        })
    }

    pub(crate) fn is_linked(&self, node: ObserverKey) -> bool {
        self.observers
            .get(node)
            .is_some_and(|n| n.prev != Prev::Detached)
    }

    /// Read the forward link stored at `link`.
    pub(crate) fn read_link(&self, link: Prev) -> Option<ObserverKey> {
        match link {
            Prev::Detached => None,
            Prev::Slot(slot) => self.slot_observers(slot),
            Prev::Binding(binding) => self.bindings.get(binding)?.first_observer,
            Prev::Node(node) => self.observers.get(node)?.next,
        }
    }

    /// Overwrite the forward link stored at `link`.
    fn write_link(&mut self, link: Prev, next: Option<ObserverKey>) {
        match link {
            Prev::Detached => {}
            Prev::Slot(slot) => self.set_slot_observers(slot, next),
            Prev::Binding(binding) => {
                if let Some(b) = self.bindings.get_mut(binding) {
                    b.first_observer = next;
                }
            }
            Prev::Node(node) => {
                if let Some(n) = self.observers.get_mut(node) {
                    n.next = next;
                }
            }
        }
    }

    /// Remove `node` from its list. Idempotent.
    pub(crate) fn unlink(&mut self, node: ObserverKey) {
        let Some(n) = self.observers.get_mut(node) else {
            return;
        };
        let prev = std::mem::replace(&mut n.prev, Prev::Detached);
        let next = n.next.take();
        if prev == Prev::Detached {
            return;
        }
        self.write_link(prev, next);
        if let Some(next) = next
            && let Some(n) = self.observers.get_mut(next)
        {
            n.prev = prev;
        }
    }

    /// Unlink and free `node`, handing back its payload so the caller can
    /// drop it outside the graph borrow.
    pub(crate) fn release_observer(&mut self, node: ObserverKey) -> Option<ObserverNode> {
        self.unlink(node);
        self.observers.remove(node)
    }

    /// Insert `node` right after `link`.
    fn link_after(&mut self, link: Prev, node: ObserverKey) {
        self.unlink(node);
        let next = self.read_link(link);
        if let Some(n) = self.observers.get_mut(node) {
            n.prev = link;
            n.next = next;
        }
        if let Some(next) = next
            && let Some(n) = self.observers.get_mut(next)
        {
            n.prev = Prev::Node(node);
        }
        self.write_link(link, Some(node));
    }

    /// Prepend `node` to the observer list of `slot`.
    pub(crate) fn prepend_observer(&mut self, slot: SlotKey, node: ObserverKey) {
        if let Some(head) = self.list_head(slot) {
            self.link_after(head, node);
        }
    }

    /// Append `node` to the observer list of `slot`.
    pub(crate) fn append_observer(&mut self, slot: SlotKey, node: ObserverKey) {
        let Some(head) = self.list_head(slot) else {
            return;
        };
        self.unlink(node);
        let mut link = head;
        while let Some(next) = self.read_link(link) {
            link = Prev::Node(next);
        }
        self.link_after(link, node);
    }

    /// Splice the list starting at `first` in front of the list at `head`.
    pub(crate) fn splice_front(&mut self, head: Prev, first: ObserverKey) {
        let mut tail = first;
        while let Some(next) = self.observers.get(tail).and_then(|n| n.next) {
            tail = next;
        }
        let existing = self.read_link(head);
        if let Some(n) = self.observers.get_mut(tail) {
            n.next = existing;
        }
        if let Some(existing) = existing
            && let Some(n) = self.observers.get_mut(existing)
        {
            n.prev = Prev::Node(tail);
        }
        if let Some(n) = self.observers.get_mut(first) {
            n.prev = head;
        }
        self.write_link(head, Some(first));
    }

    /// Detach every node of the list starting at `first`.
    pub(crate) fn detach_list(&mut self, first: Option<ObserverKey>) {
        let mut current = first;
        while let Some(node) = current {
            let Some(n) = self.observers.get_mut(node) else {
                break;
            };
            current = n.next.take();
            n.prev = Prev::Detached;
        }
    }

    /// Number of nodes in the list at `head`, placeholders excluded.
    pub(crate) fn count_observers(&self, head: Prev) -> usize {
        let mut count = 0;
        let mut current = self.read_link(head);
        while let Some(node) = current {
            let Some(n) = self.observers.get(node) else {
                break;
            };
            if !matches!(n.kind, ObserverKind::IsPlaceholder) {
                count += 1;
            }
            current = n.next;
        }
        count
    }
}

/// A placeholder node marking a walk position.
///
/// Dropping the protector unlinks and frees the placeholder.
pub(crate) struct NodeProtector {
    placeholder: Option<ObserverKey>,
}

impl NodeProtector {
    /// Splice a placeholder right after `node`.
    fn splice(graph: &mut Graph, node: ObserverKey) -> Self {
        let placeholder = graph.new_observer(ObserverKind::IsPlaceholder);
        graph.link_after(Prev::Node(node), placeholder);
        Self {
            placeholder: Some(placeholder),
        }
    }

    /// Remove the placeholder, returning the node that followed it.
    fn finish(mut self) -> Option<ObserverKey> {
        let placeholder = self.placeholder.take()?;
        with_graph(|graph| {
            let next = graph.observers.get(placeholder).and_then(|n| n.next);
            graph.release_observer(placeholder);
            next
        })
    }
}

impl Drop for NodeProtector {
    fn drop(&mut self) {
        if let Some(placeholder) = self.placeholder.take() {
            try_with_graph(|graph| graph.release_observer(placeholder));
        }
    }
}

enum BindingStep {
    Stop,
    Skip(Option<ObserverKey>),
    Evaluate(Rc<BindingCore>, NodeProtector),
}

/// Re-evaluate every binding observing the list starting at `first`,
/// collecting the ones that need a deferred notification into `pending`.
pub(crate) fn evaluate_bindings(first: Option<ObserverKey>, pending: &mut PendingBindingObservers) {
    let mut current = first;
    while let Some(node) = current {
        let step = with_graph(|graph| {
            let Some(n) = graph.observers.get(node) else {
                return BindingStep::Stop;
            };
            let ObserverKind::NotifiesBinding(binding) = n.kind else {
                return BindingStep::Skip(n.next);
            };
            let next = n.next;
            match graph.bindings.get(binding).and_then(|b| b.owner.upgrade()) {
                Some(core) => BindingStep::Evaluate(core, NodeProtector::splice(graph, node)),
                None => BindingStep::Skip(next),
            }
        });
        match step {
            BindingStep::Stop => break,
            BindingStep::Skip(next) => current = next,
            BindingStep::Evaluate(core, protector) => {
                pending.push(Rc::clone(&core));
                core.evaluate_recursive(pending);
                current = protector.finish();
            }
        }
    }
}

enum HandlerStep {
    Stop,
    Skip(Option<ObserverKey>),
    Call(HandlerFn, NodeProtector),
}

/// Run every change handler in the list starting at `first`.
pub(crate) fn notify_change_handlers(first: Option<ObserverKey>) {
    let mut current = first;
    while let Some(node) = current {
        let step = with_graph(|graph| {
            let Some(n) = graph.observers.get(node) else {
                return HandlerStep::Stop;
            };
            let ObserverKind::NotifiesChangeHandler(handler) = &n.kind else {
                return HandlerStep::Skip(n.next);
            };
            let handler = Rc::clone(handler);
            if let Some(next) = n.next
                && let Some(successor) = graph.observers.get(next)
                && matches!(successor.kind, ObserverKind::IsPlaceholder)
            {
                return HandlerStep::Skip(successor.next);
            }
            HandlerStep::Call(handler, NodeProtector::splice(graph, node))
        });
        match step {
            HandlerStep::Stop => break,
            HandlerStep::Skip(next) => current = next,
            HandlerStep::Call(handler, protector) => {
                handler();
                current = protector.finish();
            }
        }
    }
}

/// Registration of a change handler on a property.
///
/// The handler runs after every change of the property's value. Dropping
/// this value unregisters it, including from inside the handler itself.
#[must_use = "dropping a ChangeHandler unregisters its callback"]
pub struct ChangeHandler {
    node: ObserverKey,
}

impl ChangeHandler {
    /// Register `callback` on `data`. A `None` or stale slot yields a handler
    /// that never fires.
    pub(crate) fn attach(data: Option<BindingDataRef>, callback: HandlerFn) -> Self {
        let node = with_graph(|graph| {
            let node = graph.new_observer(ObserverKind::NotifiesChangeHandler(callback));
            if let Some(data) = data {
                graph.append_observer(data.key(), node);
            }
            node
        });
        Self { node }
    }

    /// Whether the handler is still attached to a live property.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        with_graph(|graph| graph.is_linked(self.node))
    }
}

impl fmt::Debug for ChangeHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeHandler")
            .field("node", &self.node)
            .finish()
    }
}

impl Drop for ChangeHandler {
    fn drop(&mut self) {
        // The callback is dropped after the graph borrow ends.
        let released = try_with_graph(|graph| graph.release_observer(self.node));
        drop(released);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding_data::PropertyBindingData;
    use std::cell::{Cell, RefCell};

    fn handler(f: impl Fn() + 'static) -> HandlerFn {
        Rc::new(f)
    }

    #[test]
    fn handlers_run_in_registration_order() {
        let data = PropertyBindingData::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        let handlers: Vec<_> = (0..3)
            .map(|i| {
                let log = Rc::clone(&log);
                ChangeHandler::attach(Some(data.handle()), handler(move || log.borrow_mut().push(i)))
            })
            .collect();
        data.handle().notify_observers();
        assert_eq!(*log.borrow(), vec![0, 1, 2]);
        drop(handlers);
        assert_eq!(data.handle().observer_count(), 0);
    }

    #[test]
    fn unlink_is_idempotent() {
        let data = PropertyBindingData::new();
        let h = ChangeHandler::attach(Some(data.handle()), handler(|| {}));
        with_graph(|graph| {
            graph.unlink(h.node);
            graph.unlink(h.node);
            assert!(!graph.is_linked(h.node));
        });
        assert_eq!(data.handle().observer_count(), 0);
    }

    #[test]
    fn handler_can_drop_its_successor() {
        let data = PropertyBindingData::new();
        let fired = Rc::new(Cell::new(0));
        let second: Rc<RefCell<Option<ChangeHandler>>> = Rc::new(RefCell::new(None));

        let first = {
            let second = Rc::clone(&second);
            ChangeHandler::attach(
                Some(data.handle()),
                handler(move || {
                    second.borrow_mut().take();
                }),
            )
        };
        let f = Rc::clone(&fired);
        *second.borrow_mut() = Some(ChangeHandler::attach(
            Some(data.handle()),
            handler(move || f.set(f.get() + 1)),
        ));

        data.handle().notify_observers();
        assert_eq!(fired.get(), 0);
        assert_eq!(data.handle().observer_count(), 1);
        drop(first);
    }

    #[test]
    fn placeholders_are_released_after_walk() {
        let data = PropertyBindingData::new();
        let _h = ChangeHandler::attach(Some(data.handle()), handler(|| {}));
        let before = crate::status::live_observer_nodes();
        data.handle().notify_observers();
        assert_eq!(crate::status::live_observer_nodes(), before);
    }

    #[test]
    fn detached_handler_never_fires() {
        let fired = Rc::new(Cell::new(false));
        let f = Rc::clone(&fired);
        let h = ChangeHandler::attach(None, handler(move || f.set(true)));
        assert!(!h.is_connected());
        assert!(!fired.get());
    }
}
