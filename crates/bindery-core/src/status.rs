#![forbid(unsafe_code)]

//! Per-thread binding status.
//!
//! Every structure of the binding graph (observer nodes, binding slots,
//! binding bookkeeping, the active update group) lives in one [`Graph`]
//! owned by a thread-local [`BindingStatus`]. Handles handed to users only
//! carry arena keys, so a property, binding or observer can only ever be
//! touched from the thread that created it.
//!
//! The status also tracks the stack of bindings currently being evaluated.
//! A tracked read consults the top frame to decide which binding (if any)
//! gains a dependency on the slot being read.
//!
//! # Borrow discipline
//!
//! The graph sits behind a `RefCell`. Engine code borrows it for short,
//! callback-free sections only; user closures (binding functions, change
//! handlers, static observers) always run with the graph released. Binding
//! objects dropped while the graph happens to be borrowed are queued and
//! reclaimed by the next borrow.

use std::cell::RefCell;

use smallvec::SmallVec;

use crate::arena::{Arena, arena_key};
use crate::binding::BindingNode;
use crate::binding_data::SlotState;
use crate::group::GroupUpdateData;
use crate::observer::ObserverNode;

arena_key! {
    /// Key of an observer node.
    pub(crate) struct ObserverKey;
}

arena_key! {
    /// Key of a binding slot (the per-property binding/observer word).
    pub(crate) struct SlotKey;
}

arena_key! {
    /// Key of a binding's graph bookkeeping.
    pub(crate) struct BindingKey;
}

/// The binding graph of one thread.
pub(crate) struct Graph {
    pub(crate) observers: Arena<ObserverKey, ObserverNode>,
    pub(crate) slots: Arena<SlotKey, SlotState>,
    pub(crate) bindings: Arena<BindingKey, BindingNode>,
    pub(crate) group: Option<GroupUpdateData>,
}

impl Graph {
    fn new() -> Self {
        Self {
            observers: Arena::new(),
            slots: Arena::new(),
            bindings: Arena::new(),
            group: None,
        }
    }
}

/// One entry of the evaluation stack.
struct EvaluationFrame {
    binding: BindingKey,
    /// Slots already registered as dependencies during this evaluation.
    captured: SmallVec<[SlotKey; 8]>,
}

pub(crate) struct BindingStatus {
    graph: RefCell<Graph>,
    /// `None` entries suspend tracking (see [`untracked`]).
    frames: RefCell<Vec<Option<EvaluationFrame>>>,
    deferred_releases: RefCell<Vec<BindingKey>>,
}

impl BindingStatus {
    fn new() -> Self {
        Self {
            graph: RefCell::new(Graph::new()),
            frames: RefCell::new(Vec::new()),
            deferred_releases: RefCell::new(Vec::new()),
        }
    }

    fn flush_deferred(&self, graph: &mut Graph) {
        let keys = std::mem::take(&mut *self.deferred_releases.borrow_mut());
        for key in keys {
            graph.release_binding(key);
        }
    }
}

thread_local! {
    static STATUS: BindingStatus = BindingStatus::new();
}

/// Run `f` with exclusive access to this thread's graph.
///
/// `f` must not call back into user code.
pub(crate) fn with_graph<R>(f: impl FnOnce(&mut Graph) -> R) -> R {
    STATUS.with(|status| {
        let mut graph = status.graph.borrow_mut();
        status.flush_deferred(&mut graph);
        f(&mut graph)
    })
}

/// Like [`with_graph`], for drop paths: returns `None` during thread-local
/// teardown instead of panicking.
pub(crate) fn try_with_graph<R>(f: impl FnOnce(&mut Graph) -> R) -> Option<R> {
    STATUS
        .try_with(|status| {
            let mut graph = status.graph.try_borrow_mut().ok()?;
            status.flush_deferred(&mut graph);
            Some(f(&mut graph))
        })
        .ok()
        .flatten()
}

/// Release a binding's graph state, deferring if the graph is busy.
pub(crate) fn release_binding_later(key: BindingKey) {
    let _ = STATUS.try_with(|status| match status.graph.try_borrow_mut() {
        Ok(mut graph) => {
            status.flush_deferred(&mut graph);
            graph.release_binding(key);
        }
        Err(_) => status.deferred_releases.borrow_mut().push(key),
    });
}

/// RAII marker for "`binding` is being evaluated".
pub(crate) struct EvaluationScope {
    _private: (),
}

impl EvaluationScope {
    pub(crate) fn enter(binding: BindingKey) -> Self {
        STATUS.with(|status| {
            status.frames.borrow_mut().push(Some(EvaluationFrame {
                binding,
                captured: SmallVec::new(),
            }));
        });
        Self { _private: () }
    }

    fn suspend() -> Self {
        STATUS.with(|status| status.frames.borrow_mut().push(None));
        Self { _private: () }
    }
}

impl Drop for EvaluationScope {
    fn drop(&mut self) {
        let _ = STATUS.try_with(|status| status.frames.borrow_mut().pop());
    }
}

/// Claim `slot` as a dependency of the binding on top of the evaluation
/// stack. Returns that binding, or `None` when nothing is being evaluated
/// or the slot was already captured by this evaluation.
pub(crate) fn capture_dependency(slot: SlotKey) -> Option<BindingKey> {
    STATUS.with(|status| {
        let mut frames = status.frames.borrow_mut();
        let frame = frames.last_mut()?.as_mut()?;
        if frame.captured.contains(&slot) {
            return None;
        }
        frame.captured.push(slot);
        Some(frame.binding)
    })
}

/// Whether a binding evaluation is in progress (and tracking is not
/// suspended) on this thread.
#[must_use]
pub fn is_evaluating() -> bool {
    STATUS.with(|status| matches!(status.frames.borrow().last(), Some(Some(_))))
}

/// Run `f` without registering dependencies for the binding currently being
/// evaluated.
///
/// Reads inside `f` return current values but never make the enclosing
/// binding depend on the properties read.
pub fn untracked<R>(f: impl FnOnce() -> R) -> R {
    let _scope = EvaluationScope::suspend();
    f()
}

/// Number of live observer nodes on this thread (dependency observers,
/// change handlers, aliases, placeholders).
#[must_use]
pub fn live_observer_nodes() -> usize {
    with_graph(|graph| graph.observers.len())
}

/// Number of live binding objects on this thread.
#[must_use]
pub fn live_bindings() -> usize {
    with_graph(|graph| graph.bindings.len())
}

/// Number of live binding slots on this thread.
#[must_use]
pub fn live_slots() -> usize {
    with_graph(|graph| graph.slots.len())
}
