//! Property-based checks for the binding graph.
//!
//! Random acyclic graphs of summing bindings are driven by random writes,
//! single or grouped, and compared against direct recomputation after every
//! step. Every input feeds a sum with coefficient one, so a dependent that
//! changes mid-walk cannot change back: a handler firing without a net
//! change is a bug outside grouped updates.

use std::cell::Cell;
use std::collections::BTreeSet;
use std::rc::Rc;

use bindery_core::{
    ChangeHandler, Property, live_bindings, live_observer_nodes, live_slots, update_group,
};
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Write(usize, i64),
    Grouped(Vec<(usize, i64)>),
}

prop_compose! {
    /// A derived node: raw input picks (reduced modulo the nodes defined so
    /// far) and a constant offset.
    fn arb_derived()(
        picks in prop::collection::vec(0usize..1000, 1..4),
        offset in -50i64..50
    ) -> (Vec<usize>, i64) {
        (picks, offset)
    }
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0usize..1000, -1000i64..1000).prop_map(|(i, v)| Op::Write(i, v)),
        1 => prop::collection::vec((0usize..1000, -1000i64..1000), 1..5).prop_map(Op::Grouped),
    ]
}

struct SumGraph {
    sources: usize,
    inputs: Vec<BTreeSet<usize>>,
    offsets: Vec<i64>,
    nodes: Vec<Property<i64>>,
    fired: Vec<Rc<Cell<u32>>>,
    _handlers: Vec<ChangeHandler>,
}

impl SumGraph {
    fn build(source_values: &[i64], derived: &[(Vec<usize>, i64)]) -> Self {
        let sources = source_values.len();
        let mut nodes: Vec<Property<i64>> =
            source_values.iter().map(|&v| Property::new(v)).collect();
        let mut inputs = Vec::with_capacity(derived.len());
        let mut offsets = Vec::with_capacity(derived.len());

        for (j, (picks, offset)) in derived.iter().enumerate() {
            let set: BTreeSet<usize> = picks.iter().map(|p| p % (sources + j)).collect();
            let reads: Vec<Property<i64>> = set.iter().map(|&i| nodes[i].clone()).collect();
            let offset = *offset;
            nodes.push(Property::bound(move || {
                reads.iter().map(Property::value).sum::<i64>() + offset
            }));
            inputs.push(set);
            offsets.push(offset);
        }

        let mut fired = Vec::with_capacity(derived.len());
        let mut handlers = Vec::with_capacity(derived.len());
        for node in &nodes[sources..] {
            let count = Rc::new(Cell::new(0));
            let c = Rc::clone(&count);
            handlers.push(node.on_value_changed(move || c.set(c.get() + 1)));
            fired.push(count);
        }

        Self {
            sources,
            inputs,
            offsets,
            nodes,
            fired,
            _handlers: handlers,
        }
    }

    fn source(&self, pick: usize) -> &Property<i64> {
        &self.nodes[pick % self.sources]
    }

    fn apply(&self, op: &Op) {
        match op {
            Op::Write(i, v) => self.source(*i).set_value(*v),
            Op::Grouped(writes) => update_group(|| {
                for &(i, v) in writes {
                    self.source(i).set_value(v);
                }
            }),
        }
    }

    fn actual(&self) -> Vec<i64> {
        self.nodes.iter().map(Property::value).collect()
    }

    fn expected(&self) -> Vec<i64> {
        let mut values: Vec<i64> = self.nodes[..self.sources]
            .iter()
            .map(Property::value)
            .collect();
        for (set, offset) in self.inputs.iter().zip(&self.offsets) {
            let v = set.iter().map(|&i| values[i]).sum::<i64>() + offset;
            values.push(v);
        }
        values
    }

    fn reset_counts(&self) {
        for count in &self.fired {
            count.set(0);
        }
    }
}

// =============================================================================
// Recomputation agreement
// =============================================================================

mod recomputation {
    use super::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// Every derived value equals a fresh recomputation after each step.
        #[test]
        fn bindings_match_recomputation(
            source_values in prop::collection::vec(-100i64..100, 1..6),
            derived in prop::collection::vec(arb_derived(), 1..8),
            ops in prop::collection::vec(arb_op(), 1..20),
        ) {
            let graph = SumGraph::build(&source_values, &derived);
            prop_assert_eq!(graph.actual(), graph.expected());

            for op in &ops {
                graph.apply(op);
                prop_assert_eq!(graph.actual(), graph.expected());
            }
        }

        /// Handlers fire once for a net change, and never without one
        /// outside a group.
        #[test]
        fn handlers_fire_at_most_once_per_step(
            source_values in prop::collection::vec(-100i64..100, 1..6),
            derived in prop::collection::vec(arb_derived(), 1..8),
            ops in prop::collection::vec(arb_op(), 1..20),
        ) {
            let graph = SumGraph::build(&source_values, &derived);

            for op in &ops {
                let before = graph.actual();
                graph.reset_counts();
                graph.apply(op);
                let after = graph.actual();
                let grouped = matches!(op, Op::Grouped(_));

                for (j, count) in graph.fired.iter().enumerate() {
                    let k = graph.sources + j;
                    let fired = count.get();
                    prop_assert!(fired <= 1, "node {} fired {} times", k, fired);
                    if after[k] != before[k] {
                        prop_assert_eq!(fired, 1, "node {} changed silently", k);
                    } else if !grouped {
                        prop_assert_eq!(fired, 0, "node {} fired without a change", k);
                    }
                }
            }
        }
    }
}

// =============================================================================
// Teardown
// =============================================================================

mod teardown {
    use super::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        /// Dropping a graph releases every node, slot and binding it created.
        #[test]
        fn dropping_graph_releases_everything(
            source_values in prop::collection::vec(-100i64..100, 1..6),
            derived in prop::collection::vec(arb_derived(), 0..8),
            ops in prop::collection::vec(arb_op(), 0..10),
        ) {
            let baseline = (live_observer_nodes(), live_slots(), live_bindings());
            {
                let graph = SumGraph::build(&source_values, &derived);
                for op in &ops {
                    graph.apply(op);
                }
            }
            prop_assert_eq!((live_observer_nodes(), live_slots(), live_bindings()), baseline);
        }
    }
}
