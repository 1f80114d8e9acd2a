#![no_main]

//! Drives a small pool of properties through arbitrary writes, bindings
//! (cycles included), handlers, aliases and update groups. The engine must
//! never panic or recurse without bound, and every group must close cleanly.

use arbitrary::Arbitrary;
use bindery_core::{
    ChangeHandler, Property, PropertyAlias, PropertyBinding, begin_property_update_group,
    end_property_update_group, is_update_group_active, live_bindings, live_observer_nodes,
    live_slots,
};
use libfuzzer_sys::fuzz_target;

const POOL: usize = 6;

#[derive(Debug, Arbitrary)]
enum Op {
    Set { target: u8, value: u8 },
    BindSum { target: u8, left: u8, right: u8 },
    BindSticky { target: u8, source: u8 },
    RemoveBinding { target: u8 },
    TakeBinding { target: u8 },
    Subscribe { target: u8 },
    DropHandler { index: u8 },
    Alias { target: u8 },
    AliasSet { index: u8, value: u8 },
    Replace { target: u8, value: u8 },
    Read { target: u8 },
    BeginGroup,
    EndGroup,
}

fn pick(raw: u8) -> usize {
    usize::from(raw) % POOL
}

fuzz_target!(|ops: Vec<Op>| {
    if ops.len() > 256 {
        return;
    }
    let baseline = (live_observer_nodes(), live_slots(), live_bindings());
    {
        let mut pool: Vec<Property<u8>> = (0..POOL).map(|_| Property::new(0)).collect();
        let mut handlers: Vec<ChangeHandler> = Vec::new();
        let mut aliases: Vec<PropertyAlias<u8>> = Vec::new();
        let mut depth = 0_usize;

        for op in ops {
            match op {
                Op::Set { target, value } => pool[pick(target)].set_value(value),
                Op::BindSum { target, left, right } => {
                    let (l, r) = (pool[pick(left)].downgrade(), pool[pick(right)].downgrade());
                    pool[pick(target)].set_binding(PropertyBinding::new(move || {
                        let l = l.upgrade().map_or(0, |p| p.value());
                        let r = r.upgrade().map_or(0, |p| p.value());
                        l.wrapping_add(r)
                    }));
                }
                Op::BindSticky { target, source } => {
                    let s = pool[pick(source)].downgrade();
                    let binding = PropertyBinding::new(move || {
                        s.upgrade().map_or(0, |p| p.value()).wrapping_mul(3)
                    });
                    binding.set_sticky(true);
                    pool[pick(target)].set_binding(binding);
                }
                Op::RemoveBinding { target } => pool[pick(target)].remove_binding(),
                Op::TakeBinding { target } => {
                    let _ = pool[pick(target)].take_binding();
                }
                Op::Subscribe { target } => {
                    let watched = pool[pick(target)].downgrade();
                    handlers.push(pool[pick(target)].on_value_changed(move || {
                        if let Some(p) = watched.upgrade() {
                            let _ = p.value();
                        }
                    }));
                }
                Op::DropHandler { index } => {
                    if !handlers.is_empty() {
                        let i = usize::from(index) % handlers.len();
                        handlers.swap_remove(i);
                    }
                }
                Op::Alias { target } => aliases.push(PropertyAlias::new(&pool[pick(target)])),
                Op::AliasSet { index, value } => {
                    if !aliases.is_empty() {
                        let i = usize::from(index) % aliases.len();
                        let _ = aliases[i].set_value(value);
                    }
                }
                Op::Replace { target, value } => pool[pick(target)] = Property::new(value),
                Op::Read { target } => {
                    let _ = pool[pick(target)].value();
                }
                Op::BeginGroup => {
                    begin_property_update_group();
                    depth += 1;
                }
                Op::EndGroup => {
                    if depth > 0 {
                        end_property_update_group();
                        depth -= 1;
                    }
                }
            }
        }
        for _ in 0..depth {
            end_property_update_group();
        }
        assert!(!is_update_group_active());
    }
    // Bindings hold their inputs weakly, so nothing outlives the pool.
    assert_eq!((live_observer_nodes(), live_slots(), live_bindings()), baseline);
});
