#![no_main]

//! Exercises the open-addressing table behind `BindingStorage` with
//! arbitrary insert/remove/lookup sequences and checks it against a model.

use std::collections::HashMap;
use std::rc::Rc;

use arbitrary::Arbitrary;
use bindery_core::{BindingStorage, PropertyId, StoredProperty};
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Arbitrary)]
enum Op {
    Create { value: u16 },
    Touch { index: u8 },
    Forget { index: u8 },
    Release { index: u8 },
    Set { index: u8, value: u16 },
}

fuzz_target!(|ops: Vec<Op>| {
    if ops.len() > 512 {
        return;
    }
    let storage = Rc::new(BindingStorage::new());
    let mut live: Vec<StoredProperty<u16>> = Vec::new();
    let mut model: HashMap<PropertyId, bool> = HashMap::new();

    for op in ops {
        match op {
            Op::Create { value } => {
                let property = StoredProperty::new(&storage, value);
                model.insert(property.id(), false);
                live.push(property);
            }
            Op::Touch { index } if !live.is_empty() => {
                let property = &live[usize::from(index) % live.len()];
                assert!(property.binding_data(true).is_some());
                model.insert(property.id(), true);
            }
            Op::Forget { index } if !live.is_empty() => {
                let property = &live[usize::from(index) % live.len()];
                let had = model.insert(property.id(), false).unwrap_or(false);
                assert_eq!(storage.remove(property.id()), had);
            }
            Op::Release { index } if !live.is_empty() => {
                let property = live.swap_remove(usize::from(index) % live.len());
                model.remove(&property.id());
            }
            Op::Set { index, value } if !live.is_empty() => {
                let property = &live[usize::from(index) % live.len()];
                property.set_value(value);
                assert_eq!(property.value(), value);
            }
            _ => {}
        }

        let expected = model.values().filter(|&&stored| stored).count();
        assert_eq!(storage.len(), expected);
        for property in &live {
            let stored = model.get(&property.id()).copied().unwrap_or(false);
            assert_eq!(property.binding_data(false).is_some(), stored);
        }
    }
});
