//! The facade prelude covers the everyday workflow.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use bindery::prelude::*;

#[test]
fn doubled_value_follows_source_with_one_notification() {
    let a = Property::new(1);
    let a2 = a.clone();
    let b = Property::bound(move || a2.value() * 2);
    assert_eq!(b.value(), 2);

    let seen = Rc::new(RefCell::new(Vec::new()));
    let (s, b2) = (Rc::clone(&seen), b.clone());
    let _handler = b.on_value_changed(move || s.borrow_mut().push(untracked(|| b2.value())));

    a.set_value(5);
    assert_eq!(b.value(), 10);
    assert_eq!(*seen.borrow(), vec![10]);
}

#[test]
fn grouped_writes_settle_before_notifying() {
    let x = Property::new(2);
    let y = Property::new(1);
    let (x2, y2) = (x.clone(), y.clone());
    let z = Property::new(0);
    z.set_binding(bind_map2!(x2, y2, |x, y| x + y));
    assert_eq!(z.value(), 3);

    let fired = Rc::new(Cell::new(0));
    let f = Rc::clone(&fired);
    let _handler = z.on_value_changed(move || f.set(f.get() + 1));

    update_group(|| {
        x.set_value(10);
        y.set_value(5);
    });
    assert_eq!(z.value(), 15);
    assert_eq!(fired.get(), 1);
}

#[test]
fn scope_and_storage_work_through_the_prelude() {
    let storage = Rc::new(BindingStorage::new());
    let width = StoredProperty::new(&storage, 4);
    let label = Property::new(String::new());
    let w = width.clone();
    label.set_binding(PropertyBinding::new(move || format!("width={}", w.value())));

    let changes = Rc::new(Cell::new(0));
    let mut scope = BindingScope::new();
    let c = Rc::clone(&changes);
    scope.on_value_changed(&label, move || c.set(c.get() + 1));

    width.set_value(9);
    assert_eq!(label.value(), "width=9");
    assert_eq!(changes.get(), 1);

    drop(scope);
    width.set_value(10);
    assert_eq!(changes.get(), 1);
}
