use kernel_sync::ExclusiveCell;
use std::panic;

#[test]
fn basic_borrow_and_raii() {
    let c = ExclusiveCell::new(0_u32);

    // borrow, mutate, and drop
    {
        let mut g = c.borrow();
        *g = 41;
    }

    // borrow again; previous drop must have released
    {
        let mut g = c.borrow();
        *g += 1;
        assert_eq!(*g, 42);
    }
}

#[test]
fn try_borrow_semantics() {
    let c = ExclusiveCell::new(1u8);

    let g1 = c.try_borrow();
    assert!(g1.is_some());
    assert!(c.is_borrowed());

    // while held, a second borrow must fail
    assert!(c.try_borrow().is_none());
    assert_eq!(c.try_with(|v| *v), None);

    drop(g1);
    assert!(!c.is_borrowed());
    assert_eq!(c.try_with(|v| *v), Some(1));
}

#[test]
#[should_panic(expected = "re-entered")]
fn reentry_panics() {
    let c = ExclusiveCell::new(Vec::<u8>::new());
    c.with(|outer| {
        outer.push(1);
        c.with(|inner| inner.push(2));
    });
}

#[test]
fn with_returns_value_and_releases() {
    let c = ExclusiveCell::new(String::from("a"));
    let len = c.with(|s| {
        s.push('b');
        s.len()
    });
    assert_eq!(len, 2);

    let got = c.with(|s| s.clone());
    assert_eq!(got, "ab");
}

#[test]
fn get_mut_and_into_inner() {
    let mut c = ExclusiveCell::new(vec![1, 2, 3]);
    c.get_mut().push(4);
    assert_eq!(c.into_inner(), vec![1, 2, 3, 4]);
}

#[test]
fn borrow_is_released_on_panic() {
    let c = ExclusiveCell::new(0u32);

    let res = panic::catch_unwind(panic::AssertUnwindSafe(|| {
        c.with(|v| {
            *v = 123;
            panic!("boom");
        });
    }));
    assert!(res.is_err(), "expected panic");

    assert_eq!(c.with(|v| *v), 123);
}

#[test]
fn usable_as_static() {
    static COUNTER: ExclusiveCell<u64> = ExclusiveCell::new(0);
    COUNTER.with(|v| *v += 5);
    assert_eq!(COUNTER.with(|v| *v), 5);
}
