//! 拉取序列适配器：逐条消费、停靠唤醒、终态与单请求纪律。

use std::cell::RefCell;
use std::rc::Rc;

use sluice_core::prelude::*;

use crate::support::{chunk_text, idle_source};

#[test]
fn iterator_drains_source_in_order() {
    let sched = Scheduler::new();
    let src = Readable::from_iter(
        &sched,
        StreamOptions::object(),
        ["a", "b", "c"].map(Chunk::item),
    );
    let collected: Vec<String> = src
        .sequence()
        .map(|item| chunk_text(&item.unwrap()))
        .collect();
    assert_eq!(collected, vec!["a", "b", "c"]);
}

#[test]
fn parked_request_resolves_when_data_arrives_later() {
    let sched = Scheduler::new();
    let src = Readable::new(&sched, StreamOptions::object(), idle_source());
    let seq = src.sequence();

    let resolved: Rc<RefCell<Option<Option<String>>>> = Rc::new(RefCell::new(None));
    {
        let resolved = Rc::clone(&resolved);
        seq.next_with(move |item| {
            *resolved.borrow_mut() = Some(item.unwrap().map(|c| chunk_text(&c)));
        });
    }
    sched.run_until_idle().unwrap();
    assert!(resolved.borrow().is_none());

    src.push(Chunk::item("x"));
    sched.run_until_idle().unwrap();
    assert_eq!(*resolved.borrow(), Some(Some("x".to_owned())));
}

#[test]
fn second_request_while_parked_is_rejected() {
    let sched = Scheduler::new();
    let src = Readable::new(&sched, StreamOptions::object(), idle_source());
    let seq = src.sequence();

    seq.next_with(|_| {});
    let rejected = Rc::new(RefCell::new(None));
    {
        let rejected = Rc::clone(&rejected);
        seq.next_with(move |item| {
            *rejected.borrow_mut() = item.err().map(|e| e.code());
        });
    }
    assert_eq!(*rejected.borrow(), Some(codes::REQUEST_PENDING));
    drop(seq);
    sched.run_until_idle().unwrap();
}

#[test]
fn parked_request_completes_with_none_at_end_of_data() {
    let sched = Scheduler::new();
    let src = Readable::new(&sched, StreamOptions::object(), idle_source());
    let seq = src.sequence();

    let resolved = Rc::new(RefCell::new(None));
    {
        let resolved = Rc::clone(&resolved);
        seq.next_with(move |item| {
            *resolved.borrow_mut() = Some(item.unwrap().is_none());
        });
    }
    src.push_end();
    sched.run_until_idle().unwrap();
    assert_eq!(*resolved.borrow(), Some(true));
}

#[test]
fn source_error_rejects_parked_and_future_requests() {
    let sched = Scheduler::new();
    let src = Readable::new(&sched, StreamOptions::object(), idle_source());
    let seq = src.sequence();

    let first = Rc::new(RefCell::new(None));
    {
        let first = Rc::clone(&first);
        seq.next_with(move |item| {
            *first.borrow_mut() = item.err().map(|e| e.code());
        });
    }
    src.destroy_with(StreamError::new("source.lost", "gone"));
    sched.run_until_idle().unwrap();
    assert_eq!(*first.borrow(), Some("source.lost"));

    let later = Rc::new(RefCell::new(None));
    {
        let later = Rc::clone(&later);
        seq.next_with(move |item| {
            *later.borrow_mut() = item.err().map(|e| e.code());
        });
    }
    assert_eq!(*later.borrow(), Some("source.lost"));
}

#[test]
fn stalled_source_is_reported_instead_of_spinning() {
    let sched = Scheduler::new();
    let src = Readable::new(&sched, StreamOptions::object(), idle_source());
    let mut seq = src.sequence();
    let item = seq.next().unwrap();
    assert!(item.unwrap_err().is(codes::SEQUENCE_STALLED));
}
