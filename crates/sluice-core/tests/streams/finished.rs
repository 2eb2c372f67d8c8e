//! 完成观察器：自然完成、提前关闭、既成终态与取消。

use std::cell::RefCell;
use std::rc::Rc;

use sluice_core::prelude::*;

use crate::support::idle_source;

fn outcome_slot() -> Rc<RefCell<Option<Result<()>>>> {
    Rc::new(RefCell::new(None))
}

fn store(
    slot: &Rc<RefCell<Option<Result<()>>>>,
) -> impl FnOnce(Result<()>) + 'static {
    let slot = Rc::clone(slot);
    move |result| *slot.borrow_mut() = Some(result)
}

#[test]
fn writable_resolves_after_finish_not_synchronously() {
    let sched = Scheduler::new();
    let sink = Writable::new(&sched, StreamOptions::object(), |_c: Chunk, done: WriteDone| {
        done.ok();
    });
    let outcome = outcome_slot();
    let _guard = finished(&sink, FinishedOptions::default(), store(&outcome));

    sink.end();
    assert!(outcome.borrow().is_none());
    sched.run_until_idle().unwrap();
    assert!(matches!(*outcome.borrow(), Some(Ok(()))));
}

#[test]
fn duplex_requires_both_halves_to_settle() {
    struct Discard;
    impl DuplexDriver for Discard {
        fn pull(&mut self, _stream: &Duplex) {}
        fn write(&mut self, _stream: &Duplex, _chunk: Chunk, done: WriteDone) {
            done.ok();
        }
    }

    let sched = Scheduler::new();
    let duplex = Duplex::new(&sched, DuplexOptions::object(), Discard);
    duplex.resume();
    let outcome = outcome_slot();
    let _guard = finished(&duplex, FinishedOptions::default(), store(&outcome));

    duplex.end();
    sched.run_until_idle().unwrap();
    // 可写侧已 finish，但可读侧尚未 end：不得提前定论。
    assert!(outcome.borrow().is_none());

    duplex.push_end();
    sched.run_until_idle().unwrap();
    assert!(matches!(*outcome.borrow(), Some(Ok(()))));
}

#[test]
fn destroy_before_terminal_state_reports_premature_close() {
    let sched = Scheduler::new();
    let stream = Readable::new(&sched, StreamOptions::object(), idle_source());
    let outcome = outcome_slot();
    let _guard = finished(&stream, FinishedOptions::default(), store(&outcome));

    stream.destroy();
    sched.run_until_idle().unwrap();

    let borrowed = outcome.borrow();
    let err = borrowed.as_ref().unwrap().as_ref().unwrap_err();
    assert!(err.is(codes::PREMATURE_CLOSE));
}

#[test]
fn stream_error_propagates_to_the_watcher() {
    let sched = Scheduler::new();
    let stream = Readable::new(&sched, StreamOptions::object(), idle_source());
    let outcome = outcome_slot();
    let _guard = finished(&stream, FinishedOptions::default(), store(&outcome));

    stream.destroy_with(StreamError::new("source.lost", "gone"));
    sched.run_until_idle().unwrap();

    let borrowed = outcome.borrow();
    let err = borrowed.as_ref().unwrap().as_ref().unwrap_err();
    assert_eq!(err.code(), "source.lost");
}

#[test]
fn already_settled_stream_resolves_on_a_later_tick() {
    let sched = Scheduler::new();
    let sink = Writable::new(&sched, StreamOptions::object(), |_c: Chunk, done: WriteDone| {
        done.ok();
    });
    sink.end();
    sched.run_until_idle().unwrap();
    assert!(sink.writable_finished());

    let outcome = outcome_slot();
    let _guard = finished(&sink, FinishedOptions::default(), store(&outcome));
    assert!(outcome.borrow().is_none());
    sched.run_until_idle().unwrap();
    assert!(matches!(*outcome.borrow(), Some(Ok(()))));
}

#[test]
fn cancelled_watcher_never_fires() {
    let sched = Scheduler::new();
    let sink = Writable::new(&sched, StreamOptions::object(), |_c: Chunk, done: WriteDone| {
        done.ok();
    });
    let outcome = outcome_slot();
    let guard = finished(&sink, FinishedOptions::default(), store(&outcome));
    guard.cancel();

    sink.end();
    sched.run_until_idle().unwrap();
    assert!(outcome.borrow().is_none());
}
