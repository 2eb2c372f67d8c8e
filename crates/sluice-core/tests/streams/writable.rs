//! 可写引擎的端到端行为：背压/排水、单在途纪律、塞停合批、收尾链与
//! 销毁时的回调扇出。

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use sluice_core::prelude::*;

use crate::support::{chunk_text, mark, recorder};

/// 扣住完成令牌的落地端，由测试侧决定每笔写何时完成。
fn manual_sink(
    sched: &Scheduler,
    options: StreamOptions,
    received: &Rc<RefCell<Vec<String>>>,
    dones: &Rc<RefCell<Vec<WriteDone>>>,
) -> Writable {
    let received = Rc::clone(received);
    let dones = Rc::clone(dones);
    Writable::new(sched, options, move |chunk: Chunk, done: WriteDone| {
        received.borrow_mut().push(chunk_text(&chunk));
        dones.borrow_mut().push(done);
    })
}

#[test]
fn drain_fires_once_after_queue_empties() {
    let sched = Scheduler::new();
    let received = recorder();
    let dones = Rc::new(RefCell::new(Vec::new()));
    let sink = manual_sink(
        &sched,
        StreamOptions::object().with_high_water_mark(2),
        &received,
        &dones,
    );
    let log = recorder();
    sink.on(EventKind::Drain, mark(&log, "drain"));

    assert!(sink.write(Chunk::item("a")));
    assert!(!sink.write(Chunk::item("b")));
    assert!(sink.needs_drain());

    // 第一笔完成后队列仍有积压，不得提前排水。
    let first = dones.borrow_mut().remove(0);
    first.ok();
    sched.run_until_idle().unwrap();
    assert!(log.borrow().is_empty());

    let second = dones.borrow_mut().remove(0);
    second.ok();
    sched.run_until_idle().unwrap();
    assert_eq!(*log.borrow(), vec!["drain".to_owned()]);
    assert!(!sink.needs_drain());
    assert_eq!(*received.borrow(), vec!["a", "b"]);
}

#[test]
fn at_most_one_write_is_ever_in_flight() {
    let sched = Scheduler::new();
    let busy = Rc::new(Cell::new(false));
    let violated = Rc::new(Cell::new(false));
    let dones = Rc::new(RefCell::new(Vec::new()));

    let sink = {
        let busy = Rc::clone(&busy);
        let violated = Rc::clone(&violated);
        let dones = Rc::clone(&dones);
        Writable::new(
            &sched,
            StreamOptions::object(),
            move |_chunk: Chunk, done: WriteDone| {
                if busy.replace(true) {
                    violated.set(true);
                }
                dones.borrow_mut().push(done);
            },
        )
    };

    for i in 0..5u8 {
        sink.write(Chunk::item(i));
    }
    sched.run_until_idle().unwrap();

    while !dones.borrow().is_empty() {
        let done = dones.borrow_mut().remove(0);
        busy.set(false);
        done.ok();
        sched.run_until_idle().unwrap();
    }
    assert!(!violated.get());
}

#[test]
fn uncork_flushes_as_one_batch_when_sink_supports_it() {
    struct BatchSink {
        batches: Rc<RefCell<Vec<usize>>>,
    }
    impl WriteSink for BatchSink {
        fn write(&mut self, _chunk: Chunk, done: WriteDone) {
            self.batches.borrow_mut().push(1);
            done.ok();
        }
        fn supports_batch(&self) -> bool {
            true
        }
        fn write_batch(&mut self, chunks: Vec<Chunk>, done: WriteDone) {
            self.batches.borrow_mut().push(chunks.len());
            done.ok();
        }
    }

    let sched = Scheduler::new();
    let batches = Rc::new(RefCell::new(Vec::new()));
    let sink = Writable::new(
        &sched,
        StreamOptions::object(),
        BatchSink { batches: Rc::clone(&batches) },
    );

    let acks = Rc::new(Cell::new(0));
    sink.cork();
    for i in 0..3u8 {
        let acks = Rc::clone(&acks);
        sink.write_with(Chunk::item(i), move |res| {
            res.unwrap();
            acks.set(acks.get() + 1);
        });
    }
    sched.run_until_idle().unwrap();
    assert!(batches.borrow().is_empty());

    sink.uncork();
    sched.run_until_idle().unwrap();
    assert_eq!(*batches.borrow(), vec![3]);
    assert_eq!(acks.get(), 3);
}

#[test]
fn nested_cork_flushes_only_at_outermost_uncork() {
    let sched = Scheduler::new();
    let received = recorder();
    let dones = Rc::new(RefCell::new(Vec::new()));
    let sink = manual_sink(&sched, StreamOptions::object(), &received, &dones);

    sink.cork();
    sink.cork();
    sink.write(Chunk::item("x"));
    sink.uncork();
    sched.run_until_idle().unwrap();
    assert!(received.borrow().is_empty());

    sink.uncork();
    sched.run_until_idle().unwrap();
    assert_eq!(*received.borrow(), vec!["x"]);
}

#[test]
fn end_runs_finalize_then_prefinish_finish_close() {
    struct FinalizingSink {
        log: Rc<RefCell<Vec<String>>>,
    }
    impl WriteSink for FinalizingSink {
        fn write(&mut self, _chunk: Chunk, done: WriteDone) {
            done.ok();
        }
        fn finalize(&mut self, done: FinalizeDone) {
            self.log.borrow_mut().push("finalize".to_owned());
            done.complete(Ok(()));
        }
    }

    let sched = Scheduler::new();
    let log = recorder();
    let sink = Writable::new(&sched, StreamOptions::object(), FinalizingSink { log: Rc::clone(&log) });
    sink.on(EventKind::Prefinish, mark(&log, "prefinish"));
    sink.on(EventKind::Finish, mark(&log, "finish"));
    sink.on(EventKind::Close, mark(&log, "close"));

    let finished_flag = Rc::new(Cell::new(false));
    let flag = Rc::clone(&finished_flag);
    sink.write(Chunk::item("payload"));
    sink.end_notify(move |res| {
        res.unwrap();
        flag.set(true);
    });
    sched.run_until_idle().unwrap();

    assert_eq!(
        *log.borrow(),
        vec!["finalize", "prefinish", "finish", "close"]
    );
    assert!(finished_flag.get());
    assert!(sink.writable_finished());
}

#[test]
fn destroy_fails_queued_writes_before_close() {
    let sched = Scheduler::new();
    let received = recorder();
    let dones = Rc::new(RefCell::new(Vec::new()));
    let sink = manual_sink(&sched, StreamOptions::object(), &received, &dones);
    let log = recorder();
    sink.on(EventKind::Close, mark(&log, "close"));

    sink.write(Chunk::item("in-flight"));
    for name in ["q1", "q2"] {
        let log = Rc::clone(&log);
        sink.write_with(Chunk::item(name), move |res| {
            let err = res.unwrap_err();
            log.borrow_mut().push(format!("failed:{}", err.code()));
        });
    }
    sink.destroy();
    sched.run_until_idle().unwrap();

    assert_eq!(
        *log.borrow(),
        vec![
            "failed:stream.destroyed".to_owned(),
            "failed:stream.destroyed".to_owned(),
            "close".to_owned()
        ]
    );
}

#[test]
fn sink_error_reaches_callback_and_error_event() {
    let sched = Scheduler::new();
    let sink = Writable::new(
        &sched,
        StreamOptions::object(),
        |_chunk: Chunk, done: WriteDone| {
            done.complete(Err(StreamError::new("sink.full", "out of space")));
        },
    );
    let log = recorder();
    sink.on(EventKind::Error, mark(&log, "error"));
    sink.on(EventKind::Close, mark(&log, "close"));

    let seen = Rc::new(RefCell::new(None));
    let seen2 = Rc::clone(&seen);
    sink.write_with(Chunk::item("x"), move |res| {
        *seen2.borrow_mut() = res.err().map(|e| e.code());
    });
    sched.run_until_idle().unwrap();

    assert_eq!(*seen.borrow(), Some("sink.full"));
    assert_eq!(*log.borrow(), vec!["error".to_owned(), "close".to_owned()]);
    assert!(sink.is_destroyed());
}

#[test]
fn end_notify_after_finish_reports_already_finished() {
    let sched = Scheduler::new();
    let sink = Writable::new(&sched, StreamOptions::object(), |_c: Chunk, done: WriteDone| {
        done.ok()
    });
    sink.on(EventKind::Error, |_| {});
    sink.end();
    sched.run_until_idle().unwrap();
    assert!(sink.writable_finished());

    let seen = Rc::new(RefCell::new(None));
    let seen2 = Rc::clone(&seen);
    sink.end_notify(move |res| {
        *seen2.borrow_mut() = res.err().map(|e| e.code());
    });
    sched.run_until_idle().unwrap();
    assert_eq!(*seen.borrow(), Some(codes::ALREADY_FINISHED));
}
