//! 管道协调器：数据搬运、背压传导、对称拆除与目的地错误处置。

use std::cell::RefCell;
use std::rc::Rc;

use bytes::Bytes;
use sluice_core::prelude::*;

use crate::support::{chunk_text, idle_source, mark, recorder};

#[test]
fn bytes_concatenate_and_finish_follows_end() {
    let sched = Scheduler::new();
    let src = Readable::from_iter(
        &sched,
        StreamOptions::default(),
        [
            Chunk::from(Bytes::from_static(b"a")),
            Chunk::from(Bytes::from_static(b"b")),
            Chunk::from(Bytes::from_static(b"c")),
        ],
    );
    let collected = Rc::new(RefCell::new(Vec::<u8>::new()));
    let sink = {
        let collected = Rc::clone(&collected);
        Writable::new(
            &sched,
            StreamOptions::default(),
            move |chunk: Chunk, done: WriteDone| {
                if let Some(bytes) = chunk.as_bytes() {
                    collected.borrow_mut().extend_from_slice(bytes);
                }
                done.ok();
            },
        )
    };
    let log = recorder();
    src.on(EventKind::End, mark(&log, "end"));
    sink.on(EventKind::Finish, mark(&log, "finish"));

    src.pipe(&sink);
    sched.run_until_idle().unwrap();

    assert_eq!(*collected.borrow(), b"abc");
    assert_eq!(*log.borrow(), vec!["end".to_owned(), "finish".to_owned()]);
}

#[test]
fn slow_destination_pauses_source_until_drain() {
    let sched = Scheduler::new();
    let src = Readable::new(&sched, StreamOptions::object(), idle_source());
    let received = recorder();
    let dones = Rc::new(RefCell::new(Vec::new()));
    let sink = {
        let received = Rc::clone(&received);
        let dones = Rc::clone(&dones);
        Writable::new(
            &sched,
            StreamOptions::object().with_high_water_mark(1),
            move |chunk: Chunk, done: WriteDone| {
                received.borrow_mut().push(chunk_text(&chunk));
                dones.borrow_mut().push(done);
            },
        )
    };

    src.pipe(&sink);
    src.push(Chunk::item("a"));
    src.push(Chunk::item("b"));
    src.push(Chunk::item("c"));
    sched.run_until_idle().unwrap();

    // 第一块送达即触发背压：第二块必须等 "drain"。
    assert_eq!(*received.borrow(), vec!["a"]);
    assert!(src.is_paused());

    let done = dones.borrow_mut().remove(0);
    done.ok();
    sched.run_until_idle().unwrap();
    assert_eq!(*received.borrow(), vec!["a", "b"]);

    let done = dones.borrow_mut().remove(0);
    done.ok();
    sched.run_until_idle().unwrap();
    assert_eq!(*received.borrow(), vec!["a", "b", "c"]);
}

#[test]
fn unpipe_restores_every_listener_it_added() {
    let sched = Scheduler::new();
    let src = Readable::new(&sched, StreamOptions::object(), idle_source());
    let sink = Writable::new(&sched, StreamOptions::object(), |_c: Chunk, done: WriteDone| {
        done.ok();
    });

    src.pipe(&sink);
    assert_eq!(src.listener_count(EventKind::Data), 1);
    assert_eq!(src.listener_count(EventKind::End), 1);
    assert_eq!(sink.listener_count(EventKind::Error), 1);
    assert_eq!(sink.listener_count(EventKind::Unpipe), 1);
    assert_eq!(sink.listener_count(EventKind::Close), 1);
    assert_eq!(sink.listener_count(EventKind::Finish), 1);

    src.unpipe(Some(&sink));
    sched.run_until_idle().unwrap();
    for kind in [EventKind::Data, EventKind::End] {
        assert_eq!(src.listener_count(kind), 0);
    }
    for kind in [
        EventKind::Error,
        EventKind::Unpipe,
        EventKind::Close,
        EventKind::Finish,
        EventKind::Drain,
    ] {
        assert_eq!(sink.listener_count(kind), 0);
    }

    // 拆除后的数据不再到达目的地。
    src.push(Chunk::item("ghost"));
    sched.run_until_idle().unwrap();
    assert_eq!(sink.buffered_len(), 0);
}

#[test]
fn repeated_pipe_unpipe_cycles_do_not_leak_listeners() {
    let sched = Scheduler::new();
    let src = Readable::new(&sched, StreamOptions::object(), idle_source());
    let sink = Writable::new(&sched, StreamOptions::object(), |_c: Chunk, done: WriteDone| {
        done.ok();
    });

    for _ in 0..5 {
        src.pipe(&sink);
        src.unpipe(Some(&sink));
    }
    sched.run_until_idle().unwrap();
    assert_eq!(src.listener_count(EventKind::Data), 0);
    assert_eq!(sink.listener_count(EventKind::Error), 0);
    assert_eq!(sink.listener_count(EventKind::Unpipe), 0);
}

#[test]
fn destination_error_unpipes_and_destroys_destination_only() {
    let sched = Scheduler::new();
    let src = Readable::new(&sched, StreamOptions::object(), idle_source());
    let sink = Writable::new(&sched, StreamOptions::object(), |_c: Chunk, done: WriteDone| {
        done.complete(Err(StreamError::new("sink.full", "no space left")));
    });

    src.pipe(&sink);
    src.push(Chunk::item("x"));
    sched.run_until_idle().unwrap();

    assert!(sink.is_destroyed());
    assert_eq!(sink.errored().map(|e| e.code()), Some("sink.full"));
    assert!(!src.is_destroyed());

    // 已拆除：后续数据只会积压在源测。
    src.push(Chunk::item("y"));
    sched.run_until_idle().unwrap();
    assert_eq!(sink.buffered_len(), 0);
    assert!(src.buffered_len() > 0);
}

#[test]
fn multiple_destinations_each_receive_every_chunk() {
    let sched = Scheduler::new();
    let src = Readable::from_iter(
        &sched,
        StreamOptions::object(),
        ["x", "y"].map(Chunk::item),
    );
    let make_sink = |log: &Rc<RefCell<Vec<String>>>| {
        let log = Rc::clone(log);
        Writable::new(
            &sched,
            StreamOptions::object(),
            move |chunk: Chunk, done: WriteDone| {
                log.borrow_mut().push(chunk_text(&chunk));
                done.ok();
            },
        )
    };
    let first_log = recorder();
    let second_log = recorder();
    let first = make_sink(&first_log);
    let second = make_sink(&second_log);

    src.pipe(&first);
    src.pipe(&second);
    sched.run_until_idle().unwrap();

    assert_eq!(*first_log.borrow(), vec!["x", "y"]);
    assert_eq!(*second_log.borrow(), vec!["x", "y"]);
    assert!(first.writable_finished());
    assert!(second.writable_finished());
}

#[test]
fn pipe_without_end_leaves_destination_open() {
    let sched = Scheduler::new();
    let src = Readable::from_iter(&sched, StreamOptions::object(), [Chunk::item("only")]);
    let received = recorder();
    let sink = {
        let received = Rc::clone(&received);
        Writable::new(
            &sched,
            StreamOptions::object(),
            move |chunk: Chunk, done: WriteDone| {
                received.borrow_mut().push(chunk_text(&chunk));
                done.ok();
            },
        )
    };

    src.pipe_with(&sink, PipeOptions { end: false });
    sched.run_until_idle().unwrap();

    assert_eq!(*received.borrow(), vec!["only"]);
    assert!(!sink.writable_ended());
    assert!(sink.is_writable());
    // 源结束后管道自动拆除。
    assert_eq!(sink.listener_count(EventKind::Unpipe), 0);
}
