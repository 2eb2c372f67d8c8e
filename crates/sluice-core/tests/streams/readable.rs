//! 可读引擎的端到端行为：推/拉两种消费节奏、背压返回值、文本解码与
//! 终态时序。

use std::cell::Cell;
use std::rc::Rc;

use bytes::Bytes;
use sluice_core::prelude::*;

use crate::support::{collect_data, idle_source, mark, recorder};

#[test]
fn buffered_chunks_round_trip_then_end_after_drain() {
    let sched = Scheduler::new();
    let stream = Readable::new(&sched, StreamOptions::object(), idle_source());
    let log = recorder();
    stream.on(EventKind::End, mark(&log, "end"));

    stream.push(Chunk::item("a"));
    stream.push(Chunk::item("b"));
    stream.push(Chunk::item("c"));
    stream.push_end();

    for expected in ["a", "b", "c"] {
        let chunk = stream.read().unwrap();
        assert_eq!(chunk.downcast_item::<&str>().as_deref(), Some(&expected));
    }
    assert!(stream.read().is_none());
    // "end" 至少推迟一个调度刻，read 返回时还不可见。
    assert!(log.borrow().is_empty());

    sched.run_until_idle().unwrap();
    assert_eq!(*log.borrow(), vec!["end".to_owned()]);
    assert!(stream.readable_ended());
}

#[test]
fn ambient_flow_delivers_in_order_and_ends() {
    let sched = Scheduler::new();
    let stream = Readable::from_iter(
        &sched,
        StreamOptions::object(),
        ["a", "b", "c"].map(Chunk::item),
    );
    let data = recorder();
    let log = recorder();
    stream.on(EventKind::Data, collect_data(&data));
    stream.on(EventKind::End, mark(&log, "end"));

    sched.run_until_idle().unwrap();
    assert_eq!(*data.borrow(), vec!["a", "b", "c"]);
    assert_eq!(*log.borrow(), vec!["end".to_owned()]);
}

#[test]
fn pause_holds_chunks_and_resume_releases_them() {
    let sched = Scheduler::new();
    let stream = Readable::new(&sched, StreamOptions::object(), idle_source());
    let data = recorder();
    stream.on(EventKind::Data, collect_data(&data));

    stream.push(Chunk::item("a"));
    sched.run_until_idle().unwrap();
    assert_eq!(*data.borrow(), vec!["a"]);

    stream.pause();
    assert!(stream.is_paused());
    stream.push(Chunk::item("b"));
    sched.run_until_idle().unwrap();
    assert_eq!(*data.borrow(), vec!["a"]);
    assert_eq!(stream.buffered_len(), 1);

    stream.resume();
    sched.run_until_idle().unwrap();
    assert_eq!(*data.borrow(), vec!["a", "b"]);
    assert!(!stream.is_paused());
}

#[test]
fn push_reports_backpressure_at_high_water_mark() {
    let sched = Scheduler::new();
    let stream = Readable::new(
        &sched,
        StreamOptions::object().with_high_water_mark(2),
        idle_source(),
    );
    assert!(stream.push(Chunk::item(1)));
    assert!(!stream.push(Chunk::item(2)));
    assert!(!stream.push(Chunk::item(3)));

    stream.read();
    stream.read();
    stream.read();
    assert!(stream.push(Chunk::item(4)));
}

#[test]
fn unshift_returns_chunk_to_the_front() {
    let sched = Scheduler::new();
    let stream = Readable::new(&sched, StreamOptions::object(), idle_source());
    stream.push(Chunk::item("b"));
    stream.unshift(Chunk::item("a"));
    assert_eq!(
        stream.read().unwrap().downcast_item::<&str>().as_deref(),
        Some(&"a")
    );
    assert_eq!(
        stream.read().unwrap().downcast_item::<&str>().as_deref(),
        Some(&"b")
    );
}

#[test]
fn encoding_option_decodes_across_chunk_boundaries() {
    let sched = Scheduler::new();
    let stream = Readable::new(
        &sched,
        StreamOptions::default().with_encoding(TextEncoding::Utf8),
        idle_source(),
    );
    let euro = "€".as_bytes();
    stream.push(Bytes::copy_from_slice(&euro[..1]));
    stream.push(Bytes::copy_from_slice(&euro[1..]));
    let chunk = stream.read().unwrap();
    assert_eq!(chunk.as_text(), Some("€"));
}

#[test]
fn decoder_remainder_is_flushed_as_replacement_on_end() {
    let sched = Scheduler::new();
    let stream = Readable::new(
        &sched,
        StreamOptions::default().with_encoding(TextEncoding::Utf8),
        idle_source(),
    );
    stream.push(Bytes::copy_from_slice(&"€".as_bytes()[..2]));
    stream.push_end();
    let chunk = stream.read().unwrap();
    assert_eq!(chunk.as_text(), Some("\u{FFFD}"));
    sched.run_until_idle().unwrap();
}

#[test]
fn destroy_twice_emits_close_once_and_tears_down_once() {
    struct CountingSource {
        torn: Rc<Cell<u32>>,
    }
    impl ReadSource for CountingSource {
        fn pull(&mut self, _stream: &Readable) {}
        fn teardown(&mut self, error: Option<StreamError>, done: TeardownDone) {
            self.torn.set(self.torn.get() + 1);
            done.complete(match error {
                Some(err) => Err(err),
                None => Ok(()),
            });
        }
    }

    let sched = Scheduler::new();
    let torn = Rc::new(Cell::new(0));
    let stream = Readable::new(
        &sched,
        StreamOptions::object(),
        CountingSource { torn: Rc::clone(&torn) },
    );
    let log = recorder();
    stream.on(EventKind::Close, mark(&log, "close"));

    stream.destroy();
    stream.destroy();
    sched.run_until_idle().unwrap();

    assert_eq!(torn.get(), 1);
    assert_eq!(*log.borrow(), vec!["close".to_owned()]);
    assert!(stream.is_destroyed());
}

#[test]
fn destroy_with_error_emits_error_then_close() {
    let sched = Scheduler::new();
    let stream = Readable::new(&sched, StreamOptions::object(), idle_source());
    let log = recorder();
    stream.on(EventKind::Error, mark(&log, "error"));
    stream.on(EventKind::Close, mark(&log, "close"));

    stream.destroy_with(StreamError::new("source.lost", "backing resource vanished"));
    sched.run_until_idle().unwrap();

    assert_eq!(*log.borrow(), vec!["error".to_owned(), "close".to_owned()]);
    assert_eq!(stream.errored().map(|e| e.code()), Some("source.lost"));
}

#[test]
fn unobserved_error_fails_the_scheduler_drive() {
    let sched = Scheduler::new();
    let stream = Readable::new(&sched, StreamOptions::object(), idle_source());
    stream.push_end();
    stream.push(Chunk::item("late"));

    let err = sched.run_until_idle().unwrap_err();
    assert!(err.is(codes::UNOBSERVED_ERROR));
    assert_eq!(
        err.cause().map(ToString::to_string),
        Some("stream.push_after_eof: push after end of data".to_owned())
    );
}

#[test]
fn auto_destroy_follows_natural_end() {
    let sched = Scheduler::new();
    let stream = Readable::from_iter(&sched, StreamOptions::object(), [Chunk::item(1u8)]);
    let log = recorder();
    stream.on(EventKind::Data, collect_data(&recorder()));
    stream.on(EventKind::Close, mark(&log, "close"));
    sched.run_until_idle().unwrap();
    assert!(stream.is_destroyed());
    assert_eq!(*log.borrow(), vec!["close".to_owned()]);
}

#[test]
fn auto_destroy_disabled_leaves_stream_undestroyed_after_end() {
    let sched = Scheduler::new();
    let stream = Readable::new(
        &sched,
        StreamOptions::object().with_auto_destroy(false),
        idle_source(),
    );
    stream.on(EventKind::Data, collect_data(&recorder()));
    stream.push(Chunk::item("x"));
    stream.push_end();
    sched.run_until_idle().unwrap();
    assert!(stream.readable_ended());
    assert!(!stream.is_destroyed());
}
