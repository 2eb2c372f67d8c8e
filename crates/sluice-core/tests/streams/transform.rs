//! 变换引擎：逐块转发、单在途纪律与可读侧饱和时的确认扣押、尾部冲刷。

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use sluice_core::prelude::*;

use crate::support::{collect_data, mark, recorder};

fn upper_op() -> impl TransformOp {
    |chunk: Chunk, done: TransformDone| {
        let upper = chunk
            .downcast_item::<&str>()
            .map(|s| s.to_uppercase())
            .unwrap_or_default();
        done.push(Chunk::item(upper));
    }
}

#[test]
fn each_write_flows_through_the_transform() {
    let sched = Scheduler::new();
    let tr = Transform::new(&sched, DuplexOptions::object(), upper_op());
    let data = recorder();
    let log = recorder();
    tr.on(EventKind::Data, collect_data(&data));
    tr.on(EventKind::End, mark(&log, "end"));
    tr.on(EventKind::Finish, mark(&log, "finish"));

    tr.write(Chunk::item("a"));
    tr.write(Chunk::item("b"));
    tr.end();
    sched.run_until_idle().unwrap();

    assert_eq!(*data.borrow(), vec!["A", "B"]);
    assert_eq!(*log.borrow(), vec!["end".to_owned(), "finish".to_owned()]);
}

#[test]
fn saturated_readable_side_withholds_the_write_ack() {
    let sched = Scheduler::new();
    let tr = Transform::new(
        &sched,
        DuplexOptions::object().with_readable_high_water_mark(1),
        |chunk: Chunk, done: TransformDone| done.push(chunk),
    );

    let ack_a = Rc::new(Cell::new(false));
    let ack_b = Rc::new(Cell::new(false));
    {
        let ack = Rc::clone(&ack_a);
        tr.write_with(Chunk::item("a"), move |res| {
            res.unwrap();
            ack.set(true);
        });
    }
    {
        let ack = Rc::clone(&ack_b);
        tr.write_with(Chunk::item("b"), move |res| {
            res.unwrap();
            ack.set(true);
        });
    }
    sched.run_until_idle().unwrap();

    // 没有消费者：输出积压在可读侧，两笔写的确认都被扣押。
    assert!(!ack_a.get());
    assert!(!ack_b.get());

    // 拉走第一个块释放第一笔确认，并让第二笔得以派发。
    let first = tr.read().unwrap();
    assert_eq!(first.downcast_item::<&str>().as_deref(), Some(&"a"));
    sched.run_until_idle().unwrap();
    assert!(ack_a.get());

    let second = tr.read().unwrap();
    assert_eq!(second.downcast_item::<&str>().as_deref(), Some(&"b"));
    sched.run_until_idle().unwrap();
    assert!(ack_b.get());
}

#[test]
fn flush_hook_emits_trailing_output_before_end() {
    struct Summing {
        total: i64,
    }
    impl TransformOp for Summing {
        fn transform(&mut self, chunk: Chunk, done: TransformDone) {
            if let Some(n) = chunk.downcast_item::<i64>() {
                self.total += *n;
            }
            done.ok();
        }
        fn flush(&mut self, done: FlushDone) {
            done.complete(Ok(Some(Chunk::item(self.total))));
        }
    }

    let sched = Scheduler::new();
    let tr = Transform::new(&sched, DuplexOptions::object(), Summing { total: 0 });
    let sums = Rc::new(RefCell::new(Vec::new()));
    let log = recorder();
    {
        let sums = Rc::clone(&sums);
        tr.on(EventKind::Data, move |event| {
            if let StreamEvent::Data(chunk) = event
                && let Some(n) = chunk.downcast_item::<i64>()
            {
                sums.borrow_mut().push(*n);
            }
        });
    }
    tr.on(EventKind::End, mark(&log, "end"));
    tr.on(EventKind::Finish, mark(&log, "finish"));

    for n in [1i64, 2, 3] {
        tr.write(Chunk::item(n));
    }
    tr.end();
    sched.run_until_idle().unwrap();

    assert_eq!(*sums.borrow(), vec![6]);
    assert_eq!(*log.borrow(), vec!["end".to_owned(), "finish".to_owned()]);
}

#[test]
fn transform_error_destroys_the_stream() {
    let sched = Scheduler::new();
    let tr = Transform::new(
        &sched,
        DuplexOptions::object(),
        |_chunk: Chunk, done: TransformDone| {
            done.complete(Err(StreamError::new("codec.bad_frame", "malformed input")));
        },
    );
    let log = recorder();
    tr.on(EventKind::Error, mark(&log, "error"));

    let seen = Rc::new(RefCell::new(None));
    let seen2 = Rc::clone(&seen);
    tr.write_with(Chunk::item("x"), move |res| {
        *seen2.borrow_mut() = res.err().map(|e| e.code());
    });
    sched.run_until_idle().unwrap();

    assert_eq!(*seen.borrow(), Some("codec.bad_frame"));
    assert_eq!(*log.borrow(), vec!["error".to_owned()]);
    assert!(tr.is_destroyed());
}
