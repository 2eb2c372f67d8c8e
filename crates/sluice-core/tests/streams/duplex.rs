//! 双工组合：两侧独立运转、半开策略的单向耦合与整体销毁。

use std::cell::RefCell;
use std::rc::Rc;

use sluice_core::prelude::*;

use crate::support::{collect_data, mark, recorder};

/// 把每个写入块原样回显到可读侧的驱动。
struct EchoDriver;

impl DuplexDriver for EchoDriver {
    fn pull(&mut self, _stream: &Duplex) {}

    fn write(&mut self, stream: &Duplex, chunk: Chunk, done: WriteDone) {
        stream.push(chunk);
        done.ok();
    }
}

/// 把写入悄悄丢弃的驱动（只关心生命周期的用例使用）。
struct DiscardDriver;

impl DuplexDriver for DiscardDriver {
    fn pull(&mut self, _stream: &Duplex) {}

    fn write(&mut self, _stream: &Duplex, _chunk: Chunk, done: WriteDone) {
        done.ok();
    }
}

#[test]
fn echo_duplex_reflects_writes_to_the_readable_side() {
    let sched = Scheduler::new();
    let duplex = Duplex::new(&sched, DuplexOptions::object(), EchoDriver);
    let data = recorder();
    duplex.on(EventKind::Data, collect_data(&data));

    duplex.write(Chunk::item("ping"));
    duplex.write(Chunk::item("pong"));
    sched.run_until_idle().unwrap();

    assert_eq!(*data.borrow(), vec!["ping", "pong"]);
}

#[test]
fn half_open_disabled_forces_finish_after_readable_end() {
    let sched = Scheduler::new();
    let duplex = Duplex::new(
        &sched,
        DuplexOptions::object().with_allow_half_open(false),
        DiscardDriver,
    );
    let log = recorder();
    duplex.on(EventKind::End, mark(&log, "end"));
    duplex.on(EventKind::Finish, mark(&log, "finish"));
    duplex.resume();

    // 只结束可读侧；可写侧从未被显式 end()。
    duplex.push_end();
    sched.run_until_idle().unwrap();

    assert_eq!(*log.borrow(), vec!["end".to_owned(), "finish".to_owned()]);
    assert!(duplex.writable_half().writable_finished());
}

#[test]
fn half_open_default_keeps_writable_side_alive_after_end() {
    let sched = Scheduler::new();
    let duplex = Duplex::new(&sched, DuplexOptions::object(), DiscardDriver);
    duplex.resume();
    duplex.push_end();
    sched.run_until_idle().unwrap();

    assert!(duplex.readable_half().readable_ended());
    assert!(duplex.writable_half().is_writable());
    // 可读侧已收束，可写侧照常接受写入。
    let ok = Rc::new(RefCell::new(None));
    let ok2 = Rc::clone(&ok);
    duplex.write_with(Chunk::item("late"), move |res| {
        *ok2.borrow_mut() = Some(res.is_ok());
    });
    sched.run_until_idle().unwrap();
    assert_eq!(*ok.borrow(), Some(true));
}

#[test]
fn destroy_settles_both_halves_with_a_single_close() {
    let sched = Scheduler::new();
    let duplex = Duplex::new(&sched, DuplexOptions::object(), EchoDriver);
    let log = recorder();
    duplex.on(EventKind::Close, mark(&log, "close"));

    duplex.destroy();
    duplex.destroy();
    sched.run_until_idle().unwrap();

    assert!(duplex.is_destroyed());
    assert!(!duplex.readable_half().is_readable());
    assert!(!duplex.writable_half().is_writable());
    assert_eq!(*log.borrow(), vec!["close".to_owned()]);
}
