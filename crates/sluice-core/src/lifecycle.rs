use std::rc::Rc;

use crate::driver::{
    ConstructDone, Driver, DuplexDriver, ReadSource, TeardownDone, TransformOp, WriteSink,
};
use crate::error::{StreamError, codes};
use crate::event::{EventKind, StreamEvent};
use crate::stream::{self, StreamCore};
use crate::writable;

/// 构造阶段启动：两侧先置为“未构造”，随后调用驱动的构造钩子。
///
/// 钩子令牌完成前：可读侧不取数、可写侧只积压、销毁被挂起。缺省钩子
/// 同步完成，流在构造函数返回前就绪。
pub(crate) fn start_construct(core: &Rc<StreamCore>) {
    let ticket = core.ticket();
    core.construct_ticket.set(Some(ticket));
    {
        core.r.borrow_mut().constructed = false;
        core.w.borrow_mut().constructed = false;
    }
    let dispatched = stream::with_driver(core, |driver| {
        let done = ConstructDone::new(core, ticket);
        match driver {
            Driver::Source(source) => source.construct(done),
            Driver::Sink(sink) => sink.construct(done),
            Driver::Duplex(duplex) => duplex.construct(done),
            Driver::Transform(op) => op.construct(done),
        }
    });
    if dispatched.is_none() {
        // 构造期驱动必然在位；防御性兜底，直接视为已构造。
        construct_completed(core, ticket, None);
    }
}

/// 构造钩子完成：解除两侧的构造门闩，补踢积压工作或兑现挂起的销毁。
pub(crate) fn construct_completed(core: &Rc<StreamCore>, ticket: u64, error: Option<StreamError>) {
    if core.construct_ticket.get() != Some(ticket) {
        error_or_destroy(
            core,
            StreamError::new(codes::COMPLETION_REPLAYED, "stale construct completion token"),
            false,
        );
        return;
    }
    core.construct_ticket.set(None);
    {
        core.r.borrow_mut().constructed = true;
        core.w.borrow_mut().constructed = true;
    }

    let deferred = core.deferred_destroy.borrow_mut().take();
    match error {
        Some(err) => match deferred {
            Some(destroy_err) => do_teardown(core, destroy_err.or(Some(err))),
            None => error_or_destroy(core, err, true),
        },
        None => match deferred {
            Some(destroy_err) => do_teardown(core, destroy_err),
            None => {
                let core = Rc::clone(core);
                let sched = core.scheduler.clone();
                sched.schedule(move || {
                    writable::clear_buffer(&core);
                    writable::finish_maybe(&core, false);
                    if core.r.borrow().need_readable {
                        crate::readable::read_internal(&core, Some(0));
                    }
                    crate::readable::maybe_pull_more(&core);
                });
            }
        },
    }
}

/// 幂等销毁入口：记录错误（先到先得）、标记两侧、调度积压写清算，
/// 然后执行（或挂起）驱动的收尾钩子。
pub(crate) fn destroy(core: &Rc<StreamCore>, error: Option<StreamError>) {
    {
        let r = core.r.borrow();
        let w = core.w.borrow();
        if r.destroyed || w.destroyed {
            return;
        }
    }
    tracing::debug!(with_error = error.is_some(), "stream destroy requested");
    {
        let mut r = core.r.borrow_mut();
        let mut w = core.w.borrow_mut();
        if let Some(err) = &error {
            if w.errored.is_none() {
                w.errored = Some(err.clone());
            }
            if r.errored.is_none() {
                r.errored = Some(err.clone());
            }
        }
        r.destroyed = true;
        w.destroyed = true;
    }

    // 仍在排队的写先于 "close" 以终态错误逐一收场。
    {
        let core = Rc::clone(core);
        let sched = core.scheduler.clone();
        sched.schedule(move || writable::error_buffer(&core));
    }

    let constructed = core.r.borrow().constructed && core.w.borrow().constructed;
    if !constructed {
        *core.deferred_destroy.borrow_mut() = Some(error);
        return;
    }
    do_teardown(core, error);
}

fn do_teardown(core: &Rc<StreamCore>, error: Option<StreamError>) {
    match stream::take_driver_for_teardown(core, error.clone()) {
        Some(driver) => run_teardown_hook(core, driver, error),
        None => {
            if !core.driver_busy() {
                // 驱动已经拆除过（防御路径）：直接进入终态发布。
                finish_destroy(core);
            }
        }
    }
}

/// 执行驱动收尾钩子；钩子返回后驱动对象随即释放。
pub(crate) fn run_teardown_hook(
    core: &Rc<StreamCore>,
    mut driver: Driver,
    error: Option<StreamError>,
) {
    let ticket = core.ticket();
    core.teardown_ticket.set(Some(ticket));
    let done = TeardownDone::new(core, ticket);
    match &mut driver {
        Driver::Source(source) => source.teardown(error, done),
        Driver::Sink(sink) => sink.teardown(error, done),
        Driver::Duplex(duplex) => duplex.teardown(error, done),
        Driver::Transform(op) => op.teardown(error, done),
    }
}

/// 收尾钩子完成：吸收钩子回报的错误并发布终态事件。
pub(crate) fn teardown_completed(core: &Rc<StreamCore>, ticket: u64, error: Option<StreamError>) {
    if core.teardown_ticket.get() != Some(ticket) {
        // 销毁本身幂等，陈旧收尾令牌只记录不升级。
        tracing::warn!("stale teardown completion token ignored");
        return;
    }
    core.teardown_ticket.set(None);
    if let Some(err) = error {
        let mut r = core.r.borrow_mut();
        let mut w = core.w.borrow_mut();
        if w.errored.is_none() {
            w.errored = Some(err.clone());
        }
        if r.errored.is_none() {
            r.errored = Some(err);
        }
    }
    finish_destroy(core);
}

/// 终态发布：`"error"`（若有且未发布过）先行，`"close"` 永远收尾。
fn finish_destroy(core: &Rc<StreamCore>) {
    {
        core.r.borrow_mut().closed = true;
        core.w.borrow_mut().closed = true;
    }
    let core = Rc::clone(core);
    let sched = core.scheduler.clone();
    sched.schedule(move || {
        let err = {
            let r = core.r.borrow();
            let w = core.w.borrow();
            r.errored.clone().or_else(|| w.errored.clone())
        };
        if let Some(err) = err {
            emit_error_once(&core, err);
        }

        let emit_close = {
            let mut r = core.r.borrow_mut();
            let mut w = core.w.borrow_mut();
            let fresh = !r.close_emitted && !w.close_emitted;
            r.close_emitted = true;
            w.close_emitted = true;
            fresh && (r.emit_close || w.emit_close)
        };
        if emit_close {
            tracing::debug!("stream close emitted");
            core.emit(StreamEvent::Close);
        }
        // 终态之后不再有事件；摘除全部监听者以切断引用环。
        core.bus.clear();
    });
}

/// 错误既定策略：开启自动销毁则升级为带错销毁，否则记录并单次发布。
pub(crate) fn error_or_destroy(core: &Rc<StreamCore>, error: StreamError, sync: bool) {
    {
        let r = core.r.borrow();
        let w = core.w.borrow();
        if r.destroyed || w.destroyed {
            return;
        }
    }
    let auto = {
        let r = core.r.borrow();
        let w = core.w.borrow();
        r.auto_destroy || w.auto_destroy
    };
    if auto {
        destroy(core, Some(error));
        return;
    }

    {
        let mut r = core.r.borrow_mut();
        let mut w = core.w.borrow_mut();
        if w.errored.is_none() {
            w.errored = Some(error.clone());
        }
        if r.errored.is_none() {
            r.errored = Some(error.clone());
        }
    }
    if sync {
        let core = Rc::clone(core);
        let sched = core.scheduler.clone();
        sched.schedule(move || emit_error_once(&core, error));
    } else {
        emit_error_once(core, error);
    }
}

/// `"error"` 的单次发布守卫；无人监听时交给调度器的未观察错误槽。
pub(crate) fn emit_error_once(core: &Rc<StreamCore>, error: StreamError) {
    let fresh = {
        let mut r = core.r.borrow_mut();
        let mut w = core.w.borrow_mut();
        if r.error_emitted || w.error_emitted {
            false
        } else {
            r.error_emitted = true;
            w.error_emitted = true;
            true
        }
    };
    if !fresh {
        return;
    }
    let observed = core.bus.listener_count(EventKind::Error) > 0;
    if observed {
        core.emit(StreamEvent::Error(error));
    } else {
        core.scheduler.report_unhandled(error);
    }
}
