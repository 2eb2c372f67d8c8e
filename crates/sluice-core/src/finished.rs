use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use crate::error::{Result, StreamError, codes};
use crate::event::{EventKind, ListenerId, StreamEvent};
use crate::stream::{AsStreamRef, StreamCore};

/// 完成观察的侧别覆写；`None` 表示按流的形状自动判定。
#[derive(Clone, Copy, Debug, Default)]
pub struct FinishedOptions {
    pub readable: Option<bool>,
    pub writable: Option<bool>,
}

type FinishedCallback = Box<dyn FnOnce(Result<()>)>;

/// 观察句柄：取消即对称摘除全部监听者，回调不再触发。
pub struct FinishedGuard {
    core: Weak<StreamCore>,
    ids: Vec<ListenerId>,
    slot: Rc<RefCell<Option<FinishedCallback>>>,
}

impl FinishedGuard {
    /// 取消观察。
    pub fn cancel(self) {
        *self.slot.borrow_mut() = None;
        if let Some(core) = self.core.upgrade() {
            for id in &self.ids {
                core.bus.remove(*id);
            }
        }
    }
}

fn fire(slot: &Rc<RefCell<Option<FinishedCallback>>>, result: Result<()>) {
    if let Some(cb) = slot.borrow_mut().take() {
        cb(result);
    }
}

/// 观察一条流的自然完成：可写侧到达 finished 且可读侧到达 end（各自
/// 以适用为前提）时恰好回调一次；底层在此之前就关闭则回报提前关闭。
///
/// # 契约说明（What）
/// - 侧别适用性来自流的形状（角色开关），可用 [`FinishedOptions`] 覆写；
/// - 已处于终态的流不会同步回调，而是推迟到下一个调度刻，给调用方
///   留出挂接的余地；
/// - 返回的 [`FinishedGuard`] 负责对称拆除，反复观察不泄漏监听者。
pub fn finished(
    stream: &impl AsStreamRef,
    options: FinishedOptions,
    callback: impl FnOnce(Result<()>) + 'static,
) -> FinishedGuard {
    let core = stream.as_stream_ref().core;
    let slot: Rc<RefCell<Option<FinishedCallback>>> = Rc::new(RefCell::new(Some(Box::new(callback))));

    let (readable, writable) = {
        let r = core.r.borrow();
        let w = core.w.borrow();
        (
            options.readable.unwrap_or(r.readable_role),
            options.writable.unwrap_or(w.writable_role),
        )
    };

    // "close" 是否足以代表自然完成：自动销毁 + 补发 close + 形状与观察
    // 侧别一致时，提前的 end/finish 不立即回调，等 close 统一定论。
    let will_emit_close = {
        let r = core.r.borrow();
        let w = core.w.borrow();
        let (auto_destroy, emit_close, closed) = if w.writable_role {
            (w.auto_destroy, w.emit_close, w.closed)
        } else {
            (r.auto_destroy, r.emit_close, r.closed)
        };
        auto_destroy
            && emit_close
            && !closed
            && r.readable_role == readable
            && w.writable_role == writable
    };
    let will_emit_close = Rc::new(Cell::new(will_emit_close));

    let writable_finished = Rc::new(Cell::new(core.w.borrow().finished));
    let readable_ended = Rc::new(Cell::new(core.r.borrow().end_emitted));

    let mut ids = Vec::with_capacity(4);

    // finish：可写侧到达终态。
    {
        let core_w = Rc::downgrade(&core);
        let slot = Rc::clone(&slot);
        let wf = Rc::clone(&writable_finished);
        let re = Rc::clone(&readable_ended);
        let wec = Rc::clone(&will_emit_close);
        ids.push(core.bus.on(EventKind::Finish, move |_| {
            let Some(core) = core_w.upgrade() else { return };
            wf.set(true);
            let destroyed = core.r.borrow().destroyed || core.w.borrow().destroyed;
            if destroyed {
                wec.set(false);
            }
            let readable_active = {
                let r = core.r.borrow();
                r.readable_role && !r.destroyed && !r.error_emitted && !r.end_emitted
            };
            if wec.get() && (!readable_active || readable) {
                return;
            }
            if !readable || re.get() {
                fire(&slot, Ok(()));
            }
        }));
    }

    // end：可读侧到达终态。
    {
        let core_w = Rc::downgrade(&core);
        let slot = Rc::clone(&slot);
        let wf = Rc::clone(&writable_finished);
        let re = Rc::clone(&readable_ended);
        let wec = Rc::clone(&will_emit_close);
        ids.push(core.bus.on(EventKind::End, move |_| {
            let Some(core) = core_w.upgrade() else { return };
            re.set(true);
            let destroyed = core.r.borrow().destroyed || core.w.borrow().destroyed;
            if destroyed {
                wec.set(false);
            }
            let writable_active = {
                let w = core.w.borrow();
                w.writable_role && !w.destroyed && w.errored.is_none() && !w.ending && !w.ended
            };
            if wec.get() && (!writable_active || writable) {
                return;
            }
            if !writable || wf.get() {
                fire(&slot, Ok(()));
            }
        }));
    }

    // error：任何错误立即定论。
    {
        let slot = Rc::clone(&slot);
        ids.push(core.bus.on(EventKind::Error, move |event| {
            if let StreamEvent::Error(err) = event {
                fire(&slot, Err(err.clone()));
            }
        }));
    }

    // close：终局裁决——终态未达即提前关闭。
    {
        let core_w = Rc::downgrade(&core);
        let slot = Rc::clone(&slot);
        let wf = Rc::clone(&writable_finished);
        let re = Rc::clone(&readable_ended);
        ids.push(core.bus.on(EventKind::Close, move |_| {
            let Some(core) = core_w.upgrade() else { return };
            if readable && !re.get() {
                let terminal = {
                    let r = core.r.borrow();
                    r.end_emitted || (r.errored.is_none() && r.ended && r.length == 0)
                };
                if !terminal {
                    fire(
                        &slot,
                        Err(StreamError::new(codes::PREMATURE_CLOSE, "stream closed before end")),
                    );
                    return;
                }
            }
            if writable && !wf.get() {
                let terminal = {
                    let w = core.w.borrow();
                    w.finished || (w.errored.is_none() && w.ended && w.length == 0)
                };
                if !terminal {
                    fire(
                        &slot,
                        Err(StreamError::new(codes::PREMATURE_CLOSE, "stream closed before finish")),
                    );
                    return;
                }
            }
            fire(&slot, Ok(()));
        }));
    }

    // 已处于终态的流：推迟一个调度刻再回调。
    let already_settled = {
        let r = core.r.borrow();
        let w = core.w.borrow();
        w.closed
            || r.closed
            || w.error_emitted
            || r.error_emitted
            || ((!writable || w.finished) && (!readable || r.end_emitted))
    };
    if already_settled {
        let slot = Rc::clone(&slot);
        core.scheduler.schedule(move || fire(&slot, Ok(())));
    }

    FinishedGuard {
        core: Rc::downgrade(&core),
        ids,
        slot,
    }
}
