use std::cell::Cell;
use std::rc::{Rc, Weak};

use crate::event::{EventKind, ListenerId, StreamEvent};
use crate::lifecycle;
use crate::readable::{self, ConsumptionMode, Readable};
use crate::stream::{StreamCore, StreamRef};
use crate::writable::{self, Writable};

/// 接管行为选项。
#[derive(Clone, Copy, Debug)]
pub struct PipeOptions {
    /// 源结束时是否自动结束目的地（默认是）。
    pub end: bool,
}

impl Default for PipeOptions {
    fn default() -> Self {
        Self { end: true }
    }
}

/// 源流可读状态中的接管登记项。
pub(crate) struct PipeEntry {
    pub(crate) dest: Rc<StreamCore>,
    hook: Rc<PipeHook>,
}

impl PipeEntry {
    pub(crate) fn matches(&self, dest: &Rc<StreamCore>) -> bool {
        Rc::ptr_eq(&self.dest, dest)
    }

    pub(crate) fn hook(&self) -> Rc<PipeHook> {
        Rc::clone(&self.hook)
    }
}

/// 单条接管关系拥有的全部监听者句柄。
///
/// 拆除必须对称：上面注册过什么，这里就逐一摘除什么，保证反复
/// pipe/unpipe 不泄漏监听者。
pub(crate) struct PipeHook {
    src: Weak<StreamCore>,
    dest: Weak<StreamCore>,
    cleaned: Cell<bool>,
    src_data: Cell<Option<ListenerId>>,
    src_end: Cell<Option<ListenerId>>,
    dest_drain: Cell<Option<ListenerId>>,
    dest_error: Cell<Option<ListenerId>>,
    dest_close: Cell<Option<ListenerId>>,
    dest_finish: Cell<Option<ListenerId>>,
    dest_unpipe: Cell<Option<ListenerId>>,
}

impl PipeHook {
    fn new(src: &Rc<StreamCore>, dest: &Rc<StreamCore>) -> Rc<Self> {
        Rc::new(Self {
            src: Rc::downgrade(src),
            dest: Rc::downgrade(dest),
            cleaned: Cell::new(false),
            src_data: Cell::new(None),
            src_end: Cell::new(None),
            dest_drain: Cell::new(None),
            dest_error: Cell::new(None),
            dest_close: Cell::new(None),
            dest_finish: Cell::new(None),
            dest_unpipe: Cell::new(None),
        })
    }

    /// 对称摘除本条接管注册过的所有监听者。
    pub(crate) fn cleanup(&self) {
        if self.cleaned.replace(true) {
            return;
        }
        if let Some(src) = self.src.upgrade() {
            for slot in [&self.src_data, &self.src_end] {
                if let Some(id) = slot.take() {
                    src.bus.remove(id);
                }
            }
        }
        if let Some(dest) = self.dest.upgrade() {
            for slot in [
                &self.dest_drain,
                &self.dest_error,
                &self.dest_close,
                &self.dest_finish,
                &self.dest_unpipe,
            ] {
                if let Some(id) = slot.take() {
                    dest.bus.remove(id);
                }
            }
        }
        // 拆除时目的地可能还欠着 "drain"：代为释放等待记录，避免源流
        // 永久停摆。
        if let (Some(src), Some(dest)) = (self.src.upgrade(), self.dest.upgrade()) {
            pipe_on_drain(&src, &dest);
        }
    }
}

fn ptr_matches(weak: &Weak<StreamCore>, core: &Rc<StreamCore>) -> bool {
    weak.upgrade().is_some_and(|rc| Rc::ptr_eq(&rc, core))
}

/// 建立接管：源 `"data"` → 目的地 `write`，背压时暂停源并等待 `"drain"`，
/// 任一侧终态触发对称拆除。返回目的地句柄以支持链式组合。
pub(crate) fn pipe(src: &Readable, dest: &Writable, options: PipeOptions) -> Writable {
    let src_core = Rc::clone(&src.core);
    let dest_core = Rc::clone(&dest.core);
    let hook = PipeHook::new(&src_core, &dest_core);

    src_core.r.borrow_mut().pipes.push(PipeEntry {
        dest: Rc::clone(&dest_core),
        hook: Rc::clone(&hook),
    });
    tracing::debug!(end = options.end, "pipe established");

    // 源结束的后续动作：自动收尾目的地，或仅解除接管。
    let end_emitted = src_core.r.borrow().end_emitted;
    if end_emitted {
        let dest_for_end = Rc::clone(&dest_core);
        let src_for_end = Rc::clone(&src_core);
        src_core.scheduler.schedule(move || {
            if options.end {
                writable::end(&dest_for_end, None, None);
            } else {
                unpipe_core(&src_for_end, Some(&dest_for_end));
            }
        });
    } else {
        let dest_for_end = Rc::downgrade(&dest_core);
        let src_for_end = Rc::downgrade(&src_core);
        let id = src_core.bus.once(EventKind::End, move |_| {
            if options.end {
                if let Some(dest) = dest_for_end.upgrade() {
                    writable::end(&dest, None, None);
                }
            } else if let (Some(src), Some(dest)) = (src_for_end.upgrade(), dest_for_end.upgrade())
            {
                unpipe_core(&src, Some(&dest));
            }
        });
        hook.src_end.set(Some(id));
    }

    // 目的地收到针对本源的 "unpipe" 时执行对称拆除。
    {
        let hook_for_unpipe = Rc::clone(&hook);
        let id = dest_core.bus.on(EventKind::Unpipe, move |event| {
            if let StreamEvent::Unpipe(source) = event
                && ptr_matches(&hook_for_unpipe.src, &source.core)
            {
                hook_for_unpipe.cleanup();
            }
        });
        hook.dest_unpipe.set(Some(id));
    }

    // 数据搬运与背压：write 返回 false 即暂停源、登记待排水目的地。
    {
        let hook_for_data = Rc::clone(&hook);
        let id = src.on(EventKind::Data, move |event| {
            let StreamEvent::Data(chunk) = event else {
                return;
            };
            let (Some(src), Some(dest)) =
                (hook_for_data.src.upgrade(), hook_for_data.dest.upgrade())
            else {
                return;
            };
            let accepted = writable::write(&dest, chunk.clone(), None);
            if !accepted {
                if !hook_for_data.cleaned.get() {
                    {
                        let mut r = src.r.borrow_mut();
                        if !r.await_drain.iter().any(|w| ptr_matches(w, &dest)) {
                            r.await_drain.push(Rc::downgrade(&dest));
                        }
                    }
                    tracing::trace!("pipe destination saturated; pausing source");
                    readable::pause(&src);
                }
                ensure_drain_listener(&hook_for_data, &src, &dest);
            }
        });
        hook.src_data.set(Some(id));
    }

    // 目的地错误：先于用户监听者拆除接管，无人观察时升级销毁。
    {
        let hook_for_error = Rc::clone(&hook);
        let id = dest_core.bus.prepend(EventKind::Error, move |event| {
            let StreamEvent::Error(err) = event else {
                return;
            };
            let (Some(src), Some(dest)) =
                (hook_for_error.src.upgrade(), hook_for_error.dest.upgrade())
            else {
                return;
            };
            if let Some(id) = hook_for_error.dest_error.take() {
                dest.bus.remove(id);
            }
            unpipe_core(&src, Some(&dest));
            if dest.bus.listener_count(EventKind::Error) == 0 {
                lifecycle::error_or_destroy(&dest, err.clone(), false);
            }
        });
        hook.dest_error.set(Some(id));
    }

    // 目的地终态（close/finish 二者先到其一）触发解除。
    {
        let hook_for_close = Rc::clone(&hook);
        let id = dest_core.bus.once(EventKind::Close, move |_| {
            let (Some(src), Some(dest)) =
                (hook_for_close.src.upgrade(), hook_for_close.dest.upgrade())
            else {
                return;
            };
            if let Some(id) = hook_for_close.dest_finish.take() {
                dest.bus.remove(id);
            }
            unpipe_core(&src, Some(&dest));
        });
        hook.dest_close.set(Some(id));
    }
    {
        let hook_for_finish = Rc::clone(&hook);
        let id = dest_core.bus.once(EventKind::Finish, move |_| {
            let (Some(src), Some(dest)) =
                (hook_for_finish.src.upgrade(), hook_for_finish.dest.upgrade())
            else {
                return;
            };
            if let Some(id) = hook_for_finish.dest_close.take() {
                dest.bus.remove(id);
            }
            unpipe_core(&src, Some(&dest));
        });
        hook.dest_finish.set(Some(id));
    }

    dest_core.emit(StreamEvent::Pipe(StreamRef {
        core: Rc::clone(&src_core),
    }));

    if src_core.r.borrow().mode != ConsumptionMode::Ambient {
        readable::resume(&src_core);
    }

    dest.clone()
}

/// 首次背压时惰性注册目的地 `"drain"` 监听者。
fn ensure_drain_listener(hook: &Rc<PipeHook>, src: &Rc<StreamCore>, dest: &Rc<StreamCore>) {
    if hook.dest_drain.get().is_some() {
        return;
    }
    let src_weak = Rc::downgrade(src);
    let dest_weak = Rc::downgrade(dest);
    let id = dest.bus.on(EventKind::Drain, move |_| {
        if let (Some(src), Some(dest)) = (src_weak.upgrade(), dest_weak.upgrade()) {
            pipe_on_drain(&src, &dest);
        }
    });
    hook.dest_drain.set(Some(id));
}

/// 目的地排水：摘除等待记录，所有目的地都排空后恢复源流动。
fn pipe_on_drain(src: &Rc<StreamCore>, dest: &Rc<StreamCore>) {
    let empty = {
        let mut r = src.r.borrow_mut();
        r.await_drain.retain(|w| !ptr_matches(w, dest));
        r.await_drain.is_empty()
    };
    if empty && src.bus.listener_count(EventKind::Data) > 0 {
        src.r.borrow_mut().mode = ConsumptionMode::Ambient;
        readable::flow(src);
    }
}

/// 解除接管；`dest` 为 `None` 时解除全部并暂停源。
pub(crate) fn unpipe(src: &Readable, dest: Option<&Writable>) {
    unpipe_core(&src.core, dest.map(|d| &d.core));
}

fn unpipe_core(src: &Rc<StreamCore>, dest: Option<&Rc<StreamCore>>) {
    match dest {
        None => {
            let entries = {
                let mut r = src.r.borrow_mut();
                std::mem::take(&mut r.pipes)
            };
            if entries.is_empty() {
                return;
            }
            readable::pause(src);
            for entry in entries {
                let hook = entry.hook();
                entry.dest.emit(StreamEvent::Unpipe(StreamRef {
                    core: Rc::clone(src),
                }));
                hook.cleanup();
            }
        }
        Some(dest) => {
            let (removed, now_empty) = {
                let mut r = src.r.borrow_mut();
                let removed = r
                    .pipes
                    .iter()
                    .position(|entry| entry.matches(dest))
                    .map(|pos| r.pipes.remove(pos));
                let empty = r.pipes.is_empty();
                (removed, empty)
            };
            let Some(entry) = removed else {
                return;
            };
            tracing::debug!("pipe removed");
            if now_empty {
                readable::pause(src);
            }
            let hook = entry.hook();
            dest.emit(StreamEvent::Unpipe(StreamRef {
                core: Rc::clone(src),
            }));
            hook.cleanup();
        }
    }
}
