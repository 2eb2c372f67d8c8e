use std::rc::Rc;

use crate::chunk::Chunk;
use crate::driver::{Driver, FlushDone, TransformDone, TransformOp};
use crate::error::{Result, StreamError, codes};
use crate::event::{EventKind, ListenerId, StreamEvent};
use crate::lifecycle;
use crate::options::DuplexOptions;
use crate::readable::{self, Readable, ReadableState};
use crate::sched::Scheduler;
use crate::stream::{self, AsStreamRef, StreamCore, StreamRef};
use crate::writable::{self, Writable, WritableState};

/// 变换流在核心上的联动记录。
///
/// 变换完成令牌与写完成之间共享“单个未决槽”：可读侧饱和时，写确认被
/// 扣押在 [`held_write`](TransformLinks::held_write)，由下一次拉取释放。
#[derive(Default)]
pub(crate) struct TransformLinks {
    pub(crate) is_transform: bool,
    /// 在途变换的令牌票号。
    transform_ticket: Option<u64>,
    /// 本次变换对应的写完成票号。
    write_ticket: Option<u64>,
    /// 变换开始前可读缓冲的水位（判断本次是否产出）。
    readable_len_before: usize,
    /// 被扣押、等待可读侧拉取释放的写完成票号。
    held_write: Option<u64>,
    /// 在途冲刷的令牌票号及其对应的最终钩子票号。
    flush_ticket: Option<u64>,
    flush_final_ticket: Option<u64>,
}

/// 判断流身份是否为变换流。
pub(crate) fn is_transform(core: &Rc<StreamCore>) -> bool {
    core.transform.borrow().is_transform
}

/// 变换流：每个写入块经用户变换产出零或一个可读块的双工特化。
///
/// # 设计背景（Why）
/// - 写入与变换之间保持“恰好一个在途”的纪律：变换完成令牌未消费前，
///   引擎不派发下一个写；
/// - 可读侧饱和（缓冲增长且到达水位线）时，写确认被扣押，直到消费者
///   拉走数据——这正是背压从可读侧反向传导到写入侧的机制；
/// - 尾部冲刷钩子在最后一个写之后、可读侧收尾之前运行，之后依次是
///   `"prefinish"`、可读侧 `"end"` 与 `"finish"`。
#[derive(Clone)]
pub struct Transform {
    pub(crate) core: Rc<StreamCore>,
}

impl crate::sealed::Sealed for Transform {}

impl AsStreamRef for Transform {
    fn as_stream_ref(&self) -> StreamRef {
        StreamRef {
            core: Rc::clone(&self.core),
        }
    }
}

impl Transform {
    /// 以变换实现构造流。
    pub fn new(scheduler: &Scheduler, options: DuplexOptions, op: impl TransformOp) -> Self {
        let mut r = ReadableState::new(&options.readable_side(), options.readable);
        // 变换输出从写派发栈推入，永不处于取数同步窗口；关闭同步门闩
        // 让流动模式下的输出直接以 "data" 交付，免去缓冲往返。
        r.sync = false;
        let w = WritableState::new(&options.writable_side(), options.writable);
        let core = StreamCore::new(scheduler.clone(), r, w, Driver::Transform(Box::new(op)));
        core.allow_half_open.set(options.allow_half_open);
        core.transform.borrow_mut().is_transform = true;
        lifecycle::start_construct(&core);
        Self { core }
    }

    /// 可读半部句柄。
    pub fn readable_half(&self) -> Readable {
        Readable::from_core(Rc::clone(&self.core))
    }

    /// 可写半部句柄。
    pub fn writable_half(&self) -> Writable {
        Writable::from_core(Rc::clone(&self.core))
    }

    /// 向变换写入。
    pub fn write(&self, chunk: impl Into<Chunk>) -> bool {
        self.writable_half().write(chunk)
    }

    /// 带完成回调写入。
    pub fn write_with(
        &self,
        chunk: impl Into<Chunk>,
        on_complete: impl FnOnce(Result<()>) + 'static,
    ) -> bool {
        self.writable_half().write_with(chunk, on_complete)
    }

    /// 请求收尾（触发冲刷 → `"prefinish"` → 可读侧 `"end"` → `"finish"`）。
    pub fn end(&self) {
        self.writable_half().end();
    }

    /// 从可读侧取变换输出。
    pub fn read(&self) -> Option<Chunk> {
        self.readable_half().read()
    }

    /// 恢复可读侧环境流动。
    pub fn resume(&self) -> &Self {
        self.readable_half().resume();
        self
    }

    /// 暂停可读侧环境流动。
    pub fn pause(&self) -> &Self {
        self.readable_half().pause();
        self
    }

    /// 幂等销毁。
    pub fn destroy(&self) {
        lifecycle::destroy(&self.core, None);
    }

    /// 以错误销毁。
    pub fn destroy_with(&self, error: StreamError) {
        lifecycle::destroy(&self.core, Some(error));
    }

    /// 注册监听者（`"data"`/`"readable"` 订阅带可读侧换挡副作用）。
    pub fn on(&self, kind: EventKind, handler: impl Fn(&StreamEvent) + 'static) -> ListenerId {
        let id = self.core.bus.on(kind, handler);
        readable::subscription_side_effects(&self.core, kind);
        id
    }

    /// 注册一次性监听者。
    pub fn once(&self, kind: EventKind, handler: impl Fn(&StreamEvent) + 'static) -> ListenerId {
        let id = self.core.bus.once(kind, handler);
        readable::subscription_side_effects(&self.core, kind);
        id
    }

    /// 是否两侧均已销毁。
    pub fn is_destroyed(&self) -> bool {
        self.core.r.borrow().destroyed && self.core.w.borrow().destroyed
    }

    /// 绑定的调度器句柄。
    pub fn scheduler(&self) -> Scheduler {
        self.core.scheduler.clone()
    }
}

/// 写派发的变换分支：登记联动票号并调用用户变换。
pub(crate) fn dispatch_transform(
    core: &Rc<StreamCore>,
    op: &mut Box<dyn TransformOp>,
    chunk: Chunk,
    write_ticket: u64,
) {
    let transform_ticket = core.ticket();
    {
        let mut links = core.transform.borrow_mut();
        links.transform_ticket = Some(transform_ticket);
        links.write_ticket = Some(write_ticket);
        links.held_write = None;
        links.readable_len_before = core.r.borrow().length;
    }
    op.transform(chunk, TransformDone::new(core, transform_ticket));
}

/// 变换完成令牌的善后：推产出，随后立即确认写或扣押等待拉取。
pub(crate) fn transform_completed(core: &Rc<StreamCore>, ticket: u64, result: Result<Option<Chunk>>) {
    let write_ticket = {
        let mut links = core.transform.borrow_mut();
        if links.transform_ticket != Some(ticket) {
            drop(links);
            lifecycle::error_or_destroy(
                core,
                StreamError::new(codes::COMPLETION_REPLAYED, "stale transform completion token"),
                false,
            );
            return;
        }
        links.transform_ticket = None;
        links.write_ticket.take()
    };
    let Some(write_ticket) = write_ticket else {
        return;
    };

    match result {
        Err(err) => writable::write_completed(core, write_ticket, Some(err)),
        Ok(output) => {
            if let Some(chunk) = output {
                readable::add_chunk(core, Some(chunk), false);
            }
            let release_now = {
                let links = core.transform.borrow();
                let r = core.r.borrow();
                let w = core.w.borrow();
                w.ended
                    || r.length == links.readable_len_before
                    || r.length < r.high_water_mark
                    || r.length == 0
            };
            if release_now {
                writable::write_completed(core, write_ticket, None);
            } else {
                tracing::trace!("transform ack withheld until readable side drains");
                core.transform.borrow_mut().held_write = Some(write_ticket);
            }
        }
    }
}

/// 可读侧拉取：释放被扣押的写确认（若有）。
pub(crate) fn pull_release(core: &Rc<StreamCore>) {
    let held = core.transform.borrow_mut().held_write.take();
    if let Some(write_ticket) = held {
        writable::write_completed(core, write_ticket, None);
    }
}

/// 最终钩子的变换分支：派发尾部冲刷。
pub(crate) fn dispatch_flush(core: &Rc<StreamCore>, final_ticket: u64) -> bool {
    let flush_ticket = core.ticket();
    {
        let mut links = core.transform.borrow_mut();
        links.flush_ticket = Some(flush_ticket);
        links.flush_final_ticket = Some(final_ticket);
    }
    let dispatched = stream::with_driver(core, |driver| {
        if let Driver::Transform(op) = driver {
            op.flush(FlushDone::new(core, flush_ticket));
        }
    })
    .is_some();
    if !dispatched {
        let mut links = core.transform.borrow_mut();
        links.flush_ticket = None;
        links.flush_final_ticket = None;
    }
    dispatched
}

/// 冲刷完成：推尾部产出、宣告可读侧数据结束，再走最终钩子善后。
pub(crate) fn flush_completed(core: &Rc<StreamCore>, ticket: u64, result: Result<Option<Chunk>>) {
    let final_ticket = {
        let mut links = core.transform.borrow_mut();
        if links.flush_ticket != Some(ticket) {
            drop(links);
            lifecycle::error_or_destroy(
                core,
                StreamError::new(codes::COMPLETION_REPLAYED, "stale flush completion token"),
                false,
            );
            return;
        }
        links.flush_ticket = None;
        links.flush_final_ticket.take()
    };
    let Some(final_ticket) = final_ticket else {
        return;
    };

    match result {
        Err(err) => writable::finalize_completed(core, final_ticket, Some(err)),
        Ok(output) => {
            if let Some(chunk) = output {
                readable::add_chunk(core, Some(chunk), false);
            }
            readable::add_chunk(core, None, false);
            writable::finalize_completed(core, final_ticket, None);
        }
    }
}
