use std::rc::Rc;

use crate::chunk::Chunk;
use crate::driver::{Driver, DuplexDriver};
use crate::error::{Result, StreamError};
use crate::event::{EventKind, ListenerId, StreamEvent};
use crate::lifecycle;
use crate::options::DuplexOptions;
use crate::readable::{self, Readable, ReadableState};
use crate::sched::Scheduler;
use crate::stream::{AsStreamRef, StreamCore, StreamRef};
use crate::writable::{Writable, WritableState};

/// 双工流：一个身份下并列的可读半部与可写半部。
///
/// # 设计背景（Why）
/// - 两个半部共享同一条事件时间线与同一次销毁收尾，但状态机彼此独立；
///   组合方式是显式字段并列与方法委托，不存在任何方法表拼接；
/// - 半开策略（[`DuplexOptions::allow_half_open`]）只在一个方向起作用：
///   可读侧 `"end"` 之后强制结束可写侧；可写侧完成从不反向终结可读侧。
///   该不对称为既定策略，不做对称化推广。
#[derive(Clone)]
pub struct Duplex {
    pub(crate) core: Rc<StreamCore>,
}

impl crate::sealed::Sealed for Duplex {}

impl AsStreamRef for Duplex {
    fn as_stream_ref(&self) -> StreamRef {
        StreamRef {
            core: Rc::clone(&self.core),
        }
    }
}

impl Duplex {
    /// 以双工驱动构造流。
    pub fn new(scheduler: &Scheduler, options: DuplexOptions, driver: impl DuplexDriver) -> Self {
        let r = ReadableState::new(&options.readable_side(), options.readable);
        let w = WritableState::new(&options.writable_side(), options.writable);
        let core = StreamCore::new(scheduler.clone(), r, w, Driver::Duplex(Box::new(driver)));
        core.allow_half_open.set(options.allow_half_open);
        lifecycle::start_construct(&core);
        Self { core }
    }

    pub(crate) fn from_core(core: Rc<StreamCore>) -> Self {
        Self { core }
    }

    /// 可读半部句柄（与本句柄共享同一条流）。
    pub fn readable_half(&self) -> Readable {
        Readable::from_core(Rc::clone(&self.core))
    }

    /// 可写半部句柄（与本句柄共享同一条流）。
    pub fn writable_half(&self) -> Writable {
        Writable::from_core(Rc::clone(&self.core))
    }

    /// 半开策略当前取值。
    pub fn allow_half_open(&self) -> bool {
        self.core.allow_half_open.get()
    }

    /// 生产者推入可读侧。
    pub fn push(&self, chunk: impl Into<Chunk>) -> bool {
        self.readable_half().push(chunk)
    }

    /// 宣告可读侧数据结束。
    pub fn push_end(&self) -> bool {
        self.readable_half().push_end()
    }

    /// 从可读侧取数据。
    pub fn read(&self) -> Option<Chunk> {
        self.readable_half().read()
    }

    /// 向可写侧写入。
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

    /// 请求可写侧收尾。
    pub fn end(&self) {
        self.writable_half().end();
    }

    /// 暂停可读侧环境流动。
    pub fn pause(&self) -> &Self {
        self.readable_half().pause();
        self
    }

    /// 恢复可读侧环境流动。
    pub fn resume(&self) -> &Self {
        self.readable_half().resume();
        self
    }

    /// 幂等销毁（两侧一并收尾）。
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

    /// 注销监听者。
    pub fn remove_listener(&self, kind: EventKind, id: ListenerId) -> bool {
        self.readable_half().remove_listener(kind, id)
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
