use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use crate::driver::Driver;
use crate::error::StreamError;
use crate::event::{EventBus, StreamEvent};
use crate::lifecycle;
use crate::readable::ReadableState;
use crate::sched::Scheduler;
use crate::transform::TransformLinks;
use crate::writable::WritableState;

/// 流身份：一个事件总线、一个调度器句柄、一对状态半部与一个驱动槽。
///
/// # 设计背景（Why）
/// - 双工流要求可读/可写两个状态机共享同一个身份（同一条事件时间线、
///   同一次销毁收尾），因此两侧状态以纯组合的方式并列在同一载体上，
///   由各引擎模块显式委托，而不做任何方法表拼接；
/// - 单向流同样持有双侧状态，用角色开关把另一侧置为惰性——这让完成
///   观察器的“形状探测”退化为读取两个布尔位。
///
/// # 并发与重入（How）
/// - 核心运行在单逻辑线程上，所有内部状态用 `RefCell` 守护；
/// - 不变式：任何状态借用都不得跨越用户回调或事件分发。驱动对象在
///   钩子调用期间被整体借出（checkout），期间发起的销毁被记账并在钩子
///   返回后补执行；借出期间的跨半部再派发一律退避到下一个调度刻。
pub(crate) struct StreamCore {
    pub(crate) scheduler: Scheduler,
    pub(crate) bus: EventBus,
    pub(crate) r: RefCell<ReadableState>,
    pub(crate) w: RefCell<WritableState>,
    pub(crate) transform: RefCell<TransformLinks>,
    driver: RefCell<Option<Driver>>,
    /// 驱动借出期间收到的销毁请求（`Some(maybe_error)`）。
    checkout_teardown: RefCell<Option<Option<StreamError>>>,
    driver_checked_out: Cell<bool>,
    /// 构造完成前收到的销毁请求。
    pub(crate) deferred_destroy: RefCell<Option<Option<StreamError>>>,
    pub(crate) construct_ticket: Cell<Option<u64>>,
    pub(crate) teardown_ticket: Cell<Option<u64>>,
    /// 双工半开策略：可读侧结束后可写侧是否继续存活。
    pub(crate) allow_half_open: Cell<bool>,
    next_ticket: Cell<u64>,
}

impl StreamCore {
    pub(crate) fn new(
        scheduler: Scheduler,
        r: ReadableState,
        w: WritableState,
        driver: Driver,
    ) -> Rc<Self> {
        Rc::new(Self {
            scheduler,
            bus: EventBus::new(),
            r: RefCell::new(r),
            w: RefCell::new(w),
            transform: RefCell::new(TransformLinks::default()),
            driver: RefCell::new(Some(driver)),
            checkout_teardown: RefCell::new(None),
            driver_checked_out: Cell::new(false),
            deferred_destroy: RefCell::new(None),
            construct_ticket: Cell::new(None),
            teardown_ticket: Cell::new(None),
            allow_half_open: Cell::new(true),
            next_ticket: Cell::new(1),
        })
    }

    /// 签发下一张完成令牌票号。
    pub(crate) fn ticket(&self) -> u64 {
        let t = self.next_ticket.get();
        self.next_ticket.set(t + 1);
        t
    }

    /// 判断驱动当前是否被借出（钩子调用中）。
    pub(crate) fn driver_busy(&self) -> bool {
        self.driver_checked_out.get()
    }

    /// 发布事件并返回监听者数量。
    pub(crate) fn emit(&self, event: StreamEvent) -> usize {
        self.bus.emit(&event)
    }
}

/// 在借出驱动的前提下执行一次钩子调用。
///
/// 返回 `None` 表示驱动不可用：要么已被拆除，要么正处于另一个钩子的
/// 调用栈上（跨半部重入）。调用方应将动作退避到下一个调度刻或直接放弃。
/// 钩子执行期间若有销毁请求到达，会在驱动归还前补执行拆除钩子。
pub(crate) fn with_driver<R>(
    core: &Rc<StreamCore>,
    f: impl FnOnce(&mut Driver) -> R,
) -> Option<R> {
    let taken = core.driver.borrow_mut().take();
    let Some(mut driver) = taken else {
        return None;
    };
    core.driver_checked_out.set(true);
    let out = f(&mut driver);
    core.driver_checked_out.set(false);

    let pending = core.checkout_teardown.borrow_mut().take();
    match pending {
        Some(error) => lifecycle::run_teardown_hook(core, driver, error),
        None => {
            *core.driver.borrow_mut() = Some(driver);
        }
    }
    Some(out)
}

/// 取出驱动以执行拆除钩子；借出中则记账等待归还时补执行。
pub(crate) fn take_driver_for_teardown(
    core: &Rc<StreamCore>,
    error: Option<StreamError>,
) -> Option<Driver> {
    if core.driver_checked_out.get() {
        *core.checkout_teardown.borrow_mut() = Some(error);
        return None;
    }
    core.driver.borrow_mut().take()
}

/// 任一流的不透明身份句柄。
///
/// 完成观察器、管道协调器与 `Pipe`/`Unpipe` 事件载荷都以它指代一条流，
/// 不关心对方的具体形态。克隆代价为一次引用计数操作。
#[derive(Clone)]
pub struct StreamRef {
    pub(crate) core: Rc<StreamCore>,
}

impl StreamRef {
    /// 判断两个句柄是否指向同一条流。
    pub fn same_stream(&self, other: &StreamRef) -> bool {
        Rc::ptr_eq(&self.core, &other.core)
    }

    /// 流是否已销毁（双工流要求两侧都已销毁）。
    pub fn is_destroyed(&self) -> bool {
        self.core.r.borrow().destroyed && self.core.w.borrow().destroyed
    }

    /// 返回绑定的调度器句柄。
    pub fn scheduler(&self) -> Scheduler {
        self.core.scheduler.clone()
    }
}

impl fmt::Debug for StreamRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamRef")
            .field("addr", &Rc::as_ptr(&self.core))
            .finish()
    }
}

/// 可以取得流身份句柄的类型（各形态的公开流句柄）。
pub trait AsStreamRef: crate::sealed::Sealed {
    /// 返回该流的身份句柄。
    fn as_stream_ref(&self) -> StreamRef;
}

impl crate::sealed::Sealed for StreamRef {}

impl AsStreamRef for StreamRef {
    fn as_stream_ref(&self) -> StreamRef {
        self.clone()
    }
}
