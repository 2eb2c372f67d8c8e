use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use crate::error::{Result, StreamError, codes};

type Task = Box<dyn FnOnce()>;

/// `Scheduler` 是流引擎的协作式单线程调度器。
///
/// # 设计背景（Why）
/// - 引擎的时序契约要求 `"readable"`/`"end"`/`"finish"`/`"close"` 等事件的
///   发布至少推迟到引起状态迁移的那次调用之后的下一个调度刻，否则回调
///   重入会造成栈增长并让同刻注册的监听者错过事件；
/// - 与其把“下一个微任务”留成隐式约定，不如将其显式建模为一个 FIFO
///   任务队列：挂起点即队列边界，时序可以在测试中被精确驱动。
///
/// # 逻辑解析（How）
/// - `schedule` 入队一个一次性闭包；`tick` 取出并执行队首任务；
///   `run_until_idle` 反复执行直到队列耗尽——执行期间新入队的任务会在
///   同一次排空中继续运行；
/// - `"error"` 事件在发布时若没有任何监听者，会经 [`report_unhandled`]
///   记入未观察错误槽；`run_until_idle` 在排空后将首个未观察错误以
///   `Err` 形式交还驱动方。
///
/// # 契约说明（What）
/// - **单线程**：句柄内部为 `Rc`，既不 `Send` 也不 `Sync`，所有流都必须
///   与其调度器同线程使用；
/// - **不可重入**：任务体内再次调用 `run_until_idle`/`tick` 是逻辑错误，
///   会被 `running` 守卫拒绝并返回 `false`/`Ok(())` 空转；
/// - **后置条件**：`run_until_idle` 返回 `Ok` 时队列为空且没有未观察
///   错误残留。
///
/// # 设计考量（Trade-offs）
/// - 未观察错误选择“驱动方致命”而非 panic：库代码不应当决定宿主的
///   崩溃策略，但也绝不允许错误被静默吞掉。
///
/// [`report_unhandled`]: Scheduler::report_unhandled
#[derive(Clone)]
pub struct Scheduler {
    inner: Rc<SchedulerInner>,
}

struct SchedulerInner {
    queue: RefCell<VecDeque<Task>>,
    running: Cell<bool>,
    unhandled: RefCell<Vec<StreamError>>,
}

impl Scheduler {
    /// 创建一个空闲调度器。
    pub fn new() -> Self {
        Self {
            inner: Rc::new(SchedulerInner {
                queue: RefCell::new(VecDeque::new()),
                running: Cell::new(false),
                unhandled: RefCell::new(Vec::new()),
            }),
        }
    }

    /// 将任务推迟到下一个调度刻执行。
    pub fn schedule(&self, task: impl FnOnce() + 'static) {
        self.inner.queue.borrow_mut().push_back(Box::new(task));
    }

    /// 执行队首任务；队列为空或处于排空过程中时返回 `false`。
    pub fn tick(&self) -> bool {
        if self.inner.running.get() {
            return false;
        }
        let task = self.inner.queue.borrow_mut().pop_front();
        match task {
            Some(task) => {
                self.inner.running.set(true);
                task();
                self.inner.running.set(false);
                true
            }
            None => false,
        }
    }

    /// 反复执行任务直到队列耗尽，随后交出首个未观察错误。
    pub fn run_until_idle(&self) -> Result<()> {
        if self.inner.running.get() {
            return Ok(());
        }
        loop {
            let task = self.inner.queue.borrow_mut().pop_front();
            let Some(task) = task else { break };
            self.inner.running.set(true);
            task();
            self.inner.running.set(false);
        }
        let mut unhandled = self.inner.unhandled.borrow_mut();
        if unhandled.is_empty() {
            Ok(())
        } else {
            let first = unhandled.remove(0);
            unhandled.clear();
            Err(first)
        }
    }

    /// 当前待执行任务数。
    pub fn pending(&self) -> usize {
        self.inner.queue.borrow().len()
    }

    /// 记录一个没有监听者的 `"error"` 事件。
    pub fn report_unhandled(&self, error: StreamError) {
        tracing::error!(code = error.code(), message = error.message(), "stream error had no listener");
        self.inner
            .unhandled
            .borrow_mut()
            .push(StreamError::new(codes::UNOBSERVED_ERROR, "error event had no listener").with_cause(error));
    }

    /// 查询是否存在尚未交出的未观察错误。
    pub fn has_unhandled(&self) -> bool {
        !self.inner.unhandled.borrow().is_empty()
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}
