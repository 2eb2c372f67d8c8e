use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::chunk::Chunk;
use crate::error::{Result, StreamError, codes};
use crate::event::{EventKind, ListenerId};
use crate::finished::{FinishedGuard, FinishedOptions, finished};
use crate::readable::Readable;

/// 一次非阻塞探询的结果。
#[derive(Debug)]
pub enum SequencePoll {
    /// 取得一个块。
    Item(Chunk),
    /// 暂无数据；等待下一次 `"readable"` 信号或终态。
    Pending,
    /// 数据已尽，序列正常收束。
    Done,
    /// 源以错误终止（`poll` 持续回报同一错误；迭代器让渡一次后收束）。
    Failed(StreamError),
}

struct SequenceShared {
    parked: RefCell<Option<Box<dyn FnOnce(Result<Option<Chunk>>)>>>,
    ended: Cell<bool>,
    error: RefCell<Option<StreamError>>,
}

impl SequenceShared {
    fn take_parked(&self) -> Option<Box<dyn FnOnce(Result<Option<Chunk>>)>> {
        self.parked.borrow_mut().take()
    }
}

/// 推式可读流之上的拉取序列：一次一个条目，单遍、单消费者。
///
/// # 设计背景（Why）
/// - 订阅事件的消费方式把控制流交给了流本身；序列适配器反转回来，
///   让消费者按自己的节奏逐个索取；
/// - 同一时刻至多一个未决请求：缓冲有货立即兑现，否则停靠等待下一次
///   `"readable"` 信号或终态（结束/错误对所有停靠与后续请求生效）。
///
/// # 契约说明（What）
/// - 序列实例单次有效：收束后继续索取得到 `Done`；需要重读请在新的
///   流上建新序列；
/// - 构造本身会注册 `"readable"` 监听者，流随之进入拉取模式。
pub struct Sequence {
    stream: Readable,
    shared: Rc<SequenceShared>,
    readable_id: Option<ListenerId>,
    watcher: Option<FinishedGuard>,
    /// 迭代器视角下错误是否已经让渡过一次（让渡后迭代收束）。
    error_yielded: Cell<bool>,
}

impl Sequence {
    pub(crate) fn new(stream: &Readable) -> Self {
        let shared = Rc::new(SequenceShared {
            parked: RefCell::new(None),
            ended: Cell::new(stream.readable_ended()),
            error: RefCell::new(None),
        });

        // "readable" 唤醒：下一刻尝试兑现停靠请求。
        let readable_id = {
            let shared = Rc::clone(&shared);
            let stream_for_wake = stream.clone();
            let scheduler = stream.scheduler();
            stream.on(EventKind::Readable, move |_| {
                let shared = Rc::clone(&shared);
                let stream = stream_for_wake.clone();
                scheduler.schedule(move || resolve_parked(&stream, &shared));
            })
        };

        // 终态观察：正常结束与提前关闭都视作收束，其余错误拒绝请求。
        let watcher = {
            let shared = Rc::clone(&shared);
            finished(
                stream,
                FinishedOptions {
                    readable: None,
                    writable: Some(false),
                },
                move |result| match result {
                    Err(err) if !err.is(codes::PREMATURE_CLOSE) => {
                        *shared.error.borrow_mut() = Some(err.clone());
                        if let Some(cb) = shared.take_parked() {
                            cb(Err(err));
                        }
                    }
                    _ => {
                        shared.ended.set(true);
                        if let Some(cb) = shared.take_parked() {
                            cb(Ok(None));
                        }
                    }
                },
            )
        };

        Self {
            stream: stream.clone(),
            shared,
            readable_id: Some(readable_id),
            watcher: Some(watcher),
            error_yielded: Cell::new(false),
        }
    }

    /// 非阻塞探询。源以错误终止后，探询持续回报同一个错误。
    pub fn poll(&self) -> SequencePoll {
        if let Some(err) = self.shared.error.borrow().clone() {
            return SequencePoll::Failed(err);
        }
        if self.shared.ended.get() {
            return SequencePoll::Done;
        }
        match self.stream.read() {
            Some(chunk) => SequencePoll::Item(chunk),
            None => {
                if self.shared.ended.get() || self.stream.readable_ended() {
                    SequencePoll::Done
                } else {
                    SequencePoll::Pending
                }
            }
        }
    }

    /// 请求下一个条目；缓冲有货立即回调，否则停靠到信号或终态。
    ///
    /// 同一时刻至多一个未决请求：上一请求未决时再次调用，本次回调
    /// 立即以 [`codes::REQUEST_PENDING`] 失败。
    pub fn next_with(&self, callback: impl FnOnce(Result<Option<Chunk>>) + 'static) {
        if let Some(err) = self.shared.error.borrow().clone() {
            callback(Err(err));
            return;
        }
        if self.shared.ended.get() {
            callback(Ok(None));
            return;
        }
        if let Some(chunk) = self.stream.read() {
            callback(Ok(Some(chunk)));
            return;
        }
        if self.shared.parked.borrow().is_some() {
            callback(Err(StreamError::new(
                codes::REQUEST_PENDING,
                "previous sequence request still pending",
            )));
            return;
        }
        *self.shared.parked.borrow_mut() = Some(Box::new(callback));
    }
}

fn resolve_parked(stream: &Readable, shared: &Rc<SequenceShared>) {
    if shared.parked.borrow().is_none() {
        return;
    }
    if let Some(chunk) = stream.read()
        && let Some(cb) = shared.take_parked()
    {
        cb(Ok(Some(chunk)));
    }
}

impl Iterator for Sequence {
    type Item = Result<Chunk>;

    /// 驱动调度器直到取得条目、收束或确认停摆。错误让渡一次后收束。
    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.poll() {
                SequencePoll::Item(chunk) => return Some(Ok(chunk)),
                SequencePoll::Done => return None,
                SequencePoll::Failed(err) => {
                    if self.error_yielded.replace(true) {
                        return None;
                    }
                    return Some(Err(err));
                }
                SequencePoll::Pending => {
                    if !self.stream.scheduler().tick() {
                        // 调度器空转仍无数据：源既不交付也不收束。
                        return Some(Err(StreamError::new(
                            codes::SEQUENCE_STALLED,
                            "no progress while sequence awaited data",
                        )));
                    }
                }
            }
        }
    }
}

impl Drop for Sequence {
    fn drop(&mut self) {
        if let Some(id) = self.readable_id.take() {
            self.stream.remove_listener(EventKind::Readable, id);
        }
        if let Some(watcher) = self.watcher.take() {
            watcher.cancel();
        }
    }
}
