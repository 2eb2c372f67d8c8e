use std::collections::VecDeque;
use std::rc::Rc;

use bytes::Bytes;

use crate::chunk::Chunk;
use crate::driver::{Driver, DuplexDriver, FinalizeDone, WriteDone, WriteSink};
use crate::error::{Result, StreamError, codes};
use crate::event::{EventKind, ListenerId, StreamEvent};
use crate::lifecycle;
use crate::options::StreamOptions;
use crate::readable::ReadableState;
use crate::sched::Scheduler;
use crate::stream::{self, AsStreamRef, StreamCore, StreamRef};

/// 写完成通知回调。
pub type WriteCallback = Box<dyn FnOnce(Result<()>)>;

/// 排队等待派发的写请求。
pub(crate) struct WriteRequest {
    pub(crate) chunk: Chunk,
    pub(crate) callback: Option<WriteCallback>,
}

/// 在途派发（单块或批量合并后恰好一个）。
pub(crate) struct InFlight {
    pub(crate) ticket: u64,
    pub(crate) units: usize,
    pub(crate) callbacks: Vec<Option<WriteCallback>>,
}

/// 可写半部的全部状态。
pub(crate) struct WritableState {
    pub(crate) queue: VecDeque<WriteRequest>,
    pub(crate) length: usize,
    pub(crate) high_water_mark: usize,
    pub(crate) corked: usize,
    pub(crate) writing: bool,
    /// 派发的同步窗口：窗口内完成的写把善后推迟一个调度刻。
    pub(crate) sync: bool,
    pub(crate) buffer_processing: bool,
    pub(crate) ending: bool,
    pub(crate) ended: bool,
    pub(crate) finished: bool,
    pub(crate) final_called: bool,
    pub(crate) final_ticket: Option<u64>,
    pub(crate) need_drain: bool,
    pub(crate) destroyed: bool,
    pub(crate) errored: Option<StreamError>,
    pub(crate) error_emitted: bool,
    pub(crate) closed: bool,
    pub(crate) close_emitted: bool,
    pub(crate) constructed: bool,
    /// 角色开关：单向可读流的可写半部置 `false` 后永远惰性。
    pub(crate) writable_role: bool,
    pub(crate) object_mode: bool,
    pub(crate) decode_text: bool,
    pub(crate) auto_destroy: bool,
    pub(crate) emit_close: bool,
    pub(crate) pending_callbacks: usize,
    pub(crate) in_flight: Option<InFlight>,
    /// `end` 注册的完成回调，finish 时统一触发。
    pub(crate) on_finished: Vec<WriteCallback>,
}

impl WritableState {
    pub(crate) fn new(options: &StreamOptions, writable_role: bool) -> Self {
        Self {
            queue: VecDeque::new(),
            length: 0,
            high_water_mark: options.resolved_high_water_mark(),
            corked: 0,
            writing: false,
            sync: true,
            buffer_processing: false,
            ending: false,
            ended: false,
            finished: false,
            final_called: false,
            final_ticket: None,
            need_drain: false,
            destroyed: false,
            errored: None,
            error_emitted: false,
            closed: false,
            close_emitted: false,
            constructed: true,
            writable_role,
            object_mode: options.object_mode,
            decode_text: options.decode_text,
            auto_destroy: options.auto_destroy,
            emit_close: options.emit_close,
            pending_callbacks: 0,
            in_flight: None,
            on_finished: Vec::new(),
        }
    }
}

/// 是否满足收尾条件（ending 且一切在途工作清零）。
pub(crate) fn need_finish(w: &WritableState) -> bool {
    w.ending
        && w.constructed
        && !w.destroyed
        && w.length == 0
        && w.queue.is_empty()
        && w.errored.is_none()
        && !w.finished
        && !w.writing
}

/// 可写流句柄。
///
/// # 设计背景（Why）
/// - 落地端一次只消化一个块（或一次批量），引擎负责排队、塞停合批与
///   `"drain"` 背压信号；
/// - [`write`](Writable::write) 返回 `false` 即缓冲越过水位线，生产者应
///   停笔等待 `"drain"`——引擎不强制，而是把选择权交给生产者。
#[derive(Clone)]
pub struct Writable {
    pub(crate) core: Rc<StreamCore>,
}

impl crate::sealed::Sealed for Writable {}

impl AsStreamRef for Writable {
    fn as_stream_ref(&self) -> StreamRef {
        StreamRef {
            core: Rc::clone(&self.core),
        }
    }
}

impl Writable {
    /// 以落地实现构造可写流。
    pub fn new(scheduler: &Scheduler, options: StreamOptions, sink: impl WriteSink) -> Self {
        let w = WritableState::new(&options, true);
        // 惰性半部沿用同一份配置，保证策略开关两侧一致。
        let r = ReadableState::new(&options, false);
        let core = StreamCore::new(scheduler.clone(), r, w, Driver::Sink(Box::new(sink)));
        lifecycle::start_construct(&core);
        Self { core }
    }

    pub(crate) fn from_core(core: Rc<StreamCore>) -> Self {
        Self { core }
    }

    /// 写入一个块；返回 `false` 表示缓冲已越过水位线（背压）。
    pub fn write(&self, chunk: impl Into<Chunk>) -> bool {
        write(&self.core, chunk.into(), None)
    }

    /// 带完成回调写入。回调恰好触发一次：成功、失败或销毁扇出。
    pub fn write_with(
        &self,
        chunk: impl Into<Chunk>,
        on_complete: impl FnOnce(Result<()>) + 'static,
    ) -> bool {
        write(&self.core, chunk.into(), Some(Box::new(on_complete)))
    }

    /// 塞停：计数器加一，写请求改为积压。
    pub fn cork(&self) {
        self.core.w.borrow_mut().corked += 1;
    }

    /// 解除塞停；计数归零时冲刷积压（支持批量的落地端合并为一次派发）。
    pub fn uncork(&self) {
        uncork(&self.core);
    }

    /// 请求收尾。
    pub fn end(&self) {
        end(&self.core, None, None);
    }

    /// 附带最后一个块请求收尾。
    pub fn end_chunk(&self, chunk: impl Into<Chunk>) {
        end(&self.core, Some(chunk.into()), None);
    }

    /// 请求收尾并在 `"finish"` 时回调（流已完成/已销毁则回调立即以
    /// 相应错误在下一个调度刻触发）。
    pub fn end_notify(&self, on_finished: impl FnOnce(Result<()>) + 'static) {
        end(&self.core, None, Some(Box::new(on_finished)));
    }

    /// 幂等销毁。
    pub fn destroy(&self) {
        lifecycle::destroy(&self.core, None);
    }

    /// 以错误销毁。
    pub fn destroy_with(&self, error: StreamError) {
        lifecycle::destroy(&self.core, Some(error));
    }

    /// 注册监听者（可写侧订阅不带换挡副作用）。
    pub fn on(&self, kind: EventKind, handler: impl Fn(&StreamEvent) + 'static) -> ListenerId {
        self.core.bus.on(kind, handler)
    }

    /// 注册一次性监听者。
    pub fn once(&self, kind: EventKind, handler: impl Fn(&StreamEvent) + 'static) -> ListenerId {
        self.core.bus.once(kind, handler)
    }

    /// 注销监听者。
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.core.bus.remove(id)
    }

    /// 某一事件种类当前的监听者数量。
    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.core.bus.listener_count(kind)
    }

    /// 是否仍可写（未收尾、未销毁、未出错）。
    pub fn is_writable(&self) -> bool {
        let w = self.core.w.borrow();
        w.writable_role && !w.destroyed && w.errored.is_none() && !w.ending && !w.ended
    }

    /// 积压中的单位数。
    pub fn buffered_len(&self) -> usize {
        self.core.w.borrow().length
    }

    /// 当前水位线。
    pub fn high_water_mark(&self) -> usize {
        self.core.w.borrow().high_water_mark
    }

    /// 塞停嵌套深度。
    pub fn corked(&self) -> usize {
        self.core.w.borrow().corked
    }

    /// `end` 是否已被请求。
    pub fn writable_ended(&self) -> bool {
        self.core.w.borrow().ending
    }

    /// 收尾回调链是否已全部完成。
    pub fn writable_finished(&self) -> bool {
        self.core.w.borrow().finished
    }

    /// 是否已宣告背压且尚未 `"drain"`。
    pub fn needs_drain(&self) -> bool {
        self.core.w.borrow().need_drain
    }

    /// 是否已销毁。
    pub fn is_destroyed(&self) -> bool {
        self.core.w.borrow().destroyed
    }

    /// 已记录的终态错误（若有）。
    pub fn errored(&self) -> Option<StreamError> {
        self.core.w.borrow().errored.clone()
    }

    /// 绑定的调度器句柄。
    pub fn scheduler(&self) -> Scheduler {
        self.core.scheduler.clone()
    }
}

/// 写入口：校验、归一化、入账并派发或积压。
pub(crate) fn write(core: &Rc<StreamCore>, chunk: Chunk, callback: Option<WriteCallback>) -> bool {
    // 字节模式下默认把文本编码为字节（与字节落地端对齐）。
    let chunk = {
        let w = core.w.borrow();
        if !w.object_mode
            && w.decode_text
            && let Chunk::Text(text) = &chunk
        {
            Chunk::Bytes(Bytes::from(text.clone().into_bytes()))
        } else {
            chunk
        }
    };

    let reject = {
        let w = core.w.borrow();
        if w.ending {
            Some(StreamError::new(codes::WRITE_AFTER_END, "write after end()"))
        } else if w.destroyed {
            Some(StreamError::new(codes::STREAM_DESTROYED, "write on destroyed stream"))
        } else {
            None
        }
    };
    if let Some(err) = reject {
        if let Some(cb) = callback {
            let failure = err.clone();
            core.scheduler.schedule(move || cb(Err(failure)));
        }
        lifecycle::error_or_destroy(core, err, true);
        return false;
    }

    core.w.borrow_mut().pending_callbacks += 1;
    write_or_buffer(core, chunk, callback)
}

fn write_or_buffer(core: &Rc<StreamCore>, chunk: Chunk, callback: Option<WriteCallback>) -> bool {
    enum Route {
        Dispatch(Chunk, Option<WriteCallback>, usize),
        Buffered { retry: bool },
    }
    let (route, ret) = {
        let mut w = core.w.borrow_mut();
        let units = chunk.units(w.object_mode);
        w.length += units;
        let ret = w.length < w.high_water_mark;
        if !ret {
            w.need_drain = true;
            tracing::trace!(buffered = w.length, hwm = w.high_water_mark, "writable backpressure raised");
        }
        if w.writing || w.corked > 0 || w.errored.is_some() || !w.constructed || core.driver_busy()
        {
            let retry = core.driver_busy() && !w.writing;
            w.queue.push_back(WriteRequest { chunk, callback });
            (Route::Buffered { retry }, ret)
        } else {
            (Route::Dispatch(chunk, callback, units), ret)
        }
    };
    match route {
        Route::Dispatch(chunk, callback, units) => {
            dispatch_entries(core, vec![chunk], vec![callback], units);
        }
        Route::Buffered { retry } => {
            if retry {
                // 驱动正被另一侧钩子占用：下一刻再试。
                let core = Rc::clone(core);
                let sched = core.scheduler.clone();
                sched.schedule(move || clear_buffer(&core));
            }
        }
    }
    let w = core.w.borrow();
    ret && w.errored.is_none() && !w.destroyed
}

/// 派发一组块（单块或合并批量），恰好占用一个在途席位。
///
/// 返回 `false` 表示驱动被借出、派发已退回队列并安排了下一刻冲刷；
/// 调用方的冲刷循环此时必须停下，避免原地空转。
fn dispatch_entries(
    core: &Rc<StreamCore>,
    mut chunks: Vec<Chunk>,
    callbacks: Vec<Option<WriteCallback>>,
    units: usize,
) -> bool {
    let ticket = core.ticket();
    {
        let mut w = core.w.borrow_mut();
        w.in_flight = Some(InFlight {
            ticket,
            units,
            callbacks,
        });
        w.writing = true;
        w.sync = true;
    }
    let dispatched = stream::with_driver(core, |driver| match driver {
        Driver::Sink(sink) => {
            if chunks.len() == 1 {
                if let Some(chunk) = chunks.pop() {
                    sink.write(chunk, WriteDone::new(core, ticket));
                }
            } else {
                sink.write_batch(std::mem::take(&mut chunks), WriteDone::new(core, ticket));
            }
        }
        Driver::Duplex(duplex) => {
            let handle = crate::duplex::Duplex::from_core(Rc::clone(core));
            if chunks.len() == 1 {
                if let Some(chunk) = chunks.pop() {
                    duplex.write(&handle, chunk, WriteDone::new(core, ticket));
                }
            } else {
                duplex.write_batch(
                    &handle,
                    std::mem::take(&mut chunks),
                    WriteDone::new(core, ticket),
                );
            }
        }
        Driver::Transform(op) => {
            if let Some(chunk) = chunks.pop() {
                crate::transform::dispatch_transform(core, op, chunk, ticket);
            }
        }
        Driver::Source(_) => {}
    });
    core.w.borrow_mut().sync = false;
    if dispatched.is_some() {
        return true;
    }
    // 驱动借出中：撤销席位，把请求按原序退回队头，下一刻冲刷。
    {
        let mut w = core.w.borrow_mut();
        w.writing = false;
        if let Some(in_flight) = w.in_flight.take() {
            let mut cbs = in_flight.callbacks;
            for (chunk, callback) in chunks.drain(..).zip(cbs.drain(..)).rev() {
                w.queue.push_front(WriteRequest { chunk, callback });
            }
        }
    }
    let core = Rc::clone(core);
    let sched = core.scheduler.clone();
    sched.schedule(move || clear_buffer(&core));
    false
}

/// 落地端完成令牌的汇聚入口（对应单一完成路径的约定）。
pub(crate) fn write_completed(core: &Rc<StreamCore>, ticket: u64, error: Option<StreamError>) {
    let matched = {
        let w = core.w.borrow();
        w.in_flight.as_ref().map(|f| f.ticket) == Some(ticket)
    };
    if !matched {
        lifecycle::error_or_destroy(
            core,
            StreamError::new(codes::COMPLETION_REPLAYED, "stale write completion token"),
            false,
        );
        return;
    }

    let (callbacks, sync) = {
        let mut w = core.w.borrow_mut();
        let Some(in_flight) = w.in_flight.take() else {
            return;
        };
        w.writing = false;
        w.length -= in_flight.units;
        (in_flight.callbacks, w.sync)
    };

    match error {
        Some(err) => {
            {
                let mut w = core.w.borrow_mut();
                if w.errored.is_none() {
                    w.errored = Some(err.clone());
                }
            }
            {
                let mut r = core.r.borrow_mut();
                if r.errored.is_none() {
                    r.errored = Some(err.clone());
                }
            }
            if sync {
                let core = Rc::clone(core);
                let sched = core.scheduler.clone();
                sched.schedule(move || write_errored(&core, callbacks, err));
            } else {
                write_errored(core, callbacks, err);
            }
        }
        None => {
            if !core.w.borrow().queue.is_empty() {
                clear_buffer(core);
            }
            if sync {
                let core = Rc::clone(core);
                let sched = core.scheduler.clone();
                sched.schedule(move || after_write(&core, callbacks));
            } else {
                after_write(core, callbacks);
            }
        }
    }
}

fn write_errored(core: &Rc<StreamCore>, callbacks: Vec<Option<WriteCallback>>, err: StreamError) {
    {
        let mut w = core.w.borrow_mut();
        w.pending_callbacks = w.pending_callbacks.saturating_sub(callbacks.len());
    }
    for cb in callbacks.into_iter().flatten() {
        cb(Err(err.clone()));
    }
    error_buffer(core);
    lifecycle::error_or_destroy(core, err, false);
}

fn after_write(core: &Rc<StreamCore>, callbacks: Vec<Option<WriteCallback>>) {
    let emit_drain = {
        let mut w = core.w.borrow_mut();
        let need = !w.ending && !w.destroyed && w.length == 0 && w.need_drain;
        if need {
            w.need_drain = false;
        }
        need
    };
    if emit_drain {
        tracing::trace!("writable drained");
        core.emit(StreamEvent::Drain);
    }
    {
        let mut w = core.w.borrow_mut();
        w.pending_callbacks = w.pending_callbacks.saturating_sub(callbacks.len());
    }
    for cb in callbacks.into_iter().flatten() {
        cb(Ok(()));
    }
    if core.w.borrow().destroyed {
        error_buffer(core);
    }
    finish_maybe(core, false);
}

/// 冲刷积压：塞停解除或上一个在途写完成后调用。
pub(crate) fn clear_buffer(core: &Rc<StreamCore>) {
    {
        let mut w = core.w.borrow_mut();
        if w.corked > 0
            || w.buffer_processing
            || w.destroyed
            || !w.constructed
            || w.writing
            || w.queue.is_empty()
        {
            return;
        }
        w.buffer_processing = true;
    }

    let batchable = {
        let use_batch = core.w.borrow().queue.len() > 1;
        use_batch
            && stream::with_driver(core, |driver| match driver {
                Driver::Sink(sink) => sink.supports_batch(),
                Driver::Duplex(duplex) => duplex.supports_batch(),
                Driver::Source(_) | Driver::Transform(_) => false,
            })
            .unwrap_or(false)
    };

    if batchable {
        let (chunks, callbacks, units) = {
            let mut w = core.w.borrow_mut();
            let mut chunks = Vec::with_capacity(w.queue.len());
            let mut callbacks = Vec::with_capacity(w.queue.len());
            let mut units = 0;
            let object_mode = w.object_mode;
            while let Some(req) = w.queue.pop_front() {
                units += req.chunk.units(object_mode);
                chunks.push(req.chunk);
                callbacks.push(req.callback);
            }
            (chunks, callbacks, units)
        };
        dispatch_entries(core, chunks, callbacks, units);
    } else {
        loop {
            let next = {
                let mut w = core.w.borrow_mut();
                if w.writing || w.corked > 0 || w.destroyed {
                    None
                } else {
                    w.queue.pop_front()
                }
            };
            let Some(req) = next else { break };
            let units = req.chunk.units(core.w.borrow().object_mode);
            if !dispatch_entries(core, vec![req.chunk], vec![req.callback], units) {
                break;
            }
        }
    }

    core.w.borrow_mut().buffer_processing = false;
    finish_maybe(core, false);
}

/// 销毁/出错时，让所有仍在排队的写以同一个终态错误收场。
pub(crate) fn error_buffer(core: &Rc<StreamCore>) {
    let (entries, err) = {
        let mut w = core.w.borrow_mut();
        if w.queue.is_empty() {
            return;
        }
        let err = w
            .errored
            .clone()
            .unwrap_or_else(|| StreamError::new(codes::STREAM_DESTROYED, "write aborted by destroy"));
        let mut entries = Vec::with_capacity(w.queue.len());
        let object_mode = w.object_mode;
        while let Some(req) = w.queue.pop_front() {
            w.length = w.length.saturating_sub(req.chunk.units(object_mode));
            w.pending_callbacks = w.pending_callbacks.saturating_sub(1);
            entries.push(req.callback);
        }
        (entries, err)
    };
    for cb in entries.into_iter().flatten() {
        cb(Err(err.clone()));
    }
}

/// 解除一层塞停；归零且空闲时冲刷积压。
pub(crate) fn uncork(core: &Rc<StreamCore>) {
    let flush = {
        let mut w = core.w.borrow_mut();
        if w.corked > 0 {
            w.corked -= 1;
        }
        w.corked == 0 && !w.writing
    };
    if flush {
        clear_buffer(core);
    }
}

/// 收尾入口。
pub(crate) fn end(core: &Rc<StreamCore>, chunk: Option<Chunk>, callback: Option<WriteCallback>) {
    if let Some(chunk) = chunk {
        write(core, chunk, None);
    }

    let was_corked = core.w.borrow().corked > 0;
    if was_corked {
        core.w.borrow_mut().corked = 1;
        uncork(core);
    }

    let first_request = {
        let mut w = core.w.borrow_mut();
        if w.errored.is_none() && !w.ending {
            w.ending = true;
            true
        } else {
            false
        }
    };
    let err = if first_request {
        tracing::debug!("writable end requested");
        finish_maybe(core, true);
        core.w.borrow_mut().ended = true;
        None
    } else {
        let w = core.w.borrow();
        if w.finished {
            Some(StreamError::new(codes::ALREADY_FINISHED, "end after finish"))
        } else if w.destroyed {
            Some(StreamError::new(codes::STREAM_DESTROYED, "end on destroyed stream"))
        } else {
            None
        }
    };

    if let Some(cb) = callback {
        let finished = core.w.borrow().finished;
        match err {
            Some(err) => core.scheduler.schedule(move || cb(Err(err))),
            None if finished => core.scheduler.schedule(move || cb(Ok(()))),
            None => core.w.borrow_mut().on_finished.push(cb),
        }
    }
}

/// 收尾条件检查：满足即进入最终钩子 → `"prefinish"` → `"finish"` 链。
pub(crate) fn finish_maybe(core: &Rc<StreamCore>, _sync: bool) {
    let call_final = {
        let mut w = core.w.borrow_mut();
        if need_finish(&w) && !w.final_called {
            w.final_called = true;
            true
        } else {
            false
        }
    };
    if call_final {
        dispatch_final(core);
    }
}

fn dispatch_final(core: &Rc<StreamCore>) {
    let ticket = core.ticket();
    {
        let mut w = core.w.borrow_mut();
        w.pending_callbacks += 1;
        w.final_ticket = Some(ticket);
    }
    let dispatched = if crate::transform::is_transform(core) {
        crate::transform::dispatch_flush(core, ticket)
    } else {
        stream::with_driver(core, |driver| match driver {
            Driver::Sink(sink) => sink.finalize(FinalizeDone::new(core, ticket)),
            Driver::Duplex(duplex) => duplex.finalize(FinalizeDone::new(core, ticket)),
            Driver::Source(_) | Driver::Transform(_) => {}
        })
        .is_some()
    };
    if !dispatched {
        let mut w = core.w.borrow_mut();
        w.final_called = false;
        w.final_ticket = None;
        w.pending_callbacks = w.pending_callbacks.saturating_sub(1);
        drop(w);
        // 仅当驱动是临时借出时才重试；驱动已拆除（销毁竞态）就到此为止。
        if core.driver_busy() {
            let core = Rc::clone(core);
            let sched = core.scheduler.clone();
            sched.schedule(move || finish_maybe(&core, false));
        }
    }
}

/// 最终钩子完成（finalize / transform flush 的共同善后）。
pub(crate) fn finalize_completed(core: &Rc<StreamCore>, ticket: u64, error: Option<StreamError>) {
    {
        let w = core.w.borrow();
        if w.final_ticket != Some(ticket) {
            drop(w);
            lifecycle::error_or_destroy(
                core,
                StreamError::new(codes::COMPLETION_REPLAYED, "stale finalize completion token"),
                false,
            );
            return;
        }
    }
    {
        let mut w = core.w.borrow_mut();
        w.final_ticket = None;
        w.pending_callbacks = w.pending_callbacks.saturating_sub(1);
    }

    match error {
        Some(err) => {
            let callbacks = {
                let mut w = core.w.borrow_mut();
                std::mem::take(&mut w.on_finished)
            };
            for cb in callbacks {
                cb(Err(err.clone()));
            }
            lifecycle::error_or_destroy(core, err, false);
        }
        None => {
            let schedule_finish = {
                let w = core.w.borrow();
                need_finish(&w)
            };
            if schedule_finish {
                core.emit(StreamEvent::Prefinish);
                core.w.borrow_mut().pending_callbacks += 1;
                let core = Rc::clone(core);
                let sched = core.scheduler.clone();
                sched.schedule(move || finish_now(&core));
            }
        }
    }
}

fn finish_now(core: &Rc<StreamCore>) {
    let callbacks = {
        let mut w = core.w.borrow_mut();
        w.pending_callbacks = w.pending_callbacks.saturating_sub(1);
        if w.error_emitted || w.close_emitted {
            return;
        }
        w.finished = true;
        std::mem::take(&mut w.on_finished)
    };
    for cb in callbacks {
        cb(Ok(()));
    }
    tracing::debug!("writable finish emitted");
    core.emit(StreamEvent::Finish);

    let auto = {
        let w = core.w.borrow();
        let r = core.r.borrow();
        w.auto_destroy && r.auto_destroy && (r.end_emitted || !r.readable_role)
    };
    if auto {
        lifecycle::destroy(core, None);
    }
}
