use std::rc::{Rc, Weak};

use crate::buffer::ChunkBuffer;
use crate::chunk::{Chunk, Utf8Decoder};
use crate::driver::{Driver, DuplexDriver, ReadSource};
use crate::error::{StreamError, codes};
use crate::event::{EventKind, ListenerId, StreamEvent};
use crate::lifecycle;
use crate::options::{StreamOptions, grow_high_water_mark};
use crate::pipe::{self, PipeOptions};
use crate::sched::Scheduler;
use crate::sequence::Sequence;
use crate::stream::{self, AsStreamRef, StreamCore, StreamRef};
use crate::writable::{Writable, WritableState};

/// 消费模式：环境流动（`"data"` 订阅推动）、显式拉取或尚未决定。
///
/// 原型实现用 `flowing: null | true | false` 三态布尔承载同一信息；这里
/// 改为显式枚举，避免“订阅即隐式换挡”的含混（换挡动作仍然存在，但都
/// 经过具名入口）。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConsumptionMode {
    /// 尚无消费者表态。
    Undetermined,
    /// 数据以 `"data"` 事件的形式主动推送。
    Ambient,
    /// 消费者通过显式 `read` 拉取。
    Pull,
}

/// 可读半部的全部状态。字段仅由引擎入口变更，消费者不直接触碰。
pub(crate) struct ReadableState {
    pub(crate) buffer: ChunkBuffer,
    pub(crate) length: usize,
    pub(crate) high_water_mark: usize,
    pub(crate) mode: ConsumptionMode,
    /// 显式 `pause`/`resume` 的三态记录（`None` = 从未表态）。
    pub(crate) explicit_pause: Option<bool>,
    pub(crate) ended: bool,
    pub(crate) end_emitted: bool,
    pub(crate) destroyed: bool,
    pub(crate) errored: Option<StreamError>,
    pub(crate) error_emitted: bool,
    pub(crate) closed: bool,
    pub(crate) close_emitted: bool,
    pub(crate) constructed: bool,
    /// 角色开关：单向可写流的可读半部置 `false` 后永远惰性。
    pub(crate) readable_role: bool,
    pub(crate) readable_listening: bool,
    pub(crate) need_readable: bool,
    pub(crate) emitted_readable: bool,
    pub(crate) reading: bool,
    pub(crate) reading_more: bool,
    pub(crate) resume_scheduled: bool,
    /// 位于同步窗口内（构造初期或 `pull` 的同步段），推送必须走缓冲。
    pub(crate) sync: bool,
    pub(crate) object_mode: bool,
    pub(crate) auto_destroy: bool,
    pub(crate) emit_close: bool,
    pub(crate) decoder: Option<Utf8Decoder>,
    pub(crate) pipes: Vec<pipe::PipeEntry>,
    /// 正在等待 `"drain"` 的管道目的地集合。
    pub(crate) await_drain: Vec<Weak<StreamCore>>,
}

impl ReadableState {
    pub(crate) fn new(options: &StreamOptions, readable_role: bool) -> Self {
        Self {
            buffer: ChunkBuffer::new(options.object_mode),
            length: 0,
            high_water_mark: options.resolved_high_water_mark(),
            mode: ConsumptionMode::Undetermined,
            explicit_pause: None,
            ended: false,
            end_emitted: false,
            destroyed: false,
            errored: None,
            error_emitted: false,
            closed: false,
            close_emitted: false,
            constructed: true,
            readable_role,
            readable_listening: false,
            need_readable: false,
            emitted_readable: false,
            reading: false,
            reading_more: false,
            resume_scheduled: false,
            sync: true,
            object_mode: options.object_mode,
            auto_destroy: options.auto_destroy,
            emit_close: options.emit_close,
            decoder: options.encoding.map(|_| Utf8Decoder::new()),
            pipes: Vec::new(),
            await_drain: Vec::new(),
        }
    }
}

/// 可读流句柄。
///
/// # 设计背景（Why）
/// - 推/拉两种消费节奏共存：生产者经 [`push`](Readable::push) 把数据送进
///   引擎，消费者要么订阅 `"data"` 进入环境流动，要么订阅 `"readable"`
///   后显式 [`read`](Readable::read)；
/// - 背压是协作式的：`push` 的返回值告知生产者是否应当继续，引擎从不
///   强行阻塞。
///
/// # 契约说明（What）
/// - 克隆句柄共享同一条流；
/// - 所有终态事件（`"end"`/`"close"`）至少推迟一个调度刻发布，同刻注册
///   的监听者不会错过。
#[derive(Clone)]
pub struct Readable {
    pub(crate) core: Rc<StreamCore>,
}

impl crate::sealed::Sealed for Readable {}

impl AsStreamRef for Readable {
    fn as_stream_ref(&self) -> StreamRef {
        StreamRef {
            core: Rc::clone(&self.core),
        }
    }
}

impl Readable {
    /// 以取数实现构造可读流。
    pub fn new(scheduler: &Scheduler, options: StreamOptions, source: impl ReadSource) -> Self {
        let r = ReadableState::new(&options, true);
        // 惰性半部沿用同一份配置：auto_destroy/emit_close 的策略判定在
        // 两侧之间取或，半部之间不允许分叉。
        let w = WritableState::new(&options, false);
        let core = StreamCore::new(
            scheduler.clone(),
            r,
            w,
            Driver::Source(Box::new(source)),
        );
        lifecycle::start_construct(&core);
        Self { core }
    }

    /// 以迭代器构造可读流：每次取数交付一个条目，耗尽即宣告结束。
    pub fn from_iter<I>(scheduler: &Scheduler, options: StreamOptions, iter: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<Chunk>,
        I::IntoIter: 'static,
    {
        let mut items = iter.into_iter();
        Self::new(scheduler, options, move |stream: &Readable| {
            match items.next() {
                Some(item) => {
                    stream.push(item.into());
                }
                None => {
                    stream.push_end();
                }
            }
        })
    }

    pub(crate) fn from_core(core: Rc<StreamCore>) -> Self {
        Self { core }
    }

    /// 生产者推入一个块；返回 `false` 表示应当停止推送（背压）。
    pub fn push(&self, chunk: impl Into<Chunk>) -> bool {
        add_chunk(&self.core, Some(chunk.into()), false)
    }

    /// 宣告数据结束（等价于原型中的 `push(null)`）。
    pub fn push_end(&self) -> bool {
        add_chunk(&self.core, None, false)
    }

    /// 把数据退回队头（消费者提前取走又归还的场景）。
    pub fn unshift(&self, chunk: impl Into<Chunk>) -> bool {
        add_chunk(&self.core, Some(chunk.into()), true)
    }

    /// 取下一个缓冲块：对象模式取一个条目；字节模式在环境流动下取队头
    /// 块，否则整段物化。没有可交付数据时返回 `None`。
    pub fn read(&self) -> Option<Chunk> {
        read_internal(&self.core, None)
    }

    /// 精确取 `n` 个单位；不足 `n` 且尚未结束时返回 `None`。
    pub fn read_n(&self, n: usize) -> Option<Chunk> {
        read_internal(&self.core, Some(n))
    }

    /// 暂停环境流动。
    pub fn pause(&self) -> &Self {
        pause(&self.core);
        self
    }

    /// 恢复/进入环境流动；同一调度刻内的重复调用只安排一次冲刷。
    pub fn resume(&self) -> &Self {
        resume(&self.core);
        self
    }

    /// 是否处于显式暂停或拉取模式。
    pub fn is_paused(&self) -> bool {
        let r = self.core.r.borrow();
        r.explicit_pause == Some(true) || r.mode == ConsumptionMode::Pull
    }

    /// 接管至目的地，返回目的地句柄以支持链式组合。
    pub fn pipe(&self, dest: &Writable) -> Writable {
        pipe::pipe(self, dest, PipeOptions::default())
    }

    /// 带选项接管（`end: false` 时源结束不会结束目的地）。
    pub fn pipe_with(&self, dest: &Writable, options: PipeOptions) -> Writable {
        pipe::pipe(self, dest, options)
    }

    /// 解除与目的地的接管；`None` 解除全部。
    pub fn unpipe(&self, dest: Option<&Writable>) {
        pipe::unpipe(self, dest);
    }

    /// 幂等销毁。
    pub fn destroy(&self) {
        lifecycle::destroy(&self.core, None);
    }

    /// 以错误销毁。
    pub fn destroy_with(&self, error: StreamError) {
        lifecycle::destroy(&self.core, Some(error));
    }

    /// 注册监听者。订阅本身带有换挡副作用：首个 `"data"` 监听者使流
    /// 进入环境流动（除非已显式暂停），`"readable"` 监听者使流转入
    /// 拉取模式。
    pub fn on(&self, kind: EventKind, handler: impl Fn(&StreamEvent) + 'static) -> ListenerId {
        let id = self.core.bus.on(kind, handler);
        subscription_side_effects(&self.core, kind);
        id
    }

    /// 注册一次性监听者（副作用同 [`on`](Readable::on)）。
    pub fn once(&self, kind: EventKind, handler: impl Fn(&StreamEvent) + 'static) -> ListenerId {
        let id = self.core.bus.once(kind, handler);
        subscription_side_effects(&self.core, kind);
        id
    }

    /// 注销监听者。摘除最后一个 `"readable"` 监听者会在下一个调度刻
    /// 重估消费模式。
    pub fn remove_listener(&self, kind: EventKind, id: ListenerId) -> bool {
        let removed = self.core.bus.remove(id);
        if removed && kind == EventKind::Readable {
            let core = Rc::clone(&self.core);
            self.core
                .scheduler
                .schedule(move || update_consumption_mode(&core));
        }
        removed
    }

    /// 某一事件种类当前的监听者数量。
    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.core.bus.listener_count(kind)
    }

    /// 当前消费模式。
    pub fn flow_mode(&self) -> ConsumptionMode {
        self.core.r.borrow().mode
    }

    /// 缓冲中的单位数。
    pub fn buffered_len(&self) -> usize {
        self.core.r.borrow().length
    }

    /// 当前水位线。
    pub fn high_water_mark(&self) -> usize {
        self.core.r.borrow().high_water_mark
    }

    /// 是否仍可读（未销毁、未出错、终态事件未发布）。
    pub fn is_readable(&self) -> bool {
        let r = self.core.r.borrow();
        r.readable_role && !r.destroyed && !r.error_emitted && !r.end_emitted
    }

    /// 终态 `"end"` 是否已发布。
    pub fn readable_ended(&self) -> bool {
        self.core.r.borrow().end_emitted
    }

    /// 是否已销毁。
    pub fn is_destroyed(&self) -> bool {
        self.core.r.borrow().destroyed
    }

    /// 已记录的终态错误（若有）。
    pub fn errored(&self) -> Option<StreamError> {
        self.core.r.borrow().errored.clone()
    }

    /// 绑定的调度器句柄。
    pub fn scheduler(&self) -> Scheduler {
        self.core.scheduler.clone()
    }

    /// 构造单遍、单消费者的拉取序列。
    pub fn sequence(&self) -> Sequence {
        Sequence::new(self)
    }
}

/// `"data"`/`"readable"` 订阅的换挡副作用。
pub(crate) fn subscription_side_effects(core: &Rc<StreamCore>, kind: EventKind) {
    match kind {
        EventKind::Data => {
            let go = {
                let mut r = core.r.borrow_mut();
                r.readable_listening = core.bus.listener_count(EventKind::Readable) > 0;
                r.mode != ConsumptionMode::Pull
            };
            if go {
                resume(core);
            }
        }
        EventKind::Readable => {
            let action = {
                let mut r = core.r.borrow_mut();
                if !r.end_emitted && !r.readable_listening {
                    r.readable_listening = true;
                    r.need_readable = true;
                    r.mode = ConsumptionMode::Pull;
                    r.emitted_readable = false;
                    if r.length > 0 {
                        Some(true)
                    } else if !r.reading {
                        Some(false)
                    } else {
                        None
                    }
                } else {
                    None
                }
            };
            match action {
                Some(true) => emit_readable(core),
                Some(false) => {
                    let core = Rc::clone(core);
                    let sched = core.scheduler.clone();
                    sched.schedule(move || {
                        read_internal(&core, Some(0));
                    });
                }
                None => {}
            }
        }
        _ => {}
    }
}

/// 摘除 `"readable"` 监听者后的消费模式重估。
pub(crate) fn update_consumption_mode(core: &Rc<StreamCore>) {
    enum Next {
        Resume,
        None,
    }
    let next = {
        let mut r = core.r.borrow_mut();
        r.readable_listening = core.bus.listener_count(EventKind::Readable) > 0;
        if r.resume_scheduled && r.explicit_pause == Some(false) {
            r.mode = ConsumptionMode::Ambient;
            Next::None
        } else if core.bus.listener_count(EventKind::Data) > 0 {
            Next::Resume
        } else {
            if !r.readable_listening {
                r.mode = ConsumptionMode::Undetermined;
            }
            Next::None
        }
    };
    if matches!(next, Next::Resume) {
        resume(core);
    }
}

/// 生产者入口（push/unshift/push_end 的共同实现）。
pub(crate) fn add_chunk(core: &Rc<StreamCore>, chunk: Option<Chunk>, front: bool) -> bool {
    match chunk {
        None => {
            core.r.borrow_mut().reading = false;
            on_eof_chunk(core);
        }
        Some(raw) => {
            enum Verdict {
                Deliver(Chunk),
                EmptySkip { kick: bool },
                Reject,
                UnshiftAfterEnd,
                PushAfterEof,
            }
            let verdict = {
                let mut r = core.r.borrow_mut();
                // 解码配置存在时，字节块先过增量解码器。
                let chunk = if let Some(decoder) = &mut r.decoder
                    && let Chunk::Bytes(bytes) = &raw
                {
                    Chunk::Text(decoder.write(bytes))
                } else {
                    raw
                };
                if front {
                    if r.end_emitted {
                        Verdict::UnshiftAfterEnd
                    } else if r.destroyed || r.errored.is_some() {
                        Verdict::Reject
                    } else if !r.object_mode && chunk.is_empty_payload() {
                        Verdict::EmptySkip { kick: false }
                    } else {
                        Verdict::Deliver(chunk)
                    }
                } else if r.ended {
                    Verdict::PushAfterEof
                } else if r.destroyed || r.errored.is_some() {
                    Verdict::Reject
                } else {
                    r.reading = false;
                    if !r.object_mode && chunk.is_empty_payload() {
                        Verdict::EmptySkip { kick: true }
                    } else {
                        Verdict::Deliver(chunk)
                    }
                }
            };
            match verdict {
                Verdict::Deliver(chunk) => add(core, chunk, front),
                Verdict::EmptySkip { kick } => {
                    if kick {
                        maybe_pull_more(core);
                    }
                }
                Verdict::Reject => return false,
                Verdict::UnshiftAfterEnd => {
                    lifecycle::error_or_destroy(
                        core,
                        StreamError::new(codes::UNSHIFT_AFTER_END, "unshift after end event"),
                        false,
                    );
                }
                Verdict::PushAfterEof => {
                    lifecycle::error_or_destroy(
                        core,
                        StreamError::new(codes::PUSH_AFTER_EOF, "push after end of data"),
                        false,
                    );
                }
            }
        }
    }

    let r = core.r.borrow();
    !r.ended && (r.length < r.high_water_mark || r.length == 0)
}

/// 入缓冲或走环境流动快路径。
fn add(core: &Rc<StreamCore>, chunk: Chunk, front: bool) {
    let deliver_now = {
        let r = core.r.borrow();
        r.mode == ConsumptionMode::Ambient
            && r.length == 0
            && !r.sync
            && core.bus.listener_count(EventKind::Data) > 0
    };
    if deliver_now {
        core.r.borrow_mut().await_drain.clear();
        core.emit(StreamEvent::Data(chunk));
    } else {
        let need = {
            let mut r = core.r.borrow_mut();
            r.length += chunk.units(r.object_mode);
            if front {
                r.buffer.unshift(chunk);
            } else {
                r.buffer.push(chunk);
            }
            r.need_readable
        };
        if need {
            emit_readable(core);
        }
    }
    maybe_pull_more(core);
}

/// 数据结束信号：冲刷解码器残留，此后 `push` 均为协议违规。
fn on_eof_chunk(core: &Rc<StreamCore>) {
    let sync = {
        let mut r = core.r.borrow_mut();
        if r.ended {
            return;
        }
        if let Some(decoder) = &mut r.decoder {
            let tail = decoder.finish();
            if !tail.is_empty() {
                let units = Chunk::Text(tail.clone()).units(r.object_mode);
                r.buffer.push(Chunk::Text(tail));
                r.length += units;
            }
        }
        r.ended = true;
        tracing::debug!(buffered = r.length, "readable reached end of data");
        r.sync
    };
    if sync {
        emit_readable(core);
    } else {
        {
            let mut r = core.r.borrow_mut();
            r.need_readable = false;
            r.emitted_readable = true;
        }
        emit_readable_now(core);
    }
}

/// 调度一次去抖的 `"readable"` 发布。
pub(crate) fn emit_readable(core: &Rc<StreamCore>) {
    let schedule = {
        let mut r = core.r.borrow_mut();
        r.need_readable = false;
        if r.emitted_readable {
            false
        } else {
            r.emitted_readable = true;
            true
        }
    };
    if schedule {
        let core = Rc::clone(core);
        let sched = core.scheduler.clone();
        sched.schedule(move || emit_readable_now(&core));
    }
}

fn emit_readable_now(core: &Rc<StreamCore>) {
    let do_emit = {
        let r = core.r.borrow();
        !r.destroyed && r.errored.is_none() && (r.length > 0 || r.ended)
    };
    if do_emit {
        core.emit(StreamEvent::Readable);
    }
    {
        let mut r = core.r.borrow_mut();
        r.emitted_readable = false;
        r.need_readable = r.mode != ConsumptionMode::Ambient
            && !r.ended
            && r.length <= r.high_water_mark;
    }
    flow(core);
}

/// 环境流动的排空循环。
pub(crate) fn flow(core: &Rc<StreamCore>) {
    loop {
        if core.r.borrow().mode != ConsumptionMode::Ambient {
            break;
        }
        if read_internal(core, None).is_none() {
            break;
        }
    }
}

/// 缓冲低于水位线时调度一轮补充取数。
pub(crate) fn maybe_pull_more(core: &Rc<StreamCore>) {
    let schedule = {
        let mut r = core.r.borrow_mut();
        if !r.reading_more && r.constructed {
            r.reading_more = true;
            true
        } else {
            false
        }
    };
    if schedule {
        let core = Rc::clone(core);
        let sched = core.scheduler.clone();
        sched.schedule(move || maybe_pull_more_now(&core));
    }
}

fn maybe_pull_more_now(core: &Rc<StreamCore>) {
    loop {
        let (go, before) = {
            let r = core.r.borrow();
            (
                !r.reading
                    && !r.ended
                    && (r.length < r.high_water_mark
                        || (r.mode == ConsumptionMode::Ambient && r.length == 0)),
                r.length,
            )
        };
        if !go {
            break;
        }
        read_internal(core, Some(0));
        if core.r.borrow().length == before {
            break;
        }
    }
    core.r.borrow_mut().reading_more = false;
}

/// 显式暂停：换入拉取模式并同步发布 `"pause"`。
pub(crate) fn pause(core: &Rc<StreamCore>) {
    let emit = {
        let mut r = core.r.borrow_mut();
        let was = r.mode;
        if was != ConsumptionMode::Pull {
            r.mode = ConsumptionMode::Pull;
        }
        r.explicit_pause = Some(true);
        was != ConsumptionMode::Pull
    };
    if emit {
        core.emit(StreamEvent::Pause);
    }
}

/// 进入环境流动；冲刷动作去抖到至多一次调度刻。
pub(crate) fn resume(core: &Rc<StreamCore>) {
    let schedule = {
        let mut r = core.r.borrow_mut();
        if r.mode != ConsumptionMode::Ambient {
            // 存在 "readable" 监听者时保持拉取模式，但仍需安排一次冲刷。
            r.mode = if r.readable_listening {
                ConsumptionMode::Pull
            } else {
                ConsumptionMode::Ambient
            };
        }
        r.explicit_pause = Some(false);
        if r.resume_scheduled {
            false
        } else {
            r.resume_scheduled = true;
            true
        }
    };
    if schedule {
        let core = Rc::clone(core);
        let sched = core.scheduler.clone();
        sched.schedule(move || resume_now(&core));
    }
}

fn resume_now(core: &Rc<StreamCore>) {
    if !core.r.borrow().reading {
        read_internal(core, Some(0));
    }
    core.r.borrow_mut().resume_scheduled = false;
    core.emit(StreamEvent::Resume);
    flow(core);
    let again = {
        let r = core.r.borrow();
        r.mode == ConsumptionMode::Ambient && !r.reading
    };
    if again {
        read_internal(core, Some(0));
    }
}

/// `read` 请求最终能交付多少单位。
fn how_much_to_read(n: Option<usize>, r: &ReadableState) -> usize {
    if n == Some(0) || (r.length == 0 && r.ended) {
        return 0;
    }
    if r.object_mode {
        return 1;
    }
    match n {
        None => {
            if r.mode == ConsumptionMode::Ambient && r.length > 0 {
                r.buffer.first_units()
            } else {
                r.length
            }
        }
        Some(n) => {
            if n <= r.length {
                n
            } else if r.ended {
                r.length
            } else {
                0
            }
        }
    }
}

/// 从缓冲中物化读取结果。
fn from_list(r: &mut ReadableState, n: usize) -> Option<Chunk> {
    if r.length == 0 {
        return None;
    }
    if r.object_mode {
        return r.buffer.shift();
    }
    let as_text = r.decoder.is_some();
    if n >= r.length {
        r.buffer.consume(r.length, as_text)
    } else {
        r.buffer.consume(n, as_text)
    }
}

/// `read`/`read_n` 的核心状态机。
pub(crate) fn read_internal(core: &Rc<StreamCore>, n: Option<usize>) -> Option<Chunk> {
    let n_orig = n;

    // 阶段一：水位线抬升与零读捷径。
    enum Shortcut {
        EndNow,
        EmitNow,
        NoneNow,
        Continue(usize),
    }
    let shortcut = {
        let mut r = core.r.borrow_mut();
        if let Some(req) = n
            && req > r.high_water_mark
        {
            let grown = grow_high_water_mark(req);
            tracing::trace!(from = r.high_water_mark, to = grown, "high water mark raised");
            r.high_water_mark = grown;
        }
        if n != Some(0) {
            r.emitted_readable = false;
        }
        if n == Some(0)
            && r.need_readable
            && ((if r.high_water_mark != 0 {
                r.length >= r.high_water_mark
            } else {
                r.length > 0
            }) || r.ended)
        {
            if r.length == 0 && r.ended {
                Shortcut::EndNow
            } else {
                Shortcut::EmitNow
            }
        } else {
            let units = how_much_to_read(n, &r);
            if units == 0 && r.ended {
                if r.length == 0 {
                    Shortcut::EndNow
                } else {
                    Shortcut::NoneNow
                }
            } else {
                Shortcut::Continue(units)
            }
        }
    };
    let mut units = match shortcut {
        Shortcut::EndNow => {
            end_readable(core);
            return None;
        }
        Shortcut::EmitNow => {
            emit_readable(core);
            return None;
        }
        Shortcut::NoneNow => return None,
        Shortcut::Continue(units) => units,
    };

    // 阶段二：必要时触发取数（同一时刻至多一个未决取数）。
    let do_pull = {
        let mut r = core.r.borrow_mut();
        let mut do_pull = r.need_readable;
        if r.length == 0 || r.length.saturating_sub(units) < r.high_water_mark {
            do_pull = true;
        }
        if r.ended || r.reading || r.destroyed || r.errored.is_some() || !r.constructed {
            do_pull = false;
        }
        if do_pull {
            r.reading = true;
            r.sync = true;
            if r.length == 0 {
                r.need_readable = true;
            }
        }
        do_pull
    };
    if do_pull {
        call_pull(core);
        let mut r = core.r.borrow_mut();
        r.sync = false;
        // 同步交付过数据的话，按最新缓冲重新核算可取量。
        if !r.reading {
            units = how_much_to_read(n_orig, &r);
        }
    }

    // 阶段三：物化与收尾核算。
    let (ret, trigger_end) = {
        let mut r = core.r.borrow_mut();
        let ret = if units > 0 { from_list(&mut r, units) } else { None };
        match &ret {
            None => {
                r.need_readable = r.length <= r.high_water_mark;
                units = 0;
            }
            Some(_) => {
                r.length -= units;
                r.await_drain.clear();
            }
        }
        let mut trigger_end = false;
        if r.length == 0 {
            if !r.ended {
                r.need_readable = true;
            }
            let mismatch = match n_orig {
                None => true,
                Some(req) => req != units,
            };
            if mismatch && r.ended {
                trigger_end = true;
            }
        }
        (ret, trigger_end)
    };
    if trigger_end {
        end_readable(core);
    }
    if let Some(chunk) = &ret {
        core.emit(StreamEvent::Data(chunk.clone()));
    }
    ret
}

/// 借出驱动执行一次取数钩子。
fn call_pull(core: &Rc<StreamCore>) {
    if crate::transform::is_transform(core) {
        crate::transform::pull_release(core);
        return;
    }
    let dispatched = stream::with_driver(core, |driver| match driver {
        Driver::Source(source) => source.pull(&Readable::from_core(Rc::clone(core))),
        Driver::Duplex(duplex) => {
            duplex.pull(&crate::duplex::Duplex::from_core(Rc::clone(core)));
        }
        Driver::Sink(_) | Driver::Transform(_) => {}
    });
    if dispatched.is_none() {
        // 驱动被借出（跨半部重入）或已拆除：退避到下一个调度刻重试。
        core.r.borrow_mut().reading = false;
        let core = Rc::clone(core);
        let sched = core.scheduler.clone();
        sched.schedule(move || {
            if !core.r.borrow().destroyed {
                read_internal(&core, Some(0));
            }
        });
    }
}

/// 终态 `"end"` 的一次性调度（缓冲必须先排空）。
pub(crate) fn end_readable(core: &Rc<StreamCore>) {
    let schedule = {
        let mut r = core.r.borrow_mut();
        if r.end_emitted {
            false
        } else {
            r.ended = true;
            true
        }
    };
    if schedule {
        let core = Rc::clone(core);
        let sched = core.scheduler.clone();
        sched.schedule(move || end_readable_tick(&core));
    }
}

fn end_readable_tick(core: &Rc<StreamCore>) {
    // 最后一刻的 unshift 会让缓冲重新非空，此时静默放弃本次发布。
    let emit = {
        let mut r = core.r.borrow_mut();
        if !r.error_emitted && !r.close_emitted && !r.end_emitted && r.length == 0 {
            r.end_emitted = true;
            true
        } else {
            false
        }
    };
    if !emit {
        return;
    }
    tracing::debug!("readable end emitted");
    core.emit(StreamEvent::End);

    // 半开策略与自然完成后的自动销毁。
    enum After {
        ForceEndWritable,
        AutoDestroy,
        Nothing,
    }
    let after = {
        let r = core.r.borrow();
        let w = core.w.borrow();
        let writable_active =
            w.writable_role && !w.ending && !w.destroyed && w.errored.is_none();
        if writable_active && !core.allow_half_open.get() {
            After::ForceEndWritable
        } else if r.auto_destroy && w.auto_destroy && (w.finished || !w.writable_role) {
            After::AutoDestroy
        } else {
            After::Nothing
        }
    };
    match after {
        After::ForceEndWritable => {
            let core = Rc::clone(core);
            let sched = core.scheduler.clone();
            sched.schedule(move || {
                let still_writable = {
                    let w = core.w.borrow();
                    w.writable_role && !w.ending && !w.destroyed && w.errored.is_none()
                };
                if still_writable {
                    crate::writable::end(&core, None, None);
                }
            });
        }
        After::AutoDestroy => lifecycle::destroy(core, None),
        After::Nothing => {}
    }
}
