use std::fmt;
use std::rc::{Rc, Weak};

use crate::chunk::Chunk;
use crate::duplex::Duplex;
use crate::error::{Result, StreamError};
use crate::lifecycle;
use crate::readable::Readable;
use crate::stream::StreamCore;
use crate::transform;
use crate::writable;

/// 流身份持有的用户实现槽。
pub(crate) enum Driver {
    Source(Box<dyn ReadSource>),
    Sink(Box<dyn WriteSink>),
    Duplex(Box<dyn DuplexDriver>),
    Transform(Box<dyn TransformOp>),
}

/// 可读流的数据来源契约。
///
/// # 契约说明（What）
/// - [`pull`](ReadSource::pull)：引擎在缓冲低于水位线且没有未决取数时
///   调用，实现通过句柄上的 `push`/`push_end` 交付数据；一次 `pull` 可以
///   同步交付，也可以先返回、稍后再推送——两种节奏引擎都接受；
/// - [`construct`](ReadSource::construct)：可选的异步构造钩子，令牌完成
///   前引擎不取数、销毁被挂起；
/// - [`teardown`](ReadSource::teardown)：销毁收尾钩子，默认把传入错误
///   原样交还（与“销毁即带错终止”的缺省语义一致）。
pub trait ReadSource: 'static {
    /// 异步构造钩子；默认立即完成。
    fn construct(&mut self, done: ConstructDone) {
        done.complete(Ok(()));
    }

    /// 请求更多数据。
    fn pull(&mut self, stream: &Readable);

    /// 销毁收尾钩子；默认把传入错误原样交还。
    fn teardown(&mut self, error: Option<StreamError>, done: TeardownDone) {
        done.complete(match error {
            Some(err) => Err(err),
            None => Ok(()),
        });
    }
}

impl<F> ReadSource for F
where
    F: FnMut(&Readable) + 'static,
{
    fn pull(&mut self, stream: &Readable) {
        self(stream);
    }
}

/// 可写流的落地端契约。
///
/// # 契约说明（What）
/// - [`write`](WriteSink::write)：每次恰好一个在途写；实现必须消费
///   `done` 令牌以宣告完成，早于令牌完成不会有第二次 `write`；
/// - [`write_batch`](WriteSink::write_batch)：仅当
///   [`supports_batch`](WriteSink::supports_batch) 返回 `true` 时，解除
///   塞停（uncork）会把积压写合并为一次批量派发，所有排队回调共享这
///   一个完成令牌的结果；
/// - [`finalize`](WriteSink::finalize)：`"prefinish"` 前的最终钩子，用于
///   冲刷实现侧的收尾数据；
/// - [`teardown`](WriteSink::teardown)：同 [`ReadSource::teardown`]。
pub trait WriteSink: 'static {
    /// 异步构造钩子；默认立即完成。
    fn construct(&mut self, done: ConstructDone) {
        done.complete(Ok(()));
    }

    /// 落一个块。
    fn write(&mut self, chunk: Chunk, done: WriteDone);

    /// 是否支持批量落块。
    fn supports_batch(&self) -> bool {
        false
    }

    /// 批量落块；仅在宣告支持后会被调用。
    fn write_batch(&mut self, chunks: Vec<Chunk>, done: WriteDone) {
        let _ = chunks;
        done.complete(Err(StreamError::new(
            crate::error::codes::BATCH_UNSUPPORTED,
            "sink did not advertise batch support",
        )));
    }

    /// 收尾前的最终钩子；默认立即完成。
    fn finalize(&mut self, done: FinalizeDone) {
        done.complete(Ok(()));
    }

    /// 销毁收尾钩子；默认把传入错误原样交还。
    fn teardown(&mut self, error: Option<StreamError>, done: TeardownDone) {
        done.complete(match error {
            Some(err) => Err(err),
            None => Ok(()),
        });
    }
}

impl<F> WriteSink for F
where
    F: FnMut(Chunk, WriteDone) + 'static,
{
    fn write(&mut self, chunk: Chunk, done: WriteDone) {
        self(chunk, done);
    }
}

/// 双工流驱动：同一个对象同时提供取数与落块两面。
///
/// 与单向契约不同，两类钩子都会拿到流句柄——双工实现通常要把写入的
/// 反应（回显、应答）推回自己的可读侧。
pub trait DuplexDriver: 'static {
    /// 异步构造钩子；默认立即完成。
    fn construct(&mut self, done: ConstructDone) {
        done.complete(Ok(()));
    }

    /// 请求更多可读数据。
    fn pull(&mut self, stream: &Duplex);

    /// 落一个块。
    fn write(&mut self, stream: &Duplex, chunk: Chunk, done: WriteDone);

    /// 是否支持批量落块。
    fn supports_batch(&self) -> bool {
        false
    }

    /// 批量落块；仅在宣告支持后会被调用。
    fn write_batch(&mut self, stream: &Duplex, chunks: Vec<Chunk>, done: WriteDone) {
        let _ = (stream, chunks);
        done.complete(Err(StreamError::new(
            crate::error::codes::BATCH_UNSUPPORTED,
            "sink did not advertise batch support",
        )));
    }

    /// 收尾前的最终钩子；默认立即完成。
    fn finalize(&mut self, done: FinalizeDone) {
        done.complete(Ok(()));
    }

    /// 销毁收尾钩子；默认把传入错误原样交还。
    fn teardown(&mut self, error: Option<StreamError>, done: TeardownDone) {
        done.complete(match error {
            Some(err) => Err(err),
            None => Ok(()),
        });
    }
}

/// 变换流的用户变换契约。
///
/// # 契约说明（What）
/// - [`transform`](TransformOp::transform)：每个写入块经此转换，完成令牌
///   可携带零或一个输出块（推向可读侧）；令牌完成前引擎不接受下一个写；
/// - [`flush`](TransformOp::flush)：最后一个写之后、可读侧收尾之前的冲刷
///   钩子，允许产出尾部输出。
pub trait TransformOp: 'static {
    /// 异步构造钩子；默认立即完成。
    fn construct(&mut self, done: ConstructDone) {
        done.complete(Ok(()));
    }

    /// 变换一个输入块。
    fn transform(&mut self, chunk: Chunk, done: TransformDone);

    /// 尾部冲刷钩子；默认无输出立即完成。
    fn flush(&mut self, done: FlushDone) {
        done.complete(Ok(None));
    }

    /// 销毁收尾钩子；默认把传入错误原样交还。
    fn teardown(&mut self, error: Option<StreamError>, done: TeardownDone) {
        done.complete(match error {
            Some(err) => Err(err),
            None => Ok(()),
        });
    }
}

impl<F> TransformOp for F
where
    F: FnMut(Chunk, TransformDone) + 'static,
{
    fn transform(&mut self, chunk: Chunk, done: TransformDone) {
        self(chunk, done);
    }
}

macro_rules! completion_token {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        pub struct $name {
            core: Weak<StreamCore>,
            ticket: u64,
        }

        impl $name {
            pub(crate) fn new(core: &Rc<StreamCore>, ticket: u64) -> Self {
                Self {
                    core: Rc::downgrade(core),
                    ticket,
                }
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_struct(stringify!($name))
                    .field("ticket", &self.ticket)
                    .finish()
            }
        }
    };
}

completion_token! {
    /// 单次写派发的完成令牌。
    ///
    /// 令牌按值消费，重复完成在类型层面不可表达；完成一张过期票号
    /// （例如伪造或跨派发滞留的令牌）会被当作协议违规上报，而不是
    /// 悄悄破坏在途计数。
    WriteDone
}

impl WriteDone {
    /// 宣告本次写完成。
    pub fn complete(self, result: Result<()>) {
        if let Some(core) = self.core.upgrade() {
            writable::write_completed(&core, self.ticket, result.err());
        }
    }

    /// `complete(Ok(()))` 的简写。
    pub fn ok(self) {
        self.complete(Ok(()));
    }
}

completion_token! {
    /// 最终钩子（finalize/flush 之外的写侧收尾）的完成令牌。
    FinalizeDone
}

impl FinalizeDone {
    /// 宣告最终钩子完成。
    pub fn complete(self, result: Result<()>) {
        if let Some(core) = self.core.upgrade() {
            writable::finalize_completed(&core, self.ticket, result.err());
        }
    }
}

completion_token! {
    /// 异步构造钩子的完成令牌。
    ConstructDone
}

impl ConstructDone {
    /// 宣告构造完成；`Err` 会直接进入销毁流程。
    pub fn complete(self, result: Result<()>) {
        if let Some(core) = self.core.upgrade() {
            lifecycle::construct_completed(&core, self.ticket, result.err());
        }
    }
}

completion_token! {
    /// 销毁收尾钩子的完成令牌。
    TeardownDone
}

impl TeardownDone {
    /// 宣告收尾完成；`Err` 作为终态错误发布。
    pub fn complete(self, result: Result<()>) {
        if let Some(core) = self.core.upgrade() {
            lifecycle::teardown_completed(&core, self.ticket, result.err());
        }
    }
}

completion_token! {
    /// 单次变换的完成令牌，可携带零或一个输出块。
    TransformDone
}

impl TransformDone {
    /// 宣告变换完成。
    pub fn complete(self, result: Result<Option<Chunk>>) {
        if let Some(core) = self.core.upgrade() {
            transform::transform_completed(&core, self.ticket, result);
        }
    }

    /// 携带单个输出块完成的简写。
    pub fn push(self, chunk: impl Into<Chunk>) {
        self.complete(Ok(Some(chunk.into())));
    }

    /// 无输出完成的简写。
    pub fn ok(self) {
        self.complete(Ok(None));
    }
}

completion_token! {
    /// 尾部冲刷钩子的完成令牌，可携带零或一个收尾输出块。
    FlushDone
}

impl FlushDone {
    /// 宣告冲刷完成。
    pub fn complete(self, result: Result<Option<Chunk>>) {
        if let Some(core) = self.core.upgrade() {
            transform::flush_completed(&core, self.ticket, result);
        }
    }
}
