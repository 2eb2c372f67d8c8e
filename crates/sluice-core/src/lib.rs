#![doc = r#"
# sluice-core

## 设计动机（Why）
- **定位**：本 crate 提供一套可组合的推/拉字节与对象流引擎——只读源、
  只写汇、双工与变换四种形态，在单逻辑线程的协作式调度下搬运数据块，
  同时维护有界缓冲、有序停机与一致的错误传播。
- **架构角色**：引擎自身不做任何 IO、不定义线格式、不提供跨线程传输；
  HTTP 分帧、工作线程通道、套接字封装等外围协作者消费本 crate 的
  push/write/end/pipe 契约，在其上各自实现传输语义。
- **设计理念**：把原本隐含的“下一个微任务”显式建模为调度刻
  （[`Scheduler`](sched::Scheduler)），把回调重入的竞态收敛为“恰好一个
  在途操作”的令牌纪律，让多旗标状态机（流动/暂停、塞停/解塞、
  ending/ended/finished、destroyed/errored）的每一次迁移都可被测试驱动。

## 核心契约（What）
- **输入条件**：调用方提供取数/落块/变换等驱动实现（[`driver`] 模块的
  trait），并负责驱动调度器（`run_until_idle`/`tick`）；
- **输出保障**：事件相对次序固定为 `"readable"`* → `"end"` →（兼为可写
  时的 `"finish"`）→ `"close"`，`"error"` 可在任意点抢占且至多发布一次；
  无人监听的 `"error"` 不会被吞掉，而是让 `run_until_idle` 以 `Err` 返回；
- **前置约束**：整套引擎单线程使用（句柄既不 `Send` 也不 `Sync`），
  背压是协作式的——无视 `false` 返回值的生产者可以把缓冲推向无界。

## 实现策略（How）
- **组合而非继承**：双工/变换由一对显式状态半部并列组成，方法逐一
  委托，不存在方法表拼接；
- **单槽令牌**：写、变换、冲刷、构造、收尾等用户钩子一律经按值消费的
  完成令牌回到引擎的单一完成路径，重复完成在类型层面不可表达，陈旧
  票号按协议违规上报；
- **借出纪律**：驱动对象在钩子调用期间整体借出，任何状态借用都不跨越
  用户回调；借出期间的销毁与跨半部派发记账后退避到下一个调度刻。

## 风险与考量（Trade-offs）
- **时序差异**：与参考行为相比，个别跨半部重入场景会多一次调度刻的
  退避（语义不变，时刻数不同）；
- **引用环**：监听闭包可能持有流句柄形成引用环，终态 `"close"` 发布后
  引擎会清空事件总线以切断环路；
- **取消粒度**：引擎内部不提供超时原语，超时策略属于外围协作者。
"#]
#![deny(unsafe_code)]
#![allow(private_bounds)]

mod buffer;
mod chunk;
mod driver;
mod duplex;
mod error;
mod event;
mod finished;
mod lifecycle;
mod options;
mod pipe;
mod readable;
mod sched;
mod sealed;
mod sequence;
mod stream;
mod transform;
mod writable;

pub mod prelude;

pub use buffer::ChunkBuffer;
pub use chunk::{Chunk, TextEncoding};
pub use driver::{
    ConstructDone, DuplexDriver, FinalizeDone, FlushDone, ReadSource, TeardownDone, TransformDone,
    TransformOp, WriteDone, WriteSink,
};
pub use duplex::Duplex;
pub use error::{Result, StreamError, codes};
pub use event::{EventKind, ListenerId, StreamEvent};
pub use finished::{FinishedGuard, FinishedOptions, finished};
pub use options::{
    DEFAULT_BYTE_HIGH_WATER_MARK, DEFAULT_OBJECT_HIGH_WATER_MARK, DuplexOptions,
    MAX_HIGH_WATER_MARK, StreamOptions, default_high_water_mark,
};
pub use pipe::PipeOptions;
pub use readable::{ConsumptionMode, Readable};
pub use sched::Scheduler;
pub use sequence::{Sequence, SequencePoll};
pub use stream::{AsStreamRef, StreamRef};
pub use transform::Transform;
pub use writable::{Writable, WriteCallback};
