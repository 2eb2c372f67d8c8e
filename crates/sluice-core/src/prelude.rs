//! 常用类型一站式引入：`use sluice_core::prelude::*;`。

pub use crate::buffer::ChunkBuffer;
pub use crate::chunk::{Chunk, TextEncoding};
pub use crate::driver::{
    ConstructDone, DuplexDriver, FinalizeDone, FlushDone, ReadSource, TeardownDone, TransformDone,
    TransformOp, WriteDone, WriteSink,
};
pub use crate::duplex::Duplex;
pub use crate::error::{Result, StreamError, codes};
pub use crate::event::{EventKind, ListenerId, StreamEvent};
pub use crate::finished::{FinishedGuard, FinishedOptions, finished};
pub use crate::options::{DuplexOptions, StreamOptions};
pub use crate::pipe::PipeOptions;
pub use crate::readable::{ConsumptionMode, Readable};
pub use crate::sched::Scheduler;
pub use crate::sequence::{Sequence, SequencePoll};
pub use crate::stream::{AsStreamRef, StreamRef};
pub use crate::transform::Transform;
pub use crate::writable::{Writable, WriteCallback};
