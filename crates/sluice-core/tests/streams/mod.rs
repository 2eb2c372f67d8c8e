//! 流引擎端到端行为套件。
//!
//! # 教案级注释概览
//!
//! - **核心目标 (Why)**：以公开 API 驱动完整的事件时序（`"readable"` →
//!   `"end"` → `"finish"` → `"close"`，`"error"` 任意点抢占），验证背压、
//!   半开、塞停合批、销毁扇出等跨模块协作行为；单模块内部不变式由各
//!   文件内的 `#[cfg(test)]` 单元测试负责，这里只走外部契约。
//! - **驱动方式 (How)**：所有用例显式驱动调度器（`run_until_idle`/
//!   `tick`），事件以字符串记录仪收集后断言相对次序，而非绝对时刻。
//! - **边界 (What)**：不触碰内部状态字段；观察面仅限事件、getter 与
//!   回调实参。

mod support;

mod duplex;
mod finished;
mod pipe;
mod readable;
mod sequence;
mod transform;
mod writable;
