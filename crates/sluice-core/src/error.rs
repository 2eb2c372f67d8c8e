use std::borrow::Cow;
use std::error::Error;
use std::fmt;
use std::rc::Rc;

/// `StreamError` 是流引擎内所有可观察错误的稳定载体。
///
/// # 设计背景（Why）
/// - 协议违规（如终止后继续写入）、实现回报的故障与提前关闭需要合流为
///   统一的错误码，便于宿主的日志与告警系统做精确分类；
/// - 同一个终止错误必须扇出给每一个尚未完成的写回调，因此错误本体要求
///   可以低成本克隆。
///
/// # 逻辑解析（How）
/// - `code` 始终为 `'static` 字符串，承载稳定语义，取值集中在 [`codes`]；
/// - `message` 面向排障人员；`cause` 以引用计数共享底层原因，克隆仅复制
///   指针，不复制原因本身。
///
/// # 契约说明（What）
/// - **前置条件**：调用方必须使用 [`codes`] 模块或遵循 `<域>.<语义>`
///   约定的自定义码值；
/// - **后置条件**：错误一经记录便不会被后续错误覆盖（先到先得），该
///   策略由各引擎的 `errored` 槽位实施，本类型只负责承载。
///
/// # 设计考量（Trade-offs）
/// - 引擎整体运行在单逻辑线程上，因此原因链使用 `Rc` 而非 `Arc`，错误
///   类型相应地不承诺 `Send`/`Sync`；
/// - 采用 `Cow` 保存消息，静态文案零分配，动态文案按需落堆。
#[derive(Clone, Debug)]
pub struct StreamError {
    code: &'static str,
    message: Cow<'static, str>,
    cause: Option<Rc<dyn Error + 'static>>,
}

impl StreamError {
    /// 构造流引擎错误。
    pub fn new(code: &'static str, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code,
            message: message.into(),
            cause: None,
        }
    }

    /// 附带底层原因并返回新的错误。
    pub fn with_cause(mut self, cause: impl Error + 'static) -> Self {
        self.cause = Some(Rc::new(cause));
        self
    }

    /// 返回稳定错误码。
    pub fn code(&self) -> &'static str {
        self.code
    }

    /// 返回人类可读描述。
    pub fn message(&self) -> &str {
        &self.message
    }

    /// 返回底层原因（若有）。
    pub fn cause(&self) -> Option<&(dyn Error + 'static)> {
        self.cause.as_deref()
    }

    /// 判断错误是否属于给定错误码。
    pub fn is(&self, code: &str) -> bool {
        self.code == code
    }
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl Error for StreamError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.cause.as_deref()
    }
}

/// 框架统一的 `Result` 别名，错误位默认为 [`StreamError`]。
pub type Result<T, E = StreamError> = core::result::Result<T, E>;

/// 稳定错误码全集。
///
/// # 命名约定（What）
/// - 所有码值遵循 `<域>.<语义>` 两段式：`stream.*` 为引擎生命周期错误，
///   `sequence.*` 为序列适配器错误；
/// - 码值一经发布即冻结，语义变化必须新增码值而非复用旧值。
pub mod codes {
    /// 写入端已进入收尾流程后仍收到写请求。
    pub const WRITE_AFTER_END: &str = "stream.write_after_end";
    /// 生产者在宣告数据结束后继续推送。
    pub const PUSH_AFTER_EOF: &str = "stream.push_after_eof";
    /// 终止事件已对外发布后仍试图向缓冲头部回插数据。
    pub const UNSHIFT_AFTER_END: &str = "stream.unshift_after_end";
    /// 流已销毁，操作无法执行。
    pub const STREAM_DESTROYED: &str = "stream.destroyed";
    /// 收尾回调在流已完成后才注册。
    pub const ALREADY_FINISHED: &str = "stream.already_finished";
    /// 同一次挂起操作的完成令牌被重复消费（或消费了陈旧令牌）。
    pub const COMPLETION_REPLAYED: &str = "stream.completion_replayed";
    /// 底层资源在到达终态（finished/ended）之前就关闭了。
    pub const PREMATURE_CLOSE: &str = "stream.premature_close";
    /// 未宣告批量能力的落地端被批量派发（引擎内部约定被绕过）。
    pub const BATCH_UNSUPPORTED: &str = "stream.batch_unsupported";
    /// `"error"` 事件发布时没有任何监听者。
    pub const UNOBSERVED_ERROR: &str = "stream.unobserved_error";
    /// 序列适配器在上一请求未决时收到新请求。
    pub const REQUEST_PENDING: &str = "sequence.request_pending";
    /// 序列迭代在调度器空转时仍未能取得数据。
    pub const SEQUENCE_STALLED: &str = "sequence.stalled";
}
