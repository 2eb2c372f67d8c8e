use crate::chunk::TextEncoding;

/// 字节流的默认水位线（16 KiB）。
pub const DEFAULT_BYTE_HIGH_WATER_MARK: usize = 16 * 1024;
/// 对象流的默认水位线（16 个条目）。
pub const DEFAULT_OBJECT_HIGH_WATER_MARK: usize = 16;
/// 水位线几何增长的上限（1 GiB / 2^30 条目）。
pub const MAX_HIGH_WATER_MARK: usize = 0x4000_0000;

/// 按计量模式返回默认水位线。
pub fn default_high_water_mark(object_mode: bool) -> usize {
    if object_mode {
        DEFAULT_OBJECT_HIGH_WATER_MARK
    } else {
        DEFAULT_BYTE_HIGH_WATER_MARK
    }
}

/// 消费端一次性索取超过当前水位线时的几何抬升策略：取不小于请求量的
/// 最小 2 的幂，并封顶于 [`MAX_HIGH_WATER_MARK`]。
pub(crate) fn grow_high_water_mark(requested: usize) -> usize {
    if requested >= MAX_HIGH_WATER_MARK {
        MAX_HIGH_WATER_MARK
    } else {
        requested.next_power_of_two()
    }
}

/// 单向流（可读或可写）的构造配置。
///
/// # 契约说明（What）
/// - `object_mode`：计量单位在“不透明条目”与“字节/标量值”之间切换；
/// - `high_water_mark`：软性缓冲上限，`Some(0)` 合法，含义为“永不
///   预取”；`None` 取模式默认值；
/// - `encoding`：可读端字节入流的文本解码模式；
/// - `auto_destroy`：自然完成后自动执行销毁收尾（默认开）；
/// - `emit_close`：销毁/完成后补发 `"close"` 事件（默认开）；
/// - `decode_text`：可写端在字节模式下把文本块编码为字节块（默认开）。
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StreamOptions {
    pub object_mode: bool,
    pub high_water_mark: Option<usize>,
    pub encoding: Option<TextEncoding>,
    pub auto_destroy: bool,
    pub emit_close: bool,
    pub decode_text: bool,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            object_mode: false,
            high_water_mark: None,
            encoding: None,
            auto_destroy: true,
            emit_close: true,
            decode_text: true,
        }
    }
}

impl StreamOptions {
    /// 对象模式快捷构造。
    pub fn object() -> Self {
        Self {
            object_mode: true,
            ..Self::default()
        }
    }

    pub fn with_high_water_mark(mut self, units: usize) -> Self {
        self.high_water_mark = Some(units);
        self
    }

    pub fn with_encoding(mut self, encoding: TextEncoding) -> Self {
        self.encoding = Some(encoding);
        self
    }

    pub fn with_auto_destroy(mut self, enabled: bool) -> Self {
        self.auto_destroy = enabled;
        self
    }

    pub fn with_emit_close(mut self, enabled: bool) -> Self {
        self.emit_close = enabled;
        self
    }

    pub fn with_decode_text(mut self, enabled: bool) -> Self {
        self.decode_text = enabled;
        self
    }

    /// 解析生效的水位线。
    pub(crate) fn resolved_high_water_mark(&self) -> usize {
        self.high_water_mark
            .unwrap_or_else(|| default_high_water_mark(self.object_mode))
    }
}

/// 双工流的构造配置：两侧共享通用开关，各自可覆写水位线与角色。
///
/// # 契约说明（What）
/// - `allow_half_open`：可读侧结束后是否允许可写侧继续写入（默认允许；
///   关闭时可读侧 `"end"` 会在下一个调度刻强制结束可写侧）；
/// - `readable`/`writable`：显式停用某一侧（停用侧永不进入终态流程）；
/// - `readable_high_water_mark`/`writable_high_water_mark` 优先于共享的
///   `high_water_mark`。
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DuplexOptions {
    pub object_mode: bool,
    pub high_water_mark: Option<usize>,
    pub readable_high_water_mark: Option<usize>,
    pub writable_high_water_mark: Option<usize>,
    pub encoding: Option<TextEncoding>,
    pub auto_destroy: bool,
    pub emit_close: bool,
    pub decode_text: bool,
    pub allow_half_open: bool,
    pub readable: bool,
    pub writable: bool,
}

impl Default for DuplexOptions {
    fn default() -> Self {
        Self {
            object_mode: false,
            high_water_mark: None,
            readable_high_water_mark: None,
            writable_high_water_mark: None,
            encoding: None,
            auto_destroy: true,
            emit_close: true,
            decode_text: true,
            allow_half_open: true,
            readable: true,
            writable: true,
        }
    }
}

impl DuplexOptions {
    /// 对象模式快捷构造。
    pub fn object() -> Self {
        Self {
            object_mode: true,
            ..Self::default()
        }
    }

    pub fn with_allow_half_open(mut self, allowed: bool) -> Self {
        self.allow_half_open = allowed;
        self
    }

    pub fn with_high_water_mark(mut self, units: usize) -> Self {
        self.high_water_mark = Some(units);
        self
    }

    pub fn with_readable_high_water_mark(mut self, units: usize) -> Self {
        self.readable_high_water_mark = Some(units);
        self
    }

    pub fn with_writable_high_water_mark(mut self, units: usize) -> Self {
        self.writable_high_water_mark = Some(units);
        self
    }

    pub fn with_auto_destroy(mut self, enabled: bool) -> Self {
        self.auto_destroy = enabled;
        self
    }

    pub fn with_emit_close(mut self, enabled: bool) -> Self {
        self.emit_close = enabled;
        self
    }

    pub fn with_encoding(mut self, encoding: TextEncoding) -> Self {
        self.encoding = Some(encoding);
        self
    }

    pub fn with_readable(mut self, enabled: bool) -> Self {
        self.readable = enabled;
        self
    }

    pub fn with_writable(mut self, enabled: bool) -> Self {
        self.writable = enabled;
        self
    }

    /// 拆解出可读侧配置。
    pub(crate) fn readable_side(&self) -> StreamOptions {
        StreamOptions {
            object_mode: self.object_mode,
            high_water_mark: self.readable_high_water_mark.or(self.high_water_mark),
            encoding: self.encoding,
            auto_destroy: self.auto_destroy,
            emit_close: self.emit_close,
            decode_text: self.decode_text,
        }
    }

    /// 拆解出可写侧配置。
    pub(crate) fn writable_side(&self) -> StreamOptions {
        StreamOptions {
            object_mode: self.object_mode,
            high_water_mark: self.writable_high_water_mark.or(self.high_water_mark),
            encoding: None,
            auto_destroy: self.auto_destroy,
            emit_close: self.emit_close,
            decode_text: self.decode_text,
        }
    }
}
