use std::any::Any;
use std::fmt;
use std::rc::Rc;

use bytes::Bytes;

/// 流中流动的单元数据。
///
/// # 设计背景（Why）
/// - 引擎同时服务字节流与对象流两种形态：前者以字节数计量缓冲水位，
///   后者以条目数计量；
/// - 字节载荷选用 [`Bytes`]，部分消费时 `split_to` 仅移动引用计数指针，
///   避免缓冲重组阶段的整段复制。
///
/// # 契约说明（What）
/// - `Bytes`：一段连续字节；
/// - `Text`：已按配置编码解码完成的文本，计量单位为标量值（char），
///   保证缓冲拆分永不落在码点中间；
/// - `Item`：对象模式下的不透明条目，引擎不检查其内部结构。
#[derive(Clone)]
pub enum Chunk {
    Bytes(Bytes),
    Text(String),
    Item(Rc<dyn Any>),
}

impl Chunk {
    /// 以不透明对象构造对象模式条目。
    pub fn item<T: Any>(value: T) -> Self {
        Chunk::Item(Rc::new(value))
    }

    /// 返回该块占用的计量单位数。
    ///
    /// 对象模式下任何块都计 1；字节模式下 `Bytes` 计字节数、`Text`
    /// 计标量值数，对象条目退化计 1。
    pub fn units(&self, object_mode: bool) -> usize {
        if object_mode {
            return 1;
        }
        match self {
            Chunk::Bytes(b) => b.len(),
            Chunk::Text(t) => t.chars().count(),
            Chunk::Item(_) => 1,
        }
    }

    /// 判断字节/文本载荷是否为空（对象条目永不为空）。
    pub fn is_empty_payload(&self) -> bool {
        match self {
            Chunk::Bytes(b) => b.is_empty(),
            Chunk::Text(t) => t.is_empty(),
            Chunk::Item(_) => false,
        }
    }

    /// 尝试将对象条目向下转型为具体类型。
    pub fn downcast_item<T: Any>(&self) -> Option<Rc<T>> {
        match self {
            Chunk::Item(item) => Rc::clone(item).downcast::<T>().ok(),
            _ => None,
        }
    }

    /// 取出字节载荷（非字节块返回 `None`）。
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Chunk::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// 取出文本载荷（非文本块返回 `None`）。
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Chunk::Text(t) => Some(t),
            _ => None,
        }
    }
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Chunk::Bytes(b) => f.debug_tuple("Bytes").field(&b.len()).finish(),
            Chunk::Text(t) => f.debug_tuple("Text").field(t).finish(),
            Chunk::Item(_) => f.write_str("Item(..)"),
        }
    }
}

impl From<Bytes> for Chunk {
    fn from(value: Bytes) -> Self {
        Chunk::Bytes(value)
    }
}

impl From<Vec<u8>> for Chunk {
    fn from(value: Vec<u8>) -> Self {
        Chunk::Bytes(Bytes::from(value))
    }
}

impl From<&'static [u8]> for Chunk {
    fn from(value: &'static [u8]) -> Self {
        Chunk::Bytes(Bytes::from_static(value))
    }
}

impl From<String> for Chunk {
    fn from(value: String) -> Self {
        Chunk::Text(value)
    }
}

impl From<&str> for Chunk {
    fn from(value: &str) -> Self {
        Chunk::Text(value.to_owned())
    }
}

/// 可读端文本解码的目标编码。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TextEncoding {
    #[default]
    Utf8,
}

/// 跨块增量 UTF-8 解码器。
///
/// # 逻辑解析（How）
/// - 每次 `write` 将上次遗留的不完整序列与新输入拼接后解码出最长合法
///   前缀；末尾的不完整序列继续滞留，等待后续字节补全；
/// - 中段的非法序列以 U+FFFD 替换后继续推进，解码本身不报错——文本
///   有效性问题不应当打断数据面的流动；
/// - `finish` 在数据结束时冲刷残留：任何未补全的序列整体折叠为一个
///   U+FFFD。
#[derive(Debug, Default)]
pub(crate) struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// 解码一段输入，返回本次可以确定的文本。
    pub(crate) fn write(&mut self, bytes: &[u8]) -> String {
        let mut buf = std::mem::take(&mut self.pending);
        buf.extend_from_slice(bytes);

        let mut out = String::new();
        let mut input = buf.as_slice();
        loop {
            match std::str::from_utf8(input) {
                Ok(text) => {
                    out.push_str(text);
                    break;
                }
                Err(err) => {
                    let valid = err.valid_up_to();
                    if let Ok(text) = std::str::from_utf8(&input[..valid]) {
                        out.push_str(text);
                    }
                    match err.error_len() {
                        Some(bad) => {
                            out.push('\u{FFFD}');
                            input = &input[valid + bad..];
                        }
                        None => {
                            // 末尾序列尚未收齐，滞留到下一次输入。
                            self.pending = input[valid..].to_vec();
                            break;
                        }
                    }
                }
            }
        }
        out
    }

    /// 数据结束时冲刷残留的不完整序列。
    pub(crate) fn finish(&mut self) -> String {
        if self.pending.is_empty() {
            String::new()
        } else {
            self.pending.clear();
            "\u{FFFD}".to_owned()
        }
    }
}
