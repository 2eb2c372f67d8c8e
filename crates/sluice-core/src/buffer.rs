use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};

use crate::chunk::Chunk;

/// 待投递块的有序缓冲。
///
/// # 设计背景（Why）
/// - 可读引擎需要一个头尾都能 O(1) 进出的待投递序列，且部分消费
///   （一次 `read(n)` 只取走头块的一部分）必须把剩余部分原位留在队头；
/// - 字节块基于 [`Bytes`]，拆分头块只移动引用计数，不发生字节复制；
///   整段物化（`consume`/`concat`）至多进行一次汇总拷贝。
///
/// # 契约说明（What）
/// - 计量单位由构造时的对象模式决定：对象条目计 1，字节块计字节，
///   文本块计标量值（详见 [`Chunk::units`]）；
/// - [`consume`](ChunkBuffer::consume) 保证：除非缓冲耗尽，返回的单位
///   数恰好等于请求数；
/// - 本类型不维护总水位，水位由引擎状态机自己记账。
#[derive(Debug, Default)]
pub struct ChunkBuffer {
    chunks: VecDeque<Chunk>,
    object_mode: bool,
}

impl ChunkBuffer {
    /// 按计量模式创建空缓冲。
    pub fn new(object_mode: bool) -> Self {
        Self {
            chunks: VecDeque::new(),
            object_mode,
        }
    }

    /// 追加到队尾。
    pub fn push(&mut self, chunk: Chunk) {
        self.chunks.push_back(chunk);
    }

    /// 回插到队头（数据被提前归还时使用）。
    pub fn unshift(&mut self, chunk: Chunk) {
        self.chunks.push_front(chunk);
    }

    /// 取出队头块。
    pub fn shift(&mut self) -> Option<Chunk> {
        self.chunks.pop_front()
    }

    /// 清空缓冲。
    pub fn clear(&mut self) {
        self.chunks.clear();
    }

    /// 缓冲内块数（非单位数）。
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// 是否为空。
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// 队头块的单位数（空缓冲计 0）。
    pub fn first_units(&self) -> usize {
        self.chunks
            .front()
            .map_or(0, |chunk| chunk.units(self.object_mode))
    }

    /// 以单位计的总量。
    pub fn total_units(&self) -> usize {
        self.chunks
            .iter()
            .map(|chunk| chunk.units(self.object_mode))
            .sum()
    }

    /// 移除恰好 `n` 个单位并物化为一个块，必要时拆分队头。
    ///
    /// 对象模式下退化为 [`shift`](ChunkBuffer::shift)：对象条目没有可再
    /// 细分的单位。字节/文本模式下，`as_text` 决定物化目标：文本路径
    /// 按标量值计数拼接（夹杂的字节块按 UTF-8 宽松解码），字节路径把
    /// 文本块按 UTF-8 编码并入。
    pub fn consume(&mut self, n: usize, as_text: bool) -> Option<Chunk> {
        if self.object_mode {
            return self.shift();
        }
        if n == 0 || self.chunks.is_empty() {
            return None;
        }

        // 单块覆盖请求时走免拷贝捷径。
        if let Some(Chunk::Bytes(first)) = self.chunks.front_mut()
            && !as_text
            && first.len() >= n
        {
            let taken = first.split_to(n);
            if first.is_empty() {
                self.chunks.pop_front();
            }
            return Some(Chunk::Bytes(taken));
        }

        if as_text {
            let mut out = String::new();
            let mut remaining = n;
            while remaining > 0 {
                let Some(chunk) = self.chunks.pop_front() else { break };
                match chunk {
                    Chunk::Text(text) => {
                        let available = text.chars().count();
                        if available <= remaining {
                            remaining -= available;
                            out.push_str(&text);
                        } else {
                            let split_at = text
                                .char_indices()
                                .nth(remaining)
                                .map_or(text.len(), |(idx, _)| idx);
                            out.push_str(&text[..split_at]);
                            self.chunks.push_front(Chunk::Text(text[split_at..].to_owned()));
                            remaining = 0;
                        }
                    }
                    Chunk::Bytes(bytes) => {
                        let mut bytes = bytes;
                        let take = bytes.len().min(remaining);
                        let taken = bytes.split_to(take);
                        out.push_str(&String::from_utf8_lossy(&taken));
                        remaining -= take;
                        if !bytes.is_empty() {
                            self.chunks.push_front(Chunk::Bytes(bytes));
                        }
                    }
                    Chunk::Item(item) => {
                        // 对象条目不参与文本物化，原样退回并停止。
                        self.chunks.push_front(Chunk::Item(item));
                        break;
                    }
                }
            }
            Some(Chunk::Text(out))
        } else {
            let mut out = BytesMut::with_capacity(n);
            let mut remaining = n;
            while remaining > 0 {
                let Some(chunk) = self.chunks.pop_front() else { break };
                match chunk {
                    Chunk::Bytes(mut bytes) => {
                        let take = bytes.len().min(remaining);
                        out.extend_from_slice(&bytes.split_to(take));
                        remaining -= take;
                        if !bytes.is_empty() {
                            self.chunks.push_front(Chunk::Bytes(bytes));
                        }
                    }
                    Chunk::Text(text) => {
                        let available = text.chars().count();
                        if available <= remaining {
                            remaining -= available;
                            out.extend_from_slice(text.as_bytes());
                        } else {
                            let split_at = text
                                .char_indices()
                                .nth(remaining)
                                .map_or(text.len(), |(idx, _)| idx);
                            out.extend_from_slice(text[..split_at].as_bytes());
                            self.chunks.push_front(Chunk::Text(text[split_at..].to_owned()));
                            remaining = 0;
                        }
                    }
                    Chunk::Item(item) => {
                        self.chunks.push_front(Chunk::Item(item));
                        break;
                    }
                }
            }
            Some(Chunk::Bytes(out.freeze()))
        }
    }

    /// 物化前 `n` 个单位为一个块，但不移除任何数据。
    pub fn concat(&self, n: usize, as_text: bool) -> Option<Chunk> {
        if self.chunks.is_empty() || n == 0 {
            return None;
        }
        if as_text {
            let mut out = String::new();
            let mut remaining = n;
            for chunk in &self.chunks {
                if remaining == 0 {
                    break;
                }
                match chunk {
                    Chunk::Text(text) => {
                        for ch in text.chars().take(remaining) {
                            out.push(ch);
                            remaining -= 1;
                        }
                    }
                    Chunk::Bytes(bytes) => {
                        let take = bytes.len().min(remaining);
                        out.push_str(&String::from_utf8_lossy(&bytes[..take]));
                        remaining -= take;
                    }
                    Chunk::Item(_) => break,
                }
            }
            Some(Chunk::Text(out))
        } else {
            let mut out = BytesMut::with_capacity(n);
            let mut remaining = n;
            for chunk in &self.chunks {
                if remaining == 0 {
                    break;
                }
                match chunk {
                    Chunk::Bytes(bytes) => {
                        let take = bytes.len().min(remaining);
                        out.extend_from_slice(&bytes[..take]);
                        remaining -= take;
                    }
                    Chunk::Text(text) => {
                        let split_at = text
                            .char_indices()
                            .nth(remaining)
                            .map_or(text.len(), |(idx, _)| idx);
                        out.extend_from_slice(text[..split_at].as_bytes());
                        remaining = remaining.saturating_sub(text.chars().count());
                    }
                    Chunk::Item(_) => break,
                }
            }
            Some(Chunk::Bytes(out.freeze()))
        }
    }
}
