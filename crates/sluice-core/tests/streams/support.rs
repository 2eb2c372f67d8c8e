//! 集成用例共享的脚手架：事件记录仪与块取值辅助。

use std::cell::RefCell;
use std::rc::Rc;

use sluice_core::prelude::*;

/// 事件/数据记录仪。
pub fn recorder() -> Rc<RefCell<Vec<String>>> {
    Rc::new(RefCell::new(Vec::new()))
}

/// 往记录仪里打标的监听者。
pub fn mark(
    log: &Rc<RefCell<Vec<String>>>,
    name: &'static str,
) -> impl Fn(&StreamEvent) + 'static {
    let log = Rc::clone(log);
    move |_| log.borrow_mut().push(name.to_owned())
}

/// 把块内容取成字符串（字节按 UTF-8 宽松解码，对象条目尝试常见类型）。
pub fn chunk_text(chunk: &Chunk) -> String {
    if let Some(text) = chunk.as_text() {
        return text.to_owned();
    }
    if let Some(bytes) = chunk.as_bytes() {
        return String::from_utf8_lossy(bytes).into_owned();
    }
    chunk
        .downcast_item::<&str>()
        .map(|s| (*s).to_owned())
        .or_else(|| chunk.downcast_item::<String>().map(|s| s.as_str().to_owned()))
        .unwrap_or_default()
}

/// 收集 `"data"` 事件载荷的监听者。
pub fn collect_data(log: &Rc<RefCell<Vec<String>>>) -> impl Fn(&StreamEvent) + 'static {
    let log = Rc::clone(log);
    move |event| {
        if let StreamEvent::Data(chunk) = event {
            log.borrow_mut().push(chunk_text(chunk));
        }
    }
}

/// 无所作为的取数实现（数据全靠测试侧手动推入）。
pub fn idle_source() -> impl ReadSource {
    |_: &Readable| {}
}
