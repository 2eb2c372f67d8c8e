use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::chunk::Chunk;
use crate::error::StreamError;
use crate::stream::StreamRef;

/// 流对外发布的具名事件。
///
/// 载荷随事件种类而定：`Data` 携带块本体，`Error` 携带错误，
/// `Pipe`/`Unpipe` 携带对端流的标识句柄，其余事件为纯信号。
#[derive(Debug)]
pub enum StreamEvent {
    Data(Chunk),
    Error(StreamError),
    End,
    Finish,
    Prefinish,
    Close,
    Drain,
    Readable,
    Pause,
    Resume,
    Pipe(StreamRef),
    Unpipe(StreamRef),
}

impl StreamEvent {
    /// 返回事件的订阅判别种类。
    pub fn kind(&self) -> EventKind {
        match self {
            StreamEvent::Data(_) => EventKind::Data,
            StreamEvent::Error(_) => EventKind::Error,
            StreamEvent::End => EventKind::End,
            StreamEvent::Finish => EventKind::Finish,
            StreamEvent::Prefinish => EventKind::Prefinish,
            StreamEvent::Close => EventKind::Close,
            StreamEvent::Drain => EventKind::Drain,
            StreamEvent::Readable => EventKind::Readable,
            StreamEvent::Pause => EventKind::Pause,
            StreamEvent::Resume => EventKind::Resume,
            StreamEvent::Pipe(_) => EventKind::Pipe,
            StreamEvent::Unpipe(_) => EventKind::Unpipe,
        }
    }
}

/// 订阅用的事件种类判别值。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    Data,
    Error,
    End,
    Finish,
    Prefinish,
    Close,
    Drain,
    Readable,
    Pause,
    Resume,
    Pipe,
    Unpipe,
}

/// 监听者句柄，用于解除订阅。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ListenerId(u64);

struct ListenerEntry {
    id: ListenerId,
    kind: EventKind,
    once: bool,
    spent: Cell<bool>,
    removed: Cell<bool>,
    handler: Rc<dyn Fn(&StreamEvent)>,
}

/// 最小具名事件发布/订阅原语，每个流都在其上构建。
///
/// # 设计背景（Why）
/// - 事件分发必须是同步且按注册顺序进行的，流引擎的大量时序约定
///   （例如管道协调器的前置错误钩子）都建立在这一点上；
/// - 回调里注册/注销监听者、甚至再次触发事件都是常态，分发过程不能
///   持有注册表借用。
///
/// # 逻辑解析（How）
/// - 分发前对匹配条目做快照：分发期间新增的监听者只影响后续事件，
///   被移除的监听者通过 `removed` 标记跳过；
/// - `once` 条目在调用前即标记消费并摘除，重入触发同一事件也至多命中
///   一次；
/// - 处理函数为不可失败的 `Fn`——异常传播语义在本引擎中被显式取消，
///   `"error"` 事件无人监听时的特殊处理由引擎层负责（见调度器的未观察
///   错误槽）。
///
/// # 契约说明（What）
/// - `emit` 返回实际调用的监听者数量，调用方据此判断事件是否被观察；
/// - `prepend` 注册的监听者先于既有监听者收到事件。
pub struct EventBus {
    listeners: RefCell<Vec<Rc<ListenerEntry>>>,
    next_id: Cell<u64>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            listeners: RefCell::new(Vec::new()),
            next_id: Cell::new(1),
        }
    }

    fn register(&self, kind: EventKind, once: bool, front: bool, handler: Rc<dyn Fn(&StreamEvent)>) -> ListenerId {
        let id = ListenerId(self.next_id.get());
        self.next_id.set(self.next_id.get() + 1);
        let entry = Rc::new(ListenerEntry {
            id,
            kind,
            once,
            spent: Cell::new(false),
            removed: Cell::new(false),
            handler,
        });
        let mut listeners = self.listeners.borrow_mut();
        if front {
            listeners.insert(0, entry);
        } else {
            listeners.push(entry);
        }
        id
    }

    /// 注册持续监听者。
    pub fn on(&self, kind: EventKind, handler: impl Fn(&StreamEvent) + 'static) -> ListenerId {
        self.register(kind, false, false, Rc::new(handler))
    }

    /// 注册一次性监听者。
    pub fn once(&self, kind: EventKind, handler: impl Fn(&StreamEvent) + 'static) -> ListenerId {
        self.register(kind, true, false, Rc::new(handler))
    }

    /// 注册插队监听者，先于既有监听者收到事件。
    pub fn prepend(&self, kind: EventKind, handler: impl Fn(&StreamEvent) + 'static) -> ListenerId {
        self.register(kind, false, true, Rc::new(handler))
    }

    /// 注销监听者；不存在时返回 `false`。
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.borrow_mut();
        let before = listeners.len();
        listeners.retain(|entry| {
            if entry.id == id {
                entry.removed.set(true);
                false
            } else {
                true
            }
        });
        listeners.len() != before
    }

    /// 某一事件种类当前的监听者数量。
    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.listeners
            .borrow()
            .iter()
            .filter(|entry| entry.kind == kind && !entry.removed.get())
            .count()
    }

    /// 同步分发事件，返回实际调用的监听者数量。
    pub fn emit(&self, event: &StreamEvent) -> usize {
        let kind = event.kind();
        let snapshot: Vec<Rc<ListenerEntry>> = self
            .listeners
            .borrow()
            .iter()
            .filter(|entry| entry.kind == kind)
            .cloned()
            .collect();

        let mut called = 0;
        for entry in snapshot {
            if entry.removed.get() {
                continue;
            }
            if entry.once {
                if entry.spent.replace(true) {
                    continue;
                }
                self.remove(entry.id);
            }
            (entry.handler)(event);
            called += 1;
        }
        called
    }

    /// 注销全部监听者（销毁收尾时切断监听闭包持有的引用环）。
    pub fn clear(&self) {
        let mut listeners = self.listeners.borrow_mut();
        for entry in listeners.iter() {
            entry.removed.set(true);
        }
        listeners.clear();
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
