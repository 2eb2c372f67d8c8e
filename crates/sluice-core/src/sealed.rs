/// 密封标记：阻止 crate 外实现携带内部不变式的公开 trait。
pub(crate) trait Sealed {}
