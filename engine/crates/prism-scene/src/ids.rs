use slotmap::new_key_type;

/// 场景节点的 id，由外部的场景存储分配
///
/// 与句柄不同，id 在节点被移除后仍然可能出现在脏列表里，需要先通过 lookup 解析。
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(pub u64);

new_key_type! { pub struct GeometryHandle; }
new_key_type! { pub struct TextureHandle; }
new_key_type! { pub struct MaterialHandle; }
