//! Layout of everything the command buffer persists.
//!
//! All values are JSON. Keys are plain strings so any [`KvStore`] can hold
//! them without a key codec.
//!
//! [`KvStore`]: tessera_store::KvStore

use crate::archetype::ArchetypeId;
use crate::component::ComponentTypeId;
use crate::entity::EntityId;

/// Next unallocated entity id (`u64`).
pub const NEXT_ENTITY_ID: &str = "ECB:NEXT-ENTITY-ID";

/// Archetype id to sorted component type ids (`BTreeMap<u32, Vec<u32>>`).
pub const ARCHETYPE_TABLE: &str = "ECB:ARCHETYPE-ID-TO-COMPONENT-TYPES";

/// Tick number written when a tick starts its durable write (`u64`).
pub const START_TICK: &str = "ECB:START-TICK";

/// Tick number written when a tick's state commit completes (`u64`).
pub const END_TICK: &str = "ECB:END-TICK";

/// Transactions snapshotted at the start of the in-flight tick.
pub const PENDING_TRANSACTIONS: &str = "ECB:PENDING-TRANSACTIONS";

/// Serialized value of one component on one entity.
pub fn component_value(ctype: ComponentTypeId, entity: EntityId) -> String {
    format!(
        "ECB:COMPONENT-VALUE:TYPE-ID-{}:ENTITY-ID-{}",
        ctype.get(),
        entity.get()
    )
}

/// Ordered list of entities in an archetype (`Vec<u64>`).
pub fn active_entities(archetype: ArchetypeId) -> String {
    format!("ECB:ACTIVE-ENTITY-IDS:ARCHETYPE-ID-{}", archetype.get())
}

/// Archetype currently holding an entity (`u32`).
pub fn entity_archetype(entity: EntityId) -> String {
    format!("ECB:ARCHETYPE-ID:ENTITY-ID-{}", entity.get())
}
