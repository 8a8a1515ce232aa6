// crates/flowcore/src/events/mod.rs

mod base;

pub use base::{step_entity_id, EventBus, ExecutionEvent, Notifier};
