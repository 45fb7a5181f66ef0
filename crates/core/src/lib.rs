//! `courier-core`: identifiers, names and errors shared by the outbox crates.
//!
//! This crate contains **pure** primitives (no IO, no async).

pub mod entity;
pub mod error;
pub mod id;
pub mod value_object;

pub use entity::Entity;
pub use error::{DomainError, DomainResult};
pub use id::EventId;
pub use value_object::{EventType, RoutingKey, ValueObject};
