//! # Domain Layer
//!
//! The domain layer contains the core business types of the support chat.
//! It is independent of any external frameworks or infrastructure concerns.
//!
//! ## Structure
//!
//! - **entities**: Users (customers and agents) and persisted room records
//! - **value_objects**: Validated room names and participant roles
//!
//! Repository traits define the persistence contracts consumed by agent
//! allocation; they are implemented in the infrastructure layer.

pub mod entities;
pub mod value_objects;

// Re-export commonly used types
pub use entities::*;
pub use value_objects::*;
