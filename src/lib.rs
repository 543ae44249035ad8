//! # Support Chat Library
//!
//! Real-time customer support chat:
//! - agent allocation that matches each customer with one free agent
//! - room broadcast engine relaying messages between participants across
//!   server processes through a Redis pub/sub broker
//! - WebSocket gateway and operational HTTP endpoints
//! - PostgreSQL for users and conversation records
//!
//! ## Architecture
//!
//! The crate follows Clean Architecture principles:
//!
//! - **Domain Layer**: Users, room records, value objects and repository traits
//! - **Application Layer**: Agent allocation service
//! - **Infrastructure Layer**: Database, broker, repositories and metrics
//! - **Presentation Layer**: WebSocket gateway, rooms and HTTP handlers
//!
//! ## Module Structure
//!
//! ```text
//! support_chat/
//! +-- config/         Configuration management
//! +-- domain/         Domain entities, value objects, and traits
//! +-- application/    Allocation service
//! +-- infrastructure/ Database, broker, repositories, metrics
//! +-- presentation/   HTTP routes, WebSocket gateway and rooms
//! +-- shared/         Common utilities (errors)
//! ```

// Configuration module
pub mod config;

// Domain layer - Core business logic
pub mod domain;

// Application layer - Business services
pub mod application;

// Infrastructure layer - External implementations
pub mod infrastructure;

// Presentation layer - HTTP and WebSocket handlers
pub mod presentation;

// Shared utilities
pub mod shared;

// Application startup and state management
pub mod startup;

// Telemetry and observability
pub mod telemetry;
