//! Infrastructure Layer
//!
//! Contains implementations for external services including:
//! - Database repositories (PostgreSQL)
//! - Pub/sub broker (Redis)
//! - Prometheus metrics

pub mod broker;
pub mod database;
pub mod metrics;
pub mod repositories;
