//! Application Services
//!
//! Business logic services that coordinate domain operations.
//!
//! ## Available Services
//!
//! - **AllocationService**: Agent reservation, release and room lookup

pub mod allocation_service;

pub use allocation_service::{
    Allocation, AllocationError, AllocationService, AllocationServiceImpl,
};
