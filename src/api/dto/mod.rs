//! Data Transfer Objects for REST request/response serialization.

pub mod system_dto;

pub use system_dto::*;
