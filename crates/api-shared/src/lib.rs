//! # API Shared
//!
//! Shared definitions for the triage APIs.
//!
//! Contains:
//! - Inbound and outbound DTOs with OpenAPI schemas (`dto` module)
//! - `HealthService`, reporting the configured backends
//!
//! Used by `api-rest` and the `triage` CLI. This crate knows nothing about the core services;
//! conversion from core types happens at the edge that owns both.

pub mod dto;
pub mod health;

/// Request and response header carrying the correlation id.
pub const CORRELATION_ID_HEADER: &str = "x-correlation-id";

pub use dto::{AssessReq, AssessRes, ErrorBody, ErrorDetail, HealthRes};
pub use health::HealthService;
