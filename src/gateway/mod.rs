//! Outbound plumbing shared by every integration: token buckets, credential pools,
//! timeouts and pagination.

pub mod http;
pub mod pagination;
pub mod rate_limit;

pub use http::{Endpoint, Gateway};
pub use pagination::{collect_paginated, paginate, Cursor, Page};
pub use rate_limit::{ClientPool, PoolStrategy, ServiceLimiter};
