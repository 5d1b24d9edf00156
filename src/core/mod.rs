//! Shared building blocks used by both the client and the broker.

pub mod error;
pub mod message;
pub mod subscription;
pub mod topic;
pub mod url;
