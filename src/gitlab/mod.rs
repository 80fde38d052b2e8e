pub mod api;
pub mod client;
pub mod gid;
pub mod hierarchy;
pub mod nodes;
pub mod pagination;
pub mod types;

#[cfg(test)]
pub mod fake;

pub use api::{GitLabApi, NamespaceKind};
pub use client::{GitLabClient, RetryPolicy};
