//! # datagrid-proto
//!
//! Shared types for the datagrid client connection layer.
//!
//! This crate defines the decoded message model, error types, member and
//! member-group snapshots, the client lifecycle states, and the tunable
//! defaults used by all datagrid client components.

pub mod defaults;
pub mod error;
pub mod groups;
pub mod member;
pub mod message;
pub mod state;

// Re-export commonly used types at the crate root
pub use error::{ClientError, ClientResult, ErrorCode};
pub use groups::MemberGroups;
pub use member::{MemberInfo, MemberVersion};
pub use message::{ClientMessage, Credentials, MessageBody, ServerEvent};
pub use state::ClientState;
