/// Cluster member types.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use uuid::Uuid;

/// Codebase version of a member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct MemberVersion {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
}

impl MemberVersion {
    pub const fn new(major: u8, minor: u8, patch: u8) -> Self {
        Self { major, minor, patch }
    }
}

impl fmt::Display for MemberVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Immutable snapshot of a cluster member, as carried by membership views.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberInfo {
    /// Unique member identifier
    pub id: Uuid,
    /// Address the client connects to
    pub address: SocketAddr,
    pub version: MemberVersion,
    /// Lite members hold no partitions
    pub is_lite_member: bool,
    pub attributes: BTreeMap<String, String>,
}

impl MemberInfo {
    pub fn new(id: Uuid, address: SocketAddr) -> Self {
        Self {
            id,
            address,
            version: MemberVersion::default(),
            is_lite_member: false,
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_version(mut self, version: MemberVersion) -> Self {
        self.version = version;
        self
    }

    pub fn lite(mut self) -> Self {
        self.is_lite_member = true;
        self
    }
}

impl fmt::Display for MemberInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Member [{}] - {}", self.address, self.id)?;
        if self.is_lite_member {
            write!(f, " lite")?;
        }
        Ok(())
    }
}
