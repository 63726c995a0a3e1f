//! Roles stored in group logs and the access they grant.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::PermsError;

/// A role as written into a group's role table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Reader,
    Writer,
    Admin,
    /// May append but not read other members' content.
    WriteOnly,
    Revoked,
    ReaderInvite,
    WriterInvite,
    AdminInvite,
}

impl Role {
    pub const fn as_str(self) -> &'static str {
        match self {
            Role::Reader => "reader",
            Role::Writer => "writer",
            Role::Admin => "admin",
            Role::WriteOnly => "writeOnly",
            Role::Revoked => "revoked",
            Role::ReaderInvite => "readerInvite",
            Role::WriterInvite => "writerInvite",
            Role::AdminInvite => "adminInvite",
        }
    }

    pub const fn is_invite(self) -> bool {
        matches!(self, Role::ReaderInvite | Role::WriterInvite | Role::AdminInvite)
    }

    /// The member role an invite hands out.
    pub const fn invite_for(self) -> Option<Role> {
        match self {
            Role::Reader => Some(Role::ReaderInvite),
            Role::Writer => Some(Role::WriterInvite),
            Role::Admin => Some(Role::AdminInvite),
            _ => None,
        }
    }

    /// Roles an invite-holder may grant.
    pub const fn invite_may_grant(self, role: Role) -> bool {
        match self {
            Role::ReaderInvite => matches!(role, Role::Reader),
            Role::WriterInvite => matches!(role, Role::Reader | Role::Writer | Role::WriteOnly),
            Role::AdminInvite => {
                matches!(role, Role::Reader | Role::Writer | Role::WriteOnly | Role::Admin)
            }
            _ => false,
        }
    }

    /// Ordering used when an invite-holder upgrades an existing member.
    pub const fn rank(self) -> u8 {
        match self {
            Role::Revoked => 0,
            Role::ReaderInvite => 1,
            Role::WriteOnly => 2,
            Role::Reader => 3,
            Role::WriterInvite => 4,
            Role::Writer => 5,
            Role::AdminInvite => 6,
            Role::Admin => 7,
        }
    }

    /// Roles that may be inherited by child groups.
    pub const fn is_inheritable(self) -> bool {
        matches!(self, Role::Reader | Role::Writer | Role::Admin | Role::WriteOnly)
    }

    /// Roles the special `everyone` subject may hold.
    pub const fn allowed_for_everyone(self) -> bool {
        matches!(self, Role::Reader | Role::Writer | Role::WriteOnly | Role::Revoked)
    }

    pub const fn access(self) -> Access {
        match self {
            Role::Reader => Access::Read,
            Role::Writer => Access::Write,
            Role::Admin => Access::Admin,
            Role::WriteOnly => Access::WriteOnly,
            Role::Revoked | Role::ReaderInvite | Role::WriterInvite | Role::AdminInvite => {
                Access::NoAccess
            }
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = PermsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "reader" => Role::Reader,
            "writer" => Role::Writer,
            "admin" => Role::Admin,
            "writeOnly" => Role::WriteOnly,
            "revoked" => Role::Revoked,
            "readerInvite" => Role::ReaderInvite,
            "writerInvite" => Role::WriterInvite,
            "adminInvite" => Role::AdminInvite,
            other => return Err(PermsError::InvalidRole(other.to_string())),
        })
    }
}

/// What an agent may do with a value.
///
/// Admin implies write implies read. Write-only may append but not read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Access {
    #[default]
    NoAccess,
    Read,
    WriteOnly,
    Write,
    Admin,
}

impl Access {
    pub const fn can_read(self) -> bool {
        matches!(self, Access::Read | Access::Write | Access::Admin)
    }

    pub const fn can_write(self) -> bool {
        matches!(self, Access::WriteOnly | Access::Write | Access::Admin)
    }

    pub const fn is_admin(self) -> bool {
        matches!(self, Access::Admin)
    }

    /// Combine capabilities granted from several sources.
    pub const fn union(self, other: Access) -> Access {
        let admin = self.is_admin() || other.is_admin();
        let read = self.can_read() || other.can_read();
        let write = self.can_write() || other.can_write();
        match (admin, read, write) {
            (true, _, _) => Access::Admin,
            (false, true, true) => Access::Write,
            (false, false, true) => Access::WriteOnly,
            (false, true, false) => Access::Read,
            (false, false, false) => Access::NoAccess,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_string_roundtrip() {
        for role in [
            Role::Reader,
            Role::Writer,
            Role::Admin,
            Role::WriteOnly,
            Role::Revoked,
            Role::ReaderInvite,
            Role::WriterInvite,
            Role::AdminInvite,
        ] {
            assert_eq!(role.as_str().parse::<Role>().unwrap(), role);
        }
        assert!("owner".parse::<Role>().is_err());
    }

    #[test]
    fn test_access_implications() {
        assert!(Access::Admin.can_write() && Access::Admin.can_read());
        assert!(Access::Write.can_read());
        assert!(Access::WriteOnly.can_write() && !Access::WriteOnly.can_read());
        assert!(!Access::NoAccess.can_read());
    }

    #[test]
    fn test_access_union() {
        assert_eq!(Access::Read.union(Access::WriteOnly), Access::Write);
        assert_eq!(Access::NoAccess.union(Access::Read), Access::Read);
        assert_eq!(Access::Write.union(Access::Admin), Access::Admin);
        assert_eq!(Access::NoAccess.union(Access::NoAccess), Access::NoAccess);
    }

    #[test]
    fn test_invite_grants() {
        assert!(Role::WriterInvite.invite_may_grant(Role::Writer));
        assert!(!Role::WriterInvite.invite_may_grant(Role::Admin));
        assert!(!Role::ReaderInvite.invite_may_grant(Role::Writer));
        assert!(!Role::Admin.invite_may_grant(Role::Reader));
        assert_eq!(Role::Writer.invite_for(), Some(Role::WriterInvite));
    }
}
