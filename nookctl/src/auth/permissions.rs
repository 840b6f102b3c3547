//! Role and ownership checks.
//!
//! The `can_*` functions answer a question; the `require_*` functions turn a negative answer
//! into [`Error::InsufficientPermissions`] so handlers can use `?`.

use crate::{
    api::models::users::CurrentUser,
    db::models::families::FamilyDBResponse,
    errors::{Error, Result},
    types::Role,
};

pub fn is_admin(user: &CurrentUser) -> bool {
    user.role == Role::Admin
}

/// Parents create families for themselves; admins may create them for anyone.
pub fn can_create_family(user: &CurrentUser) -> bool {
    matches!(user.role, Role::Parent | Role::Admin)
}

pub fn can_read_family(user: &CurrentUser, family: &FamilyDBResponse) -> bool {
    match user.role {
        Role::Admin => true,
        Role::Parent => family.parent_id == user.id,
        Role::Child => user.family_id == Some(family.id),
    }
}

pub fn can_write_family(user: &CurrentUser, family: &FamilyDBResponse) -> bool {
    match user.role {
        Role::Admin => true,
        Role::Parent => family.parent_id == user.id,
        Role::Child => false,
    }
}

pub fn require_admin(user: &CurrentUser) -> Result<()> {
    if is_admin(user) {
        Ok(())
    } else {
        Err(Error::InsufficientPermissions {
            action: "administer".to_string(),
            resource: "master profiles and sync".to_string(),
        })
    }
}

pub fn require_family_read(user: &CurrentUser, family: &FamilyDBResponse) -> Result<()> {
    if can_read_family(user, family) {
        Ok(())
    } else {
        Err(Error::InsufficientPermissions {
            action: "read".to_string(),
            resource: format!("family {}", family.id),
        })
    }
}

pub fn require_family_write(user: &CurrentUser, family: &FamilyDBResponse) -> Result<()> {
    if can_write_family(user, family) {
        Ok(())
    } else {
        Err(Error::InsufficientPermissions {
            action: "modify".to_string(),
            resource: format!("family {}", family.id),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn family_owned_by(parent_id: Uuid) -> FamilyDBResponse {
        FamilyDBResponse {
            id: Uuid::new_v4(),
            name: "Smiths".to_string(),
            parent_id,
            external_group_ref: Some("grp-1".to_string()),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn user(role: Role, family_id: Option<Uuid>) -> CurrentUser {
        CurrentUser {
            id: Uuid::new_v4(),
            role,
            family_id,
        }
    }

    #[test]
    fn test_parent_owns_only_their_families() {
        let parent = user(Role::Parent, None);
        let own = family_owned_by(parent.id);
        let other = family_owned_by(Uuid::new_v4());

        assert!(can_read_family(&parent, &own));
        assert!(can_write_family(&parent, &own));
        assert!(!can_read_family(&parent, &other));
        assert!(matches!(
            require_family_write(&parent, &other),
            Err(Error::InsufficientPermissions { .. })
        ));
    }

    #[test]
    fn test_child_reads_own_family_only() {
        let family = family_owned_by(Uuid::new_v4());
        let child = user(Role::Child, Some(family.id));
        let stranger = user(Role::Child, Some(Uuid::new_v4()));

        assert!(can_read_family(&child, &family));
        assert!(!can_write_family(&child, &family));
        assert!(!can_read_family(&stranger, &family));
        assert!(!can_create_family(&child));
    }

    #[test]
    fn test_admin_can_do_anything() {
        let admin = user(Role::Admin, None);
        let family = family_owned_by(Uuid::new_v4());

        assert!(can_read_family(&admin, &family));
        assert!(can_write_family(&admin, &family));
        assert!(require_admin(&admin).is_ok());
        assert!(require_admin(&user(Role::Parent, None)).is_err());
    }
}
