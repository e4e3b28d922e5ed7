use crate::error::BillingError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Attendant,
}

/// The staff member performing an operation, recorded in audit notes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Staff {
    pub name: String,
    pub role: Role,
}

impl Staff {
    pub fn admin(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            role: Role::Admin,
        }
    }

    pub fn attendant(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            role: Role::Attendant,
        }
    }

    pub fn require_admin(&self, action: &str) -> Result<(), BillingError> {
        match self.role {
            Role::Admin => Ok(()),
            Role::Attendant => Err(BillingError::Unauthorized(format!(
                "only administrators may {action}"
            ))),
        }
    }
}
