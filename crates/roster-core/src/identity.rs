use crate::error::IdentityError;
use serde::{Deserialize, Serialize};

/// The signed-in user as the presence layer sees it.
///
/// `login_id` is the natural key used to find an existing presence record;
/// `display_name` is written once when the record is created.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub login_id: String,
    pub display_name: String,
}

impl Identity {
    pub fn new(
        login_id: impl Into<String>,
        display_name: impl Into<String>,
    ) -> Result<Self, IdentityError> {
        let login_id = login_id.into().trim().to_string();
        if login_id.is_empty() {
            return Err(IdentityError::MissingKey);
        }
        let mut display_name = display_name.into().trim().to_string();
        if display_name.is_empty() {
            display_name = login_id.clone();
        }
        Ok(Self {
            login_id,
            display_name,
        })
    }

    /// Builds an identity from raw sign-in details.
    ///
    /// The display name prefers the sign-in login id and falls back to the
    /// account username; the natural key prefers the login id and falls back
    /// to the email attribute.
    pub fn from_sign_in(
        login_id: Option<&str>,
        username: &str,
        email: Option<&str>,
    ) -> Result<Self, IdentityError> {
        let login_id = non_empty(login_id);
        let display_name = login_id
            .or_else(|| non_empty(Some(username)))
            .unwrap_or_default();
        let key = login_id
            .or_else(|| non_empty(email))
            .ok_or(IdentityError::MissingKey)?;
        Self::new(key, display_name)
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}
