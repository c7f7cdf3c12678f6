use std::fmt;

/// An authenticated backend session. Obtained by the application's sign-in flow
/// and handed to the sync and migration engines once available.
#[derive(Clone, PartialEq, Eq)]
pub struct Session {
    user_id: String,
    access_token: String,
}

impl Session {
    pub fn new(user_id: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            access_token: access_token.into(),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn access_token(&self) -> &str {
        &self.access_token
    }
}

// Keep tokens out of logs
impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("user_id", &self.user_id)
            .field("access_token", &"<redacted>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_redacts_token() {
        let session = Session::new("u1", "secret-token");
        let printed = format!("{:?}", session);
        assert!(printed.contains("u1"));
        assert!(!printed.contains("secret-token"));
    }
}
