use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};

use crate::catalog::Catalog;
use crate::engine::Scope;
use crate::observability::AUTH_FAILURES_TOTAL;

/// Single shared password; the user name only selects the scope.
#[derive(Debug)]
pub struct ChairbookAuthSource {
    password: String,
}

impl ChairbookAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for ChairbookAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        if login.user().as_deref().is_none_or(str::is_empty) {
            metrics::counter!(AUTH_FAILURES_TOTAL).increment(1);
            return Err(PgWireError::UserError(Box::new(ErrorInfo::new(
                "FATAL".into(),
                "28000".into(),
                "user name required".into(),
            ))));
        }
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}

/// A user named after a location manages only that location; anyone else manages all.
pub fn scope_for(user: Option<&str>, catalog: &Catalog) -> Scope {
    match user {
        Some(user) if catalog.location(user).is_some() => Scope::Location(user.to_string()),
        _ => Scope::All,
    }
}
