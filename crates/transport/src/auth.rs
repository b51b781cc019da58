use snafu::Snafu;

use super::BoxFuture;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum AuthError {
    #[snafu(display("token refresh failed: {message}"))]
    RefreshFailed {
        stage: &'static str,
        message: String,
    },
}

pub type AuthResult<T> = Result<T, AuthError>;

/// Supplies bearer credentials for every outgoing request.
///
/// `refresh_token` is awaited before each network call; implementations that
/// cannot refresh should resolve immediately.
pub trait AuthProvider: Send + Sync {
    fn token(&self) -> Option<String>;
    fn refresh_token<'a>(&'a self) -> BoxFuture<'a, AuthResult<()>>;
}

/// Fixed token, or no token at all for open endpoints.
#[derive(Debug, Clone, Default)]
pub struct StaticToken {
    token: Option<String>,
}

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        let token = token.into().trim().to_string();
        Self {
            token: (!token.is_empty()).then_some(token),
        }
    }

    pub fn anonymous() -> Self {
        Self::default()
    }
}

impl AuthProvider for StaticToken {
    fn token(&self) -> Option<String> {
        self.token.clone()
    }

    fn refresh_token<'a>(&'a self) -> BoxFuture<'a, AuthResult<()>> {
        Box::pin(async { Ok(()) })
    }
}
