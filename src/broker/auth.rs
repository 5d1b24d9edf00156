use std::collections::HashSet;

/// Decides whether a `Connect` frame's token may open a session.
pub trait TokenValidator: Send + Sync {
    fn validate(&self, token: Option<&str>) -> bool;
}

/// Accepts every connection, with or without a token.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAnyToken;

impl TokenValidator for AllowAnyToken {
    fn validate(&self, _token: Option<&str>) -> bool {
        true
    }
}

#[derive(Debug, Clone)]
pub struct StaticTokenValidator {
    tokens: HashSet<String>,
}

impl StaticTokenValidator {
    pub fn from_tokens<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tokens: tokens.into_iter().map(Into::into).collect(),
        }
    }
}

impl TokenValidator for StaticTokenValidator {
    fn validate(&self, token: Option<&str>) -> bool {
        token.is_some_and(|t| self.tokens.contains(t))
    }
}
