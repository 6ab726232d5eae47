//! Per-invocation context: acting user and cancellation signal.
//!
//! A [`Context`] travels alongside every request through the pipeline. It is
//! cheap to clone: the cancellation token is reference-counted and the user
//! name is a small owned string.

use tokio_util::sync::CancellationToken;

/// Per-invocation context: who is acting, and whether the caller gave up.
#[derive(Debug, Clone, Default)]
pub struct Context {
    user: Option<String>,
    cancel: CancellationToken,
}

impl Context {
    /// Create an anonymous context with a fresh, never-cancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach the acting user's name.
    #[must_use]
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Replace the cancellation token, typically with a child of the
    /// caller's own token.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Returns `true` once the caller has cancelled this invocation.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anonymous_by_default() {
        let ctx = Context::new();
        assert_eq!(ctx.user(), None);
        assert!(!ctx.is_cancelled());
    }

    #[test]
    fn clones_share_cancellation() {
        let token = CancellationToken::new();
        let ctx = Context::new().with_user("alice").with_cancellation(token.clone());
        let copy = ctx.clone();

        token.cancel();

        assert!(ctx.is_cancelled());
        assert!(copy.is_cancelled());
        assert_eq!(copy.user(), Some("alice"));
    }
}
