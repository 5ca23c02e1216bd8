//! Configuration consulted by individual upgrade steps.
//!
//! A few historical steps only act on themed builds of the client, so the
//! same version number can be a no-op or a real mutation depending on the
//! build. That capability is injected here rather than read from ambient
//! state.

/// Build configuration visible to upgrade steps.
#[derive(Debug, Clone, Default)]
pub struct StepContext {
    theme: Option<String>,
}

impl StepContext {
    /// Context for a plain (unthemed) build.
    #[must_use]
    pub fn plain() -> Self {
        Self::default()
    }

    /// Context for a themed build.
    #[must_use]
    pub fn themed(name: impl Into<String>) -> Self {
        Self {
            theme: Some(name.into()),
        }
    }

    /// The active theme name, if this is a themed build.
    #[must_use]
    pub fn theme(&self) -> Option<&str> {
        self.theme.as_deref()
    }
}
