//! Caller identity and rate-limit key construction.

use std::fmt;

/// Who is making a request, as far as admission control cares.
///
/// An authenticated subject always wins over the network origin, so a
/// signed-in caller keeps one window no matter where they connect from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    /// Authenticated subject id, if the request carried valid credentials
    pub subject: Option<String>,
    /// Network origin of the request (usually the client IP)
    pub origin: String,
}

impl Identity {
    /// Identity of an anonymous caller.
    pub fn anonymous(origin: impl Into<String>) -> Self {
        Self {
            subject: None,
            origin: origin.into(),
        }
    }

    /// Identity of an authenticated caller.
    pub fn authenticated(subject: impl Into<String>, origin: impl Into<String>) -> Self {
        Self {
            subject: Some(subject.into()),
            origin: origin.into(),
        }
    }

    /// The scope this identity is keyed under.
    pub fn scope(&self) -> IdentityScope<'_> {
        match &self.subject {
            Some(subject) => IdentityScope::Subject(subject),
            None => IdentityScope::Origin(&self.origin),
        }
    }

    /// Scoped key for this identity: `subject:<id>` or `origin:<origin>`.
    pub fn resolve_key(&self) -> String {
        self.scope().to_string()
    }
}

/// The half of an [`Identity`] that names its admission window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityScope<'a> {
    Subject(&'a str),
    Origin(&'a str),
}

impl fmt::Display for IdentityScope<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdentityScope::Subject(id) => write!(f, "subject:{id}"),
            IdentityScope::Origin(origin) => write!(f, "origin:{origin}"),
        }
    }
}
