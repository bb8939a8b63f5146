//! HTTP admission middleware.

mod layer;

pub use layer::{resolve_identity, AdmissionLayer, AdmissionService, AuthenticatedSubject};
