//! State machines layered on top of [`crate::service::Service`] for the
//! bridge's long-lived workflows. Each module's `code` submodule is that
//! workflow's op-code contract -- external, defined by the native service,
//! and illustrative rather than exhaustive (SPEC_FULL.md §4.4).

pub mod build;
pub mod combine;
pub mod derive;
pub mod extract;
