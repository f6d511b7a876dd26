//! Shared foundation of the Flotilla fleet manager: the entity data model,
//! the declarative object store everything communicates through, the
//! work-queue controller runtime, and the small pure helpers (naming,
//! hashing, manifest codec) the rest of the workspace builds on.

pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod labels;
pub mod manifest;
pub mod names;
pub mod patch;
pub mod selector;
pub mod store;

// External re-exports, so dependent crates agree on versions.
pub use k8s_openapi;
pub use kube;
