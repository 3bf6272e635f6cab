//! Viewer instance lifecycle and the process-wide registry.
//!
//! A [`registry::Registry`] maps container ids to viewer instances, hands
//! out frozen [`instance::InstanceHandle`] facades, and enforces the
//! global lifecycle rules: at most one viewer per container, monotonically
//! unique instance ids, nothing after global teardown.
//!
//! Error disposition follows the infrastructure/per-page split:
//! registry-level misuse ([`RegistryError`]) and document-level failures
//! ([`LoadError`]) surface to the caller, while per-page render failures
//! stay inside the virtualizer.

pub mod instance;
pub mod options;
pub mod registry;
pub mod services;

pub use instance::{
    AnnotationsFacade, DownloadFacade, EventsFacade, InstanceHandle, InstanceStats, SearchFacade,
};
pub use options::{
    DefaultToolbar, LoadOptions, Toolbar, ToolbarOptions, ViewerFileConfig, ViewerSection,
    discover_defaults, load_defaults_from, resolve_virtualizer_config,
};
pub use registry::{Environment, Registry, RegistryStats, global, init_global};
pub use services::{
    AnnotationService, DownloadService, NoopAnnotations, NoopDownload, NoopSearch, SearchMatch,
    SearchService,
};

use core_provider::ProviderError;
use thiserror::Error;

/// Failures surfaced while opening a document and booting its viewer.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("container {0:?} does not exist on the host surface")]
    ContainerMissing(String),
    #[error("document requires a password")]
    PasswordRequired,
    #[error("document rejected by provider: {0}")]
    Document(#[source] ProviderError),
    #[error("viewer initialization failed: {0}")]
    Internal(String),
}

/// Registry-level failures.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("container {0:?} already hosts a viewer")]
    ContainerBusy(String),
    #[error("no viewer found for {0}")]
    NotFound(String),
    #[error("viewer system was torn down")]
    SystemTornDown,
    #[error(transparent)]
    Load(#[from] LoadError),
}
