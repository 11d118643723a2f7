//! Capability runtime: discovery, loading, remote origins, and the registry.
//!
//! A capability is a named, schema-described unit the orchestration loop may
//! invoke. Capability files are standalone programs speaking a fixed JSON
//! contract over stdin/stdout; the host never evaluates their source in
//! process. See [`process`] for the contract and [`registry`] for the
//! install/uninstall/restore lifecycle.

pub mod error;
pub mod loader;
pub mod origin;
pub mod persist;
pub mod process;
pub mod registry;
pub mod types;

pub use {
    error::RegistryError,
    loader::{CommandInstaller, Loader, PackageInstaller, is_capability_file, missing_package},
    origin::{OriginClient, OriginEndpoints, normalize_origin},
    persist::{OriginRecord, OriginStore, OriginsFile},
    process::{CapabilityDeclaration, DescribeError, ProcessCapability},
    registry::{CapabilityRegistry, OriginStatus, ToggleOutcome},
    types::{Capability, CapabilitySet, CapabilitySummary, ManifestEntry, OriginManifest},
};
