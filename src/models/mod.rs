//! Model artifact lifecycle: catalog, fetch, verify, extract, promote.
//!
//! [`ModelManager`] is the entry point; the other modules are the pieces it
//! drives and are public so tools can reuse them directly.

pub mod download;
pub mod extract;
pub mod layout;
pub mod manager;
pub mod manifest;
pub mod state;
pub mod verify;

pub use download::{format_bytes, ContentFetcher};
pub use layout::ResourceLayout;
pub use manager::ModelManager;
pub use manifest::{ArchiveMember, DigestTable, ModelEntry};
pub use state::{DownloadState, ModelEvent, Phase, RequestOutcome};
