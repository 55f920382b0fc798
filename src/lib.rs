pub mod cleaner;
pub mod client;
pub mod package;
pub mod version;

pub use cleaner::{SyncPolicy, list_packages_by_index, remove_packages, wait_for_sync};
pub use client::{DevpiClient, DevpiError, DevpiOps, IndexSettings};
pub use package::{PACKAGE_EXTENSIONS, Package, ParseError};
