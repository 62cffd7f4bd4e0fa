//! ioc - FreeBSD jail management library
//!
//! Composes the kernel's isolation primitives into a full jail lifecycle:
//! fetch a release, create a jail from it, start it with VNET networking
//! and mounts, execute commands inside, stop it with complete teardown,
//! back it up, update the release and destroy it again. Every
//! long-running operation reports typed events and rolls back its side
//! effects on failure.
//!
//! The library is invoked per operation and assumes superuser privilege
//! on the FreeBSD host it manages.

pub mod backup;
pub mod config;
pub mod error;
pub mod events;
pub mod fstab;
pub mod host;
pub mod jail;
pub mod network;
pub mod paths;
pub mod rcconf;
pub mod release;
pub mod securetar;
pub mod storage;
pub mod zfs;

pub use backup::{BackupFormat, JailBackup};
pub use config::Config;
pub use error::{Error, Result};
pub use events::{Event, EventRecord, EventStatus, EventType, Scope};
pub use host::{Datasets, Distribution, Host, OsVersion, RootDatasets};
pub use jail::{Jail, StartOptions};
pub use release::{FetchOptions, Release};
pub use zfs::Zfs;
