//! Unified error types for ioc

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for ioc operations
#[derive(Error, Debug)]
pub enum Error {
    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Feature not available: {0}")]
    MissingFeature(String),

    // Host errors
    #[error("Unable to determine the host distribution")]
    DistributionUnknown,

    #[error("Unable to determine the host release")]
    HostReleaseUnknown,

    #[error("Unable to determine the host userland version")]
    HostUserlandVersionUnknown,

    #[error("No active ioc source dataset - run activate first")]
    NotActivated,

    #[error("Failed to activate pool '{pool}': {reason}")]
    ActivationFailed { pool: String, reason: String },

    #[error("Invalid source name '{0}'")]
    InvalidSourceName(String),

    #[error("Source '{0}' not found")]
    SourceNotFound(String),

    #[error("sysctl '{name}' failed: {reason}")]
    Sysctl { name: String, reason: String },

    // Config errors
    #[error("Unknown config property '{0}'")]
    UnknownConfigProperty(String),

    #[error("Invalid value for config property '{property}': {reason}")]
    InvalidConfigValue { property: String, reason: String },

    #[error("Invalid address '{0}'")]
    InvalidAddress(String),

    #[error("Invalid MAC address '{0}'")]
    InvalidMacAddress(String),

    #[error("Unknown resource limit '{0}'")]
    ResourceLimitUnknown(String),

    #[error("rctl action failed for '{rule}': {reason}")]
    ResourceLimitActionFailed { rule: String, reason: String },

    #[error("ZFS property config is read-only and cannot be written")]
    ConfigZfsIsNotAllowed,

    // Fstab errors
    #[error("Fstab line at index {0} is auto-generated and has no real index")]
    VirtualFstabLineHasNoRealIndex(usize),

    #[error("An fstab entry for destination '{0}' already exists")]
    FstabDestinationExists(PathBuf),

    // Jail errors
    #[error("Jail '{0}' does not exist")]
    JailDoesNotExist(String),

    #[error("Jail '{0}' already exists")]
    JailAlreadyExists(String),

    #[error("Jail '{0}' is not running")]
    JailNotRunning(String),

    #[error("Jail '{0}' is already running")]
    JailAlreadyRunning(String),

    #[error("No jail matches '{0}'")]
    JailNotFound(String),

    #[error("Identifier '{0}' does not uniquely match a jail")]
    JailUnknownIdentifier(String),

    #[error("Jail '{0}' is a template")]
    JailIsTemplate(String),

    #[error("Jail '{0}' is not a template")]
    JailNotTemplate(String),

    #[error("Invalid jail name '{0}'")]
    InvalidJailName(String),

    #[error("Launching jail '{jail}' failed: {reason}")]
    JailLaunchFailed { jail: String, reason: String },

    #[error("Destroying jail '{jail}' failed: {reason}")]
    JailDestructionFailed { jail: String, reason: String },

    #[error("Command failed in jail '{jail}' (exit {code})")]
    JailCommandFailed { jail: String, code: i32 },

    #[error("Execution in jail '{0}' was aborted")]
    JailExecutionAborted(String),

    #[error("Updating the state of jail '{jail}' failed: {reason}")]
    JailStateUpdateFailed { jail: String, reason: String },

    // Security errors
    #[error("Insecure path '{0}': contains a symlink")]
    InsecureJailPath(PathBuf),

    #[error("Path '{path}' escapes the jail root '{root}'")]
    JailEscape { path: PathBuf, root: PathBuf },

    #[error("Illegal archive member '{0}'")]
    IllegalArchiveContent(String),

    // ZFS errors
    #[error("ZFS operation failed: {0}")]
    Zfs(String),

    #[error("Dataset '{0}' already exists")]
    DatasetExists(String),

    #[error("Dataset '{0}' is not mounted")]
    DatasetNotMounted(String),

    #[error("Dataset '{0}' is not available")]
    DatasetNotAvailable(String),

    #[error("Dataset '{0}' is not attached to the jail")]
    DatasetNotJailed(String),

    #[error("Invalid ZFS pool '{0}'")]
    ZfsPoolInvalid(String),

    #[error("ZFS pool '{0}' is not available")]
    ZfsPoolUnavailable(String),

    #[error("Snapshot creation failed: {0}")]
    SnapshotCreation(String),

    #[error("Snapshot deletion failed: {0}")]
    SnapshotDeletion(String),

    #[error("Snapshot rollback failed: {0}")]
    SnapshotRollback(String),

    #[error("Snapshot '{0}' not found")]
    SnapshotNotFound(String),

    #[error("Invalid snapshot identifier '{0}': expected dataset@name")]
    InvalidSnapshotIdentifier(String),

    // Network errors
    #[error("Network interface '{nic}' has no bridge configured")]
    VnetBridgeMissing { nic: String },

    #[error("Bridge interface '{0}' does not exist")]
    VnetBridgeDoesNotExist(String),

    #[error("Invalid IP address '{0}'")]
    InvalidIpAddress(String),

    #[error("IPFW is disabled on the host but secure VNET mode requires it")]
    FirewallDisabled,

    #[error("ipfw command failed: {0}")]
    FirewallCommandFailure(String),

    // Devfs errors
    #[error("Failed to read devfs rules from '{path}': {reason}")]
    DevfsRuleRead { path: PathBuf, reason: String },

    #[error("Failed to write devfs ruleset: {0}")]
    DevfsRuleWrite(String),

    #[error("Devfs ruleset '{0}' not found")]
    DevfsRulesetNotFound(String),

    // Release errors
    #[error("Release list unavailable from mirror: {0}")]
    ReleaseListUnavailable(String),

    #[error("Hash manifest for release '{0}' is unavailable")]
    ReleaseAssetHashesUnavailable(String),

    #[error("Download failed: {0}")]
    DownloadFailed(String),

    #[error("Asset '{asset}' failed signature verification: expected {expected}, got {actual}")]
    InvalidReleaseAssetSignature {
        asset: String,
        expected: String,
        actual: String,
    },

    #[error("Release '{0}' is not fetched")]
    ReleaseNotFetched(String),

    #[error("Release '{0}' is not supported")]
    UnsupportedRelease(String),

    #[error("No default release could be determined")]
    DefaultReleaseNotFound,

    #[error("Update of '{subject}' failed: {reason}")]
    UpdateFailure { subject: String, reason: String },

    #[error("Updates can only be fetched for -RELEASE distributions, not '{0}'")]
    NonReleaseUpdateFetch(String),

    // Backup errors
    #[error("A backup of '{0}' is already in progress")]
    BackupInProgress(String),

    #[error("Backup source '{0}' does not exist")]
    BackupSourceDoesNotExist(PathBuf),

    #[error("Unknown backup format '{0}'")]
    BackupUnknownFormat(String),

    #[error("Export destination '{0}' already exists")]
    ExportDestinationExists(PathBuf),

    // Subprocess errors
    #[error("Command '{command}' failed: {message}")]
    CommandFailure { command: String, message: String },

    // Pkg errors
    #[error("pkg binary not found on the host")]
    PkgNotFound,

    // Provisioning errors
    #[error("No provisioning source defined for jail '{0}'")]
    UndefinedProvisionerSource(String),

    #[error("Unknown provisioning method '{0}'")]
    UndefinedProvisionerMethod(String),
}

/// Result type alias for ioc operations
pub type Result<T> = std::result::Result<T, Error>;
