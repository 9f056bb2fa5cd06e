// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for BitBurrow

use std::net::Ipv4Addr;

use thiserror::Error;

/// Result type alias for BitBurrow operations
pub type Result<T> = std::result::Result<T, BurrowError>;

/// Operational errors: reported to the operator with context, then a non-zero exit
#[derive(Error, Debug)]
pub enum BurrowError {
    /// Store file exists but could not be parsed
    #[error("Failed to parse config store '{path}': {message}")]
    StoreParse { path: String, message: String },

    /// Invalid configuration contents
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    /// Record carried a tag outside the fixed tag table
    #[error("Unknown record tag '{tag}'")]
    UnknownTag { tag: String },

    /// Record carried a known tag, but not the one expected here
    #[error("Expected a '{expected}' record, found '{found}'")]
    UnexpectedTag { expected: String, found: String },

    /// Coterie module failed to parse
    #[error("Failed to parse coterie module '{module}': {message}")]
    ModuleParse { module: String, message: String },

    /// Coterie module failed validation
    #[error("Invalid coterie module '{module}': {message}")]
    InvalidModule { module: String, message: String },

    /// Module requested by id does not exist in the source
    #[error("Coterie module not found: {id}")]
    ModuleNotFound { id: String },

    /// The same coterie id appears in more than one selected module
    #[error("Coterie '{id}' is declared by both '{first}' and '{second}'")]
    DuplicateCoterie {
        id: String,
        first: String,
        second: String,
    },

    /// Payload placeholder could not be resolved
    #[error("Coterie '{coterie}': unresolved placeholder '{{{name}}}'")]
    UnresolvedPlaceholder { coterie: String, name: String },

    /// A required remote command failed while applying a coterie
    #[error("Coterie '{coterie}' failed: command `{command}` exited with status {status}: {stderr}")]
    CoterieFailed {
        coterie: String,
        command: String,
        status: i32,
        stderr: String,
    },

    /// Subnet scan found no live host
    #[error("No router candidates found on attached networks")]
    NoCandidates,

    /// More than one plausible router; the operator must choose
    #[error("Multiple router candidates found: {}; use --router-address to choose", .candidates.join(", "))]
    MultipleCandidates { candidates: Vec<String> },

    /// No scanned SSID matched a known or factory network
    #[error("No supported network visible (seen: {})", .seen.join(", "))]
    NoSupportedNetwork { seen: Vec<String> },

    /// More than one scanned SSID matched
    #[error("Multiple possible networks: {}", .ssids.join(", "))]
    MultipleNetworks { ssids: Vec<String> },

    /// Router at a known address could not be reached
    #[error("Router at {ip} is unreachable: {message}")]
    Unreachable { ip: Ipv4Addr, message: String },

    /// SSH host key does not match the pinned fingerprint
    #[error("Host key mismatch at {ip}: expected {expected}, got {actual}; refusing to continue")]
    HostKeyMismatch {
        ip: Ipv4Addr,
        expected: String,
        actual: String,
    },

    /// Neither SSH nor telnet produced a root shell
    #[error("Bootstrap of {ip} failed: {message}; factory-reset the router and try again")]
    BootstrapFailed { ip: Ipv4Addr, message: String },

    /// Our key was installed, yet key authentication still fails
    #[error("Router at {ip} did not accept the managed SSH key")]
    KeyRejected { ip: Ipv4Addr },

    /// Operation needs a router that is not in the store
    #[error("Router not known: {message}")]
    RouterNotKnown { message: String },

    /// Provider id not in the registry
    #[error("Unknown provider: {id}")]
    UnknownProvider { id: String },

    /// A local helper program failed
    #[error("Local command `{command}` failed: {message}")]
    LocalCommand { command: String, message: String },

    /// Remote transport failure (not a command exit status)
    #[error("Remote session error: {message}")]
    Session { message: String },

    /// Credential generation or hashing failure
    #[error("Credential error: {message}")]
    Credential { message: String },

    /// Self-check fixture disagreed with its known answer
    #[error("Self-check '{fixture}' failed: {message}")]
    SelfCheck { fixture: String, message: String },

    /// IO error wrapper
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// TOML parsing error
    #[error("TOML parse error: {0}")]
    TomlError(#[from] toml::de::Error),

    /// TOML serialization error
    #[error("TOML serialize error: {0}")]
    TomlSerError(#[from] toml::ser::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// libssh2 error
    #[error("SSH error: {0}")]
    SshError(#[from] ssh2::Error),

    /// Invalid regular expression in a wifi table
    #[error("Invalid pattern: {0}")]
    RegexError(#[from] regex::Error),
}

/// A required remote command exited non-zero.
///
/// Internal to the coterie executor and the bootstrap runner; always converted
/// into [`BurrowError::CoterieFailed`] or [`BurrowError::BootstrapFailed`]
/// before it leaves the library.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("`{command}` exited with status {status}: {stderr}")]
pub struct RemoteCommandError {
    pub command: String,
    pub status: i32,
    pub stderr: String,
}

impl RemoteCommandError {
    /// Attach the coterie id, producing the operator-facing error
    pub fn into_coterie_error(self, coterie: &str) -> BurrowError {
        BurrowError::CoterieFailed {
            coterie: coterie.to_string(),
            command: self.command,
            status: self.status,
            stderr: self.stderr.trim().to_string(),
        }
    }
}
