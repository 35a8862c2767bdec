#![allow(clippy::large_enum_variant)]

use std::path::PathBuf;

use thiserror::Error as ThisError;

/// The error kinds the engine distinguishes. Everything else travels as
/// `anyhow::Error` context around one of these.
#[derive(ThisError, Debug)]
pub enum InstallError {
    #[error("malformed manifest '{}' at line {line}, column {col}: {detail}", .path.display())]
    Manifest {
        path: PathBuf,
        line: usize,
        col: usize,
        detail: String,
    },
    #[error(
        "repository belongs to application '{found}', but this run manages '{expected}'"
    )]
    IncompatibleApplication { expected: String, found: String },
    #[error("could not load installed-package catalog '{}': {detail}", .path.display())]
    LocalCatalog {
        path: PathBuf,
        detail: String,
        recoverable: bool,
    },
    #[error("could not fetch '{url}': {detail}")]
    Network { url: String, detail: String },
    #[error("the user chose to continue without repository '{0}'")]
    UserIgnore(String),
    #[error("operation '{kind}' failed: {detail}")]
    Operation { kind: String, detail: String },
    #[error("administrative rights could not be acquired: {0}")]
    Elevation(String),
    #[error("canceled by user")]
    Canceled,
    #[error("no such operation kind: '{0}'")]
    UnknownOperation(String),
    #[error("invariant violated: {0}")]
    InvariantViolation(String),
    #[error("checksum mismatch for '{name}': expected {expected}, got {calculated}")]
    ChecksumFailed {
        name: String,
        expected: String,
        calculated: String,
    },
    #[error("'{}' is not a maintenance tool image: {detail}", .path.display())]
    BadArtifact { path: PathBuf, detail: String },
    #[error("helper protocol violation: {0}")]
    Protocol(String),
    #[error("could not read {name} file: '{}'", .path.display())]
    ReadingFile { name: &'static str, path: PathBuf },
    #[error("could not write {name} file: '{}'", .path.display())]
    WritingFile { name: &'static str, path: PathBuf },
    #[error("could not create {name} directory: '{}'", .path.display())]
    CreatingDirectory { name: &'static str, path: PathBuf },
    #[error("could not remove {name} '{}'", .path.display())]
    Removing { name: &'static str, path: PathBuf },
    #[error("I/O error")]
    Io(#[from] std::io::Error),
}

impl InstallError {
    /// Whether a retry may reasonably succeed without the user changing
    /// anything. Structural errors are final; transient I/O is not.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::LocalCatalog { recoverable, .. } => *recoverable,
            Self::Network { .. } | Self::Io(_) => true,
            _ => false,
        }
    }

    /// The process exit code this error maps to.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Canceled => 3,
            Self::Manifest { .. }
            | Self::IncompatibleApplication { .. }
            | Self::UnknownOperation(_) => 4,
            _ => 1,
        }
    }
}
