//! Repository configuration and the fetch seam.
//!
//! The engine never talks HTTP itself. A [`RepositoryFetcher`] turns each
//! configured repository into a staged directory holding the catalog
//! manifest and any data archives; the shipped implementation handles
//! local directories and `file://` URLs, which is also what the test suite
//! uses. A network-backed fetcher plugs in behind the same trait.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use sha2::{Digest, Sha256};
use tracing::{info, warn};
use url::Url;

use crate::catalog::CATALOG_FILE;
use crate::context::{CancelToken, MessagePolicy};
use crate::errors::InstallError;
use crate::utils;

/// One configured repository.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Repository {
    pub url: Url,
    /// Temporary repositories come from the command line and are not
    /// persisted into the maintenance tool's settings.
    pub temporary: bool,
    /// A temporary repository may replace the configured set instead of
    /// extending it.
    pub replace_default: bool,
}

impl Repository {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            temporary: false,
            replace_default: false,
        }
    }
}

/// A repository fetched to local disk: a directory with a catalog manifest
/// and the archives it references.
#[derive(Clone, Debug)]
pub struct StagedRepository {
    pub repository: Repository,
    pub dir: PathBuf,
}

impl StagedRepository {
    pub fn manifest_path(&self) -> PathBuf {
        self.dir.join(CATALOG_FILE)
    }

    pub fn archive_path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    /// Verify `archive` against its `.sha256` sibling, if one is present.
    /// Catalogs that opt into checksums ship one per archive.
    pub fn verify_archive(&self, name: &str) -> Result<()> {
        let archive = self.archive_path(name);
        let digest_file = self.dir.join(format!("{name}.sha256"));
        if !utils::is_file(&digest_file) {
            return Ok(());
        }
        let expected = utils::read_file("checksum", &digest_file)?;
        let expected = expected.split_whitespace().next().unwrap_or("").to_owned();
        let data = utils::read_bytes("archive", &archive)?;
        let calculated = format!("{:x}", Sha256::digest(&data));
        if calculated != expected {
            return Err(InstallError::ChecksumFailed {
                name: name.to_owned(),
                expected,
                calculated,
            }
            .into());
        }
        Ok(())
    }
}

/// The fetch interface. Implementations must observe `cancel` between
/// repositories and abort in-flight transfers when it trips.
pub trait RepositoryFetcher {
    fn fetch(&self, repository: &Repository, cancel: &CancelToken) -> Result<StagedRepository>;
}

/// Fetcher for repositories that are already on local disk.
#[derive(Default)]
pub struct DirectoryFetcher;

impl RepositoryFetcher for DirectoryFetcher {
    fn fetch(&self, repository: &Repository, cancel: &CancelToken) -> Result<StagedRepository> {
        cancel.check()?;
        let dir = local_dir(&repository.url)?;
        if !utils::is_file(&dir.join(CATALOG_FILE)) {
            return Err(InstallError::Network {
                url: repository.url.to_string(),
                detail: format!("no {CATALOG_FILE} in repository"),
            }
            .into());
        }
        Ok(StagedRepository {
            repository: repository.clone(),
            dir,
        })
    }
}

fn local_dir(url: &Url) -> Result<PathBuf> {
    match url.scheme() {
        "file" => url
            .to_file_path()
            .map_err(|_| anyhow!("not a local path: {url}")),
        _ => Err(InstallError::Network {
            url: url.to_string(),
            detail: "only file:// repositories are supported by the built-in fetcher".to_owned(),
        }
        .into()),
    }
}

/// Fetch every repository, letting the user skip broken ones. A skipped
/// repository downgrades to a warning and the run proceeds with what was
/// obtained; refusing the skip propagates the fetch error.
pub fn fetch_all(
    fetcher: &dyn RepositoryFetcher,
    repositories: &[Repository],
    messages: MessagePolicy,
    cancel: &CancelToken,
) -> Result<Vec<StagedRepository>> {
    let mut staged = Vec::with_capacity(repositories.len());
    for repository in repositories {
        cancel.check()?;
        match fetcher.fetch(repository, cancel) {
            Ok(s) => {
                info!("fetched repository {}", repository.url);
                staged.push(s);
            }
            Err(e) if e.downcast_ref::<InstallError>().map(InstallError::is_recoverable)
                == Some(true) =>
            {
                let question =
                    format!("repository {} is unavailable ({e}), continue without it?", repository.url);
                if messages.confirm(&question) {
                    // The accepted skip is the user-ignore path: the run
                    // proceeds with whatever was obtained.
                    let ignored = InstallError::UserIgnore(repository.url.to_string());
                    warn!("{ignored}");
                } else {
                    return Err(e);
                }
            }
            Err(e) => return Err(e),
        }
    }
    Ok(staged)
}

/// Resolve a repository argument: an URL, or a bare filesystem path which
/// is turned into a `file://` URL.
pub fn parse_repository_url(s: &str) -> Result<Url> {
    if let Ok(url) = Url::parse(s) {
        return Ok(url);
    }
    let path = Path::new(s);
    let abs = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };
    Url::from_file_path(&abs).map_err(|_| anyhow!("invalid repository location '{s}'"))
}
