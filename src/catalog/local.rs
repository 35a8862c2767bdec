//! The installed-package catalog kept in the target directory.
//!
//! This is the persistent record of what is on disk: one entry per
//! installed package with its version and last update date. The executor is
//! its only writer. Flushes stage a temporary sibling and rename it into
//! place; when the target directory is not writable by this process the
//! rename is delegated to the elevated helper.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::NaiveDate;
use tracing::{debug, warn};

use crate::context::{AdminRights, MessagePolicy};
use crate::errors::InstallError;
use crate::protocol;
use crate::utils;
use crate::utils::toml_utils::{get_array, get_opt_string, get_string, get_table};

pub const INSTALLED_FILE: &str = "installed.toml";

#[derive(Clone, Debug, PartialEq)]
pub struct InstalledRecord {
    pub name: String,
    pub version: String,
    pub last_update_date: Option<NaiveDate>,
    pub attrs: BTreeMap<String, String>,
}

impl InstalledRecord {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            last_update_date: None,
            attrs: BTreeMap::new(),
        }
    }
}

/// The on-disk store plus its in-memory working copy.
#[derive(Debug)]
pub struct LocalCatalog {
    path: PathBuf,
    records: Vec<InstalledRecord>,
    dirty: bool,
}

impl LocalCatalog {
    /// Load the catalog from `target_dir`, retrying transient read errors
    /// up to `silent_retries` times before asking whether to try again. A
    /// missing file is a fresh target, not an error; a malformed file is
    /// immediately fatal.
    pub fn load(target_dir: &Path, silent_retries: u32, messages: MessagePolicy) -> Result<Self> {
        let path = target_dir.join(INSTALLED_FILE);
        let mut attempts = 0;
        let mut asked = false;
        loop {
            match Self::read(&path) {
                Ok(records) => {
                    return Ok(Self {
                        path,
                        records,
                        dirty: false,
                    });
                }
                Err(e) => {
                    let recoverable = e
                        .downcast_ref::<InstallError>()
                        .map(InstallError::is_recoverable)
                        .unwrap_or(false);
                    if !recoverable {
                        return Err(e);
                    }
                    attempts += 1;
                    if attempts <= silent_retries {
                        debug!("retrying installed-package catalog read ({attempts}): {e}");
                        continue;
                    }
                    // One question, one more round of retries, then give up.
                    if !asked
                        && messages.confirm(&format!(
                            "could not read {}, try again?",
                            path.display()
                        ))
                    {
                        asked = true;
                        attempts = 0;
                        continue;
                    }
                    return Err(e);
                }
            }
        }
    }

    /// An empty store not backed by a real file, for tests that only need
    /// the in-memory view.
    #[cfg(any(test, feature = "test"))]
    pub fn in_memory() -> Self {
        Self {
            path: PathBuf::from(INSTALLED_FILE),
            records: Vec::new(),
            dirty: false,
        }
    }

    fn read(path: &Path) -> Result<Vec<InstalledRecord>> {
        if !utils::path_exists(path) {
            return Ok(Vec::new());
        }
        let data = match std::fs::read_to_string(path) {
            Ok(data) => data,
            Err(e) => {
                return Err(InstallError::LocalCatalog {
                    path: path.to_path_buf(),
                    detail: e.to_string(),
                    recoverable: e.kind() != ErrorKind::InvalidData,
                }
                .into());
            }
        };
        let mut table: toml::value::Table =
            toml::from_str(&data).map_err(|e| InstallError::LocalCatalog {
                path: path.to_path_buf(),
                detail: e.message().to_owned(),
                recoverable: false,
            })?;
        let mut records = Vec::new();
        for entry in get_array(&mut table, "package", "")? {
            let toml::Value::Table(mut pkg) = entry else {
                return Err(InstallError::LocalCatalog {
                    path: path.to_path_buf(),
                    detail: "expected [[package]] tables".to_owned(),
                    recoverable: false,
                }
                .into());
            };
            let name = get_string(&mut pkg, "name", "package.")?;
            let version = get_string(&mut pkg, "version", "package.")?;
            let last_update_date = get_opt_string(&mut pkg, "last-update-date", "package.")?
                .map(|d| NaiveDate::parse_from_str(&d, "%Y-%m-%d"))
                .transpose()
                .with_context(|| format!("bad last-update-date for '{name}'"))?;
            let mut attrs = BTreeMap::new();
            for (k, v) in get_table(&mut pkg, "attrs", "package.")? {
                if let toml::Value::String(v) = v {
                    attrs.insert(k, v);
                }
            }
            records.push(InstalledRecord {
                name,
                version,
                last_update_date,
                attrs,
            });
        }
        Ok(records)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn records(&self) -> &[InstalledRecord] {
        &self.records
    }

    pub fn find(&self, name: &str) -> Option<&InstalledRecord> {
        self.records.iter().find(|r| r.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.find(name).is_some()
    }

    /// Insert or replace the record for `record.name`.
    pub fn insert(&mut self, record: InstalledRecord) {
        self.remove(&record.name);
        self.records.push(record);
        self.dirty = true;
    }

    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.records.len();
        self.records.retain(|r| r.name != name);
        let removed = self.records.len() != before;
        self.dirty |= removed;
        removed
    }

    fn stringify(&self) -> String {
        let mut root = toml::value::Table::new();
        let mut list = toml::value::Array::new();
        for record in &self.records {
            let mut pkg = toml::value::Table::new();
            pkg.insert("name".into(), toml::Value::String(record.name.clone()));
            pkg.insert("version".into(), toml::Value::String(record.version.clone()));
            if let Some(date) = record.last_update_date {
                pkg.insert(
                    "last-update-date".into(),
                    toml::Value::String(date.format("%Y-%m-%d").to_string()),
                );
            }
            if !record.attrs.is_empty() {
                let mut attrs = toml::value::Table::new();
                for (k, v) in &record.attrs {
                    attrs.insert(k.clone(), toml::Value::String(v.clone()));
                }
                pkg.insert("attrs".into(), toml::Value::Table(attrs));
            }
            list.push(toml::Value::Table(pkg));
        }
        root.insert("package".into(), toml::Value::Array(list));
        toml::to_string(&root).expect("catalog table always serializes")
    }

    /// Write the catalog back if anything changed. The rename is retried
    /// through the helper when it fails for lack of rights.
    pub fn flush(&mut self, admin: &mut AdminRights) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            utils::ensure_dir_exists("target", parent)?;
        }
        let staged = utils::sibling_temp_path(&self.path);
        utils::write_bytes("installed catalog", &staged, self.stringify().as_bytes())?;
        match std::fs::rename(&staged, &self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::PermissionDenied => {
                warn!(
                    "no rights to replace {}, delegating to helper",
                    self.path.display()
                );
                self.helper_rename(admin, &staged)?;
            }
            Err(e) => {
                return Err(e).with_context(|| InstallError::WritingFile {
                    name: "installed catalog",
                    path: self.path.clone(),
                });
            }
        }
        self.dirty = false;
        Ok(())
    }

    fn helper_rename(&self, admin: &mut AdminRights, staged: &Path) -> Result<()> {
        let gained = admin.gain()?;
        let result = {
            let channel = admin
                .channel()
                .ok_or_else(|| InstallError::Elevation("helper is not active".into()))?;
            let payload = protocol::encode_strings(&[
                staged.display().to_string(),
                self.path.display().to_string(),
            ]);
            channel.request(protocol::CMD_RENAME, &payload).map(|_| ())
        };
        if gained {
            admin.release();
        }
        result
    }
}
