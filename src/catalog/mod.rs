//! Remote catalog manifests.
//!
//! Every repository stages a `catalog.toml` describing the application it
//! belongs to and the packages it offers. Parsing goes through the
//! `toml_utils` accessors, which consume keys as they go; whatever is left
//! in a table afterwards is unknown and either rejected (strict mode) or
//! warned about (relaxed mode).

pub mod local;

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use tracing::warn;

use crate::context::RunOptions;
use crate::errors::InstallError;
use crate::repository::StagedRepository;
use crate::utils;
use crate::utils::toml_utils::{
    get_array, get_opt_bool, get_opt_string, get_opt_u64, get_string, get_string_list, get_table,
};
use crate::version::Dependency;

pub const CATALOG_FILE: &str = "catalog.toml";

/// Attribute consulted by the resolver for install ordering.
pub const ATTR_INSTALL_PRIORITY: &str = "install-priority";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PackageFlags {
    pub important: bool,
    pub new_component: bool,
    pub default_selected: bool,
    pub virtual_component: bool,
    pub force_install: bool,
    pub remove_before_update: bool,
}

impl PackageFlags {
    fn parse(names: Vec<String>, package: &str) -> Result<Self> {
        let mut flags = Self::default();
        for name in names {
            match name.as_str() {
                "important" => flags.important = true,
                "new-component" => flags.new_component = true,
                "default-selected" => flags.default_selected = true,
                "virtual" => flags.virtual_component = true,
                "force-install" => flags.force_install = true,
                "remove-before-update" => flags.remove_before_update = true,
                other => {
                    anyhow::bail!("unknown flag '{other}' on package '{package}'")
                }
            }
        }
        Ok(flags)
    }
}

/// An operation declared by a package, still unresolved: arguments carry
/// `@Variable@` references until the executor substitutes them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeclaredOperation {
    pub kind: String,
    pub args: Vec<String>,
    pub admin: bool,
}

/// One package as described by a repository catalog.
#[derive(Clone, Debug, PartialEq)]
pub struct PackageRecord {
    pub name: String,
    pub version: String,
    pub release_date: Option<NaiveDate>,
    pub dependencies: Vec<Dependency>,
    pub replaces: Vec<String>,
    pub archives: Vec<String>,
    pub uncompressed_size: u64,
    pub compressed_size: u64,
    pub flags: PackageFlags,
    pub script: Option<String>,
    pub attrs: BTreeMap<String, String>,
    pub operations: Vec<DeclaredOperation>,
}

impl PackageRecord {
    pub fn install_priority(&self) -> i64 {
        self.attrs
            .get(ATTR_INSTALL_PRIORITY)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }
}

/// The parsed contents of one repository catalog.
#[derive(Clone, Debug, PartialEq)]
pub struct RepositoryManifest {
    pub application_name: String,
    pub application_version: String,
    pub checksum_required: bool,
    pub packages: Vec<PackageRecord>,
}

impl RepositoryManifest {
    pub fn load(path: &Path, options: &RunOptions) -> Result<Self> {
        let data = utils::read_file("catalog", path)?;
        Self::parse(&data, path, options)
    }

    pub fn parse(data: &str, path: &Path, options: &RunOptions) -> Result<Self> {
        let value: toml::value::Table =
            toml::from_str(data).map_err(|e| manifest_error(path, data, e))?;
        Self::from_toml(value, path, options)
    }

    fn from_toml(
        table: toml::value::Table,
        path: &Path,
        options: &RunOptions,
    ) -> Result<Self> {
        Self::from_toml_inner(table, options).map_err(|e| structural_error(path, e))
    }

    fn from_toml_inner(mut table: toml::value::Table, options: &RunOptions) -> Result<Self> {
        let application_name = get_string(&mut table, "application-name", "")?;
        let application_version = get_string(&mut table, "application-version", "")?;
        let checksum_required = get_opt_bool(&mut table, "checksum", "")?.unwrap_or(false);

        let mut packages = Vec::new();
        for entry in get_array(&mut table, "package", "")? {
            let toml::Value::Table(pkg) = entry else {
                anyhow::bail!("expected type: 'table' for 'package'");
            };
            packages.push(Self::package_from_toml(pkg, options)?);
        }
        reject_unknown_keys(&table, "", options)?;
        Ok(Self {
            application_name,
            application_version,
            checksum_required,
            packages,
        })
    }

    fn package_from_toml(
        mut table: toml::value::Table,
        options: &RunOptions,
    ) -> Result<PackageRecord> {
        let name = get_string(&mut table, "name", "package.")?;
        let path = format!("package.{name}.");
        let version = get_string(&mut table, "version", &path)?;
        let release_date = match get_opt_string(&mut table, "release-date", &path)? {
            Some(date) => Some(
                NaiveDate::parse_from_str(&date, "%Y-%m-%d")
                    .with_context(|| format!("bad release-date '{date}' on package '{name}'"))?,
            ),
            None => None,
        };
        let dependencies = get_string_list(&mut table, "dependencies", &path)?
            .iter()
            .map(|s| s.parse())
            .collect::<Result<Vec<Dependency>>>()
            .with_context(|| format!("bad dependency on package '{name}'"))?;
        let replaces = get_string_list(&mut table, "replaces", &path)?;
        let archives = get_string_list(&mut table, "archives", &path)?;
        let uncompressed_size = get_opt_u64(&mut table, "uncompressed-size", &path)?.unwrap_or(0);
        let compressed_size = get_opt_u64(&mut table, "compressed-size", &path)?.unwrap_or(0);
        let flags = PackageFlags::parse(get_string_list(&mut table, "flags", &path)?, &name)?;
        let script = get_opt_string(&mut table, "script", &path)?;

        let mut attrs = BTreeMap::new();
        for (k, v) in get_table(&mut table, "attrs", &path)? {
            let toml::Value::String(v) = v else {
                anyhow::bail!("expected type: 'string' for '{path}attrs.{k}'");
            };
            attrs.insert(k, v);
        }

        let mut operations = Vec::new();
        for entry in get_array(&mut table, "operation", &path)? {
            let toml::Value::Table(mut op) = entry else {
                anyhow::bail!("expected type: 'table' for '{path}operation'");
            };
            let op_path = format!("{path}operation.");
            operations.push(DeclaredOperation {
                kind: get_string(&mut op, "kind", &op_path)?,
                args: get_string_list(&mut op, "args", &op_path)?,
                admin: get_opt_bool(&mut op, "admin", &op_path)?.unwrap_or(false),
            });
            reject_unknown_keys(&op, &op_path, options)?;
        }

        reject_unknown_keys(&table, &path, options)?;
        Ok(PackageRecord {
            name,
            version,
            release_date,
            dependencies,
            replaces,
            archives,
            uncompressed_size,
            compressed_size,
            flags,
            script,
            attrs,
            operations,
        })
    }
}

fn reject_unknown_keys(
    table: &toml::value::Table,
    path: &str,
    options: &RunOptions,
) -> Result<()> {
    for key in table.keys() {
        if options.strict_parse {
            anyhow::bail!("unknown key: '{path}{key}'");
        }
        warn!("ignoring unknown catalog key '{path}{key}'");
    }
    Ok(())
}

fn manifest_error(path: &Path, data: &str, error: toml::de::Error) -> anyhow::Error {
    let (line, col) = error
        .span()
        .map(|span| position_of(data, span.start))
        .unwrap_or((0, 0));
    InstallError::Manifest {
        path: path.to_path_buf(),
        line,
        col,
        detail: error.message().to_owned(),
    }
    .into()
}

fn structural_error(path: &Path, error: anyhow::Error) -> anyhow::Error {
    if error.downcast_ref::<InstallError>().is_some() {
        return error;
    }
    InstallError::Manifest {
        path: path.to_path_buf(),
        line: 0,
        col: 0,
        detail: format!("{error:#}"),
    }
    .into()
}

fn position_of(data: &str, offset: usize) -> (usize, usize) {
    let prefix = &data[..offset.min(data.len())];
    let line = prefix.matches('\n').count() + 1;
    let col = prefix.rsplit('\n').next().map(str::len).unwrap_or(0) + 1;
    (line, col)
}

/// Load and merge the catalogs of every staged repository. All
/// repositories in one run must agree on the application; the first
/// occurrence of a package name wins and later duplicates are dropped with
/// a warning.
pub fn load_catalogs(
    staged: &[StagedRepository],
    options: &RunOptions,
) -> Result<(Option<String>, Vec<PackageRecord>)> {
    let mut application: Option<String> = None;
    let mut packages: Vec<PackageRecord> = Vec::new();
    for repo in staged {
        let manifest = RepositoryManifest::load(&repo.manifest_path(), options)?;
        match &application {
            None => application = Some(manifest.application_name.clone()),
            Some(expected) if *expected != manifest.application_name => {
                return Err(InstallError::IncompatibleApplication {
                    expected: expected.clone(),
                    found: manifest.application_name,
                }
                .into());
            }
            Some(_) => {}
        }
        for package in manifest.packages {
            if packages.iter().any(|p| p.name == package.name) {
                warn!(
                    "package '{}' already provided by an earlier repository, skipping",
                    package.name
                );
                continue;
            }
            packages.push(package);
        }
    }
    Ok((application, packages))
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::{load_catalogs, RepositoryManifest};
    use crate::context::RunOptions;
    use crate::errors::InstallError;
    use crate::repository::{Repository, StagedRepository};

    const SAMPLE: &str = r#"
application-name = "SDK"
application-version = "3.1"
checksum = true

[[package]]
name = "org.sdk"
version = "3.1.0"
release-date = "2024-05-01"
flags = ["default-selected"]

[[package]]
name = "org.sdk.tools"
version = "3.1.0"
dependencies = ["org.sdk", "org.base->=1.2"]
replaces = ["org.oldtools"]
archives = ["tools.tar.gz"]
uncompressed-size = 1048576
compressed-size = "262144"
[package.attrs]
install-priority = "-5"

[[package.operation]]
kind = "Mkdir"
args = ["@TargetDir@/logs"]
"#;

    #[test]
    fn parses_a_full_catalog() {
        let m = RepositoryManifest::parse(
            SAMPLE,
            Path::new("catalog.toml"),
            &RunOptions::default(),
        )
        .unwrap();
        assert_eq!(m.application_name, "SDK");
        assert!(m.checksum_required);
        assert_eq!(m.packages.len(), 2);

        let tools = &m.packages[1];
        assert_eq!(tools.dependencies.len(), 2);
        assert_eq!(tools.dependencies[1].name, "org.base");
        assert_eq!(tools.replaces, vec!["org.oldtools"]);
        assert_eq!(tools.uncompressed_size, 1_048_576);
        assert_eq!(tools.compressed_size, 262_144);
        assert_eq!(tools.install_priority(), -5);
        assert_eq!(tools.operations.len(), 1);
        assert_eq!(tools.operations[0].kind, "Mkdir");
        assert!(m.packages[0].flags.default_selected);
    }

    #[test]
    fn syntax_errors_carry_line_and_column() {
        let err = RepositoryManifest::parse(
            "application-name = \"SDK\"\nbroken ===",
            Path::new("catalog.toml"),
            &RunOptions::default(),
        )
        .unwrap_err();
        match err.downcast_ref::<InstallError>() {
            Some(InstallError::Manifest { line, .. }) => assert_eq!(*line, 2),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn strict_mode_rejects_unknown_keys() {
        let data = "application-name = \"SDK\"\napplication-version = \"1\"\nmystery = 1\n";
        let relaxed = RunOptions::default();
        assert!(RepositoryManifest::parse(data, Path::new("c.toml"), &relaxed).is_ok());

        let strict = RunOptions {
            strict_parse: true,
            ..RunOptions::default()
        };
        let err = RepositoryManifest::parse(data, Path::new("c.toml"), &strict).unwrap_err();
        assert!(err.to_string().contains("mystery"));
    }

    #[test]
    fn mismatched_applications_are_rejected() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        std::fs::write(
            dir_a.path().join("catalog.toml"),
            "application-name = \"A\"\napplication-version = \"1\"\n",
        )
        .unwrap();
        std::fs::write(
            dir_b.path().join("catalog.toml"),
            "application-name = \"B\"\napplication-version = \"1\"\n",
        )
        .unwrap();
        let staged = [dir_a.path(), dir_b.path()]
            .into_iter()
            .map(|p| StagedRepository {
                repository: Repository::new(url::Url::from_file_path(p).unwrap()),
                dir: p.to_path_buf(),
            })
            .collect::<Vec<_>>();
        let err = load_catalogs(&staged, &RunOptions::default()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<InstallError>(),
            Some(InstallError::IncompatibleApplication { .. })
        ));
    }
}
