//! The maintenance tool command line.
//!
//! The same binary is the installer, the updater, the package manager and
//! the uninstaller: the marker embedded in its own image decides the
//! default run mode, and the mode flags override it. A hidden flag turns
//! the process into the elevated helper server instead.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::artifact;
use crate::catalog::local::LocalCatalog;
use crate::catalog::{load_catalogs, CATALOG_FILE};
use crate::component::{resolver, ComponentStore};
use crate::context::{AdminRights, MessagePolicy, RunContext, RunMode, RunStatus};
use crate::errors::InstallError;
use crate::executor::Executor;
use crate::helper;
use crate::hooks::NoHooks;
use crate::journal::Journal;
use crate::operation::OperationRegistry;
use crate::progress::{NullProgress, ProgressSink};
use crate::repository::{fetch_all, parse_repository_url, DirectoryFetcher, Repository};
use crate::temp;
use crate::utils;
use crate::variables;

const MAINTENANCE_TOOL_NAME: &str = if cfg!(windows) {
    "maintenance.exe"
} else {
    "maintenance"
};

#[derive(Parser, Debug)]
#[command(
    name = "instill",
    about = "Installs, updates and removes software components from declarative repositories",
    version
)]
struct Cli {
    /// Run as a fresh installer.
    #[arg(long, conflicts_with_all = ["updater", "manage_packages", "uninstall"])]
    install: bool,

    /// Check for and apply updates to the installed components.
    #[arg(long, conflicts_with_all = ["manage_packages", "uninstall"])]
    updater: bool,

    /// Add or remove individual components.
    #[arg(long = "manage-packages", conflicts_with = "uninstall")]
    manage_packages: bool,

    /// Remove everything this tool installed.
    #[arg(long)]
    uninstall: bool,

    /// No questions, no progress output.
    #[arg(long)]
    silent: bool,

    /// Answer every question with its accept option.
    #[arg(long, conflicts_with = "auto_reject_messages")]
    auto_accept_messages: bool,

    /// Answer every question with its reject option.
    #[arg(long)]
    auto_reject_messages: bool,

    /// Use an additional repository (repeatable).
    #[arg(long = "add-repository", value_name = "URL")]
    add_repository: Vec<String>,

    /// Use a repository for this run only; append ",replace" to drop the
    /// configured ones.
    #[arg(long = "set-temporary-repository", value_name = "URL[,replace]")]
    set_temporary_repository: Option<String>,

    /// Chatty diagnostics.
    #[arg(long, short)]
    verbose: bool,

    /// Directory to install into (and where installed state lives).
    #[arg(long, value_name = "DIR")]
    target_dir: Option<PathBuf>,

    /// Internal: serve privileged operations over stdio.
    #[arg(long = "helper-server", hide = true)]
    helper_server: bool,

    /// Components to select, dotted names. Empty means default selection.
    components: Vec<String>,
}

/// Entry point; returns the process exit code.
pub fn main() -> i32 {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if cli.helper_server {
        let registry = OperationRegistry::with_builtins();
        return match helper::serve(&registry) {
            Ok(()) => 0,
            Err(e) => {
                error!("helper failed: {e:#}");
                1
            }
        };
    }

    match run(cli) {
        Ok(status) => status.exit_code(),
        Err(e) => {
            error!("{e:#}");
            e.downcast_ref::<InstallError>()
                .map(InstallError::exit_code)
                .unwrap_or(1)
        }
    }
}

fn init_tracing(verbose: bool) {
    let fallback = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(fallback));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .try_init();
}

fn run(cli: Cli) -> Result<RunStatus> {
    let own_metadata = std::env::current_exe()
        .ok()
        .and_then(|exe| artifact::read(&exe).ok().flatten());
    let mode = select_mode(&cli, own_metadata.as_ref());
    debug!("running as {mode:?}");

    let mut ctx = RunContext::new(mode);
    ctx.messages = if cli.auto_reject_messages {
        MessagePolicy::AutoReject
    } else if cli.auto_accept_messages || cli.silent {
        MessagePolicy::AutoAccept
    } else {
        MessagePolicy::Interactive
    };
    ctx.admin = AdminRights::new(Box::new(helper::ElevatedSpawner));

    let target_dir = cli
        .target_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from("."));
    utils::ensure_dir_exists("target", &target_dir)?;
    let target_dir = target_dir
        .canonicalize()
        .context("could not resolve target directory")?;
    ctx.variables.set_path(variables::TARGET_DIR, &target_dir);

    // Honors TMPDIR for all staging and backups.
    let scratch = temp::Context::in_system_temp("instill")?;

    // A maintenance run may need rights before its first admin operation:
    // rewriting our own image requires them already.
    if mode != RunMode::Installer {
        if let Ok(exe) = std::env::current_exe() {
            if utils::is_file(&exe)
                && std::fs::metadata(&exe).map(|m| m.permissions().readonly()).unwrap_or(false)
            {
                warn!("maintenance tool is not writable, elevating early");
                ctx.admin.gain()?;
            }
        }
    }

    let mut journal = match own_metadata.as_ref().and_then(|m| m.journal()) {
        Some(bytes) => Journal::from_encoded(bytes)
            .context("embedded journal is corrupt")?,
        None => Journal::new(),
    };

    let mut local = LocalCatalog::load(&target_dir, ctx.options.silent_retries, ctx.messages)?;
    let registry = OperationRegistry::with_builtins();
    let mut hooks = NoHooks;
    let mut progress = make_progress(cli.silent);

    if mode == RunMode::Uninstaller {
        let store = ComponentStore::default();
        let mut executor = Executor::new(
            &mut ctx,
            &registry,
            &store,
            &mut local,
            &mut journal,
            &scratch,
            &mut hooks,
        );
        let (status, failed) = executor.uninstall(progress.as_mut())?;
        for name in &failed {
            warn!("'{name}' could not be removed completely");
        }
        return Ok(status);
    }

    let repositories = configured_repositories(&cli)?;
    if repositories.is_empty() {
        return Err(InstallError::Network {
            url: "<none>".to_owned(),
            detail: format!(
                "no repositories configured; pass --add-repository pointing at a {CATALOG_FILE}"
            ),
        }
        .into());
    }
    let staged = fetch_all(&DirectoryFetcher, &repositories, ctx.messages, &ctx.cancel)?;

    let (application, packages) = load_catalogs(&staged, &ctx.options)?;
    if let Some(application) = &application {
        ctx.variables
            .set(variables::APPLICATION_NAME, application.as_str());
    }

    let mut store = ComponentStore::build(packages, &local, mode);
    apply_selection(&mut store, &cli, &ctx, mode)?;

    let list = resolver::install_list(&store, &ctx.options, mode);
    if list.is_empty() {
        info!("nothing to do");
        return Ok(RunStatus::Success);
    }
    info!(
        "installing: {}",
        list.iter()
            .map(|&h| store.get(h).name())
            .collect::<Vec<_>>()
            .join(", ")
    );

    // The archives were staged during the fetch. When this run actually
    // needed any, that download phase gets a third of the progress range
    // and installation the rest; otherwise installation takes it all.
    let fetched_archives: usize = list
        .iter()
        .map(|&h| store.get(h).package.archives.len())
        .sum();
    let progress_base = if fetched_archives > 0 { 1.0 / 3.0 } else { 0.0 };
    if fetched_archives > 0 {
        progress.message("archives fetched");
        progress.progress(progress_base);
    }

    let mut executor = Executor::new(
        &mut ctx,
        &registry,
        &store,
        &mut local,
        &mut journal,
        &scratch,
        &mut hooks,
    );
    let status = executor.install(&list, &staged, progress.as_mut(), progress_base)?;

    if status == RunStatus::Success {
        write_maintenance_tool(&target_dir, &journal, &local, &repositories, &mut ctx)?;
    }
    Ok(status)
}

fn select_mode(cli: &Cli, own: Option<&artifact::Metadata>) -> RunMode {
    if cli.install {
        RunMode::Installer
    } else if cli.updater {
        RunMode::Updater
    } else if cli.manage_packages {
        RunMode::PackageManager
    } else if cli.uninstall {
        RunMode::Uninstaller
    } else {
        own.and_then(artifact::Metadata::mode)
            .unwrap_or(RunMode::Installer)
    }
}

fn configured_repositories(cli: &Cli) -> Result<Vec<Repository>> {
    let mut repositories = Vec::new();
    for url in &cli.add_repository {
        repositories.push(Repository::new(parse_repository_url(url)?));
    }
    if let Some(value) = &cli.set_temporary_repository {
        let (url, replace) = match value.strip_suffix(",replace") {
            Some(url) => (url, true),
            None => (value.as_str(), false),
        };
        let mut repository = Repository::new(parse_repository_url(url)?);
        repository.temporary = true;
        repository.replace_default = replace;
        if replace {
            repositories.clear();
        }
        repositories.push(repository);
    }
    Ok(repositories)
}

fn apply_selection(
    store: &mut ComponentStore,
    cli: &Cli,
    ctx: &RunContext,
    mode: RunMode,
) -> Result<()> {
    if mode == RunMode::Updater {
        // Updates select themselves, subject to the importance filter.
        for handle in resolver::update_candidates(store, &ctx.options) {
            store.set_checked(handle, true);
        }
        return Ok(());
    }
    for name in &cli.components {
        let handle = store
            .by_name(name)
            .ok_or_else(|| anyhow::anyhow!("no such component: '{name}'"))?;
        if store.get(handle).is_virtual() && !ctx.options.virtual_visible {
            anyhow::bail!("component '{name}' is not selectable");
        }
        store.set_checked(handle, true);
    }
    Ok(())
}

fn write_maintenance_tool(
    target_dir: &std::path::Path,
    journal: &Journal,
    local: &LocalCatalog,
    repositories: &[Repository],
    ctx: &mut RunContext,
) -> Result<()> {
    let base = std::env::current_exe().context("cannot locate own executable")?;
    let out = target_dir.join(MAINTENANCE_TOOL_NAME);

    // The embedded image keeps whatever sections a newer tool may have
    // added; only the ones this engine owns are replaced.
    let mut metadata = match artifact::read(&base)? {
        Some(existing) => existing,
        None => artifact::Metadata::new(RunMode::Uninstaller),
    };
    metadata.marker = artifact::marker_of(RunMode::Uninstaller);
    metadata.set_section(artifact::TAG_JOURNAL, journal.encode());
    metadata.set_section(
        artifact::TAG_PACKAGE_REGISTRY,
        registry_section(local),
    );
    metadata.set_section(artifact::TAG_SETTINGS, settings_section(repositories));

    artifact::write(&base, &out, &metadata, &mut ctx.admin)?;
    ctx.variables
        .set_path(variables::MAINTENANCE_TOOL, &out);
    info!("maintenance tool written to {}", out.display());
    Ok(())
}

/// The package registry section: the installed set as the next run of the
/// tool will trust it.
fn registry_section(local: &LocalCatalog) -> Vec<u8> {
    let mut w = utils::wire::Writer::new();
    let records = local.records();
    w.put_u32(records.len() as u32);
    for record in records {
        w.put_str(&record.name);
        w.put_str(&record.version);
    }
    w.into_bytes()
}

fn settings_section(repositories: &[Repository]) -> Vec<u8> {
    let mut table = toml::value::Table::new();
    let urls: Vec<toml::Value> = repositories
        .iter()
        .filter(|r| !r.temporary)
        .map(|r| toml::Value::String(r.url.to_string()))
        .collect();
    table.insert("repositories".to_owned(), toml::Value::Array(urls));
    toml::Value::Table(table).to_string().into_bytes()
}

fn make_progress(silent: bool) -> Box<dyn ProgressSink> {
    if silent {
        Box::new(NullProgress)
    } else {
        Box::new(BarProgress::new())
    }
}

/// Progress rendering for interactive runs.
struct BarProgress {
    bar: ProgressBar,
}

impl BarProgress {
    const SCALE: u64 = 1000;

    fn new() -> Self {
        let bar = ProgressBar::new(Self::SCALE);
        bar.set_style(
            ProgressStyle::with_template("{bar:40} {percent:>3}% {msg}")
                .expect("static template"),
        );
        Self { bar }
    }
}

impl ProgressSink for BarProgress {
    fn progress(&mut self, fraction: f64) {
        self.bar
            .set_position((fraction.clamp(0.0, 1.0) * Self::SCALE as f64) as u64);
    }

    fn message(&mut self, text: &str) {
        self.bar.set_message(text.to_owned());
    }
}
