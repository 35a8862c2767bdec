//! The transactional executor.
//!
//! Walks the resolved component list in order, performing each component's
//! operations and committing them to the journal as the component
//! finishes, so that a failure only ever unwinds the failing component's
//! uncommitted operations. `perform` and `undo` run on a short-lived worker
//! thread per operation; the driver thread keeps servicing progress and
//! cancellation meanwhile. This is the only concurrency in the engine --
//! operations never run against each other.


use std::collections::HashSet;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Result};
use tracing::{info, warn};

use crate::catalog::local::{InstalledRecord, LocalCatalog};
use crate::component::{ComponentHandle, ComponentStore};
use crate::context::{RunContext, RunStatus};
use crate::errors::InstallError;
use crate::hooks::ComponentHooks;
use crate::journal::Journal;
use crate::operation::{OpEnv, Operation, OperationBehavior, OperationRegistry};
use crate::progress::{Aggregator, ProgressSink};
use crate::protocol;
use crate::repository::StagedRepository;
use crate::temp;
use crate::utils;

/// Attribute carrying the requested phase across the helper boundary.
const ATTR_PHASE: &str = "phase";

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Phase {
    Perform,
    Undo,
}

impl Phase {
    fn as_str(self) -> &'static str {
        match self {
            Self::Perform => "perform",
            Self::Undo => "undo",
        }
    }
}

pub struct Executor<'a> {
    pub ctx: &'a mut RunContext,
    pub registry: &'a OperationRegistry,
    pub store: &'a ComponentStore,
    pub local: &'a mut LocalCatalog,
    pub journal: &'a mut Journal,
    pub temp: &'a temp::Context,
    pub hooks: &'a mut dyn ComponentHooks,
    /// Operations performed for the current component but not yet
    /// committed. Rollback unwinds exactly these.
    in_flight: Vec<Operation>,
}

impl<'a> Executor<'a> {
    pub fn new(
        ctx: &'a mut RunContext,
        registry: &'a OperationRegistry,
        store: &'a ComponentStore,
        local: &'a mut LocalCatalog,
        journal: &'a mut Journal,
        temp: &'a temp::Context,
        hooks: &'a mut dyn ComponentHooks,
    ) -> Self {
        Self {
            ctx,
            registry,
            store,
            local,
            journal,
            temp,
            hooks,
            in_flight: Vec::new(),
        }
    }

    /// Install `list` in order. `progress_base` is how much of the overall
    /// range the download phase already used (a third when archives were
    /// fetched, zero otherwise).
    ///
    /// On failure or cancellation the session is rolled back and the
    /// corresponding status returned; an invariant violation aborts
    /// without rollback so the journal stays inspectable.
    pub fn install(
        &mut self,
        list: &[ComponentHandle],
        staged: &[StagedRepository],
        sink: &mut dyn ProgressSink,
        progress_base: f64,
    ) -> Result<RunStatus> {
        let mut agg = Aggregator::new(sink, progress_base, 1.0 - progress_base, list.len());
        match self.install_all(list, staged, &mut agg) {
            Ok(()) => Ok(RunStatus::Success),
            Err(e) => {
                if matches!(
                    e.downcast_ref::<InstallError>(),
                    Some(InstallError::InvariantViolation(_))
                ) {
                    // No rollback: keep the backups and the journal as they
                    // are for a post-mortem.
                    self.temp.keep();
                    return Err(e);
                }
                let status = if matches!(
                    e.downcast_ref::<InstallError>(),
                    Some(InstallError::Canceled)
                ) {
                    info!("canceled, rolling back this session");
                    RunStatus::Canceled
                } else {
                    warn!("installation failed, rolling back this session: {e:#}");
                    RunStatus::Failure
                };
                self.roll_back();
                Ok(status)
            }
        }
    }

    fn install_all(
        &mut self,
        list: &[ComponentHandle],
        staged: &[StagedRepository],
        agg: &mut Aggregator<'_>,
    ) -> Result<()> {
        for &handle in list {
            self.ctx.cancel.check()?;
            self.install_component(handle, staged, agg)?;
        }
        Ok(())
    }

    fn install_component(
        &mut self,
        handle: ComponentHandle,
        staged: &[StagedRepository],
        agg: &mut Aggregator<'_>,
    ) -> Result<()> {
        let component = self.store.get(handle);
        let name = component.name().to_owned();
        let version = component.package.version.clone();
        self.hooks.component_loaded(&name)?;

        if component.package.flags.remove_before_update && self.ctx.mode.is_maintenance() {
            self.remove_predecessors(handle, agg)?;
        }

        let ops = self.instantiate_operations(handle, staged)?;
        agg.begin_component(&name, ops.len());
        self.hooks.installation_started(&name)?;

        let mut gained_admin = false;
        let result = self.perform_component_ops(&name, ops, &mut gained_admin, agg);
        match result {
            Ok(()) => {
                // Commit: journal first, then the local store, so a crash
                // between the two leaves an undoable record rather than a
                // claimed-installed component with no journal.
                self.journal.commit(self.in_flight.drain(..));
                let mut record = InstalledRecord::new(name.clone(), version);
                record.last_update_date = Some(chrono::Utc::now().date_naive());
                self.local.insert(record);
                self.local.flush(&mut self.ctx.admin)?;
                self.hooks.installation_finished(&name)?;
                if gained_admin {
                    self.ctx.admin.release();
                }
                agg.component_completed();
                info!("installed {name}");
                Ok(())
            }
            Err(e) => {
                if gained_admin {
                    self.ctx.admin.release();
                }
                Err(e)
            }
        }
    }

    fn perform_component_ops(
        &mut self,
        component: &str,
        ops: Vec<Operation>,
        gained_admin: &mut bool,
        agg: &mut Aggregator<'_>,
    ) -> Result<()> {
        for mut op in ops {
            self.ctx.cancel.check()?;
            self.hooks.operation_starting(component, &op)?;

            // Substitute on the driver, right before perform; the worker
            // only ever sees resolved arguments.
            op.expand_args(&self.ctx.variables);

            if op.is_admin() && !self.ctx.admin.is_active() {
                self.ctx.admin.gain()?;
                *gained_admin = true;
            }
            self.run_phase(&mut op, Phase::Perform, &mut |f| agg.operation_progress(f))?;

            self.hooks.operation_finished(component, &op)?;
            agg.operation_completed();
            self.in_flight.push(op);
        }
        Ok(())
    }

    /// Undo, in reverse journal order, everything a remove-before-update
    /// component (or the packages it replaces) installed earlier, and drop
    /// those packages from the local store.
    fn remove_predecessors(
        &mut self,
        handle: ComponentHandle,
        agg: &mut Aggregator<'_>,
    ) -> Result<()> {
        let names = self.store.owned_names(handle);
        let ops = self.journal.take_committed_of(&names);
        if ops.is_empty() {
            return Ok(());
        }
        agg.message(&format!(
            "removing the old version of {}",
            self.store.get(handle).name()
        ));
        for mut op in ops {
            if let Err(e) = self.undo_with_admin(&mut op) {
                warn!("could not undo prior operation '{}': {e:#}", op.kind);
            }
        }
        for name in &names {
            self.local.remove(name);
        }
        self.local.flush(&mut self.ctx.admin)
    }

    fn instantiate_operations(
        &self,
        handle: ComponentHandle,
        staged: &[StagedRepository],
    ) -> Result<Vec<Operation>> {
        let component = self.store.get(handle);
        let name = component.name();
        let mut ops = Vec::new();
        for archive in &component.package.archives {
            let repo = staged
                .iter()
                .find(|s| utils::is_file(&s.archive_path(archive)))
                .ok_or_else(|| InstallError::Network {
                    url: archive.clone(),
                    detail: format!("archive for '{name}' was not fetched"),
                })?;
            if self.ctx.options.checksum_download {
                repo.verify_archive(archive)?;
            }
            let mut op = self.registry.create(
                "Extract",
                vec![
                    repo.archive_path(archive).display().to_string(),
                    "@TargetDir@".to_owned(),
                ],
            )?;
            op.set_component(name);
            ops.push(op);
        }
        for declared in &component.package.operations {
            let mut op = self.registry.create(&declared.kind, declared.args.clone())?;
            op.set_admin(declared.admin);
            op.set_component(name);
            ops.push(op);
        }
        Ok(ops)
    }

    /// Undo the not-yet-committed operations of the failing component in
    /// strict reverse order. Committed components stay installed; that is
    /// the point of committing per component. Undo failures are logged and
    /// skipped; a component whose entries all undid cleanly is dropped
    /// from the local store if an earlier version had been recorded there.
    pub fn roll_back(&mut self) {
        let mut failed_components: HashSet<String> = HashSet::new();
        let mut seen_components: Vec<String> = Vec::new();

        let mut unwind = std::mem::take(&mut self.in_flight);
        unwind.reverse();

        for mut op in unwind {
            let component = op.component().map(str::to_owned);
            if let Some(c) = &component {
                if !seen_components.contains(c) {
                    seen_components.push(c.clone());
                }
            }
            if let Err(e) = self.undo_with_admin(&mut op) {
                warn!("rollback: could not undo '{}': {e:#}", op.kind);
                if let Some(c) = component {
                    failed_components.insert(c);
                }
            }
        }

        for component in seen_components {
            if !failed_components.contains(&component) {
                self.local.remove(&component);
            }
        }
        if let Err(e) = self.local.flush(&mut self.ctx.admin) {
            warn!("rollback: could not write local catalog: {e:#}");
        }
    }

    /// Replay the *previous* sessions' journal backwards: the uninstall
    /// path of the maintenance tool. Failures are collected, not fatal;
    /// the names that could not be fully unwound are returned.
    pub fn uninstall(&mut self, sink: &mut dyn ProgressSink) -> Result<(RunStatus, Vec<String>)> {
        let names: Vec<String> = self
            .local
            .records()
            .iter()
            .map(|r| r.name.clone())
            .collect();
        // Strict reverse of everything ever journaled; entries of packages
        // the local store has forgotten are unwound all the same.
        let ops = self.journal.drain_reversed();

        let mut agg = Aggregator::new(sink, 0.0, 1.0, 1);
        agg.begin_component("uninstall", ops.len());

        let mut failed: HashSet<String> = HashSet::new();
        let mut attempted = 0usize;
        let mut undone = 0usize;
        for mut op in ops {
            self.ctx.cancel.check()?;
            attempted += 1;
            let component = op.component().map(str::to_owned);
            match self.undo_with_admin(&mut op) {
                Ok(()) => undone += 1,
                Err(e) => {
                    warn!("uninstall: could not undo '{}': {e:#}", op.kind);
                    if let Some(c) = component {
                        failed.insert(c);
                    }
                }
            }
            agg.operation_completed();
        }

        for name in names {
            if !failed.contains(&name) {
                self.local.remove(&name);
            }
        }
        self.local.flush(&mut self.ctx.admin)?;

        let status = if attempted > 0 && undone == 0 {
            RunStatus::Failure
        } else {
            RunStatus::Success
        };
        Ok((status, failed.into_iter().collect()))
    }

    fn undo_with_admin(&mut self, op: &mut Operation) -> Result<()> {
        let gained = if op.is_admin() && !self.ctx.admin.is_active() {
            self.ctx.admin.gain()?;
            true
        } else {
            false
        };
        let result = self.run_phase(op, Phase::Undo, &mut |_| {});
        if gained {
            self.ctx.admin.release();
        }
        result
    }

    /// Run one phase of one operation: through the helper when the
    /// operation needs elevation, on a worker thread otherwise.
    fn run_phase(
        &mut self,
        op: &mut Operation,
        phase: Phase,
        progress: &mut dyn FnMut(f64),
    ) -> Result<()> {
        if op.is_admin() {
            return self.run_phase_elevated(op, phase);
        }
        let behavior = self.registry.behavior(&op.kind)?;
        if phase == Phase::Perform {
            behavior.backup(op, &OpEnv::silent(self.temp))?;
        }
        run_on_worker(
            behavior,
            op,
            phase,
            self.ctx.variables.snapshot(),
            self.temp,
            progress,
        )
    }

    fn run_phase_elevated(&mut self, op: &mut Operation, phase: Phase) -> Result<()> {
        let channel = self
            .ctx
            .admin
            .channel()
            .ok_or_else(|| InstallError::Elevation("helper is not active".into()))?;
        op.set_attr(ATTR_PHASE, phase.as_str());
        let reply = channel.request(protocol::CMD_EXECUTE_OPERATION, &op.encode())?;
        // The helper returns the operation with whatever state its backup
        // and perform recorded; that state is what our journal must keep.
        *op = Operation::decode(&reply)?;
        op.clear_attr(ATTR_PHASE);
        Ok(())
    }
}

/// Run one phase on a short-lived worker thread, pumping progress events
/// back to the caller until the phase finishes.
fn run_on_worker(
    behavior: &dyn OperationBehavior,
    op: &mut Operation,
    phase: Phase,
    variables: crate::variables::Variables,
    temp: &temp::Context,
    progress: &mut dyn FnMut(f64),
) -> Result<()> {
    let (tx, rx) = mpsc::channel::<f64>();
    thread::scope(|scope| {
        let worker = scope.spawn(move || {
            let tx = Mutex::new(tx);
            let forward = move |f: f64| {
                if let Ok(tx) = tx.lock() {
                    let _ = tx.send(f);
                }
            };
            let env = OpEnv {
                variables,
                temp,
                progress: &forward,
            };
            match phase {
                Phase::Perform => behavior.perform(op, &env),
                Phase::Undo => behavior.undo(op, &env),
            }
        });
        loop {
            match rx.recv_timeout(Duration::from_millis(50)) {
                Ok(fraction) => progress(fraction),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        worker
            .join()
            .unwrap_or_else(|_| Err(anyhow!("operation worker panicked")))
    })
}
