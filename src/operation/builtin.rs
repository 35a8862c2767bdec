//! The built-in operation kinds.
//!
//! Each behavior records whatever its `undo` will need as attributes on the
//! operation value, because that value -- not the behavior -- is what ends
//! up in the journal. Backups live in the session scratch tree; an undo
//! replayed in a *later* session (uninstall) will find them gone and falls
//! back to plain removal, which is the best a non-transactional filesystem
//! offers.

use std::env;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use tracing::{debug, warn};

use super::{OpEnv, Operation, OperationBehavior, OperationRegistry};
use crate::errors::InstallError;
use crate::utils;

const ATTR_BACKUP: &str = "backup";
const ATTR_CREATED: &str = "created";
const ATTR_FILES: &str = "files";
const ATTR_PREVIOUS: &str = "previous";

/// Separator splitting an Execute argument list into perform and undo
/// command lines.
pub const UNDO_EXECUTE_SEPARATOR: &str = "UNDOEXECUTE";

pub(super) fn register(registry: &mut OperationRegistry) {
    registry.register("Extract", Box::new(Extract));
    registry.register("Copy", Box::new(Copy));
    registry.register("Delete", Box::new(Delete));
    registry.register("Mkdir", Box::new(Mkdir));
    registry.register("RegisterFileType", Box::new(RegisterFileType));
    registry.register("CreateShortcut", Box::new(CreateShortcut));
    registry.register("EnvironmentVariable", Box::new(EnvironmentVariable));
    registry.register("Execute", Box::new(Execute));
}

fn op_error(op: &Operation, detail: impl Into<String>) -> anyhow::Error {
    InstallError::Operation {
        kind: op.kind.clone(),
        detail: detail.into(),
    }
    .into()
}

/// `Extract(archive, target_dir)`: unpack a gzipped tar archive, recording
/// every created entry so undo can remove them.
struct Extract;

impl OperationBehavior for Extract {
    fn perform(&self, op: &mut Operation, env: &OpEnv<'_>) -> Result<()> {
        let archive = PathBuf::from(op.arg(0)?);
        let target = PathBuf::from(op.arg(1)?);
        utils::ensure_dir_exists("extract target", &target)?;

        // One cheap pass for the entry count so progress has a scale.
        let total = {
            let file = utils::open_file("archive", &archive)?;
            tar::Archive::new(GzDecoder::new(file)).entries()?.count()
        };

        let file = utils::open_file("archive", &archive)?;
        let mut tar = tar::Archive::new(GzDecoder::new(file));
        let mut extracted = Vec::new();
        for (index, entry) in tar.entries()?.enumerate() {
            let mut entry = entry.with_context(|| {
                format!("corrupt archive '{}'", archive.display())
            })?;
            let rel = entry.path()?.into_owned();
            if entry.unpack_in(&target)? {
                extracted.push(rel.display().to_string());
            }
            (env.progress)((index + 1) as f64 / total.max(1) as f64);
        }
        op.set_attr(ATTR_FILES, extracted.join("\n"));
        Ok(())
    }

    fn undo(&self, op: &mut Operation, _env: &OpEnv<'_>) -> Result<()> {
        let target = PathBuf::from(op.arg(1)?);
        let files = op.attr(ATTR_FILES).unwrap_or("").to_owned();
        for rel in files.lines().rev().filter(|l| !l.is_empty()) {
            let path = target.join(rel);
            if utils::is_directory(&path) {
                // Only prune directories the unpack created and that are
                // empty now; shared parents stay.
                let _ = std::fs::remove_dir(&path);
            } else if utils::path_exists(&path) {
                utils::ensure_file_removed("extracted", &path)?;
            }
        }
        Ok(())
    }

    fn describe(&self, op: &Operation) -> String {
        format!("extracting {}", op.arg(0).unwrap_or("archive"))
    }

    fn reports_progress(&self) -> bool {
        true
    }
}

/// `Copy(source, destination)`: pre-existing destinations are backed up
/// into the scratch tree for rollback.
struct Copy;

impl OperationBehavior for Copy {
    fn backup(&self, op: &mut Operation, env: &OpEnv<'_>) -> Result<()> {
        let dest = PathBuf::from(op.arg(1)?);
        if utils::is_file(&dest) {
            let backup = env.temp.new_file();
            utils::copy_file(&dest, &backup)?;
            op.set_attr(ATTR_BACKUP, backup.display().to_string());
        }
        Ok(())
    }

    fn perform(&self, op: &mut Operation, _env: &OpEnv<'_>) -> Result<()> {
        let src = PathBuf::from(op.arg(0)?);
        let dest = PathBuf::from(op.arg(1)?);
        utils::copy_file(&src, &dest)
    }

    fn undo(&self, op: &mut Operation, _env: &OpEnv<'_>) -> Result<()> {
        let dest = PathBuf::from(op.arg(1)?);
        match op.attr(ATTR_BACKUP).map(PathBuf::from) {
            Some(backup) if utils::is_file(&backup) => utils::copy_file(&backup, &dest),
            _ => utils::ensure_file_removed("copied", &dest),
        }
    }

    fn describe(&self, op: &Operation) -> String {
        format!(
            "copying {} to {}",
            op.arg(0).unwrap_or("?"),
            op.arg(1).unwrap_or("?")
        )
    }
}

/// `Delete(path)`: the contents, a file's bytes or a whole directory
/// tree, are preserved in the scratch tree so rollback can put them back.
struct Delete;

impl OperationBehavior for Delete {
    fn backup(&self, op: &mut Operation, env: &OpEnv<'_>) -> Result<()> {
        let path = PathBuf::from(op.arg(0)?);
        if utils::is_directory(&path) {
            let backup = env.temp.new_directory()?;
            utils::copy_dir(&path, &backup)?;
            op.set_attr(ATTR_BACKUP, backup.display().to_string());
        } else if utils::is_file(&path) {
            let backup = env.temp.new_file();
            utils::copy_file(&path, &backup)?;
            op.set_attr(ATTR_BACKUP, backup.display().to_string());
        }
        Ok(())
    }

    fn perform(&self, op: &mut Operation, _env: &OpEnv<'_>) -> Result<()> {
        let path = PathBuf::from(op.arg(0)?);
        if utils::is_directory(&path) {
            utils::remove_dir("deleted", &path)
        } else {
            utils::ensure_file_removed("deleted", &path)
        }
    }

    fn undo(&self, op: &mut Operation, _env: &OpEnv<'_>) -> Result<()> {
        let path = PathBuf::from(op.arg(0)?);
        match op.attr(ATTR_BACKUP).map(PathBuf::from) {
            Some(backup) if utils::is_directory(&backup) => utils::copy_dir(&backup, &path),
            Some(backup) if utils::is_file(&backup) => utils::copy_file(&backup, &path),
            _ => {
                warn!("no backup left for '{}', cannot restore", path.display());
                Ok(())
            }
        }
    }

    fn describe(&self, op: &Operation) -> String {
        format!("deleting {}", op.arg(0).unwrap_or("?"))
    }
}

/// `Mkdir(path)`: records the topmost directory it actually created, and
/// removes only that subtree's empty directories on undo.
struct Mkdir;

impl OperationBehavior for Mkdir {
    fn perform(&self, op: &mut Operation, _env: &OpEnv<'_>) -> Result<()> {
        let path = PathBuf::from(op.arg(0)?);
        if utils::is_directory(&path) {
            return Ok(());
        }
        let mut topmost = path.clone();
        while let Some(parent) = topmost.parent() {
            if utils::path_exists(parent) {
                break;
            }
            topmost = parent.to_path_buf();
        }
        utils::ensure_dir_exists("created", &path)?;
        op.set_attr(ATTR_CREATED, topmost.display().to_string());
        Ok(())
    }

    fn undo(&self, op: &mut Operation, _env: &OpEnv<'_>) -> Result<()> {
        let Some(created) = op.attr(ATTR_CREATED).map(PathBuf::from) else {
            return Ok(());
        };
        let mut cursor = PathBuf::from(op.arg(0)?);
        loop {
            if utils::is_directory(&cursor) && std::fs::remove_dir(&cursor).is_err() {
                // Not empty: someone put data in it, leave the tree alone.
                break;
            }
            if cursor == created {
                break;
            }
            match cursor.parent() {
                Some(parent) => cursor = parent.to_path_buf(),
                None => break,
            }
        }
        Ok(())
    }

    fn describe(&self, op: &Operation) -> String {
        format!("creating directory {}", op.arg(0).unwrap_or("?"))
    }
}

/// `RegisterFileType(extension, command, description)`: file association.
/// Registry classes on Windows, an application entry in the XDG data
/// directory elsewhere.
struct RegisterFileType;

impl RegisterFileType {
    #[cfg(not(windows))]
    fn entry_path(extension: &str) -> Result<PathBuf> {
        let data_home = env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .or_else(|| env::var_os("HOME").map(|h| PathBuf::from(h).join(".local/share")))
            .ok_or_else(|| anyhow::anyhow!("no XDG data directory"))?;
        Ok(data_home
            .join("applications")
            .join(format!("instill-{extension}.desktop")))
    }
}

impl OperationBehavior for RegisterFileType {
    #[cfg(not(windows))]
    fn perform(&self, op: &mut Operation, _env: &OpEnv<'_>) -> Result<()> {
        let extension = op.arg(0)?.trim_start_matches('.').to_owned();
        let command = op.arg(1)?.to_owned();
        let description = op.args.get(2).cloned().unwrap_or_else(|| extension.clone());
        let entry = Self::entry_path(&extension)?;
        if let Some(parent) = entry.parent() {
            utils::ensure_dir_exists("applications", parent)?;
        }
        let contents = format!(
            "[Desktop Entry]\nType=Application\nName={description}\nExec={command} %f\nMimeType=application/x-{extension};\nNoDisplay=true\n"
        );
        utils::write_file("file association", &entry, &contents)?;
        op.set_attr(ATTR_CREATED, entry.display().to_string());
        Ok(())
    }

    #[cfg(windows)]
    fn perform(&self, op: &mut Operation, _env: &OpEnv<'_>) -> Result<()> {
        let extension = op.arg(0)?.trim_start_matches('.').to_owned();
        let command = op.arg(1)?.to_owned();
        let progid = format!("Instill.{extension}");
        let classes = windows_registry::CURRENT_USER.create("Software\\Classes")?;
        classes
            .create(format!(".{extension}"))?
            .set_string("", &progid)?;
        classes
            .create(format!("{progid}\\shell\\open\\command"))?
            .set_string("", &format!("{command} \"%1\""))?;
        op.set_attr(ATTR_CREATED, progid);
        Ok(())
    }

    #[cfg(not(windows))]
    fn undo(&self, op: &mut Operation, _env: &OpEnv<'_>) -> Result<()> {
        if let Some(entry) = op.attr(ATTR_CREATED).map(PathBuf::from) {
            utils::ensure_file_removed("file association", &entry)?;
        }
        Ok(())
    }

    #[cfg(windows)]
    fn undo(&self, op: &mut Operation, _env: &OpEnv<'_>) -> Result<()> {
        let extension = op.arg(0)?.trim_start_matches('.').to_owned();
        let classes = windows_registry::CURRENT_USER.create("Software\\Classes")?;
        let _ = classes.remove_tree(format!(".{extension}"));
        if let Some(progid) = op.attr(ATTR_CREATED) {
            let _ = classes.remove_tree(progid);
        }
        Ok(())
    }

    fn describe(&self, op: &Operation) -> String {
        format!("registering file type .{}", op.arg(0).unwrap_or("?"))
    }
}

/// `CreateShortcut(target, location)`: a symlink where symlinks are the
/// convention, a small launcher script on Windows.
struct CreateShortcut;

impl OperationBehavior for CreateShortcut {
    #[cfg(not(windows))]
    fn perform(&self, op: &mut Operation, _env: &OpEnv<'_>) -> Result<()> {
        let target = PathBuf::from(op.arg(0)?);
        let location = PathBuf::from(op.arg(1)?);
        if let Some(parent) = location.parent() {
            utils::ensure_dir_exists("shortcut", parent)?;
        }
        utils::ensure_file_removed("shortcut", &location)?;
        std::os::unix::fs::symlink(&target, &location).with_context(|| {
            format!(
                "could not link '{}' to '{}'",
                location.display(),
                target.display()
            )
        })?;
        op.set_attr(ATTR_CREATED, location.display().to_string());
        Ok(())
    }

    #[cfg(windows)]
    fn perform(&self, op: &mut Operation, _env: &OpEnv<'_>) -> Result<()> {
        let target = PathBuf::from(op.arg(0)?);
        let location = PathBuf::from(op.arg(1)?);
        if let Some(parent) = location.parent() {
            utils::ensure_dir_exists("shortcut", parent)?;
        }
        let launcher = location.with_extension("cmd");
        utils::write_file(
            "shortcut",
            &launcher,
            &format!("@echo off\r\nstart \"\" \"{}\" %*\r\n", target.display()),
        )?;
        op.set_attr(ATTR_CREATED, launcher.display().to_string());
        Ok(())
    }

    fn undo(&self, op: &mut Operation, _env: &OpEnv<'_>) -> Result<()> {
        if let Some(created) = op.attr(ATTR_CREATED).map(PathBuf::from) {
            utils::ensure_file_removed("shortcut", &created)?;
        }
        Ok(())
    }

    fn describe(&self, op: &Operation) -> String {
        format!("creating shortcut to {}", op.arg(0).unwrap_or("?"))
    }
}

/// `EnvironmentVariable(name, value)`: sets the variable for this process
/// and records the prior value for undo. Persistence beyond the process is
/// a Windows registry write.
struct EnvironmentVariable;

impl OperationBehavior for EnvironmentVariable {
    fn perform(&self, op: &mut Operation, _env: &OpEnv<'_>) -> Result<()> {
        let name = op.arg(0)?.to_owned();
        let value = op.arg(1)?.to_owned();
        if let Ok(previous) = env::var(&name) {
            op.set_attr(ATTR_PREVIOUS, previous);
        }
        env::set_var(&name, &value);
        #[cfg(windows)]
        if op.args.get(2).map(String::as_str) == Some("persistent") {
            windows_registry::CURRENT_USER
                .create("Environment")?
                .set_string(&name, &value)?;
        }
        Ok(())
    }

    fn undo(&self, op: &mut Operation, _env: &OpEnv<'_>) -> Result<()> {
        let name = op.arg(0)?.to_owned();
        match op.attr(ATTR_PREVIOUS) {
            Some(previous) => env::set_var(&name, previous),
            None => env::remove_var(&name),
        }
        #[cfg(windows)]
        if op.args.get(2).map(String::as_str) == Some("persistent") {
            let key = windows_registry::CURRENT_USER.create("Environment")?;
            match op.attr(ATTR_PREVIOUS) {
                Some(previous) => key.set_string(&name, previous)?,
                None => {
                    let _ = key.remove_value(&name);
                }
            }
        }
        Ok(())
    }

    fn describe(&self, op: &Operation) -> String {
        format!("setting environment variable {}", op.arg(0).unwrap_or("?"))
    }
}

/// `Execute(program, args.., [UNDOEXECUTE, program, args..])`: runs a
/// program and fails on a nonzero exit. The part after the separator, if
/// any, is the command line `undo` runs.
struct Execute;

impl Execute {
    fn split(op: &Operation) -> (Vec<String>, Option<Vec<String>>) {
        match op.args.iter().position(|a| a == UNDO_EXECUTE_SEPARATOR) {
            Some(i) => (op.args[..i].to_vec(), Some(op.args[i + 1..].to_vec())),
            None => (op.args.clone(), None),
        }
    }

    fn run(op: &Operation, command_line: &[String]) -> Result<()> {
        let [program, args @ ..] = command_line else {
            return Err(op_error(op, "missing program"));
        };
        debug!("running {program} {args:?}");
        let status = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .status()
            .with_context(|| format!("could not start '{program}'"))?;
        if !status.success() {
            return Err(op_error(
                op,
                format!("'{program}' exited with {status}"),
            ));
        }
        Ok(())
    }
}

impl OperationBehavior for Execute {
    fn perform(&self, op: &mut Operation, _env: &OpEnv<'_>) -> Result<()> {
        let (perform, _) = Self::split(op);
        Self::run(op, &perform)
    }

    fn undo(&self, op: &mut Operation, _env: &OpEnv<'_>) -> Result<()> {
        match Self::split(op).1 {
            Some(undo) if !undo.is_empty() => Self::run(op, &undo),
            _ => Ok(()),
        }
    }

    fn describe(&self, op: &Operation) -> String {
        format!("running {}", op.arg(0).unwrap_or("?"))
    }
}

/// Run a standalone operation outside any session: perform, and on failure
/// immediately undo whatever half-applied.
pub fn run_single(
    registry: &OperationRegistry,
    op: &mut Operation,
    env: &OpEnv<'_>,
) -> Result<()> {
    let behavior = registry.behavior(&op.kind)?;
    behavior.backup(op, env)?;
    if let Err(e) = behavior.perform(op, env) {
        if let Err(undo_err) = behavior.undo(op, env) {
            warn!("could not undo failed operation: {undo_err}");
        }
        return Err(e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;

    use flate2::write::GzEncoder;
    use flate2::Compression;

    use super::super::{OpEnv, Operation, OperationRegistry};
    use crate::temp;

    fn registry() -> OperationRegistry {
        OperationRegistry::with_builtins()
    }

    fn run(
        registry: &OperationRegistry,
        op: &mut Operation,
        env: &OpEnv<'_>,
    ) -> anyhow::Result<()> {
        let behavior = registry.behavior(&op.kind)?;
        behavior.backup(op, env)?;
        behavior.perform(op, env)
    }

    fn undo(registry: &OperationRegistry, op: &mut Operation, env: &OpEnv<'_>) {
        registry.behavior(&op.kind).unwrap().undo(op, env).unwrap();
    }

    fn write_archive(path: &Path, files: &[(&str, &[u8])]) {
        let gz = GzEncoder::new(fs::File::create(path).unwrap(), Compression::default());
        let mut builder = tar::Builder::new(gz);
        for (name, data) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, *data).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
    }

    #[test]
    fn extract_unpacks_and_undo_removes() {
        let dir = tempfile::tempdir().unwrap();
        let scratch = temp::Context::new(dir.path(), "scratch").unwrap();
        let env = OpEnv::silent(&scratch);
        let archive = dir.path().join("payload.tar.gz");
        write_archive(&archive, &[("bin/tool", b"#!"), ("share/doc.txt", b"d")]);
        let target = dir.path().join("install");

        let registry = registry();
        let mut op = Operation::new(
            "Extract",
            vec![
                archive.display().to_string(),
                target.display().to_string(),
            ],
        );
        run(&registry, &mut op, &env).unwrap();
        assert!(target.join("bin/tool").is_file());
        assert!(target.join("share/doc.txt").is_file());

        undo(&registry, &mut op, &env);
        assert!(!target.join("bin/tool").exists());
        assert!(!target.join("share/doc.txt").exists());
    }

    #[test]
    fn copy_backs_up_and_restores() {
        let dir = tempfile::tempdir().unwrap();
        let scratch = temp::Context::new(dir.path(), "scratch").unwrap();
        let env = OpEnv::silent(&scratch);
        let src = dir.path().join("new");
        let dest = dir.path().join("conf");
        fs::write(&src, b"new contents").unwrap();
        fs::write(&dest, b"original").unwrap();

        let registry = registry();
        let mut op = Operation::new(
            "Copy",
            vec![src.display().to_string(), dest.display().to_string()],
        );
        run(&registry, &mut op, &env).unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"new contents");

        undo(&registry, &mut op, &env);
        assert_eq!(fs::read(&dest).unwrap(), b"original");
    }

    #[test]
    fn copy_undo_without_prior_file_deletes() {
        let dir = tempfile::tempdir().unwrap();
        let scratch = temp::Context::new(dir.path(), "scratch").unwrap();
        let env = OpEnv::silent(&scratch);
        let src = dir.path().join("new");
        let dest = dir.path().join("fresh");
        fs::write(&src, b"x").unwrap();

        let registry = registry();
        let mut op = Operation::new(
            "Copy",
            vec![src.display().to_string(), dest.display().to_string()],
        );
        run(&registry, &mut op, &env).unwrap();
        undo(&registry, &mut op, &env);
        assert!(!dest.exists());
    }

    #[test]
    fn delete_restores_from_backup() {
        let dir = tempfile::tempdir().unwrap();
        let scratch = temp::Context::new(dir.path(), "scratch").unwrap();
        let env = OpEnv::silent(&scratch);
        let victim = dir.path().join("victim");
        fs::write(&victim, b"precious").unwrap();

        let registry = registry();
        let mut op = Operation::new("Delete", vec![victim.display().to_string()]);
        run(&registry, &mut op, &env).unwrap();
        assert!(!victim.exists());
        undo(&registry, &mut op, &env);
        assert_eq!(fs::read(&victim).unwrap(), b"precious");
    }

    #[test]
    fn delete_backs_up_whole_directories() {
        let dir = tempfile::tempdir().unwrap();
        let scratch = temp::Context::new(dir.path(), "scratch").unwrap();
        let env = OpEnv::silent(&scratch);
        let tree = dir.path().join("tree");
        fs::create_dir_all(tree.join("inner")).unwrap();
        fs::write(tree.join("inner/file"), b"kept").unwrap();

        let registry = registry();
        let mut op = Operation::new("Delete", vec![tree.display().to_string()]);
        run(&registry, &mut op, &env).unwrap();
        assert!(!tree.exists());
        undo(&registry, &mut op, &env);
        assert_eq!(fs::read(tree.join("inner/file")).unwrap(), b"kept");
    }

    #[test]
    fn mkdir_undo_removes_only_what_it_created() {
        let dir = tempfile::tempdir().unwrap();
        let scratch = temp::Context::new(dir.path(), "scratch").unwrap();
        let env = OpEnv::silent(&scratch);
        let deep = dir.path().join("a/b/c");

        let registry = registry();
        let mut op = Operation::new("Mkdir", vec![deep.display().to_string()]);
        run(&registry, &mut op, &env).unwrap();
        assert!(deep.is_dir());

        undo(&registry, &mut op, &env);
        assert!(!dir.path().join("a").exists());
    }

    #[test]
    fn mkdir_undo_keeps_nonempty_directories() {
        let dir = tempfile::tempdir().unwrap();
        let scratch = temp::Context::new(dir.path(), "scratch").unwrap();
        let env = OpEnv::silent(&scratch);
        let deep = dir.path().join("a/b");

        let registry = registry();
        let mut op = Operation::new("Mkdir", vec![deep.display().to_string()]);
        run(&registry, &mut op, &env).unwrap();
        fs::write(deep.join("keep"), b"data").unwrap();

        undo(&registry, &mut op, &env);
        assert!(deep.join("keep").exists());
    }

    #[test]
    fn environment_variable_restores_previous_value() {
        let dir = tempfile::tempdir().unwrap();
        let scratch = temp::Context::new(dir.path(), "scratch").unwrap();
        let env = OpEnv::silent(&scratch);
        std::env::set_var("INSTILL_OP_TEST", "before");

        let registry = registry();
        let mut op = Operation::new(
            "EnvironmentVariable",
            vec!["INSTILL_OP_TEST".into(), "after".into()],
        );
        run(&registry, &mut op, &env).unwrap();
        assert_eq!(std::env::var("INSTILL_OP_TEST").unwrap(), "after");
        undo(&registry, &mut op, &env);
        assert_eq!(std::env::var("INSTILL_OP_TEST").unwrap(), "before");
    }

    #[cfg(unix)]
    #[test]
    fn execute_fails_on_nonzero_exit_and_runs_declared_undo() {
        let dir = tempfile::tempdir().unwrap();
        let scratch = temp::Context::new(dir.path(), "scratch").unwrap();
        let env = OpEnv::silent(&scratch);
        let registry = registry();

        let mut ok = Operation::new("Execute", vec!["true".into()]);
        run(&registry, &mut ok, &env).unwrap();

        let mut bad = Operation::new("Execute", vec!["false".into()]);
        assert!(run(&registry, &mut bad, &env).is_err());

        let marker = dir.path().join("undone");
        let mut with_undo = Operation::new(
            "Execute",
            vec![
                "true".into(),
                super::UNDO_EXECUTE_SEPARATOR.into(),
                "touch".into(),
                marker.display().to_string(),
            ],
        );
        run(&registry, &mut with_undo, &env).unwrap();
        undo(&registry, &mut with_undo, &env);
        assert!(marker.exists());
    }

    #[cfg(unix)]
    #[test]
    fn shortcut_links_and_unlinks() {
        let dir = tempfile::tempdir().unwrap();
        let scratch = temp::Context::new(dir.path(), "scratch").unwrap();
        let env = OpEnv::silent(&scratch);
        let target = dir.path().join("tool");
        fs::write(&target, b"#!").unwrap();
        let link = dir.path().join("bin/tool");

        let registry = registry();
        let mut op = Operation::new(
            "CreateShortcut",
            vec![target.display().to_string(), link.display().to_string()],
        );
        run(&registry, &mut op, &env).unwrap();
        assert!(fs::symlink_metadata(&link).unwrap().file_type().is_symlink());
        undo(&registry, &mut op, &env);
        assert!(!link.exists());
    }
}
