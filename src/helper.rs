//! The elevated helper process and its client.
//!
//! When an operation carries the `admin` attribute and the process lacks
//! rights, the engine spawns itself as an elevated child in helper mode
//! and speaks the framed packet protocol over the child's stdio. The
//! helper executes operations with its own registry and reports `ok` or
//! `error` per request; it honors `shutdown` before its next operation.

use std::io::{Read, Write};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};
use wait_timeout::ChildExt;

use crate::context::{AdminProvider, HelperChannel};
use crate::errors::InstallError;
use crate::operation::builtin::run_single;
use crate::operation::{OpEnv, Operation, OperationRegistry};
use crate::protocol::{
    self, recv_packet, send_packet, Packet, CMD_COPY_FILE, CMD_DELETE, CMD_ERROR,
    CMD_EXECUTE_OPERATION, CMD_OK, CMD_RENAME, CMD_SHUTDOWN, CMD_WRITE_SETTINGS_FILE,
};
use crate::temp;
use crate::utils;

/// How long the spawned helper gets to say hello.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Environment override for the elevation launcher (`pkexec` by default on
/// Unix). Authorization-related variables of the launcher itself pass
/// through untouched because the child inherits the environment.
pub const ELEVATOR_ENV: &str = "INSTILL_ELEVATOR";

/// The hidden flag the engine passes to itself to enter helper mode.
pub const HELPER_FLAG: &str = "--helper-server";

// ---------------------------------------------------------------------------
// Client side

/// Spawns the current executable elevated, in helper mode.
pub struct ElevatedSpawner;

impl AdminProvider for ElevatedSpawner {
    fn acquire(&mut self) -> Result<Box<dyn HelperChannel>> {
        let exe = std::env::current_exe().context("cannot locate own executable")?;
        let mut command = elevation_command();
        command
            .arg(&exe)
            .arg(HELPER_FLAG)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        debug!("spawning elevated helper: {command:?}");
        let mut child = command
            .spawn()
            .map_err(|e| InstallError::Elevation(format!("could not launch helper: {e}")))?;

        let stdin = child.stdin.take().expect("helper stdin is piped");
        let stdout = child.stdout.take().expect("helper stdout is piped");
        let rx = spawn_reader(stdout);

        let mut channel = HelperProcess {
            child,
            stdin,
            rx,
            buffer: Vec::new(),
        };
        // Handshake: the helper announces itself before the first request.
        let hello = channel
            .receive(Some(HANDSHAKE_TIMEOUT))
            .map_err(|e| channel.abort(e))?;
        if hello.command != CMD_OK {
            return Err(channel.abort(
                InstallError::Elevation(format!("unexpected helper greeting '{}'", hello.command))
                    .into(),
            ));
        }
        info!("elevated helper is up");
        Ok(Box::new(channel))
    }
}

#[cfg(unix)]
fn elevation_command() -> Command {
    let launcher =
        std::env::var(ELEVATOR_ENV).unwrap_or_else(|_| "pkexec".to_owned());
    Command::new(launcher)
}

#[cfg(windows)]
fn elevation_command() -> Command {
    // Windows elevation happens through the application manifest; when the
    // engine itself runs elevated the helper inherits that token.
    match std::env::var(ELEVATOR_ENV) {
        Ok(launcher) => Command::new(launcher),
        Err(_) => {
            let mut c = Command::new("cmd");
            c.arg("/C");
            c
        }
    }
}

fn spawn_reader(mut stdout: impl Read + Send + 'static) -> mpsc::Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut chunk = [0u8; 4096];
        loop {
            match stdout.read(&mut chunk) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if tx.send(chunk[..n].to_vec()).is_err() {
                        break;
                    }
                }
            }
        }
    });
    rx
}

struct HelperProcess {
    child: Child,
    stdin: ChildStdin,
    rx: mpsc::Receiver<Vec<u8>>,
    buffer: Vec<u8>,
}

impl HelperProcess {
    fn receive(&mut self, timeout: Option<Duration>) -> Result<Packet> {
        loop {
            let (packet, consumed) = recv_packet(&self.buffer)?;
            if let Some(packet) = packet {
                self.buffer.drain(..consumed);
                return Ok(packet);
            }
            let chunk = match timeout {
                Some(t) => self.rx.recv_timeout(t).map_err(|_| {
                    InstallError::Elevation("helper did not answer in time".into())
                })?,
                None => self.rx.recv().map_err(|_| {
                    InstallError::Elevation("helper closed the connection".into())
                })?,
            };
            self.buffer.extend(chunk);
        }
    }

    fn abort(&mut self, error: anyhow::Error) -> anyhow::Error {
        let _ = self.child.kill();
        let _ = self.child.wait();
        error
    }
}

impl HelperChannel for HelperProcess {
    fn request(&mut self, command: &str, payload: &[u8]) -> Result<Vec<u8>> {
        self.stdin
            .write_all(&send_packet(command, payload))
            .and_then(|()| self.stdin.flush())
            .map_err(|e| InstallError::Elevation(format!("could not reach helper: {e}")))?;
        let reply = self.receive(None)?;
        match reply.command.as_str() {
            CMD_OK => Ok(reply.payload),
            CMD_ERROR => Err(InstallError::Operation {
                kind: command.to_owned(),
                detail: String::from_utf8_lossy(&reply.payload).into_owned(),
            }
            .into()),
            other => Err(InstallError::Protocol(format!("unexpected reply '{other}'")).into()),
        }
    }

    fn shutdown(&mut self) -> Result<()> {
        let _ = self.stdin.write_all(&send_packet(CMD_SHUTDOWN, &[]));
        let _ = self.stdin.flush();
        match self.child.wait_timeout(Duration::from_secs(5)) {
            Ok(Some(_)) => {}
            _ => {
                warn!("helper is lingering, killing it");
                let _ = self.child.kill();
                let _ = self.child.wait();
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Server side

/// The helper main loop over this process's stdio. Entered through the
/// hidden CLI flag when the engine spawns itself elevated.
pub fn serve(registry: &OperationRegistry) -> Result<()> {
    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    serve_streams(&mut stdin.lock(), &mut stdout.lock(), registry)
}

/// Protocol loop over arbitrary streams; tests drive it with in-memory
/// buffers.
pub fn serve_streams(
    input: &mut dyn Read,
    output: &mut dyn Write,
    registry: &OperationRegistry,
) -> Result<()> {
    let scratch = temp::Context::in_system_temp("instill-helper")?;
    let mut buffer: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 4096];

    // Announce readiness; the client's handshake waits for this.
    output.write_all(&send_packet(CMD_OK, b"ready"))?;
    output.flush()?;

    loop {
        // Drain every complete packet in the buffer before reading more.
        loop {
            let (packet, consumed) = match recv_packet(&buffer) {
                Ok(result) => result,
                Err(e) => {
                    warn!("malformed packet from client: {e}");
                    output.write_all(&send_packet(CMD_ERROR, e.to_string().as_bytes()))?;
                    output.flush()?;
                    return Err(e);
                }
            };
            let Some(packet) = packet else { break };
            buffer.drain(..consumed);

            if packet.command == CMD_SHUTDOWN {
                output.write_all(&send_packet(CMD_OK, &[]))?;
                output.flush()?;
                return Ok(());
            }
            let reply = handle_packet(&packet, registry, &scratch);
            output.write_all(&send_packet(&reply.command, &reply.payload))?;
            output.flush()?;
        }

        let n = input.read(&mut chunk)?;
        if n == 0 {
            debug!("client went away, shutting helper down");
            return Ok(());
        }
        buffer.extend_from_slice(&chunk[..n]);
    }
}

fn handle_packet(packet: &Packet, registry: &OperationRegistry, scratch: &temp::Context) -> Packet {
    match execute_command(packet, registry, scratch) {
        Ok(payload) => Packet::ok(payload),
        Err(e) => Packet::error(&format!("{e:#}")),
    }
}

fn execute_command(
    packet: &Packet,
    registry: &OperationRegistry,
    scratch: &temp::Context,
) -> Result<Vec<u8>> {
    match packet.command.as_str() {
        CMD_EXECUTE_OPERATION => {
            let mut op = Operation::decode(&packet.payload)?;
            let phase = op.attr("phase").unwrap_or("perform").to_owned();
            op.clear_attr("phase");
            let env = OpEnv::silent(scratch);
            match phase.as_str() {
                "undo" => registry.behavior(&op.kind)?.undo(&mut op, &env)?,
                // A failing perform undoes its own half-applied state
                // before the error crosses back to the client.
                "perform" => run_single(registry, &mut op, &env)?,
                other => {
                    return Err(
                        InstallError::Protocol(format!("unknown phase '{other}'")).into()
                    );
                }
            }
            Ok(op.encode())
        }
        CMD_COPY_FILE => {
            let args = protocol::decode_strings(&packet.payload)?;
            let [src, dest] = args.as_slice() else {
                return Err(InstallError::Protocol("copy-file wants 2 paths".into()).into());
            };
            utils::copy_file(src.as_ref(), dest.as_ref())?;
            Ok(Vec::new())
        }
        CMD_RENAME => {
            let args = protocol::decode_strings(&packet.payload)?;
            let [src, dest] = args.as_slice() else {
                return Err(InstallError::Protocol("rename wants 2 paths".into()).into());
            };
            utils::rename("helper", src.as_ref(), dest.as_ref())?;
            Ok(Vec::new())
        }
        CMD_DELETE => {
            let args = protocol::decode_strings(&packet.payload)?;
            let [path] = args.as_slice() else {
                return Err(InstallError::Protocol("delete wants 1 path".into()).into());
            };
            let path = std::path::Path::new(path);
            if utils::is_directory(path) {
                utils::remove_dir("helper", path)?;
            } else {
                utils::ensure_file_removed("helper", path)?;
            }
            Ok(Vec::new())
        }
        CMD_WRITE_SETTINGS_FILE => {
            let args = protocol::decode_strings(&packet.payload)?;
            let [path, contents] = args.as_slice() else {
                return Err(
                    InstallError::Protocol("write-settings-file wants path and contents".into())
                        .into(),
                );
            };
            utils::replace_file("settings", path.as_ref(), contents.as_bytes())?;
            Ok(Vec::new())
        }
        unknown => Err(InstallError::Protocol(format!("unknown command '{unknown}'")).into()),
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::{serve_streams, HELPER_FLAG};
    use crate::operation::OperationRegistry;
    use crate::protocol::{
        decode_strings, encode_strings, recv_packet, send_packet, CMD_ERROR, CMD_OK, CMD_RENAME,
        CMD_SHUTDOWN, CMD_WRITE_SETTINGS_FILE,
    };

    fn drive(requests: Vec<u8>) -> Vec<(String, Vec<u8>)> {
        let registry = OperationRegistry::with_builtins();
        let mut input = Cursor::new(requests);
        let mut output = Vec::new();
        serve_streams(&mut input, &mut output, &registry).unwrap();

        let mut replies = Vec::new();
        let mut rest = output.as_slice();
        loop {
            let (packet, consumed) = recv_packet(rest).unwrap();
            match packet {
                Some(p) => {
                    replies.push((p.command, p.payload));
                    rest = &rest[consumed..];
                }
                None => break,
            }
        }
        replies
    }

    #[test]
    fn serves_file_commands_and_shuts_down() {
        let dir = tempfile::tempdir().unwrap();
        let settings = dir.path().join("cfg.toml");
        let renamed = dir.path().join("cfg-final.toml");

        let mut requests = Vec::new();
        requests.extend(send_packet(
            CMD_WRITE_SETTINGS_FILE,
            &encode_strings(&[settings.display().to_string(), "a = 1\n".to_owned()]),
        ));
        requests.extend(send_packet(
            CMD_RENAME,
            &encode_strings(&[
                settings.display().to_string(),
                renamed.display().to_string(),
            ]),
        ));
        requests.extend(send_packet(CMD_SHUTDOWN, &[]));

        let replies = drive(requests);
        // Greeting, two command replies, shutdown ack.
        assert_eq!(replies.len(), 4);
        assert!(replies.iter().all(|(c, _)| c == CMD_OK));
        assert_eq!(std::fs::read_to_string(&renamed).unwrap(), "a = 1\n");
        assert!(!settings.exists());
    }

    #[test]
    fn unknown_commands_get_an_error_packet() {
        let mut requests = Vec::new();
        requests.extend(send_packet("frobnicate", b""));
        requests.extend(send_packet(CMD_SHUTDOWN, &[]));
        let replies = drive(requests);
        assert_eq!(replies[1].0, CMD_ERROR);
        assert!(String::from_utf8_lossy(&replies[1].1).contains("frobnicate"));
    }

    #[test]
    fn executes_operations_with_its_own_registry() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("made/by/helper");
        let op = crate::operation::Operation::new(
            "Mkdir",
            vec![target.display().to_string()],
        );

        let mut requests = Vec::new();
        requests.extend(send_packet(
            crate::protocol::CMD_EXECUTE_OPERATION,
            &op.encode(),
        ));
        requests.extend(send_packet(CMD_SHUTDOWN, &[]));

        let replies = drive(requests);
        assert_eq!(replies[1].0, CMD_OK);
        assert!(target.is_dir());
        // The reply carries the operation back, state included.
        let round_tripped = crate::operation::Operation::decode(&replies[1].1).unwrap();
        assert!(round_tripped.attr("created").is_some());
    }

    #[test]
    fn helper_flag_spelling_is_stable() {
        // The spawner and the CLI must agree on this literal.
        assert_eq!(HELPER_FLAG, "--helper-server");
        let strings = vec!["x".to_owned()];
        assert_eq!(decode_strings(&encode_strings(&strings)).unwrap(), strings);
    }
}
