//! The run context: everything that used to be a process-wide singleton in
//! installers of this shape, folded into one value that is threaded through
//! the resolver, the executor and the helper client. Tests construct one
//! with doubles at the seams.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use tracing::warn;

use crate::errors::InstallError;
use crate::variables::Variables;

/// What this process is doing to the target, normally decided by the marker
/// embedded in the maintenance tool binary.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RunMode {
    Installer,
    Updater,
    PackageManager,
    Uninstaller,
}

impl RunMode {
    /// Modes in which an existing installation is being changed in place.
    pub fn is_maintenance(self) -> bool {
        matches!(self, Self::Updater | Self::PackageManager)
    }
}

/// Outcome of a run, mapped onto the process exit code.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RunStatus {
    Success,
    Failure,
    Canceled,
}

impl RunStatus {
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Success => 0,
            Self::Failure => 1,
            Self::Canceled => 3,
        }
    }
}

/// Recognized configuration switches.
#[derive(Clone, Debug)]
pub struct RunOptions {
    /// Install `force-install` components even when deselected.
    pub force_installation: bool,
    /// Show components flagged `virtual` in listings.
    pub virtual_visible: bool,
    /// Reject unknown manifest keys instead of warning about them.
    pub strict_parse: bool,
    /// Silent reload attempts for the local catalog before surfacing.
    pub silent_retries: u32,
    /// Verify archive checksums after download.
    pub checksum_download: bool,
    /// When any pending update is flagged important, drop the others.
    pub important_updates_only: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            force_installation: false,
            virtual_visible: false,
            strict_parse: false,
            silent_retries: 3,
            checksum_download: true,
            important_updates_only: true,
        }
    }
}

/// How to answer questions when no human is attached.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum MessagePolicy {
    #[default]
    Interactive,
    AutoAccept,
    AutoReject,
}

impl MessagePolicy {
    /// Resolve a yes/no question. Interactive runs driven by the CLI accept
    /// by default; a front end replaces this with a real prompt.
    pub fn confirm(self, question: &str) -> bool {
        match self {
            Self::AutoAccept => true,
            Self::AutoReject => false,
            Self::Interactive => {
                warn!("no message handler attached, accepting: {question}");
                true
            }
        }
    }
}

/// Cooperative cancellation. One flag, set from anywhere, observed at every
/// suspension point; operations themselves are never preempted.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_canceled() {
            Err(InstallError::Canceled.into())
        } else {
            Ok(())
        }
    }
}

/// A channel to the elevated helper. The real implementation frames
/// requests over the helper's stdio; tests substitute an in-process one.
pub trait HelperChannel {
    /// Send `command` with `payload`, wait for the reply payload.
    fn request(&mut self, command: &str, payload: &[u8]) -> Result<Vec<u8>>;

    /// Ask the helper to exit after its current operation.
    fn shutdown(&mut self) -> Result<()>;
}

/// Capability for acquiring elevation. The real provider spawns the helper
/// as an elevated child process.
pub trait AdminProvider {
    fn acquire(&mut self) -> Result<Box<dyn HelperChannel>>;
}

struct DeniedAdmin;

impl AdminProvider for DeniedAdmin {
    fn acquire(&mut self) -> Result<Box<dyn HelperChannel>> {
        Err(InstallError::Elevation("no elevation capability configured".into()).into())
    }
}

/// Reference-counted administrative rights. `gain` is idempotent while
/// held; `release` drops the helper once the count reaches zero.
pub struct AdminRights {
    provider: Box<dyn AdminProvider>,
    channel: Option<Box<dyn HelperChannel>>,
    count: u32,
}

impl AdminRights {
    pub fn new(provider: Box<dyn AdminProvider>) -> Self {
        Self {
            provider,
            channel: None,
            count: 0,
        }
    }

    /// A rights value that refuses every elevation request. Used by runs
    /// that must never escalate and by the helper process itself.
    pub fn denied() -> Self {
        Self::new(Box::new(DeniedAdmin))
    }

    pub fn is_active(&self) -> bool {
        self.channel.is_some()
    }

    /// Acquire elevation, spawning the helper on first use. Returns whether
    /// this call actually gained rights (so the caller knows to release).
    pub fn gain(&mut self) -> Result<bool> {
        if self.channel.is_none() {
            self.channel = Some(self.provider.acquire()?);
        }
        self.count += 1;
        Ok(self.count == 1)
    }

    pub fn release(&mut self) {
        if self.count == 0 {
            return;
        }
        self.count -= 1;
        if self.count == 0 {
            if let Some(mut channel) = self.channel.take() {
                if let Err(e) = channel.shutdown() {
                    warn!("helper did not shut down cleanly: {e}");
                }
            }
        }
    }

    pub fn channel(&mut self) -> Option<&mut (dyn HelperChannel + '_)> {
        match &mut self.channel {
            Some(channel) => Some(channel.as_mut()),
            None => None,
        }
    }
}

impl Drop for AdminRights {
    fn drop(&mut self) {
        self.count = self.count.min(1);
        self.release();
    }
}

/// The explicit bundle threaded through a run.
pub struct RunContext {
    pub mode: RunMode,
    pub options: RunOptions,
    pub variables: Variables,
    pub cancel: CancelToken,
    pub messages: MessagePolicy,
    pub admin: AdminRights,
}

impl RunContext {
    pub fn new(mode: RunMode) -> Self {
        Self {
            mode,
            options: RunOptions::default(),
            variables: Variables::new(),
            cancel: CancelToken::new(),
            messages: MessagePolicy::default(),
            admin: AdminRights::denied(),
        }
    }
}
