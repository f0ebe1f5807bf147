//! Cross-process ownership of the interactive authorization step.
//!
//! At most one process per server drives the browser flow. Ownership is a
//! `lock.json` record in the server's namespace, created with
//! create-if-absent semantics (a fully written temp file hard-linked into
//! place, so readers never see a partial record). Other processes wait for
//! the record to disappear, or take it over once its owner is dead or the
//! record is older than the staleness threshold.
//!
//! Removal, whether by the owner or by a process reaping a stale record, goes
//! through a rename to a private tombstone first. The tombstone is checked
//! against the record the remover meant to delete and put back if it turns
//! out to be someone else's.

use std::{
    fmt, fs, io,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};

use {
    mcp_remote_config::AuthSettings,
    serde::{Deserialize, Serialize},
    tracing::{debug, info, warn},
};

use crate::{
    Error, Result,
    identity::ServerIdentity,
    liveness::{Liveness, LivenessProbe, OwnerIdentity, SystemProbe},
    storage::{CredentialStore, write_atomic, write_temp},
    types::unix_now,
};

pub const LOCK_FILE: &str = "lock.json";

/// Attempts at creating the record before giving up on a namespace that
/// keeps changing under us.
const MAX_ACQUIRE_ATTEMPTS: u32 = 8;

/// An unparseable record younger than this may still be in the middle of a
/// non-atomic write and is left alone.
const CORRUPT_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockState {
    /// Owner is preparing the flow (discovery, registration).
    Acquired,
    /// Owner has a callback listener up and is waiting for the browser.
    AwaitingCallback,
}

/// Contents of `lock.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinationRecord {
    pub pid: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<u64>,
    /// Identity hash of the server this record guards.
    pub server: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_port: Option<u16>,
    pub state: LockState,
    /// Unix timestamp of acquisition.
    pub created_at: u64,
    /// Distinguishes successive owners that share a PID.
    pub nonce: String,
}

impl CoordinationRecord {
    pub fn owner(&self) -> OwnerIdentity {
        OwnerIdentity {
            pid: self.pid,
            started_at: self.started_at,
        }
    }

    pub fn age(&self) -> Duration {
        Duration::from_secs(unix_now().saturating_sub(self.created_at))
    }
}

/// How the owner's flow ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Completed,
    Failed,
    Abandoned,
}

impl fmt::Display for ReleaseOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Abandoned => write!(f, "abandoned"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinationMode {
    /// Lock records arbitrate between processes.
    Coordinated,
    /// No process introspection on this platform: every process acts as
    /// the owner and no records are written.
    Standalone,
}

/// Result of [`Coordinator::acquire`].
#[derive(Debug)]
pub enum Acquisition {
    Owner(OwnerGuard),
    /// Someone else owns the flow; the record is what we saw. `None` when
    /// the record is still too young to judge as unreadable.
    Waiter(Option<CoordinationRecord>),
}

/// How a wait on another owner ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The record went away or was replaced; re-read the store.
    Released,
    /// The owner died, went stale or left an unreadable record; try to
    /// acquire.
    OwnerVanished,
}

enum RecordRead {
    Missing,
    Corrupt { age: Duration },
    Present(CoordinationRecord),
}

pub struct Coordinator {
    store: CredentialStore,
    probe: Arc<dyn LivenessProbe>,
    me: OwnerIdentity,
    stale_after: Duration,
    poll_interval: Duration,
    mode: CoordinationMode,
}

impl Coordinator {
    pub fn new(store: CredentialStore, settings: &AuthSettings) -> Self {
        Self::with_probe(store, settings, Arc::new(SystemProbe))
    }

    pub fn with_probe(
        store: CredentialStore,
        settings: &AuthSettings,
        probe: Arc<dyn LivenessProbe>,
    ) -> Self {
        let mode = if probe.is_supported() {
            CoordinationMode::Coordinated
        } else {
            warn!(
                "process liveness cannot be checked on this platform; authorization is not \
                 coordinated across processes"
            );
            CoordinationMode::Standalone
        };
        Self {
            store,
            probe,
            me: OwnerIdentity::current(),
            stale_after: settings.stale_after(),
            poll_interval: settings.poll_interval(),
            mode,
        }
    }

    /// Act as a specific process (tests simulate several owners this way).
    #[must_use]
    pub fn with_identity(mut self, me: OwnerIdentity) -> Self {
        self.me = me;
        self
    }

    #[must_use]
    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    #[must_use]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn mode(&self) -> CoordinationMode {
        self.mode
    }

    pub fn identity(&self) -> OwnerIdentity {
        self.me
    }

    pub fn lock_path(&self, server: &ServerIdentity) -> PathBuf {
        self.store.namespace(server).join(LOCK_FILE)
    }

    /// The record currently on disk, if it parses.
    pub fn current_owner(&self, server: &ServerIdentity) -> Option<CoordinationRecord> {
        match read_record(&self.lock_path(server)) {
            RecordRead::Present(record) => Some(record),
            RecordRead::Missing | RecordRead::Corrupt { .. } => None,
        }
    }

    /// Try to become the owner of `server`'s authorization.
    pub fn acquire(&self, server: &ServerIdentity) -> Result<Acquisition> {
        let record = self.new_record(server);

        if self.mode == CoordinationMode::Standalone {
            debug!(server = %server.short(), "standalone mode, acting as owner");
            return Ok(Acquisition::Owner(OwnerGuard {
                path: None,
                record,
                server: server.clone(),
                released: false,
            }));
        }

        self.store.ensure_namespace(server)?;
        let path = self.lock_path(server);
        let data = serde_json::to_vec_pretty(&record)?;

        for attempt in 1..=MAX_ACQUIRE_ATTEMPTS {
            if create_exclusive(&path, &data)? {
                info!(server = %server.short(), pid = record.pid, "acquired authorization lock");
                return Ok(Acquisition::Owner(OwnerGuard {
                    path: Some(path),
                    record,
                    server: server.clone(),
                    released: false,
                }));
            }

            match read_record(&path) {
                // Released between our create and our read.
                RecordRead::Missing => continue,
                RecordRead::Corrupt { age } if age >= CORRUPT_GRACE => {
                    warn!(
                        server = %server.short(),
                        path = %path.display(),
                        "removing unreadable lock record"
                    );
                    remove_matching(&path, None)?;
                },
                RecordRead::Corrupt { age } => {
                    debug!(
                        server = %server.short(),
                        attempt,
                        age_ms = age.as_millis() as u64,
                        "lock record unreadable, treating it as owned"
                    );
                    return Ok(Acquisition::Waiter(None));
                },
                RecordRead::Present(existing) => {
                    if let Some(reason) = self.takeover_reason(&existing) {
                        info!(
                            server = %server.short(),
                            owner_pid = existing.pid,
                            age_secs = existing.age().as_secs(),
                            reason,
                            "taking over authorization lock"
                        );
                        remove_matching(&path, Some(&existing.nonce))?;
                        continue;
                    }
                    debug!(
                        server = %server.short(),
                        owner_pid = existing.pid,
                        "authorization owned by another process"
                    );
                    return Ok(Acquisition::Waiter(Some(existing)));
                },
            }
        }

        Err(Error::message(format!(
            "could not acquire authorization lock at {} after {MAX_ACQUIRE_ATTEMPTS} attempts",
            path.display()
        )))
    }

    /// Wait until the owner described by `seen` releases, disappears, or
    /// `timeout` elapses. With `seen` unset, the first record that parses
    /// becomes the one waited on.
    pub async fn wait_for_release(
        &self,
        server: &ServerIdentity,
        seen: Option<&CoordinationRecord>,
        timeout: Duration,
    ) -> Result<WaitOutcome> {
        let path = self.lock_path(server);
        let started = Instant::now();
        let mut seen = seen.cloned();
        info!(
            server = %server.short(),
            owner_pid = seen.as_ref().map(|r| r.pid),
            timeout_secs = timeout.as_secs(),
            "waiting for another process to finish authorizing"
        );

        loop {
            match read_record(&path) {
                RecordRead::Missing => {
                    debug!(server = %server.short(), "lock released");
                    return Ok(WaitOutcome::Released);
                },
                RecordRead::Present(current) => {
                    if let Some(ref prev) = seen
                        && current.nonce != prev.nonce
                    {
                        debug!(
                            server = %server.short(),
                            new_owner = current.pid,
                            "lock changed hands"
                        );
                        return Ok(WaitOutcome::Released);
                    }
                    if let Some(reason) = self.takeover_reason(&current) {
                        info!(
                            server = %server.short(),
                            owner_pid = current.pid,
                            reason,
                            "lock owner vanished"
                        );
                        return Ok(WaitOutcome::OwnerVanished);
                    }
                    seen = Some(current);
                },
                RecordRead::Corrupt { age } if age >= CORRUPT_GRACE => {
                    info!(server = %server.short(), "lock record stayed unreadable");
                    return Ok(WaitOutcome::OwnerVanished);
                },
                RecordRead::Corrupt { .. } => {},
            }

            let waited = started.elapsed();
            if waited >= timeout {
                let owner_pid = seen.as_ref().map(|r| r.pid);
                warn!(server = %server.short(), owner_pid, "gave up waiting for lock owner");
                return Err(Error::CoordinationTimeout {
                    server: server.server_url().to_string(),
                    owner_pid,
                    waited,
                });
            }
            tokio::time::sleep(self.poll_interval.min(timeout - waited)).await;
        }
    }

    fn new_record(&self, server: &ServerIdentity) -> CoordinationRecord {
        CoordinationRecord {
            pid: self.me.pid,
            started_at: self.me.started_at,
            server: server.as_str().to_string(),
            callback_port: None,
            state: LockState::Acquired,
            created_at: unix_now(),
            nonce: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// Why `record` may be taken over, or `None` if its owner is in charge.
    fn takeover_reason(&self, record: &CoordinationRecord) -> Option<&'static str> {
        if record.age() >= self.stale_after {
            return Some("stale");
        }
        match self.probe.probe(&record.owner()) {
            Liveness::Dead => Some("owner not running"),
            Liveness::Alive | Liveness::Unknown => None,
        }
    }
}

/// Held by the process that owns the authorization. Dropping it without
/// calling [`OwnerGuard::release`] releases with [`ReleaseOutcome::Abandoned`].
pub struct OwnerGuard {
    /// `None` in standalone mode.
    path: Option<PathBuf>,
    record: CoordinationRecord,
    server: ServerIdentity,
    released: bool,
}

impl OwnerGuard {
    pub fn record(&self) -> &CoordinationRecord {
        &self.record
    }

    /// Publish the callback port so waiters and `status` can see it.
    pub fn set_callback_port(&mut self, port: u16) -> Result<()> {
        self.record.callback_port = Some(port);
        self.record.state = LockState::AwaitingCallback;
        let Some(path) = &self.path else {
            return Ok(());
        };
        match read_record(path) {
            RecordRead::Present(current) if current.nonce == self.record.nonce => {
                write_atomic(path, &serde_json::to_vec_pretty(&self.record)?)
            },
            _ => {
                warn!(server = %self.server.short(), "authorization lock was taken over");
                Err(Error::message("authorization lock is no longer held by this process"))
            },
        }
    }

    pub fn release(mut self, outcome: ReleaseOutcome) -> Result<()> {
        self.release_inner(outcome)
    }

    fn release_inner(&mut self, outcome: ReleaseOutcome) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        let Some(path) = &self.path else {
            return Ok(());
        };
        if remove_matching(path, Some(&self.record.nonce))? {
            info!(server = %self.server.short(), %outcome, "released authorization lock");
        } else {
            warn!(
                server = %self.server.short(),
                %outcome,
                "authorization lock was taken over before release; leaving it"
            );
        }
        Ok(())
    }
}

impl Drop for OwnerGuard {
    fn drop(&mut self) {
        if let Err(e) = self.release_inner(ReleaseOutcome::Abandoned) {
            warn!(server = %self.server.short(), error = %e, "failed to release authorization lock");
        }
    }
}

impl fmt::Debug for OwnerGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OwnerGuard")
            .field("server", &self.server.short())
            .field("pid", &self.record.pid)
            .field("standalone", &self.path.is_none())
            .field("released", &self.released)
            .finish()
    }
}

// ── Filesystem primitives ──────────────────────────────────────────────────

/// Create `path` with `data` only if it does not exist. `Ok(false)` means
/// someone else's record is there.
fn create_exclusive(path: &Path, data: &[u8]) -> Result<bool> {
    let tmp = write_temp(path, data)?;
    let linked = fs::hard_link(&tmp, path);
    let _ = fs::remove_file(&tmp);
    match linked {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) if e.kind() == io::ErrorKind::Unsupported => create_new_fallback(path, data),
        Err(e) => Err(e.into()),
    }
}

/// For filesystems without hard links. A reader may briefly see a partial
/// record, which [`CORRUPT_GRACE`] covers.
fn create_new_fallback(path: &Path, data: &[u8]) -> Result<bool> {
    use std::io::Write;

    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    match options.open(path) {
        Ok(mut file) => {
            file.write_all(data)?;
            file.sync_all()?;
            Ok(true)
        },
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e.into()),
    }
}

fn read_record(path: &Path) -> RecordRead {
    let data = match fs::read(path) {
        Ok(d) => d,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return RecordRead::Missing,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "lock record unreadable");
            return RecordRead::Corrupt {
                age: file_age(path),
            };
        },
    };
    match serde_json::from_slice(&data) {
        Ok(record) => RecordRead::Present(record),
        Err(e) => {
            debug!(path = %path.display(), error = %e, "lock record does not parse");
            RecordRead::Corrupt {
                age: file_age(path),
            }
        },
    }
}

fn file_age(path: &Path) -> Duration {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| modified.elapsed().ok())
        .unwrap_or_default()
}

/// Remove the record at `path` if it is the one identified by `nonce`
/// (`None`: an unparseable record). Returns whether it was removed.
fn remove_matching(path: &Path, nonce: Option<&str>) -> Result<bool> {
    let tombstone = path.with_file_name(format!(
        "{LOCK_FILE}.{}.{}.reap",
        std::process::id(),
        uuid::Uuid::new_v4().simple()
    ));
    match fs::rename(path, &tombstone) {
        Ok(()) => {},
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e.into()),
    }

    let matches = match (read_record(&tombstone), nonce) {
        (RecordRead::Present(record), Some(nonce)) => record.nonce == nonce,
        (RecordRead::Corrupt { .. }, None) => true,
        _ => false,
    };
    if !matches {
        // Not what we meant to remove; put it back unless a newer one exists.
        match fs::hard_link(&tombstone, path) {
            Ok(()) => {},
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                warn!(path = %path.display(), "lock replaced while restoring a record");
            },
            Err(e) => warn!(path = %path.display(), error = %e, "failed to restore lock record"),
        }
    }
    fs::remove_file(&tombstone)?;
    Ok(matches)
}
