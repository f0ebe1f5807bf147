//! File-backed credential store.
//!
//! Every server gets its own directory under `<config_dir>/servers/<identity>/`
//! holding one file per artifact:
//!
//! | artifact            | file                |
//! |---------------------|---------------------|
//! | client registration | `client_info.json`  |
//! | tokens              | `tokens.json`       |
//! | PKCE verifier       | `code_verifier.txt` |
//!
//! The coordinator's `lock.json` lives in the same directory.

use std::{
    fmt, fs,
    io::{self, Write},
    path::{Path, PathBuf},
    sync::atomic::{AtomicU32, Ordering},
};

use tracing::{debug, info, warn};

use crate::{
    Error, Result,
    config_dir::credentials_dir,
    identity::ServerIdentity,
    types::{ClientRegistration, CodeVerifier, TokenSet},
};

/// The kinds of artifact kept per server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    ClientInfo,
    Tokens,
    CodeVerifier,
}

impl ArtifactKind {
    pub const ALL: [Self; 3] = [Self::ClientInfo, Self::Tokens, Self::CodeVerifier];

    pub fn file_name(self) -> &'static str {
        match self {
            Self::ClientInfo => "client_info.json",
            Self::Tokens => "tokens.json",
            Self::CodeVerifier => "code_verifier.txt",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::ClientInfo => "client registration",
            Self::Tokens => "token set",
            Self::CodeVerifier => "code verifier",
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A value the store knows how to encode, decode and validate.
pub trait Artifact: Sized {
    const KIND: ArtifactKind;

    fn encode(&self) -> Result<Vec<u8>>;

    /// Parse and validate. Any error means the stored record is unusable.
    fn decode(bytes: &[u8]) -> Result<Self>;
}

impl Artifact for ClientRegistration {
    const KIND: ArtifactKind = ArtifactKind::ClientInfo;

    fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        let reg: Self = serde_json::from_slice(bytes)
            .map_err(|e| Error::schema(Self::KIND.label(), e.to_string()))?;
        reg.validate()?;
        Ok(reg)
    }
}

impl Artifact for TokenSet {
    const KIND: ArtifactKind = ArtifactKind::Tokens;

    fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        let tokens: Self = serde_json::from_slice(bytes)
            .map_err(|e| Error::schema(Self::KIND.label(), e.to_string()))?;
        tokens.validate()?;
        Ok(tokens)
    }
}

impl Artifact for CodeVerifier {
    const KIND: ArtifactKind = ArtifactKind::CodeVerifier;

    fn encode(&self) -> Result<Vec<u8>> {
        Ok(self.expose().as_bytes().to_vec())
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| Error::schema(Self::KIND.label(), e.to_string()))?
            .trim();
        if text.is_empty() {
            return Err(Error::schema(Self::KIND.label(), "verifier is empty"));
        }
        Ok(Self::new(text))
    }
}

/// Per-server credential persistence on the local filesystem.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    root: PathBuf,
}

impl CredentialStore {
    /// Store rooted at `<config_dir>/servers`.
    pub fn new() -> Self {
        Self {
            root: credentials_dir(),
        }
    }

    /// Create a store at a specific root (useful for testing).
    pub fn with_root(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding every artifact of `id`.
    pub fn namespace(&self, id: &ServerIdentity) -> PathBuf {
        self.root.join(id.as_str())
    }

    pub fn artifact_path(&self, id: &ServerIdentity, kind: ArtifactKind) -> PathBuf {
        self.namespace(id).join(kind.file_name())
    }

    /// Read an artifact. Missing, unreadable and invalid records all come
    /// back as `None`; the latter two are logged.
    pub fn read<A: Artifact>(&self, id: &ServerIdentity) -> Option<A> {
        let path = self.artifact_path(id, A::KIND);
        let data = match fs::read(&path) {
            Ok(d) => d,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(server = %id.short(), artifact = %A::KIND, "artifact not found");
                return None;
            },
            Err(e) => {
                warn!(
                    path = %path.display(),
                    artifact = %A::KIND,
                    error = %e,
                    "artifact read failed"
                );
                return None;
            },
        };

        match A::decode(&data) {
            Ok(artifact) => {
                debug!(server = %id.short(), artifact = %A::KIND, "artifact loaded");
                Some(artifact)
            },
            Err(e) => {
                warn!(
                    path = %path.display(),
                    artifact = %A::KIND,
                    error = %e,
                    "stored artifact is invalid, treating as absent"
                );
                None
            },
        }
    }

    /// Persist an artifact, replacing any previous version atomically.
    pub fn write<A: Artifact>(&self, id: &ServerIdentity, artifact: &A) -> Result<()> {
        let data = artifact.encode()?;
        let path = self.artifact_path(id, A::KIND);
        self.ensure_namespace(id)?;
        write_atomic(&path, &data)?;
        info!(server = %id.short(), artifact = %A::KIND, "artifact saved");
        Ok(())
    }

    /// Remove an artifact. Removing one that does not exist succeeds.
    pub fn delete(&self, id: &ServerIdentity, kind: ArtifactKind) -> Result<()> {
        let path = self.artifact_path(id, kind);
        match fs::remove_file(&path) {
            Ok(()) => {
                info!(server = %id.short(), artifact = %kind, "artifact deleted");
                Ok(())
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove every credential artifact of a server.
    pub fn clear(&self, id: &ServerIdentity) -> Result<()> {
        for kind in ArtifactKind::ALL {
            self.delete(id, kind)?;
        }
        Ok(())
    }

    pub fn exists(&self, id: &ServerIdentity, kind: ArtifactKind) -> bool {
        self.artifact_path(id, kind).is_file()
    }

    pub(crate) fn ensure_namespace(&self, id: &ServerIdentity) -> Result<PathBuf> {
        let dir = self.namespace(id);
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            fs::DirBuilder::new()
                .recursive(true)
                .mode(0o700)
                .create(&dir)?;
        }
        #[cfg(not(unix))]
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }
}

impl Default for CredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Write `data` to a uniquely named sibling of `path` with owner-only
/// permissions and return the sibling's path.
///
/// The name carries PID + counter so concurrent writers in different
/// processes never share a temp file.
pub(crate) fn write_temp(path: &Path, data: &[u8]) -> io::Result<PathBuf> {
    static COUNTER: AtomicU32 = AtomicU32::new(0);

    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp_path = path.with_file_name(format!("{file_name}.{}.{seq}.tmp", std::process::id()));

    let result = (|| -> io::Result<()> {
        let mut file = fs::File::create(&tmp_path)?;
        // Tightened before any secret is written.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            file.set_permissions(fs::Permissions::from_mode(0o600))?;
        }
        file.write_all(data)?;
        file.sync_all()
    })();

    match result {
        Ok(()) => Ok(tmp_path),
        Err(e) => {
            let _ = fs::remove_file(&tmp_path);
            Err(e)
        },
    }
}

/// Replace `path` with `data` without readers ever seeing a partial file.
pub(crate) fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let tmp_path = write_temp(path, data)?;
    if let Err(e) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(e.into());
    }
    Ok(())
}
