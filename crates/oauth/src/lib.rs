//! OAuth credentials for `mcp-remote` and cross-process coordination of the
//! interactive authorization step.
//!
//! Every process talking to the same server shares one on-disk namespace
//! (see [`storage`]); [`coordinator`] makes sure only one of them opens a
//! browser at a time.

pub mod authorize;
pub mod callback_server;
mod config_dir;
pub mod coordinator;
pub mod discovery;
pub mod env_override;
pub mod error;
pub mod flow;
pub mod identity;
pub mod liveness;
pub mod pkce;
pub mod provider;
pub mod storage;
pub mod types;

pub use {
    authorize::{Authorized, Authorizer, TokenOrigin},
    callback_server::{CallbackResult, CallbackServer},
    config_dir::{credentials_dir, remote_config_dir},
    coordinator::{
        Acquisition, CoordinationMode, CoordinationRecord, Coordinator, LockState, OwnerGuard,
        ReleaseOutcome, WaitOutcome,
    },
    discovery::{ServerEndpoints, discover, parse_www_authenticate, register_client},
    env_override::EnvOverrides,
    flow::{FlowConfig, OAuthFlow},
    identity::ServerIdentity,
    liveness::{Liveness, LivenessProbe, OwnerIdentity, SystemProbe},
    provider::{
        AuthorizationPrompt, BrowserLauncher, CredentialProvider, CredentialSource,
        InvalidateScope, SourceOrigin, SystemBrowser,
    },
    storage::{Artifact, ArtifactKind, CredentialStore},
    types::{
        ClientMetadata, ClientRegistration, CodeVerifier, ExpiresIn, ExpiryDiagnostic,
        PkceChallenge, TokenSet, serialize_option_secret, serialize_secret,
    },
};

pub use error::{Error, Result};
