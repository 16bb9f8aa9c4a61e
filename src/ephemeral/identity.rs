//! Per-server host identity

use russh::server::Config as SshConfig;
use russh_keys::key::KeyPair;
use std::sync::Arc;
use std::time::Duration;

use super::ProvisionError;

/// Host key for exactly one ephemeral server. Never persisted or reused.
pub struct ServerIdentity {
    key_pair: KeyPair,
    fingerprint: String,
}

impl ServerIdentity {
    pub fn provision() -> Result<Self, ProvisionError> {
        let key_pair = KeyPair::generate_ed25519().ok_or(ProvisionError::KeyGeneration)?;
        let fingerprint = key_pair
            .clone_public_key()
            .map_err(ProvisionError::PublicKey)?
            .fingerprint();

        Ok(Self {
            key_pair,
            fingerprint,
        })
    }

    /// SHA-256 fingerprint of the public host key
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Consume the identity into the russh server config that serves it.
    pub fn into_ssh_config(self, inactivity_timeout: Option<Duration>) -> Arc<SshConfig> {
        let config = SshConfig {
            inactivity_timeout,
            auth_rejection_time: Duration::from_secs(1),
            auth_rejection_time_initial: Some(Duration::from_secs(0)),
            keys: vec![self.key_pair],
            ..Default::default()
        };
        Arc::new(config)
    }
}
