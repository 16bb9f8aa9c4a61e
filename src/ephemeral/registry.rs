//! Registry of live and recently finished ephemeral servers
//!
//! Each entry keeps the descriptor handed to the client, a cancellation
//! handle and a watch slot holding the server's current state (and terminal
//! outcome once done).

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::Rng;
use serde::Serialize;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::ProvisionError;
use super::events::ServerEvent;
use super::identity::ServerIdentity;
use super::lifecycle::LifecycleManager;
use super::listener::EphemeralListener;
use super::outcome::{ServerOutcome, ServerState};
use crate::config::config::Config;
use crate::ssh::PaymentSessionHandler;
use crate::ssh::line_reader::EchoPolicy;
use crate::ssh::script::PaymentScript;

#[derive(Debug, Clone)]
pub struct ProvisionSettings {
    pub external_addr: String,
    pub bind_ip: IpAddr,
    pub budget: Duration,
    pub accept_timeout: Duration,
    pub inactivity_timeout: Option<Duration>,
    pub username_prefix: String,
    pub client_command: String,
    pub echo: EchoPolicy,
    pub max_line_len: usize,
}

impl ProvisionSettings {
    pub fn from_config(config: &Config, bind_ip: IpAddr) -> Self {
        Self {
            external_addr: config.server.external_addr.clone(),
            bind_ip,
            budget: config.payments.budget(),
            accept_timeout: config.payments.accept_timeout(),
            inactivity_timeout: config.payments.inactivity_timeout(),
            username_prefix: config.payments.username_prefix.clone(),
            client_command: config.payments.client_command.clone(),
            echo: config.payments.echo,
            max_line_len: config.payments.max_line_len,
        }
    }
}

/// What the caller needs to reach a freshly created server.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionDescriptor {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub fingerprint: String,
    pub connection_string: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    #[serde(flatten)]
    pub descriptor: ConnectionDescriptor,
    pub amount: String,
    pub state: ServerState,
}

struct ServerEntry {
    descriptor: ConnectionDescriptor,
    amount: String,
    cancel: CancellationToken,
    state: watch::Receiver<ServerState>,
}

impl ServerEntry {
    fn status(&self) -> ServerStatus {
        ServerStatus {
            descriptor: self.descriptor.clone(),
            amount: self.amount.clone(),
            state: self.state.borrow().clone(),
        }
    }
}

pub struct ServerRegistry {
    servers: DashMap<String, ServerEntry>,
    settings: ProvisionSettings,
    events: broadcast::Sender<ServerEvent>,
    shutdown: CancellationToken,
}

impl ServerRegistry {
    pub fn new(settings: ProvisionSettings) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            servers: DashMap::new(),
            settings,
            events,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }

    /// Provision identity and listener, start the lifecycle manager and
    /// return without waiting for any client.
    pub async fn create(&self, amount: &str) -> Result<ConnectionDescriptor, ProvisionError> {
        let username = generate_username(&self.settings.username_prefix);

        let identity = ServerIdentity::provision()?;
        let listener = EphemeralListener::bind(self.settings.bind_ip)
            .await
            .map_err(ProvisionError::Bind)?;

        let id = Uuid::new_v4().to_string();
        let port = listener.port();
        let created_at = Utc::now();
        let expires_at = later_by(created_at, self.settings.budget);

        let descriptor = ConnectionDescriptor {
            id: id.clone(),
            host: self.settings.external_addr.clone(),
            port,
            connection_string: format!(
                "{} {}@{} -p {}",
                self.settings.client_command, username, self.settings.external_addr, port
            ),
            username,
            fingerprint: identity.fingerprint().to_string(),
            created_at,
            expires_at,
        };

        let ssh_config = identity.into_ssh_config(self.settings.inactivity_timeout);
        let script = PaymentScript::new(amount.to_string())
            .with_echo(self.settings.echo)
            .with_max_line_len(self.settings.max_line_len);
        let handler = Arc::new(PaymentSessionHandler::new(id.clone(), ssh_config, script));
        let cancel = self.shutdown.child_token();
        let (state_tx, state_rx) = watch::channel(ServerState::Accepting);

        let _ = self.events.send(ServerEvent::Listening {
            server_id: id.clone(),
            addr: listener.local_addr(),
        });

        let manager = LifecycleManager::new(
            id.clone(),
            listener,
            handler,
            self.settings.budget,
            self.settings.accept_timeout,
            cancel.clone(),
            self.events.clone(),
            state_tx,
        );

        self.servers.insert(
            id.clone(),
            ServerEntry {
                descriptor: descriptor.clone(),
                amount: amount.to_string(),
                cancel,
                state: state_rx,
            },
        );

        tokio::spawn(manager.run());

        tracing::info!("Created payment server {} on port {} for ${}", id, port, amount);
        Ok(descriptor)
    }

    pub fn get(&self, id: &str) -> Option<ServerStatus> {
        self.servers.get(id).map(|entry| entry.status())
    }

    pub fn list(&self) -> Vec<ServerStatus> {
        let mut servers: Vec<ServerStatus> =
            self.servers.iter().map(|entry| entry.status()).collect();
        servers.sort_by(|a, b| a.descriptor.created_at.cmp(&b.descriptor.created_at));
        servers
    }

    /// Stop accepting on one server. In-flight sessions are left to finish.
    pub fn cancel(&self, id: &str) -> bool {
        match self.servers.get(id) {
            Some(entry) => {
                entry.cancel.cancel();
                tracing::info!("Cancelled payment server {}", id);
                true
            }
            None => false,
        }
    }

    /// Cancel every server, including ones created after this call.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Wait for a server's terminal outcome.
    pub async fn wait_done(&self, id: &str) -> Option<ServerOutcome> {
        let mut state = self.servers.get(id)?.state.clone();
        let done = state.wait_for(|s| s.is_done()).await.ok()?;
        done.outcome().cloned()
    }

    /// Forget servers that finished more than `retain` ago.
    pub fn prune_finished(&self, retain: Duration) -> usize {
        let cutoff = earlier_by(Utc::now(), retain);
        let before = self.servers.len();

        self.servers.retain(|_, entry| match entry.state.borrow().outcome() {
            Some(outcome) => outcome.finished_at > cutoff,
            None => true,
        });

        before.saturating_sub(self.servers.len())
    }
}

/// Saturates at the end of representable time instead of overflowing.
fn later_by(at: DateTime<Utc>, by: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(by)
        .ok()
        .and_then(|by| at.checked_add_signed(by))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn earlier_by(at: DateTime<Utc>, by: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(by)
        .ok()
        .and_then(|by| at.checked_sub_signed(by))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn generate_username(prefix: &str) -> String {
    let suffix: u32 = rand::thread_rng().gen_range(0..1_000_000);
    format!("{}{:06}", prefix, suffix)
}
