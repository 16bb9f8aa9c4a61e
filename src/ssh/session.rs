//! SSH session handling for ephemeral payment servers
//!
//! One `PaymentConnection` per accepted TCP connection. Clients are not
//! authenticated. The first `session` channel runs the payment script; every
//! other channel is refused, and once the script ends the connection is
//! dropped.

use async_trait::async_trait;
use russh::server::{Auth, Handle, Msg, Session, run_stream};
use russh::{Channel, ChannelId, Disconnect};
use russh_keys::key::PublicKey;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;

use super::script::{CapturedInput, PaymentScript, ScriptError};
use crate::ephemeral::lifecycle::SessionHandler;
use crate::ephemeral::outcome::{SessionError, SessionOutcome};

type ScriptResult = Result<CapturedInput, ScriptError>;

/// Runs the payment script over every connection accepted by one ephemeral
/// server.
pub struct PaymentSessionHandler {
    server_id: String,
    config: Arc<russh::server::Config>,
    script: Arc<PaymentScript>,
}

impl PaymentSessionHandler {
    pub fn new(
        server_id: String,
        config: Arc<russh::server::Config>,
        script: PaymentScript,
    ) -> Self {
        Self {
            server_id,
            config,
            script: Arc::new(script),
        }
    }
}

#[async_trait]
impl<C> SessionHandler<C> for PaymentSessionHandler
where
    C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn handle(&self, conn: C, peer: SocketAddr) -> SessionOutcome {
        let (script_tx, script_rx) = oneshot::channel();
        let connection =
            PaymentConnection::new(self.server_id.clone(), peer, self.script.clone(), script_tx);

        let running = match run_stream(self.config.clone(), conn, connection).await {
            Ok(running) => running,
            Err(e) => {
                tracing::warn!("[{}] Failed to handshake with {}: {}", self.server_id, peer, e);
                return SessionOutcome::failed(peer, SessionError::Handshake(e.to_string()));
            }
        };

        let session_result = running.await;
        if let Err(e) = &session_result {
            tracing::debug!(
                "[{}] SSH session with {} ended with error: {}",
                self.server_id,
                peer,
                e
            );
        }

        // the sender lives in the script task, or is dropped with the handler
        // if no session channel was ever opened
        match script_rx.await {
            Ok(Ok(captured)) => SessionOutcome::completed(peer, captured),
            Ok(Err(e)) => SessionOutcome::failed(peer, SessionError::Script(e)),
            Err(_) => match session_result {
                Err(e) => SessionOutcome::failed(peer, SessionError::Protocol(e.to_string())),
                Ok(()) => SessionOutcome::failed(peer, SessionError::NoChannel),
            },
        }
    }
}

pub struct PaymentConnection {
    server_id: String,
    peer: SocketAddr,
    script: Arc<PaymentScript>,
    script_tx: Option<oneshot::Sender<ScriptResult>>,
    channel: Option<ChannelId>,
}

impl PaymentConnection {
    fn new(
        server_id: String,
        peer: SocketAddr,
        script: Arc<PaymentScript>,
        script_tx: oneshot::Sender<ScriptResult>,
    ) -> Self {
        Self {
            server_id,
            peer,
            script,
            script_tx: Some(script_tx),
            channel: None,
        }
    }

    fn is_payment_channel(&self, channel: ChannelId) -> bool {
        self.channel == Some(channel)
    }

    async fn run_script(
        server_id: String,
        peer: SocketAddr,
        script: Arc<PaymentScript>,
        channel: Channel<Msg>,
        handle: Handle,
        script_tx: oneshot::Sender<ScriptResult>,
    ) {
        let channel_id = channel.id();
        tracing::debug!("[{}] Collecting ${} from {}", server_id, script.amount(), peer);

        let result = script.run(channel.into_stream()).await;
        match &result {
            Ok(captured) => {
                tracing::info!("[{}] Card number from {}: {}", server_id, peer, captured.masked());
            }
            Err(e) => {
                tracing::warn!("[{}] Payment script with {} failed: {}", server_id, peer, e);
            }
        }
        let _ = script_tx.send(result);

        let _ = handle.close(channel_id).await;
        let _ = handle
            .disconnect(
                Disconnect::ByApplication,
                "payment session finished".to_string(),
                "en".to_string(),
            )
            .await;
    }
}

#[async_trait]
impl russh::server::Handler for PaymentConnection {
    type Error = anyhow::Error;

    async fn auth_none(&mut self, user: &str) -> Result<Auth, Self::Error> {
        tracing::debug!(
            "[{}] Accepting {} from {} without credentials",
            self.server_id,
            user,
            self.peer
        );
        Ok(Auth::Accept)
    }

    async fn auth_password(&mut self, user: &str, _password: &str) -> Result<Auth, Self::Error> {
        tracing::debug!(
            "[{}] Accepting {} from {} (password ignored)",
            self.server_id,
            user,
            self.peer
        );
        Ok(Auth::Accept)
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        _public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        tracing::debug!("[{}] Accepting {} from {} (key ignored)", self.server_id, user, self.peer);
        Ok(Auth::Accept)
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let Some(script_tx) = self.script_tx.take() else {
            tracing::debug!(
                "[{}] Rejecting extra session channel from {}",
                self.server_id,
                self.peer
            );
            return Ok(false);
        };

        tracing::debug!(
            "[{}] Session channel {} opened by {}",
            self.server_id,
            channel.id(),
            self.peer
        );
        self.channel = Some(channel.id());

        tokio::spawn(Self::run_script(
            self.server_id.clone(),
            self.peer,
            self.script.clone(),
            channel,
            session.handle(),
            script_tx,
        ));

        Ok(true)
    }

    async fn channel_open_x11(
        &mut self,
        _channel: Channel<Msg>,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        tracing::debug!("[{}] Rejecting x11 channel from {}", self.server_id, self.peer);
        Ok(false)
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        _channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        tracing::debug!(
            "[{}] Rejecting direct-tcpip channel to {}:{} from {}",
            self.server_id,
            host_to_connect,
            port_to_connect,
            self.peer
        );
        Ok(false)
    }

    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        tracing::debug!(
            "[{}] Refusing tcpip-forward {}:{} from {}",
            self.server_id,
            address,
            port,
            self.peer
        );
        Ok(false)
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if self.is_payment_channel(channel) {
            tracing::debug!(
                "[{}] PTY {} {}x{} for {}",
                self.server_id,
                term,
                col_width,
                row_height,
                self.peer
            );
            let _ = session.channel_success(channel);
        } else {
            let _ = session.channel_failure(channel);
        }
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if self.is_payment_channel(channel) {
            let _ = session.channel_success(channel);
        } else {
            let _ = session.channel_failure(channel);
        }
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        tracing::debug!(
            "[{}] Refusing exec {:?} from {}",
            self.server_id,
            String::from_utf8_lossy(data),
            self.peer
        );
        let _ = session.channel_failure(channel);
        Ok(())
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        _variable_name: &str,
        _variable_value: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let _ = session.channel_failure(channel);
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        tracing::debug!("[{}] Refusing subsystem {} from {}", self.server_id, name, self.peer);
        let _ = session.channel_failure(channel);
        Ok(())
    }

    async fn x11_request(
        &mut self,
        channel: ChannelId,
        _single_connection: bool,
        _x11_auth_protocol: &str,
        _x11_auth_cookie: &str,
        _x11_screen_number: u32,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let _ = session.channel_failure(channel);
        Ok(())
    }

    async fn agent_request(
        &mut self,
        _channel: ChannelId,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(false)
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        tracing::debug!("[{}] Channel {} closed by {}", self.server_id, channel, self.peer);
        Ok(())
    }
}
