//! Lifecycle manager for one ephemeral server
//!
//! Owns the listener from the moment it is bound until it is closed. The
//! accept loop runs with a short per-call timeout and also watches the
//! budget deadline and the cancellation token, so it never blocks in accept
//! past a shutdown request.

use async_trait::async_trait;
use chrono::Utc;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;

use super::events::{DrainReason, ServerEvent};
use super::listener::{AcceptError, Acceptor};
use super::outcome::{ExitReason, ServerOutcome, ServerState, SessionOutcome};
use super::tracker::SessionTracker;

/// Runs the protocol side of one accepted connection.
#[async_trait]
pub trait SessionHandler<C>: Send + Sync + 'static {
    async fn handle(&self, conn: C, peer: SocketAddr) -> SessionOutcome;
}

pub struct LifecycleManager<A, H> {
    server_id: String,
    acceptor: A,
    handler: Arc<H>,
    budget: Duration,
    accept_timeout: Duration,
    cancel: CancellationToken,
    events: broadcast::Sender<ServerEvent>,
    state: watch::Sender<ServerState>,
}

#[derive(Default)]
struct Tally {
    completed: usize,
    failed: usize,
}

impl<A, H> LifecycleManager<A, H>
where
    A: Acceptor,
    H: SessionHandler<A::Conn>,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        server_id: String,
        acceptor: A,
        handler: Arc<H>,
        budget: Duration,
        accept_timeout: Duration,
        cancel: CancellationToken,
        events: broadcast::Sender<ServerEvent>,
        state: watch::Sender<ServerState>,
    ) -> Self {
        Self {
            server_id,
            acceptor,
            handler,
            budget,
            accept_timeout,
            cancel,
            events,
            state,
        }
    }

    /// Drive the server to completion and return its terminal outcome.
    pub async fn run(self) -> ServerOutcome {
        let Self {
            server_id,
            mut acceptor,
            handler,
            budget,
            accept_timeout,
            cancel,
            events,
            state,
        } = self;

        let tracker = SessionTracker::new();
        let (outcome_tx, mut outcome_rx) = mpsc::unbounded_channel::<SessionOutcome>();
        let mut tally = Tally::default();

        let record = |tally: &mut Tally, outcome: SessionOutcome| {
            if outcome.is_success() {
                tally.completed += 1;
            } else {
                tally.failed += 1;
            }
            let _ = events.send(ServerEvent::SessionFinished {
                server_id: server_id.clone(),
                outcome,
            });
        };

        let deadline = tokio::time::sleep(budget);
        tokio::pin!(deadline);

        // Accepting
        let drain: Result<DrainReason, AcceptError> = loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break Ok(DrainReason::Cancelled),
                _ = &mut deadline => break Ok(DrainReason::BudgetElapsed),
                Some(outcome) = outcome_rx.recv() => record(&mut tally, outcome),
                accepted = acceptor.accept_timeout(accept_timeout) => match accepted {
                    Ok((conn, peer)) => {
                        let _ = events.send(ServerEvent::SessionStarted {
                            server_id: server_id.clone(),
                            peer,
                        });

                        let guard = tracker.enter();
                        let handler = handler.clone();
                        let outcome_tx = outcome_tx.clone();
                        tokio::spawn(async move {
                            let _guard = guard;
                            let outcome = handler.handle(conn, peer).await;
                            let _ = outcome_tx.send(outcome);
                        });
                    }
                    Err(e) if e.is_timeout() => continue,
                    Err(e) => break Err(e),
                },
            }
        };

        let exit = match drain {
            Ok(reason) => {
                // Draining: no more accepts, let in-flight sessions finish
                state.send_replace(ServerState::Draining);
                let _ = events.send(ServerEvent::Draining {
                    server_id: server_id.clone(),
                    reason,
                    outstanding: tracker.outstanding(),
                });
                tracing::debug!("[{}] Draining {} session(s)", server_id, tracker.outstanding());

                loop {
                    tokio::select! {
                        Some(outcome) = outcome_rx.recv() => record(&mut tally, outcome),
                        _ = tracker.wait_idle() => break,
                    }
                }
                // guards drop after their outcome is sent, so anything left is queued
                while let Ok(outcome) = outcome_rx.try_recv() {
                    record(&mut tally, outcome);
                }

                ExitReason::from(reason)
            }
            Err(e) => {
                tracing::error!("[{}] Failed to accept connection: {}", server_id, e);
                ExitReason::AcceptFailed(format!("failed to accept connection: {}", e))
            }
        };

        // Terminating
        state.send_replace(ServerState::Terminating);
        acceptor.close();

        let outcome = ServerOutcome {
            exit,
            sessions_completed: tally.completed,
            sessions_failed: tally.failed,
            finished_at: Utc::now(),
        };

        state.send_replace(ServerState::Done {
            outcome: outcome.clone(),
        });
        let _ = events.send(ServerEvent::Closed {
            server_id: server_id.clone(),
            outcome: outcome.clone(),
        });

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ephemeral::listener::EphemeralListener;
    use crate::ephemeral::outcome::SessionError;
    use crate::ssh::script::CapturedInput;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::sync::Notify;

    /// Acceptor fed by the test through a channel.
    struct ScriptedAcceptor {
        incoming: mpsc::UnboundedReceiver<Result<(DuplexStream, SocketAddr), AcceptError>>,
        closed: Arc<AtomicBool>,
        close_calls: Arc<std::sync::atomic::AtomicUsize>,
    }

    #[async_trait]
    impl Acceptor for ScriptedAcceptor {
        type Conn = DuplexStream;

        async fn accept(&mut self) -> Result<(DuplexStream, SocketAddr), AcceptError> {
            match self.incoming.recv().await {
                Some(next) => next,
                None => std::future::pending().await,
            }
        }

        fn close(&mut self) {
            self.closed.store(true, Ordering::SeqCst);
            self.close_calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Reads one byte; `x` fails the session, anything else completes it.
    /// Waits for `release` before returning when one is set.
    struct ByteHandler {
        release: Option<Arc<Notify>>,
    }

    #[async_trait]
    impl<C> SessionHandler<C> for ByteHandler
    where
        C: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        async fn handle(&self, mut conn: C, peer: SocketAddr) -> SessionOutcome {
            if let Some(release) = &self.release {
                release.notified().await;
            }
            match conn.read_u8().await {
                Ok(b'x') | Err(_) => SessionOutcome::failed(peer, SessionError::NoChannel),
                Ok(byte) => {
                    SessionOutcome::completed(peer, CapturedInput::new((byte as char).to_string()))
                }
            }
        }
    }

    struct Harness {
        incoming: mpsc::UnboundedSender<Result<(DuplexStream, SocketAddr), AcceptError>>,
        closed: Arc<AtomicBool>,
        close_calls: Arc<std::sync::atomic::AtomicUsize>,
        cancel: CancellationToken,
        state: watch::Receiver<ServerState>,
        events: broadcast::Receiver<ServerEvent>,
        run: tokio::task::JoinHandle<ServerOutcome>,
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:50000".parse().unwrap()
    }

    fn start(handler: ByteHandler, budget: Duration) -> Harness {
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        let close_calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let acceptor = ScriptedAcceptor {
            incoming: incoming_rx,
            closed: closed.clone(),
            close_calls: close_calls.clone(),
        };
        let cancel = CancellationToken::new();
        let (events_tx, events_rx) = broadcast::channel(64);
        let (state_tx, state_rx) = watch::channel(ServerState::Accepting);

        let manager = LifecycleManager::new(
            "test-server".to_string(),
            acceptor,
            Arc::new(handler),
            budget,
            Duration::from_millis(20),
            cancel.clone(),
            events_tx,
            state_tx,
        );

        Harness {
            incoming: incoming_tx,
            closed,
            close_calls,
            cancel,
            state: state_rx,
            events: events_rx,
            run: tokio::spawn(manager.run()),
        }
    }

    fn connect(harness: &Harness) -> DuplexStream {
        let (client, server) = tokio::io::duplex(64);
        harness.incoming.send(Ok((server, peer()))).unwrap();
        client
    }

    #[tokio::test]
    async fn test_budget_elapses_with_no_connections() {
        let host = "127.0.0.1".parse().unwrap();
        let listener = EphemeralListener::bind(host).await.unwrap();
        let addr = listener.local_addr();
        let (events_tx, _) = broadcast::channel(16);
        let (state_tx, state_rx) = watch::channel(ServerState::Accepting);

        let manager = LifecycleManager::new(
            "budget".to_string(),
            listener,
            Arc::new(ByteHandler { release: None }),
            Duration::from_millis(150),
            Duration::from_millis(20),
            CancellationToken::new(),
            events_tx,
            state_tx,
        );

        let outcome = tokio::time::timeout(Duration::from_secs(5), manager.run())
            .await
            .expect("budget should end the server");

        assert_eq!(outcome.exit, ExitReason::BudgetElapsed);
        assert_eq!(outcome.sessions_completed, 0);
        assert!(state_rx.borrow().is_done());
        assert!(std::net::TcpListener::bind(addr).is_ok());
    }

    #[tokio::test]
    async fn test_accept_error_terminates_without_waiting_for_budget() {
        let mut harness = start(ByteHandler { release: None }, Duration::from_secs(3600));
        harness
            .incoming
            .send(Err(AcceptError::Io(std::io::Error::other("too many open files"))))
            .unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(2), &mut harness.run)
            .await
            .expect("accept failure should end the server")
            .unwrap();

        match &outcome.exit {
            ExitReason::AcceptFailed(msg) => assert!(msg.contains("too many open files")),
            other => panic!("unexpected exit: {:?}", other),
        }
        assert!(!outcome.is_success());
        assert!(harness.closed.load(Ordering::SeqCst));
        assert_eq!(harness.close_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_drains_in_flight_sessions() {
        let release = Arc::new(Notify::new());
        let mut harness = start(
            ByteHandler {
                release: Some(release.clone()),
            },
            Duration::from_secs(3600),
        );

        let mut client = connect(&harness);
        client.write_u8(b'4').await.unwrap();

        // wait until the session is dispatched
        loop {
            if let ServerEvent::SessionStarted { .. } = harness.events.recv().await.unwrap() {
                break;
            }
        }

        harness.cancel.cancel();
        harness
            .state
            .wait_for(|s| matches!(s, ServerState::Draining))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!harness.run.is_finished());
        assert!(!harness.closed.load(Ordering::SeqCst));

        release.notify_one();
        let outcome = tokio::time::timeout(Duration::from_secs(2), &mut harness.run)
            .await
            .expect("drain should finish once the session ends")
            .unwrap();

        assert_eq!(outcome.exit, ExitReason::Cancelled);
        assert_eq!(outcome.sessions_completed, 1);
        assert!(harness.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_session_failure_does_not_stop_accepting() {
        let mut harness = start(ByteHandler { release: None }, Duration::from_secs(3600));

        let mut bad = connect(&harness);
        bad.write_u8(b'x').await.unwrap();

        loop {
            match harness.events.recv().await.unwrap() {
                ServerEvent::SessionFinished { outcome, .. } => {
                    assert!(!outcome.is_success());
                    break;
                }
                _ => continue,
            }
        }
        assert!(matches!(*harness.state.borrow(), ServerState::Accepting));

        let mut good = connect(&harness);
        good.write_u8(b'7').await.unwrap();
        loop {
            match harness.events.recv().await.unwrap() {
                ServerEvent::SessionFinished { outcome, .. } => {
                    assert_eq!(outcome.captured().map(|c| c.as_str()), Some("7"));
                    break;
                }
                _ => continue,
            }
        }

        harness.cancel.cancel();
        let outcome = (&mut harness.run).await.unwrap();
        assert_eq!(outcome.exit, ExitReason::Cancelled);
        assert_eq!(outcome.sessions_completed, 1);
        assert_eq!(outcome.sessions_failed, 1);
    }

    #[tokio::test]
    async fn test_closed_event_is_last() {
        let mut harness = start(ByteHandler { release: None }, Duration::from_millis(50));
        let outcome = (&mut harness.run).await.unwrap();
        assert_eq!(outcome.exit, ExitReason::BudgetElapsed);

        let mut last = None;
        while let Ok(event) = harness.events.try_recv() {
            last = Some(event);
        }
        match last {
            Some(ServerEvent::Closed { server_id, .. }) => assert_eq!(server_id, "test-server"),
            other => panic!("expected Closed, got {:?}", other),
        }
    }
}
