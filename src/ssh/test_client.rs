//! Minimal russh client for driving payment servers in tests.

use async_trait::async_trait;
use russh::ChannelMsg;
use russh::client::{self, Handle, Msg};
use russh_keys::key::PublicKey;
use std::net::SocketAddr;
use std::sync::Arc;

pub struct TestClient;

#[async_trait]
impl client::Handler for TestClient {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

#[derive(Debug, Default)]
pub struct Transcript {
    pub output: String,
    pub successes: usize,
    pub failures: usize,
    pub closed: bool,
}

pub async fn connect(addr: SocketAddr) -> Handle<TestClient> {
    let config = Arc::new(client::Config::default());
    let mut handle = client::connect(config, addr, TestClient).await.unwrap();
    assert!(handle.authenticate_none("payme000001").await.unwrap());
    handle
}

/// Open a shell like an interactive ssh client would, type `input` and
/// collect everything the server sends back.
pub async fn pay(handle: &Handle<TestClient>, input: &[u8]) -> Transcript {
    let mut channel = handle.channel_open_session().await.unwrap();
    channel
        .request_pty(true, "xterm", 80, 24, 0, 0, &[])
        .await
        .unwrap();
    channel.request_shell(true).await.unwrap();
    channel.data(input).await.unwrap();
    collect(&mut channel).await
}

pub async fn collect(channel: &mut russh::Channel<Msg>) -> Transcript {
    let mut transcript = Transcript::default();
    let mut output = Vec::new();

    while let Some(msg) = channel.wait().await {
        match msg {
            ChannelMsg::Data { data } => output.extend_from_slice(&data),
            ChannelMsg::Success => transcript.successes += 1,
            ChannelMsg::Failure => transcript.failures += 1,
            ChannelMsg::Close => {
                transcript.closed = true;
                break;
            }
            _ => {}
        }
    }

    transcript.output = String::from_utf8_lossy(&output).into_owned();
    transcript
}
