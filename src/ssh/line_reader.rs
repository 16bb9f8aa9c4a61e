//! Line input over a raw terminal channel
//!
//! A shell channel has no line discipline on the server side, so bytes arrive
//! as they are typed and nothing is shown to the user unless we echo it back.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use super::script::ScriptError;

/// Longest line accepted before giving up on the peer.
pub const MAX_LINE_LEN: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EchoPolicy {
    /// Send every byte back as typed
    #[default]
    Verbatim,
    /// Send this byte back in place of every typed byte
    Masked(u8),
    Silent,
}

impl EchoPolicy {
    fn echo_for(self, byte: u8) -> Option<u8> {
        match self {
            EchoPolicy::Verbatim => Some(byte),
            EchoPolicy::Masked(mask) => Some(mask),
            EchoPolicy::Silent => None,
        }
    }
}

pub struct LineReader<R> {
    inner: BufReader<R>,
    echo: EchoPolicy,
    terminator: u8,
    max_len: usize,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    /// Reader for carriage-return terminated lines, which is what a terminal
    /// sends for Enter in raw mode.
    pub fn new(reader: R, echo: EchoPolicy) -> Self {
        Self {
            inner: BufReader::new(reader),
            echo,
            terminator: b'\r',
            max_len: MAX_LINE_LEN,
        }
    }

    pub fn with_max_len(mut self, max_len: usize) -> Self {
        self.max_len = max_len;
        self
    }

    /// Read up to the terminator, echoing into `echo_to` as bytes arrive.
    /// The terminator itself is neither echoed nor returned.
    pub async fn read_line<W>(&mut self, echo_to: &mut W) -> Result<String, ScriptError>
    where
        W: AsyncWrite + Unpin,
    {
        let mut line = Vec::new();

        loop {
            let byte = self
                .inner
                .read_u8()
                .await
                .map_err(|e| ScriptError::Read(e.to_string()))?;

            if byte == self.terminator {
                break;
            }
            if line.len() >= self.max_len {
                return Err(ScriptError::LineTooLong(self.max_len));
            }
            line.push(byte);

            if let Some(echoed) = self.echo.echo_for(byte) {
                echo_to
                    .write_all(&[echoed])
                    .await
                    .map_err(|e| ScriptError::Write(e.to_string()))?;
                echo_to
                    .flush()
                    .await
                    .map_err(|e| ScriptError::Write(e.to_string()))?;
            }
        }

        Ok(String::from_utf8_lossy(&line).into_owned())
    }
}
