//! The payment prompt run over every accepted shell channel

use std::fmt;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use super::line_reader::{EchoPolicy, LineReader, MAX_LINE_LEN};

pub const THANK_YOU: &str = "\r\nThank you for your payment\r\n";

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ScriptError {
    #[error("failed to write to channel: {0}")]
    Write(String),
    #[error("failed to read from channel: {0}")]
    Read(String),
    #[error("input line longer than {0} bytes")]
    LineTooLong(usize),
}

pub fn greeting(amount: &str) -> String {
    format!(
        "Welcome to the payment server\r\nYou owe: ${}\r\nEnter a card number: ",
        amount
    )
}

/// Card number typed by the client. Debug output only shows the last four
/// characters.
#[derive(Clone, PartialEq, Eq)]
pub struct CapturedInput(String);

impl CapturedInput {
    pub fn new(line: String) -> Self {
        Self(line)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn masked(&self) -> String {
        let len = self.0.chars().count();
        self.0
            .chars()
            .enumerate()
            .map(|(i, c)| if i + 4 < len { '*' } else { c })
            .collect()
    }
}

impl fmt::Debug for CapturedInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CapturedInput({})", self.masked())
    }
}

pub struct PaymentScript {
    amount: String,
    echo: EchoPolicy,
    max_line_len: usize,
}

impl PaymentScript {
    pub fn new(amount: String) -> Self {
        Self {
            amount,
            echo: EchoPolicy::Verbatim,
            max_line_len: MAX_LINE_LEN,
        }
    }

    pub fn with_echo(mut self, echo: EchoPolicy) -> Self {
        self.echo = echo;
        self
    }

    pub fn with_max_line_len(mut self, max_line_len: usize) -> Self {
        self.max_line_len = max_line_len;
        self
    }

    pub fn amount(&self) -> &str {
        &self.amount
    }

    /// Greet, read one line, thank the client and shut the stream down.
    pub async fn run<S>(&self, stream: S) -> Result<CapturedInput, ScriptError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (reader, mut writer) = tokio::io::split(stream);

        write_str(&mut writer, &greeting(&self.amount)).await?;

        let mut lines = LineReader::new(reader, self.echo).with_max_len(self.max_line_len);
        let line = lines.read_line(&mut writer).await?;

        write_str(&mut writer, THANK_YOU).await?;
        writer
            .shutdown()
            .await
            .map_err(|e| ScriptError::Write(e.to_string()))?;

        Ok(CapturedInput::new(line))
    }
}

async fn write_str<W: AsyncWrite + Unpin>(writer: &mut W, text: &str) -> Result<(), ScriptError> {
    writer
        .write_all(text.as_bytes())
        .await
        .map_err(|e| ScriptError::Write(e.to_string()))?;
    writer
        .flush()
        .await
        .map_err(|e| ScriptError::Write(e.to_string()))
}
