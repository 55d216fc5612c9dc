use anyhow::Context;
use async_trait::async_trait;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines},
    net::TcpStream,
};
use tracing::debug;

use super::{EventReader, RawEvent, ReadError};

/// Reads newline-delimited JSON events from a TCP endpoint, one event per
/// line. Blank lines are ignored.
///
/// A websocket relay such as `websocat -t ws://gateway:443 tcp-l:127.0.0.1:4430`
/// exposes the gateway's event feed in this shape.
pub struct LineEventReader {
    addr: String,
    lines: Option<Lines<BufReader<TcpStream>>>,
}

impl LineEventReader {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            lines: None,
        }
    }
}

#[async_trait]
impl EventReader for LineEventReader {
    async fn dial(&mut self) -> anyhow::Result<()> {
        let stream = TcpStream::connect(&self.addr)
            .await
            .with_context(|| format!("connecting to event stream at {}", self.addr))?;
        debug!(addr = %self.addr, "Event stream socket connected");
        self.lines = Some(BufReader::new(stream).lines());
        Ok(())
    }

    async fn read_event(&mut self) -> Result<RawEvent, ReadError> {
        let lines = self.lines.as_mut().ok_or(ReadError::NotConnected)?;
        loop {
            match lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => return Ok(RawEvent::from_slice(line.as_bytes())?),
                Ok(None) => {
                    self.lines = None;
                    return Err(ReadError::ConnectionLost("event stream closed by peer".to_owned()));
                }
                Err(e) => {
                    self.lines = None;
                    return Err(e.into());
                }
            }
        }
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        let Some(lines) = self.lines.take() else {
            return Ok(());
        };
        let mut stream = lines.into_inner().into_inner();
        stream.shutdown().await.context("shutting down event stream")?;
        Ok(())
    }
}
