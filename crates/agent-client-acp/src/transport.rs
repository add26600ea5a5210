//! Transport layer: newline-delimited JSON over a byte stream
//!
//! The reader and writer halves are separate so that responses,
//! notifications and agent-initiated requests can be read by one task while
//! other tasks write requests.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};
use tracing::{debug, warn};

/// Outgoing half of a transport
#[async_trait]
pub trait MessageWriter: Send {
    async fn send(&mut self, message: Value) -> io::Result<()>;
    async fn close(&mut self) -> io::Result<()>;
}

/// Incoming half of a transport
#[async_trait]
pub trait MessageReader: Send {
    /// Next message, or `None` once the peer closed the stream
    async fn receive(&mut self) -> io::Result<Option<Value>>;
}

fn codec_error(e: LinesCodecError) -> io::Error {
    match e {
        LinesCodecError::Io(e) => e,
        LinesCodecError::MaxLineLengthExceeded => {
            io::Error::new(io::ErrorKind::InvalidData, "line length exceeded")
        }
    }
}

pub struct LineWriter<W> {
    sink: FramedWrite<W, LinesCodec>,
    /// Process to kill when the writer is closed
    child: Option<Child>,
}

impl<W: AsyncWrite + Unpin> LineWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            sink: FramedWrite::new(writer, LinesCodec::new()),
            child: None,
        }
    }

    fn with_child(mut self, child: Child) -> Self {
        self.child = Some(child);
        self
    }
}

#[async_trait]
impl<W: AsyncWrite + Send + Unpin> MessageWriter for LineWriter<W> {
    async fn send(&mut self, message: Value) -> io::Result<()> {
        let line = serde_json::to_string(&message)?;
        self.sink.send(line).await.map_err(codec_error)
    }

    async fn close(&mut self) -> io::Result<()> {
        let closed = SinkExt::<String>::close(&mut self.sink)
            .await
            .map_err(codec_error);
        if let Some(mut child) = self.child.take() {
            child.kill().await?;
        }
        closed
    }
}

pub struct LineReader<R> {
    stream: FramedRead<R, LinesCodec>,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            stream: FramedRead::new(reader, LinesCodec::new()),
        }
    }
}

#[async_trait]
impl<R: AsyncRead + Send + Unpin> MessageReader for LineReader<R> {
    async fn receive(&mut self) -> io::Result<Option<Value>> {
        while let Some(line) = self.stream.next().await {
            let line = line.map_err(codec_error)?;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str(trimmed) {
                Ok(value) => return Ok(Some(value)),
                // Some agents print log lines on stdout
                Err(e) => warn!("Skipping non-JSON line from agent ({}): {}", e, trimmed),
            }
        }
        Ok(None)
    }
}

/// How to launch an agent process
#[derive(Debug, Clone, Default)]
pub struct AgentCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
}

impl AgentCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_env(mut self, env: Vec<(String, String)>) -> Self {
        self.env = env;
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }
}

/// Stdio transport for a spawned agent process
pub struct StdioTransport {
    writer: LineWriter<ChildStdin>,
    reader: LineReader<ChildStdout>,
}

impl StdioTransport {
    /// Launch the agent. Must be called from within a tokio runtime; the
    /// process's stderr is forwarded to the log.
    pub fn spawn(command: &AgentCommand) -> io::Result<Self> {
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .envs(command.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &command.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd.spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::other("Failed to capture stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("Failed to capture stdout"))?;

        if let Some(stderr) = child.stderr.take() {
            let program = command.program.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(agent = %program, "stderr: {}", line);
                }
            });
        }

        debug!(program = %command.program, args = ?command.args, "Spawned agent process");

        Ok(Self {
            writer: LineWriter::new(stdin).with_child(child),
            reader: LineReader::new(stdout),
        })
    }

    pub fn into_split(self) -> (LineWriter<ChildStdin>, LineReader<ChildStdout>) {
        (self.writer, self.reader)
    }
}
