//! Receiver role for the TCP engine.
//!
//! One listener per port; each accepted connection is a session that writes
//! files under the root and records them in the transfer log.

use crate::abort::AbortChecker;
use crate::engine::protocol::{
    negotiate_version, read_frame, write_frame, Abort, Done, FileEntry, Hello, MessageType,
    VersionNegotiationResult,
};
use crate::engine::transfer_log::{LogEntry, TransferLogWriter};
use crate::error::ErrorCode;
use crate::role::{ReceiveRole, ReceiverSpec, TransferReport, TransferRole, TransferSummary};
use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::{self, File};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// How long a rejected sender gets to finish writing before we hang up.
const REJECT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Validate that a relative path is safe and doesn't escape the root.
/// Returns the full path if valid.
fn validate_path(root: &Path, relative: &str) -> Result<PathBuf> {
    if relative.is_empty() {
        anyhow::bail!("Empty path not allowed");
    }

    let rel_path = Path::new(relative);
    if rel_path.is_absolute() {
        anyhow::bail!("Absolute paths not allowed: {}", relative);
    }

    for component in rel_path.components() {
        match component {
            Component::ParentDir => {
                anyhow::bail!("Path traversal not allowed: {}", relative);
            }
            Component::Prefix(_) | Component::RootDir => {
                anyhow::bail!("Rooted paths not allowed: {}", relative);
            }
            _ => {}
        }
    }

    Ok(root.join(rel_path))
}

/// Settings shared by all session tasks of one receiver.
struct SessionContext {
    root: PathBuf,
    transfer_id: String,
    protocol_version: Option<u32>,
    accept_poll: Duration,
    checker: Option<Arc<dyn AbortChecker>>,
    log: TransferLogWriter,
}

impl SessionContext {
    fn should_abort(&self) -> bool {
        self.checker.as_ref().is_some_and(|c| c.should_abort())
    }
}

pub struct TcpReceiver {
    spec: ReceiverSpec,
    transfer_id: String,
    protocol_version: Option<u32>,
    checker: Option<Arc<dyn AbortChecker>>,
    listeners: Vec<TcpListener>,
    sessions: JoinSet<TransferSummary>,
}

impl TcpReceiver {
    pub fn new(spec: ReceiverSpec) -> Self {
        Self {
            spec,
            transfer_id: String::new(),
            protocol_version: None,
            checker: None,
            listeners: Vec::new(),
            sessions: JoinSet::new(),
        }
    }

    /// Local ports actually bound by [`register_ports`](ReceiveRole::register_ports).
    pub fn bound_ports(&self) -> Vec<u16> {
        self.listeners
            .iter()
            .filter_map(|l| l.local_addr().ok())
            .map(|a| a.port())
            .collect()
    }

    /// Hand the bound listeners to a shared session context, opening the
    /// transfer log on the way.
    async fn take_listeners(&mut self) -> Result<(Vec<TcpListener>, Arc<SessionContext>)> {
        if self.listeners.is_empty() {
            anyhow::bail!("No bound ports; call register_ports first");
        }
        fs::create_dir_all(&self.spec.root)
            .await
            .with_context(|| format!("Failed to create {}", self.spec.root.display()))?;
        let log_path = self.spec.root.join(&self.spec.options.log_name);
        let log = TransferLogWriter::open(&log_path).await?;
        log.append(&LogEntry::session(&self.transfer_id, self.listeners.len()))
            .await?;

        let ctx = Arc::new(SessionContext {
            root: self.spec.root.clone(),
            transfer_id: self.transfer_id.clone(),
            protocol_version: self.protocol_version,
            accept_poll: Duration::from_millis(self.spec.options.accept_poll_ms),
            checker: self.checker.clone(),
            log,
        });
        Ok((std::mem::take(&mut self.listeners), ctx))
    }
}

impl TransferRole for TcpReceiver {
    fn set_abort_checker(&mut self, checker: Arc<dyn AbortChecker>) {
        self.checker = Some(checker);
    }

    fn set_transfer_id(&mut self, id: &str) {
        self.transfer_id = id.to_string();
    }

    fn set_protocol_version(&mut self, version: u32) {
        self.protocol_version = Some(version);
    }
}

#[async_trait]
impl ReceiveRole for TcpReceiver {
    async fn register_ports(&mut self) -> usize {
        for port in self.spec.options.ports() {
            match TcpListener::bind(("0.0.0.0", port)).await {
                Ok(listener) => {
                    debug!(port, "Listening");
                    self.listeners.push(listener);
                }
                Err(e) => warn!(port, "Failed to bind: {}", e),
            }
        }
        self.listeners.len()
    }

    async fn transfer_async(&mut self) -> Result<()> {
        if self.listeners.is_empty() {
            anyhow::bail!("No bound ports; call register_ports first");
        }
        let (listeners, ctx) = match self.take_listeners().await {
            Ok(taken) => taken,
            Err(e) => {
                warn!("{:#}", e);
                self.sessions.spawn(async {
                    TransferSummary::new(ErrorCode::TransferLogAcquireError, 0, 0)
                });
                return Ok(());
            }
        };
        info!(ports = listeners.len(), "Waiting for sender");
        for listener in listeners {
            let ctx = Arc::clone(&ctx);
            self.sessions
                .spawn(async move { serve_session(&listener, &ctx).await });
        }
        Ok(())
    }

    async fn finish(&mut self) -> Result<TransferReport> {
        let mut total = TransferSummary::default();
        while let Some(joined) = self.sessions.join_next().await {
            let summary = joined.context("Receiver session panicked")?;
            total.merge(&summary);
        }
        Ok(TransferReport::new(total))
    }

    async fn run_forever(&mut self) -> Result<()> {
        let (listeners, ctx) = self.take_listeners().await?;
        info!(ports = listeners.len(), "Receiver running until stopped");
        let mut loops = JoinSet::new();
        for listener in listeners {
            let ctx = Arc::clone(&ctx);
            loops.spawn(async move {
                loop {
                    let summary = serve_session(&listener, &ctx).await;
                    if summary.error_code() == ErrorCode::Abort && ctx.should_abort() {
                        break;
                    }
                    info!(
                        code = %summary.error_code(),
                        files = summary.files,
                        bytes = summary.bytes,
                        "Session finished"
                    );
                }
            });
        }
        while let Some(joined) = loops.join_next().await {
            joined.context("Receiver loop panicked")?;
        }
        info!("All receiver loops stopped");
        Ok(())
    }
}

/// Wait for a connection, re-checking the abort signal every poll interval.
async fn accept(
    listener: &TcpListener,
    ctx: &SessionContext,
) -> std::result::Result<TcpStream, ErrorCode> {
    let mut ticker = tokio::time::interval(ctx.accept_poll);
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = accepted.map_err(|e| {
                    warn!("Accept failed: {}", e);
                    ErrorCode::ConnError
                })?;
                debug!(%peer, "Sender connected");
                return Ok(stream);
            }
            _ = ticker.tick() => {
                if ctx.should_abort() {
                    info!("Abort requested while waiting for sender");
                    return Err(ErrorCode::Abort);
                }
            }
        }
    }
}

async fn serve_session(listener: &TcpListener, ctx: &SessionContext) -> TransferSummary {
    let stream = match accept(listener, ctx).await {
        Ok(stream) => stream,
        Err(code) => return TransferSummary::new(code, 0, 0),
    };
    let (read_half, write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut writer = BufWriter::new(write_half);

    let mut session = Session::default();
    let code = match session.run(ctx, &mut reader, &mut writer).await {
        Ok(()) => ErrorCode::Ok,
        Err(code) => {
            match code {
                ErrorCode::SocketReadError | ErrorCode::SocketWriteError => {}
                ErrorCode::VersionMismatch | ErrorCode::IdMismatch => {
                    reject(&mut reader, &mut writer, code, true).await
                }
                _ => reject(&mut reader, &mut writer, code, false).await,
            }
            code
        }
    };
    TransferSummary::new(code, session.files, session.bytes)
}

/// Tell the sender why we stop. With `drain`, let it finish writing so the
/// close doesn't reset the connection before it reads our reply.
async fn reject<R, W>(reader: &mut R, writer: &mut W, code: ErrorCode, drain: bool)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    warn!(%code, "Rejecting session");
    if write_frame(writer, &Abort { code }.encode()).await.is_err() {
        return;
    }
    let _ = writer.flush().await;
    if !drain {
        return;
    }
    let _ = tokio::time::timeout(REJECT_DRAIN_TIMEOUT, async {
        while let Ok((msg_type, _)) = read_frame(reader).await {
            if matches!(msg_type, MessageType::Done | MessageType::Abort) {
                break;
            }
        }
    })
    .await;
}

struct OpenFile {
    name: String,
    writer: BufWriter<File>,
    written: u64,
}

#[derive(Default)]
struct Session {
    files: u64,
    bytes: u64,
    current: Option<OpenFile>,
}

impl Session {
    async fn run<R, W>(
        &mut self,
        ctx: &SessionContext,
        reader: &mut R,
        writer: &mut W,
    ) -> std::result::Result<(), ErrorCode>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let (msg_type, payload) = next_frame(reader).await?;
        if msg_type != MessageType::Hello {
            warn!("Expected HELLO, got {:?}", msg_type);
            return Err(ErrorCode::ProtocolError);
        }
        let hello = Hello::decode(payload).map_err(|_| ErrorCode::ProtocolError)?;
        check_hello(ctx, &hello)?;

        loop {
            if ctx.should_abort() {
                info!("Abort requested, stopping session");
                return Err(ErrorCode::Abort);
            }
            let (msg_type, payload) = next_frame(reader).await?;
            match msg_type {
                MessageType::FileEntry => self.open_file(ctx, payload).await?,
                MessageType::Data => self.write_data(payload).await?,
                MessageType::FileEnd => self.close_file(ctx).await?,
                MessageType::Done => {
                    if self.current.is_some() {
                        return Err(ErrorCode::ProtocolError);
                    }
                    let done = Done {
                        files: self.files,
                        bytes: self.bytes,
                    };
                    write_frame(writer, &done.encode())
                        .await
                        .map_err(|_| ErrorCode::SocketWriteError)?;
                    writer
                        .flush()
                        .await
                        .map_err(|_| ErrorCode::SocketWriteError)?;
                    return Ok(());
                }
                MessageType::Abort => {
                    let abort = Abort::decode(payload).map_err(|_| ErrorCode::ProtocolError)?;
                    info!(code = %abort.code, "Sender aborted");
                    return Err(abort.code);
                }
                MessageType::Hello => return Err(ErrorCode::ProtocolError),
            }
        }
    }

    async fn open_file(
        &mut self,
        ctx: &SessionContext,
        payload: Bytes,
    ) -> std::result::Result<(), ErrorCode> {
        if self.current.is_some() {
            return Err(ErrorCode::ProtocolError);
        }
        let entry = FileEntry::decode(payload).map_err(|_| ErrorCode::ProtocolError)?;
        let full = validate_path(&ctx.root, &entry.path).map_err(|e| {
            warn!("{:#}", e);
            ErrorCode::ProtocolError
        })?;
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|_| ErrorCode::FileWriteError)?;
        }
        let file = File::create(&full).await.map_err(|e| {
            warn!("Failed to create {}: {}", full.display(), e);
            ErrorCode::FileWriteError
        })?;
        self.current = Some(OpenFile {
            name: entry.path,
            writer: BufWriter::new(file),
            written: 0,
        });
        Ok(())
    }

    async fn write_data(&mut self, payload: Bytes) -> std::result::Result<(), ErrorCode> {
        let open = self.current.as_mut().ok_or(ErrorCode::ProtocolError)?;
        open.writer
            .write_all(&payload)
            .await
            .map_err(|_| ErrorCode::FileWriteError)?;
        open.written += payload.len() as u64;
        Ok(())
    }

    async fn close_file(&mut self, ctx: &SessionContext) -> std::result::Result<(), ErrorCode> {
        let mut open = self.current.take().ok_or(ErrorCode::ProtocolError)?;
        open.writer
            .flush()
            .await
            .map_err(|_| ErrorCode::FileWriteError)?;
        if let Err(e) = ctx.log.append(&LogEntry::file(&open.name, open.written)).await {
            warn!("{:#}", e);
            return Err(ErrorCode::TransferLogAcquireError);
        }
        self.files += 1;
        self.bytes += open.written;
        debug!(file = %open.name, bytes = open.written, "Received file");
        Ok(())
    }
}

async fn next_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> std::result::Result<(MessageType, Bytes), ErrorCode> {
    read_frame(reader).await.map_err(|e| {
        debug!("Read failed: {:#}", e);
        ErrorCode::SocketReadError
    })
}

fn check_hello(ctx: &SessionContext, hello: &Hello) -> std::result::Result<(), ErrorCode> {
    match negotiate_version(hello.version) {
        VersionNegotiationResult::Supported(v) => {
            if ctx.protocol_version.is_some_and(|ours| ours != v) {
                warn!(theirs = v, "Sender protocol version differs from configured one");
                return Err(ErrorCode::VersionMismatch);
            }
        }
        other => {
            warn!("Unsupported protocol version: {:?}", other);
            return Err(ErrorCode::VersionMismatch);
        }
    }
    if !ctx.transfer_id.is_empty() && ctx.transfer_id != hello.transfer_id {
        warn!(
            expected = %ctx.transfer_id,
            got = %hello.transfer_id,
            "Transfer id mismatch"
        );
        return Err(ErrorCode::IdMismatch);
    }
    Ok(())
}
