//! Sender role for the TCP engine.
//!
//! Items are dealt round-robin across the port range, one connection per
//! port. Every port is connected even when it has no items, since the
//! receiver waits for a session on each of its listeners.

use crate::abort::AbortChecker;
use crate::engine::filter::{scan_root, PathFilter};
use crate::engine::protocol::{
    encode_data, encode_file_end, read_frame, write_frame, Abort, Done, FileEntry, Hello,
    MessageType, MAX_STRING_LEN, PROTOCOL_VERSION,
};
use crate::error::ErrorCode;
use crate::items::TransferItem;
use crate::role::{SendRole, SenderSpec, TransferReport, TransferRole, TransferSummary};
use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Per-connection settings shared by all port tasks.
struct SessionContext {
    destination: String,
    root: PathBuf,
    hello: Bytes,
    buffer_size: usize,
    connect_timeout: Duration,
    checker: Option<Arc<dyn AbortChecker>>,
}

impl SessionContext {
    fn should_abort(&self) -> bool {
        self.checker.as_ref().is_some_and(|c| c.should_abort())
    }
}

pub struct TcpSender {
    spec: SenderSpec,
    transfer_id: String,
    protocol_version: u32,
    checker: Option<Arc<dyn AbortChecker>>,
    include_regex: String,
    exclude_regex: String,
    prune_dir_regex: String,
}

impl TcpSender {
    pub fn new(spec: SenderSpec) -> Self {
        Self {
            spec,
            transfer_id: String::new(),
            protocol_version: PROTOCOL_VERSION,
            checker: None,
            include_regex: String::new(),
            exclude_regex: String::new(),
            prune_dir_regex: String::new(),
        }
    }

    /// Explicit items as given, otherwise a filtered scan of the root.
    async fn resolve_items(&self) -> Result<Vec<TransferItem>> {
        if !self.spec.items.is_empty() {
            return Ok(self.spec.items.clone());
        }
        let filter = PathFilter::new(
            &self.include_regex,
            &self.exclude_regex,
            &self.prune_dir_regex,
        )?;
        let root = self.spec.root.clone();
        let skip = self.spec.options.log_name.clone();
        tokio::task::spawn_blocking(move || scan_root(&root, &filter, &skip)).await?
    }
}

impl TransferRole for TcpSender {
    fn set_abort_checker(&mut self, checker: Arc<dyn AbortChecker>) {
        self.checker = Some(checker);
    }

    fn set_transfer_id(&mut self, id: &str) {
        self.transfer_id = id.to_string();
    }

    fn set_protocol_version(&mut self, version: u32) {
        self.protocol_version = version;
    }
}

#[async_trait]
impl SendRole for TcpSender {
    fn set_include_regex(&mut self, pattern: &str) {
        self.include_regex = pattern.to_string();
    }

    fn set_exclude_regex(&mut self, pattern: &str) {
        self.exclude_regex = pattern.to_string();
    }

    fn set_prune_dir_regex(&mut self, pattern: &str) {
        self.prune_dir_regex = pattern.to_string();
    }

    async fn transfer(&mut self) -> Result<TransferReport> {
        if self.spec.ports.is_empty() {
            anyhow::bail!("No ports configured for sender");
        }
        let items = self.resolve_items().await?;
        info!(
            files = items.len(),
            ports = self.spec.ports.len(),
            destination = %self.spec.destination,
            "Starting transfer"
        );

        let mut batches: Vec<Vec<TransferItem>> = vec![Vec::new(); self.spec.ports.len()];
        for (i, item) in items.into_iter().enumerate() {
            batches[i % self.spec.ports.len()].push(item);
        }

        let hello = Hello::new(self.protocol_version, self.transfer_id.clone())
            .encode()
            .context("Cannot announce transfer")?;
        let ctx = Arc::new(SessionContext {
            destination: self.spec.destination.clone(),
            root: self.spec.root.clone(),
            hello,
            buffer_size: self.spec.options.buffer_size,
            connect_timeout: Duration::from_secs(self.spec.options.connect_timeout_secs),
            checker: self.checker.clone(),
        });

        let mut tasks = JoinSet::new();
        for (port, batch) in self.spec.ports.iter().copied().zip(batches) {
            let ctx = Arc::clone(&ctx);
            tasks.spawn(async move { send_on_port(&ctx, port, batch).await });
        }

        let mut total = TransferSummary::default();
        while let Some(joined) = tasks.join_next().await {
            let summary = joined.context("Sender task panicked")?;
            total.merge(&summary);
        }
        Ok(TransferReport::new(total))
    }
}

/// Files and bytes fully sent on one connection.
#[derive(Default)]
struct PortProgress {
    files: u64,
    bytes: u64,
}

async fn send_on_port(
    ctx: &SessionContext,
    port: u16,
    batch: Vec<TransferItem>,
) -> TransferSummary {
    let mut progress = PortProgress::default();
    let code = match run_session(ctx, port, &batch, &mut progress).await {
        Ok(()) => ErrorCode::Ok,
        Err(code) => code,
    };
    if !code.is_ok() {
        warn!(port, %code, "Port session ended with error");
    }
    TransferSummary::new(code, progress.files, progress.bytes)
}

async fn run_session(
    ctx: &SessionContext,
    port: u16,
    batch: &[TransferItem],
    progress: &mut PortProgress,
) -> std::result::Result<(), ErrorCode> {
    let stream = tokio::time::timeout(
        ctx.connect_timeout,
        TcpStream::connect((ctx.destination.as_str(), port)),
    )
    .await
    .map_err(|_| {
        warn!(port, "Connect timed out");
        ErrorCode::ConnError
    })?
    .map_err(|e| {
        warn!(port, "Connect failed: {}", e);
        ErrorCode::ConnError
    })?;
    let (read_half, write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut writer = BufWriter::new(write_half);

    send(&mut writer, &ctx.hello).await?;

    for item in batch {
        if ctx.should_abort() {
            return abort(&mut writer).await;
        }
        send_file(ctx, item, &mut writer, progress).await?;
    }

    let done = Done {
        files: progress.files,
        bytes: progress.bytes,
    };
    send(&mut writer, &done.encode()).await?;
    writer.flush().await.map_err(|_| ErrorCode::SocketWriteError)?;

    let (msg_type, payload) = read_frame(&mut reader).await.map_err(|e| {
        debug!(port, "Reading receiver reply failed: {:#}", e);
        ErrorCode::SocketReadError
    })?;
    match msg_type {
        MessageType::Done => {
            let ack = Done::decode(payload).map_err(|_| ErrorCode::ProtocolError)?;
            debug!(port, files = ack.files, bytes = ack.bytes, "Receiver acknowledged");
            if ack.files != progress.files || ack.bytes != progress.bytes {
                warn!(port, "Receiver totals differ from what was sent");
                return Err(ErrorCode::ProtocolError);
            }
            Ok(())
        }
        MessageType::Abort => {
            let abort = Abort::decode(payload).map_err(|_| ErrorCode::ProtocolError)?;
            Err(abort.code)
        }
        _ => Err(ErrorCode::ProtocolError),
    }
}

async fn send<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &Bytes,
) -> std::result::Result<(), ErrorCode> {
    write_frame(writer, frame)
        .await
        .map_err(|_| ErrorCode::SocketWriteError)
}

async fn abort<W: AsyncWrite + Unpin>(writer: &mut W) -> std::result::Result<(), ErrorCode> {
    info!("Abort requested, stopping sender");
    // Best effort: the receiver may already be gone.
    let _ = write_frame(writer, &Abort { code: ErrorCode::Abort }.encode()).await;
    let _ = writer.flush().await;
    Err(ErrorCode::Abort)
}

async fn send_file<W: AsyncWrite + Unpin>(
    ctx: &SessionContext,
    item: &TransferItem,
    writer: &mut W,
    progress: &mut PortProgress,
) -> std::result::Result<(), ErrorCode> {
    if item.name.len() > MAX_STRING_LEN {
        warn!("Item name is {} bytes, limit is {}", item.name.len(), MAX_STRING_LEN);
        return Err(ErrorCode::ProtocolError);
    }
    let full_path = ctx.root.join(&item.name);
    let file = File::open(&full_path).await.map_err(|e| {
        warn!("Failed to open {}: {}", full_path.display(), e);
        ErrorCode::ByteSourceReadError
    })?;
    let size = match item.size_hint.and_then(|s| u64::try_from(s).ok()) {
        Some(size) => size,
        None => file
            .metadata()
            .await
            .map_err(|_| ErrorCode::ByteSourceReadError)?
            .len(),
    };

    let entry = FileEntry {
        path: item.name.clone(),
        size,
    }
    .encode()
    .map_err(|e| {
        warn!("Cannot send {}: {:#}", item.name, e);
        ErrorCode::ProtocolError
    })?;
    send(writer, &entry).await?;

    let mut reader = BufReader::new(file);
    let mut buf = vec![0u8; ctx.buffer_size];
    let mut remaining = size;
    let mut sent = 0u64;

    while remaining > 0 {
        if ctx.should_abort() {
            return abort(writer).await;
        }
        let want = buf.len().min(remaining.try_into().unwrap_or(usize::MAX));
        let n = reader
            .read(&mut buf[..want])
            .await
            .map_err(|_| ErrorCode::ByteSourceReadError)?;
        if n == 0 {
            debug!("{} is shorter than its size hint", item.name);
            break;
        }
        send(writer, &encode_data(&buf[..n])).await?;
        remaining -= n as u64;
        sent += n as u64;
    }

    send(writer, &encode_file_end()).await?;
    progress.files += 1;
    progress.bytes += sent;
    debug!(file = %item.name, bytes = sent, "Sent file");
    Ok(())
}
