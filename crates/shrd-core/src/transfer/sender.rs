//! Send-side state machine.

use std::io::SeekFrom;
use std::path::Path;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{notify_failure, send_best_effort, Progress, TransferOptions, TransferState};
use crate::crypto::{to_hex, SealedReader, SealedWriter, SecureChannel, DIGEST_ALGORITHM};
use crate::error::{Error, Result};
use crate::protocol::{reason, ChunkFrame, ControlMessage, Message, TransferHeader};

/// File name and size of a file about to be sent.
///
/// # Errors
///
/// Returns [`Error::FileNotFound`] for missing paths and
/// [`Error::InvalidPath`] for anything that is not a regular file.
pub fn inspect_file(path: &Path) -> Result<(String, u64)> {
    let metadata = std::fs::metadata(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => Error::FileNotFound(path.display().to_string()),
        std::io::ErrorKind::PermissionDenied => {
            Error::PermissionDenied(path.display().to_string())
        }
        _ => Error::Io(e),
    })?;
    if !metadata.is_file() {
        return Err(Error::InvalidPath(format!(
            "{} is not a regular file",
            path.display()
        )));
    }

    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| Error::InvalidPath(path.display().to_string()))?;
    Ok((name, metadata.len()))
}

/// Send `path` over an established channel.
///
/// Progress and the final state are published through `progress`.
/// Cancelling `cancel` aborts at the next suspension point.
pub async fn send_file<S>(
    channel: SecureChannel<S>,
    path: &Path,
    options: &TransferOptions,
    progress: &Progress,
    cancel: &CancellationToken,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (reader, mut writer, peer) = channel.into_split();
    tracing::info!(
        session = %progress.session_id(),
        peer = %peer.device_id,
        file = %path.display(),
        "Sending file"
    );

    let mut control = ControlReader::spawn(reader);
    let result = FileSender {
        writer: &mut writer,
        control: &mut control,
        options,
        progress,
        cancel,
    }
    .run(path)
    .await;

    match &result {
        Ok(()) => {
            let _ = writer.shutdown().await;
        }
        Err(e) => notify_failure(&mut writer, e).await,
    }
    progress.finish(&result);
    result
}

struct FileSender<'a, W> {
    writer: &'a mut SealedWriter<W>,
    control: &'a mut ControlReader,
    options: &'a TransferOptions,
    progress: &'a Progress,
    cancel: &'a CancellationToken,
}

/// What the receiver asked for after some chunks went out.
enum Reply {
    Retransmit(u32),
    Complete,
}

impl<W: AsyncWrite + Unpin> FileSender<'_, W> {
    async fn run(&mut self, path: &Path) -> Result<()> {
        let header = self.negotiate(path).await?;
        let mut file = File::open(path).await?;
        self.stream(&mut file, &header).await
    }

    async fn negotiate(&mut self, path: &Path) -> Result<TransferHeader> {
        let (file_name, file_size) = inspect_file(path)?;
        let digest = self.digest(path).await?;

        let header = TransferHeader {
            file_name: file_name.clone(),
            file_size,
            chunk_size: self.options.chunk_size,
            digest_algorithm: DIGEST_ALGORITHM.to_string(),
            digest: Some(digest.clone()),
        };
        self.progress.update(|session| {
            session.file_name = file_name;
            session.file_size = file_size;
            session.chunk_size = header.chunk_size;
            session.integrity_digest = Some(digest);
        });
        self.progress.started();

        self.send(ControlMessage::Header(header.clone()).into())
            .await?;

        let reply = self
            .wait_control(self.options.negotiate_timeout, "negotiating")
            .await?;
        match reply {
            ControlMessage::HeaderAck { accept: true, .. } => {
                tracing::debug!(chunks = header.total_chunks(), "Offer accepted");
                Ok(header)
            }
            ControlMessage::HeaderAck {
                accept: false,
                reason,
            } => Err(Error::TransferRejected(
                reason.unwrap_or_else(|| "no reason given".to_string()),
            )),
            other => Err(unexpected_reply("headerAck", other)),
        }
    }

    async fn digest(&self, path: &Path) -> Result<String> {
        let mut file = File::open(path).await?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; 64 * 1024];

        loop {
            let n = tokio::select! {
                () = self.cancel.cancelled() => return Err(Error::TransferCancelled),
                n = file.read(&mut buf) => n?,
            };
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }

        Ok(to_hex(&hasher.finalize()))
    }

    async fn stream(&mut self, file: &mut File, header: &TransferHeader) -> Result<()> {
        let total = header.total_chunks();
        let mut next = 0u32;
        let mut buf = vec![0u8; header.chunk_size as usize];

        self.progress.set_state(TransferState::Transferring);

        loop {
            if self.cancel.is_cancelled() {
                send_best_effort(self.writer, ControlMessage::Cancel).await;
                return Err(Error::TransferCancelled);
            }

            if next < total {
                if let Some(message) = self.control.try_next()? {
                    if let Reply::Retransmit(index) = interpret(message, next, total)? {
                        next = self.rewind(file, header, index).await?;
                    }
                    continue;
                }

                let len = header.expected_chunk_len(next);
                file.read_exact(&mut buf[..len]).await?;
                let frame = ChunkFrame::new(next, buf[..len].to_vec());
                self.send(Message::Chunk(frame)).await?;
                tracing::debug!(index = next, len, "Sent chunk");

                next += 1;
                self.progress
                    .advance(header.file_size.min(u64::from(next) * u64::from(header.chunk_size)));
                continue;
            }

            self.progress.set_state(TransferState::Verifying);
            let message = self
                .wait_control(self.options.verify_timeout, "verifying")
                .await?;
            match interpret(message, next, total)? {
                Reply::Complete => return Ok(()),
                Reply::Retransmit(index) => {
                    next = self.rewind(file, header, index).await?;
                    self.progress.set_state(TransferState::Transferring);
                }
            }
        }
    }

    async fn rewind(&self, file: &mut File, header: &TransferHeader, index: u32) -> Result<u32> {
        tracing::info!(index, "Receiver asked for chunk again");
        let offset = u64::from(index) * u64::from(header.chunk_size);
        file.seek(SeekFrom::Start(offset)).await?;
        self.progress.advance(offset);
        Ok(index)
    }

    /// Write one message. Cancellation while the write is pending drops the
    /// half-written frame and the connection with it.
    async fn send(&mut self, message: Message) -> Result<()> {
        tokio::select! {
            () = self.cancel.cancelled() => Err(Error::TransferCancelled),
            result = self.writer.send(&message) => result,
        }
    }

    /// Wait for the next control message, at most `limit`.
    async fn wait_control(&mut self, limit: Duration, phase: &str) -> Result<ControlMessage> {
        let received = tokio::select! {
            () = self.cancel.cancelled() => {
                send_best_effort(self.writer, ControlMessage::Cancel).await;
                return Err(Error::TransferCancelled);
            }
            received = tokio::time::timeout(limit, self.control.recv()) => received,
        };

        received.map_err(|_| {
            tracing::warn!("Peer did not answer while {}", phase);
            Error::Timeout(limit.as_secs())
        })?
    }
}

fn interpret(message: ControlMessage, sent: u32, total: u32) -> Result<Reply> {
    match message {
        ControlMessage::Retransmit { index } if index < sent => Ok(Reply::Retransmit(index)),
        ControlMessage::Retransmit { index } => Err(Error::ProtocolError(format!(
            "retransmit requested for chunk {index} which was not sent yet"
        ))),
        ControlMessage::Complete if sent == total => Ok(Reply::Complete),
        ControlMessage::Complete => Err(Error::ProtocolError(format!(
            "complete received after {sent} of {total} chunks"
        ))),
        ControlMessage::Cancel => Err(Error::RemoteAbort(reason::CANCELLED.to_string())),
        ControlMessage::Error { reason } => Err(Error::RemoteAbort(reason)),
        other => Err(unexpected_reply("retransmit or complete", other)),
    }
}

fn unexpected_reply(expected: &str, actual: ControlMessage) -> Error {
    match actual {
        ControlMessage::Cancel => Error::RemoteAbort(reason::CANCELLED.to_string()),
        ControlMessage::Error { reason } => Error::RemoteAbort(reason),
        other => Error::UnexpectedMessage {
            expected: expected.to_string(),
            actual: other.kind().to_string(),
        },
    }
}

/// Reads control messages on its own task so chunk writes never wait on
/// the receive side.
struct ControlReader {
    rx: mpsc::Receiver<Result<ControlMessage>>,
    task: JoinHandle<()>,
}

impl ControlReader {
    fn spawn<R>(mut reader: SealedReader<R>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(16);
        let task = tokio::spawn(async move {
            loop {
                let item = match reader.recv().await {
                    Ok(Message::Control(control)) => Ok(control),
                    Ok(Message::Chunk(chunk)) => Err(Error::UnexpectedMessage {
                        expected: "control message".to_string(),
                        actual: format!("chunk {}", chunk.index),
                    }),
                    Err(e) => Err(e),
                };
                let stop = item.is_err();
                if tx.send(item).await.is_err() || stop {
                    break;
                }
            }
        });
        Self { rx, task }
    }

    /// Next message if one already arrived.
    fn try_next(&mut self) -> Result<Option<ControlMessage>> {
        match self.rx.try_recv() {
            Ok(item) => item.map(Some),
            Err(mpsc::error::TryRecvError::Empty) => Ok(None),
            Err(mpsc::error::TryRecvError::Disconnected) => Err(Error::ConnectionClosed),
        }
    }

    async fn recv(&mut self) -> Result<ControlMessage> {
        self.rx.recv().await.unwrap_or(Err(Error::ConnectionClosed))
    }
}

impl Drop for ControlReader {
    fn drop(&mut self) {
        self.task.abort();
    }
}
