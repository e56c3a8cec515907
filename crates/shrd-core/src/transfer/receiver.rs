//! Receive-side state machine.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

use super::staging::{available_space, sanitize_file_name, StagingFile};
use super::{
    notify_failure, send_best_effort, ConsentPolicy, Progress, TransferOffer, TransferOptions,
    TransferState,
};
use crate::config::MAX_CHUNK_SIZE;
use crate::crypto::{PeerIdentity, SealedReader, SealedWriter, SecureChannel, DIGEST_ALGORITHM};
use crate::error::{Error, Result};
use crate::protocol::{
    reason, ChunkFrame, ControlMessage, Message, TransferHeader, FRAME_OVERHEAD,
};

/// Everything the receiver needs besides the connection.
#[derive(Clone)]
pub struct ReceiveContext {
    /// Where accepted files are saved
    pub download_dir: PathBuf,
    /// Decides whether an offer is taken
    pub consent: Arc<dyn ConsentPolicy>,
    /// Whether the sender is a paired device
    pub trusted: bool,
    /// Timeouts
    pub options: TransferOptions,
}

impl std::fmt::Debug for ReceiveContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReceiveContext")
            .field("download_dir", &self.download_dir)
            .field("trusted", &self.trusted)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// Receive one file over an established channel.
///
/// Returns the path the file was saved under. On any failure the partial
/// file is deleted before returning.
pub async fn receive_file<S>(
    channel: SecureChannel<S>,
    context: &ReceiveContext,
    progress: &Progress,
    cancel: &CancellationToken,
) -> Result<PathBuf>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut reader, mut writer, peer) = channel.into_split();

    let mut receiver = FileReceiver {
        reader: &mut reader,
        writer: &mut writer,
        peer: &peer,
        context,
        progress,
        cancel,
    };
    let result = receiver.run().await;

    match &result {
        Ok(path) => {
            progress.update(|session| {
                session.saved_path = Some(path.clone());
                if let Some(name) = path.file_name() {
                    session.file_name = name.to_string_lossy().into_owned();
                }
            });
        }
        Err(e) => notify_failure(&mut writer, e).await,
    }
    progress.finish(&result);
    result
}

struct FileReceiver<'a, R, W> {
    reader: &'a mut SealedReader<R>,
    writer: &'a mut SealedWriter<W>,
    peer: &'a PeerIdentity,
    context: &'a ReceiveContext,
    progress: &'a Progress,
    cancel: &'a CancellationToken,
}

impl<R, W> FileReceiver<'_, R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    async fn run(&mut self) -> Result<PathBuf> {
        let (header, file_name) = self.negotiate().await?;
        let mut staging = StagingFile::create(
            &self.context.download_dir,
            &file_name,
            self.progress.session_id(),
        )
        .await
        .inspect_err(|_| {
            let dir = self.context.download_dir.display();
            tracing::warn!(dir = %dir, "Cannot create staging file");
        })?;

        let outcome = async {
            self.reply(ControlMessage::HeaderAck {
                accept: true,
                reason: None,
            })
            .await?;
            self.stream(&header, &mut staging).await?;
            self.verify(&header, &mut staging).await
        }
        .await;

        match outcome {
            Ok(()) => {
                // The rename is the commit point; a lost `complete` only
                // affects what the sender reports.
                let saved = staging
                    .persist(&self.context.download_dir, &file_name)
                    .await?;
                tracing::info!(path = %saved.display(), "Saved received file");
                send_best_effort(self.writer, ControlMessage::Complete).await;
                Ok(saved)
            }
            Err(e) => {
                staging.discard().await;
                Err(e)
            }
        }
    }

    async fn negotiate(&mut self) -> Result<(TransferHeader, String)> {
        let header = match self.wait(self.context.options.negotiate_timeout).await? {
            Message::Control(ControlMessage::Header(header)) => header,
            other => return Err(unexpected(&other, "header")),
        };

        let Some(file_name) = validate_header(&header) else {
            self.reject(reason::INVALID_HEADER).await;
            return Err(Error::ProtocolError(format!(
                "invalid header for '{}'",
                header.file_name
            )));
        };

        self.reader
            .set_max_frame(header.chunk_size as usize + FRAME_OVERHEAD);
        self.progress.update(|session| {
            session.file_name.clone_from(&file_name);
            session.file_size = header.file_size;
            session.chunk_size = header.chunk_size;
            session.integrity_digest.clone_from(&header.digest);
        });
        self.progress.started();
        tracing::info!(
            peer = %self.peer.device_id,
            file = %file_name,
            size = header.file_size,
            "Incoming transfer offer"
        );

        let offer = TransferOffer {
            peer: self.peer,
            trusted: self.context.trusted,
            header: &header,
        };
        if !self.context.consent.decide(&offer) {
            self.reject(reason::DECLINED).await;
            return Err(Error::TransferRejected(reason::DECLINED.to_string()));
        }

        if let Some(available) = available_space(&self.context.download_dir) {
            if available < header.file_size {
                self.reject(reason::INSUFFICIENT_SPACE).await;
                return Err(Error::InsufficientSpace {
                    needed: header.file_size,
                    available,
                });
            }
        }

        Ok((header, file_name))
    }

    async fn stream(&mut self, header: &TransferHeader, staging: &mut StagingFile) -> Result<()> {
        let total = header.total_chunks();
        let mut expected = 0u32;
        let mut awaiting_retransmit = false;
        let mut retried = HashSet::new();

        self.progress.set_state(TransferState::Transferring);

        while expected < total {
            let chunk = match self.next_message().await? {
                Message::Chunk(chunk) => chunk,
                other => return Err(unexpected(&other, "chunk")),
            };

            // Chunks already in flight when the retransmit request went out.
            if awaiting_retransmit && chunk.index > expected {
                tracing::debug!(index = chunk.index, "Dropping chunk while awaiting retransmit");
                continue;
            }
            check_chunk(header, &chunk, expected)?;

            if !chunk.is_intact() {
                if !retried.insert(expected) {
                    return Err(Error::ChecksumMismatch { chunk: expected });
                }
                tracing::warn!(index = expected, "Chunk checksum mismatch, requesting it again");
                self.reply(ControlMessage::Retransmit { index: expected })
                    .await?;
                awaiting_retransmit = true;
                continue;
            }

            awaiting_retransmit = false;
            staging.write(&chunk.data).await?;
            tracing::debug!(index = expected, len = chunk.data.len(), "Wrote chunk");
            expected += 1;
            self.progress.advance(staging.bytes_written());
        }

        Ok(())
    }

    async fn verify(&mut self, header: &TransferHeader, staging: &mut StagingFile) -> Result<()> {
        self.progress.set_state(TransferState::Verifying);

        let limit = self.context.options.verify_timeout;
        let actual = tokio::select! {
            () = self.cancel.cancelled() => {
                send_best_effort(self.writer, ControlMessage::Cancel).await;
                return Err(Error::TransferCancelled);
            }
            digest = tokio::time::timeout(limit, staging.finish()) => {
                digest.map_err(|_| Error::Timeout(limit.as_secs()))??
            }
        };

        match &header.digest {
            Some(expected) if !expected.eq_ignore_ascii_case(&actual) => {
                Err(Error::DigestMismatch {
                    expected: expected.clone(),
                    actual,
                })
            }
            _ => {
                self.progress
                    .update(|session| session.integrity_digest = Some(actual));
                Ok(())
            }
        }
    }

    /// Next message with no time limit (chunks may take a while on slow links).
    async fn next_message(&mut self) -> Result<Message> {
        tokio::select! {
            () = self.cancel.cancelled() => {
                send_best_effort(self.writer, ControlMessage::Cancel).await;
                Err(Error::TransferCancelled)
            }
            message = self.reader.recv() => message,
        }
    }

    /// Next message, at most `limit`.
    async fn wait(&mut self, limit: Duration) -> Result<Message> {
        match tokio::time::timeout(limit, self.next_message()).await {
            Ok(message) => message,
            Err(_) => {
                tracing::warn!(peer = %self.peer.device_id, "Peer sent no header in time");
                Err(Error::Timeout(limit.as_secs()))
            }
        }
    }

    async fn reply(&mut self, message: ControlMessage) -> Result<()> {
        self.writer.send(&message.into()).await
    }

    async fn reject(&mut self, reason: &str) {
        tracing::info!(peer = %self.peer.device_id, reason, "Rejecting transfer");
        send_best_effort(
            self.writer,
            ControlMessage::HeaderAck {
                accept: false,
                reason: Some(reason.to_string()),
            },
        )
        .await;
    }
}

/// Sanitized file name when every header field is acceptable.
fn validate_header(header: &TransferHeader) -> Option<String> {
    let chunk_size = header.chunk_size as usize;
    if chunk_size == 0 || chunk_size > MAX_CHUNK_SIZE {
        return None;
    }
    if header.digest_algorithm != DIGEST_ALGORITHM {
        return None;
    }
    if header.file_size.div_ceil(u64::from(header.chunk_size)) > u64::from(u32::MAX) {
        return None;
    }
    sanitize_file_name(&header.file_name)
}

fn check_chunk(header: &TransferHeader, chunk: &ChunkFrame, expected: u32) -> Result<()> {
    if chunk.index != expected {
        return Err(Error::ProtocolError(format!(
            "expected chunk {expected}, got chunk {}",
            chunk.index
        )));
    }
    let expected_len = header.expected_chunk_len(expected);
    if chunk.data.len() != expected_len {
        return Err(Error::ProtocolError(format!(
            "chunk {expected} carries {} bytes, expected {expected_len}",
            chunk.data.len()
        )));
    }
    Ok(())
}

fn unexpected(message: &Message, expected: &str) -> Error {
    match message {
        Message::Control(ControlMessage::Cancel) => {
            Error::RemoteAbort(reason::CANCELLED.to_string())
        }
        Message::Control(ControlMessage::Error { reason }) => Error::RemoteAbort(reason.clone()),
        other => Error::UnexpectedMessage {
            expected: expected.to_string(),
            actual: other.kind().to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(file_size: u64, chunk_size: u32) -> TransferHeader {
        TransferHeader {
            file_name: "a.bin".into(),
            file_size,
            chunk_size,
            digest_algorithm: DIGEST_ALGORITHM.into(),
            digest: None,
        }
    }

    #[test]
    fn test_validate_header() {
        assert_eq!(validate_header(&header(100, 10)).as_deref(), Some("a.bin"));
        assert!(validate_header(&header(100, 0)).is_none());
        assert!(validate_header(&header(100, u32::MAX)).is_none());

        let mut md5 = header(100, 10);
        md5.digest_algorithm = "md5".into();
        assert!(validate_header(&md5).is_none());

        let mut traversal = header(100, 10);
        traversal.file_name = "../../.bashrc".into();
        assert_eq!(validate_header(&traversal).as_deref(), Some(".bashrc"));

        assert!(validate_header(&header(u64::MAX, 1)).is_none());
    }

    #[test]
    fn test_check_chunk() {
        let header = header(25, 10);
        assert!(check_chunk(&header, &ChunkFrame::new(0, vec![0; 10]), 0).is_ok());
        assert!(check_chunk(&header, &ChunkFrame::new(2, vec![0; 5]), 2).is_ok());
        assert!(matches!(
            check_chunk(&header, &ChunkFrame::new(1, vec![0; 10]), 0),
            Err(Error::ProtocolError(_))
        ));
        assert!(matches!(
            check_chunk(&header, &ChunkFrame::new(2, vec![0; 10]), 2),
            Err(Error::ProtocolError(_))
        ));
    }
}
