// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Job uploader: transfers a sliced file to the printer's storage and
// optionally starts it.
//
// Transfer sequence on the control session:
//
//   M28 <size> 0:/user/<name>     announce
//   packet, packet, ...           file data, no per-packet reply
//   M29                           close; `ok` means the file is stored
//   M23 0:/user/<name>            only after `ok`, only when asked to start
//
// Progress is pulled, not pushed: `Upload::next` does one step of work and
// reports it.  The upload borrows the session mutably for its whole life, so
// no status poll can interleave with the packet stream.

use std::path::Path;

use futures::Stream;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, info, instrument, warn};

use forgelink_core::config::DEFAULT_CHUNK_SIZE;
use forgelink_core::error::{ForgeError, Result};
use forgelink_core::types::{UploadJob, UploadProgress, UploadStage};

use crate::protocol::{Command, encode_packet};
use crate::session::ControlSession;
use crate::transport::ControlStream;

/// Starts uploads.
#[derive(Debug, Clone)]
pub struct JobUploader {
    chunk_size: usize,
}

impl Default for JobUploader {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE)
    }
}

impl JobUploader {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
        }
    }

    /// Describe an upload of `local_path`, sized from the file on disk.
    ///
    /// The remote name defaults to the local file name.
    pub async fn prepare(
        &self,
        local_path: impl AsRef<Path>,
        remote_file_name: Option<&str>,
        start_after_upload: bool,
    ) -> Result<UploadJob> {
        let local_path = local_path.as_ref();
        let metadata = tokio::fs::metadata(local_path).await?;
        if !metadata.is_file() {
            return Err(ForgeError::Upload(format!(
                "{} is not a regular file",
                local_path.display()
            )));
        }
        let remote = match remote_file_name {
            Some(name) => name.to_owned(),
            None => local_path
                .file_name()
                .and_then(|n| n.to_str())
                .map(str::to_owned)
                .ok_or_else(|| {
                    ForgeError::Upload(format!(
                        "{} has no usable file name; pass one explicitly",
                        local_path.display()
                    ))
                })?,
        };
        let job = UploadJob::new(local_path, remote, start_after_upload, metadata.len());
        validate(&job)?;
        Ok(job)
    }

    /// Begin uploading `job.local_path` over `session`.
    ///
    /// Nothing reaches the printer until the first `next()`.
    pub async fn upload<'s, S: ControlStream>(
        &self,
        session: &'s mut ControlSession<S>,
        job: UploadJob,
    ) -> Result<Upload<'s, S, tokio::fs::File>> {
        validate(&job)?;
        let file = tokio::fs::File::open(&job.local_path).await?;
        let on_disk = file.metadata().await?.len();
        if on_disk != job.bytes_total {
            return Err(ForgeError::Upload(format!(
                "{} is {on_disk} bytes, expected {}",
                job.local_path.display(),
                job.bytes_total
            )));
        }
        self.upload_from(session, job, file)
    }

    /// Begin uploading `job.bytes_total` bytes read from `source`.
    pub fn upload_from<'s, S: ControlStream, R: AsyncRead + Unpin + Send>(
        &self,
        session: &'s mut ControlSession<S>,
        job: UploadJob,
        source: R,
    ) -> Result<Upload<'s, S, R>> {
        validate(&job)?;
        Ok(Upload {
            session,
            source,
            job,
            buf: vec![0u8; self.chunk_size],
            sequence: 0,
            phase: Phase::Announce,
        })
    }
}

/// Reject jobs the printer could only fail on.
fn validate(job: &UploadJob) -> Result<()> {
    let name = &job.remote_file_name;
    if name.is_empty() || name.contains(|c: char| matches!(c, '/' | '\\')) || name.chars().any(char::is_control) {
        return Err(ForgeError::Upload(format!(
            "remote file name {name:?} must be a plain, non-empty file name"
        )));
    }
    if name.chars().any(char::is_whitespace) {
        // The M28 frame is space-separated.
        return Err(ForgeError::Upload(format!(
            "remote file name {name:?} must not contain spaces"
        )));
    }
    if job.bytes_total == 0 {
        return Err(ForgeError::Upload(format!(
            "{} is empty; nothing to print",
            job.local_path.display()
        )));
    }
    if job.bytes_sent != 0 {
        // Transfers always start from the first byte.
        return Err(ForgeError::Upload(format!(
            "job {} already has {} of {} bytes sent; prepare a fresh job",
            job.id, job.bytes_sent, job.bytes_total
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Announce,
    Streaming,
    Closing,
    Starting,
    Done,
}

/// An upload in progress.  Finite and not restartable; it yields nothing
/// after completing or after its first error.
///
/// Dropping it while file data is still owed to the printer fails the
/// session, since the printer would read the next command as file data.
pub struct Upload<'s, S: ControlStream, R> {
    session: &'s mut ControlSession<S>,
    source: R,
    job: UploadJob,
    buf: Vec<u8>,
    sequence: u32,
    phase: Phase,
}

impl<'s, S: ControlStream, R: AsyncRead + Unpin + Send> Upload<'s, S, R> {
    pub fn job(&self) -> &UploadJob {
        &self.job
    }

    /// Do the next step and report it.
    #[instrument(skip(self), fields(job = %self.job.id, file = %self.job.remote_file_name))]
    pub async fn next(&mut self) -> Option<Result<UploadProgress>> {
        match self.step().await {
            Ok(progress) => progress.map(Ok),
            Err(e) => {
                let failed_in = std::mem::replace(&mut self.phase, Phase::Done);
                if failed_in == Phase::Streaming {
                    // The printer is still expecting file data; the link
                    // cannot carry another command.
                    self.session.abandon(&e.to_string());
                }
                warn!(error = %e, sent = self.job.bytes_sent, total = self.job.bytes_total, "upload failed");
                Some(Err(e))
            }
        }
    }

    async fn step(&mut self) -> Result<Option<UploadProgress>> {
        loop {
            match self.phase {
                Phase::Announce => {
                    let announce = Command::BeginUpload {
                        size: self.job.bytes_total,
                        remote_path: self.job.remote_path(),
                    };
                    self.session.exchange(&announce).await?;
                    info!(bytes = self.job.bytes_total, path = %self.job.remote_path(), "printer accepted transfer");
                    self.phase = Phase::Streaming;
                }
                Phase::Streaming => {
                    let remaining = self.job.bytes_total.saturating_sub(self.job.bytes_sent);
                    if remaining == 0 {
                        self.phase = Phase::Closing;
                        continue;
                    }
                    let len = self.buf.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
                    self.source
                        .read_exact(&mut self.buf[..len])
                        .await
                        .map_err(|e| match e.kind() {
                            std::io::ErrorKind::UnexpectedEof => ForgeError::Upload(format!(
                                "{} ended after {} of {} bytes",
                                self.job.local_path.display(),
                                self.job.bytes_sent,
                                self.job.bytes_total
                            )),
                            _ => ForgeError::Io(e),
                        })?;

                    let packet = encode_packet(self.sequence, &self.buf[..len]);
                    self.session
                        .write_payload(&packet)
                        .await
                        .map_err(into_upload_error)?;
                    self.sequence += 1;
                    self.job.bytes_sent += len as u64;
                    debug!(sent = self.job.bytes_sent, total = self.job.bytes_total, "chunk sent");
                    return Ok(Some(self.progress(UploadStage::Transferring)));
                }
                Phase::Closing => {
                    self.session
                        .exchange(&Command::EndUpload)
                        .await
                        .map_err(into_upload_error)?;
                    info!(bytes = self.job.bytes_total, "printer acknowledged file");
                    self.phase = if self.job.start_after_upload {
                        Phase::Starting
                    } else {
                        Phase::Done
                    };
                    return Ok(Some(self.progress(UploadStage::Acknowledged)));
                }
                Phase::Starting => {
                    self.session
                        .exchange(&Command::StartPrint {
                            remote_path: self.job.remote_path(),
                        })
                        .await?;
                    info!(path = %self.job.remote_path(), "print started");
                    self.phase = Phase::Done;
                    return Ok(Some(self.progress(UploadStage::PrintStarted)));
                }
                Phase::Done => return Ok(None),
            }
        }
    }

    fn progress(&self, stage: UploadStage) -> UploadProgress {
        UploadProgress {
            job_id: self.job.id,
            bytes_sent: self.job.bytes_sent,
            bytes_total: self.job.bytes_total,
            stage,
        }
    }

    /// Drive the upload as a `futures::Stream` of progress updates.
    pub fn into_stream(self) -> impl Stream<Item = Result<UploadProgress>> + 's
    where
        S: 's,
        R: 's,
    {
        futures::stream::unfold(self, |mut upload| async move {
            let item = upload.next().await?;
            Some((item, upload))
        })
    }
}

impl<S: ControlStream, R> Drop for Upload<'_, S, R> {
    fn drop(&mut self) {
        if self.phase == Phase::Streaming {
            warn!(
                job = %self.job.id,
                sent = self.job.bytes_sent,
                total = self.job.bytes_total,
                "upload dropped mid-transfer"
            );
            self.session.abandon("upload dropped before the transfer finished");
        }
    }
}

/// Link failures while the file is in flight are upload failures.
fn into_upload_error(err: ForgeError) -> ForgeError {
    match err {
        ForgeError::Connection(detail) | ForgeError::Timeout(detail) => {
            ForgeError::Upload(format!("transfer interrupted: {detail}"))
        }
        other => other,
    }
}
