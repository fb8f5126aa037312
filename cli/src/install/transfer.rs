//! Bulk file transfer — streams a local file or directory tree into a
//! remote `tar` extraction, both ends running concurrently under one shared
//! deadline. This is the primitive behind firmware upload and the final
//! configuration-bundle deployment.

use std::path::Path;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::io::SyncIoBridge;
use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::install::session::{RemoteSession, shell_quote};
use crate::install::{DeviceSession, Reporter, SHORT_COMMAND_TIMEOUT};

const COPY_TIMEOUT: Duration = Duration::from_secs(20 * 60);

enum CopyWait {
    Done(Result<(), Error>),
    TimedOut,
    Cancelled,
}

/// Replicates `local` (a file or a directory tree) under `remote` on the
/// device. Symlinks are recorded as links, not followed. Each written entry
/// is logged through the reporter.
///
/// Waits for both the local packaging task and the remote process before
/// returning; a packaging error takes precedence over the remote error
/// since it usually explains it.
///
/// # Errors
///
/// [`Error::Transfer`] for local packaging failures, [`Error::Command`] /
/// [`Error::Network`] for remote failures, [`Error::Timeout`] after the
/// shared deadline, [`Error::Cancelled`] when the token fires.
pub(crate) async fn copy_path_to_device(
    session: &RemoteSession,
    cancel: &CancellationToken,
    local: &Path,
    remote: &str,
    reporter: &dyn Reporter,
) -> Result<(), Error> {
    let remote = remote.trim();
    if remote.is_empty() {
        return Err(Error::Transfer("remote path must not be empty".into()));
    }
    if let Err(e) = std::fs::symlink_metadata(local) {
        return Err(Error::Transfer(format!(
            "stat local path {}: {e}",
            local.display()
        )));
    }

    reporter.log(
        &format!("Copying {} to {remote}", local.display()),
        "",
    );

    session
        .run_command(
            &format!("mkdir -p {}", shell_quote(remote)),
            SHORT_COMMAND_TIMEOUT,
        )
        .await?;

    let extract_cmd = format!("tar -xpf - -C {}", shell_quote(remote));
    let mut channel = session.open_exec(&extract_cmd).await?;

    let (writer, reader) = tokio::io::duplex(64 * 1024);
    let (log_tx, mut log_rx) = tokio::sync::mpsc::unbounded_channel::<String>();

    let local_owned = local.to_path_buf();
    let pack = tokio::task::spawn_blocking(move || -> Result<(), String> {
        let bridge = SyncIoBridge::new(writer);
        let mut builder = tar::Builder::new(bridge);
        builder.follow_symlinks(false);
        pack_local(&mut builder, &local_owned, &log_tx).map_err(|e| e.to_string())?;
        let mut bridge = builder.into_inner().map_err(|e| e.to_string())?;
        bridge.shutdown().map_err(|e| e.to_string())?;
        Ok(())
    });

    let deadline = Instant::now() + COPY_TIMEOUT;
    let outcome = {
        let drive = drive_extraction(&mut channel, reader, &extract_cmd);
        tokio::pin!(drive);
        loop {
            tokio::select! {
                result = &mut drive => break CopyWait::Done(result),
                Some(line) = log_rx.recv() => reporter.log(&line, ""),
                () = tokio::time::sleep_until(deadline) => break CopyWait::TimedOut,
                () = cancel.cancelled() => break CopyWait::Cancelled,
            }
        }
    };

    let session_result = match outcome {
        CopyWait::Done(result) => result,
        CopyWait::TimedOut => {
            reporter.log("Copy operation timed out; aborting remote extraction", "");
            let _ = channel.signal(russh::Sig::KILL).await;
            let _ = channel.eof().await;
            Err(Error::Timeout {
                command: extract_cmd.clone(),
                timeout: COPY_TIMEOUT,
            })
        }
        CopyWait::Cancelled => {
            let _ = channel.signal(russh::Sig::KILL).await;
            let _ = channel.eof().await;
            Err(Error::Cancelled)
        }
    };

    // Both ends must terminate before this call returns. Dropping the
    // extraction future above closes the pipe reader, which unblocks the
    // packaging task if the remote side died first.
    let aborted = session_result
        .as_ref()
        .is_err_and(|e| matches!(e, Error::Timeout { .. } | Error::Cancelled));
    let pack_result = match pack.await {
        Ok(result) => result,
        Err(e) => Err(format!("packaging task failed: {e}")),
    };
    while let Ok(line) = log_rx.try_recv() {
        reporter.log(&line, "");
    }

    // A packaging failure explains a remote failure and takes precedence,
    // unless the run was aborted: then the broken pipe is collateral and
    // the abort error is the one to surface.
    if !aborted {
        if let Err(e) = pack_result {
            return Err(Error::Transfer(format!("package local content: {e}")));
        }
    }
    session_result?;

    reporter.log("Copy complete.", "");
    Ok(())
}

async fn drive_extraction(
    channel: &mut russh::Channel<russh::client::Msg>,
    archive: tokio::io::DuplexStream,
    command: &str,
) -> Result<(), Error> {
    channel
        .data(archive)
        .await
        .map_err(|e| Error::Network(format!("stream archive to remote: {e}")))?;
    channel
        .eof()
        .await
        .map_err(|e| Error::Network(format!("finish archive stream: {e}")))?;

    let mut stderr = Vec::new();
    let mut status = None;
    while let Some(msg) = channel.wait().await {
        match msg {
            russh::ChannelMsg::ExtendedData { data, ext: 1 } => {
                stderr.extend_from_slice(&data);
            }
            russh::ChannelMsg::ExitStatus { exit_status } => status = Some(exit_status),
            _ => {}
        }
    }
    match status {
        Some(0) => Ok(()),
        Some(code) => Err(Error::Command {
            command: command.to_string(),
            status: code,
            stderr: String::from_utf8_lossy(&stderr).trim().to_string(),
        }),
        None => Err(Error::Network(
            "session closed before remote extraction reported an exit status".into(),
        )),
    }
}

/// Serializes `base` into the tar builder. Directories recurse in name
/// order; symlinks record their target rather than its contents.
pub(crate) fn pack_local<W: std::io::Write>(
    builder: &mut tar::Builder<W>,
    base: &Path,
    log: &tokio::sync::mpsc::UnboundedSender<String>,
) -> std::io::Result<()> {
    let meta = std::fs::symlink_metadata(base)?;
    if meta.is_dir() {
        pack_dir(builder, base, base, log)
    } else {
        let rel = base
            .file_name()
            .map_or_else(|| Path::new("file").to_path_buf(), std::convert::Into::into);
        append_entry(builder, base, &rel, &meta, log)
    }
}

fn pack_dir<W: std::io::Write>(
    builder: &mut tar::Builder<W>,
    base: &Path,
    dir: &Path,
    log: &tokio::sync::mpsc::UnboundedSender<String>,
) -> std::io::Result<()> {
    let mut entries = std::fs::read_dir(dir)?.collect::<std::io::Result<Vec<_>>>()?;
    entries.sort_by_key(std::fs::DirEntry::file_name);
    for entry in entries {
        let path = entry.path();
        let meta = std::fs::symlink_metadata(&path)?;
        let rel = path
            .strip_prefix(base)
            .map_err(std::io::Error::other)?
            .to_path_buf();
        append_entry(builder, &path, &rel, &meta, log)?;
        if meta.is_dir() {
            pack_dir(builder, base, &path, log)?;
        }
    }
    Ok(())
}

fn append_entry<W: std::io::Write>(
    builder: &mut tar::Builder<W>,
    full: &Path,
    rel: &Path,
    meta: &std::fs::Metadata,
    log: &tokio::sync::mpsc::UnboundedSender<String>,
) -> std::io::Result<()> {
    let name = rel.to_string_lossy().replace('\\', "/");
    if meta.file_type().is_symlink() {
        let target = std::fs::read_link(full)?;
        let mut header = tar::Header::new_gnu();
        header.set_metadata(meta);
        header.set_size(0);
        builder.append_link(&mut header, rel, &target)?;
        let _ = log.send(format!("Copied symlink: {name}"));
    } else if meta.is_dir() {
        builder.append_dir(rel, full)?;
        let _ = log.send(format!("Created directory: {name}/"));
    } else {
        let mut file = std::fs::File::open(full)?;
        builder.append_file(rel, &mut file)?;
        let _ = log.send(format!("Copied file: {name}"));
    }
    Ok(())
}
