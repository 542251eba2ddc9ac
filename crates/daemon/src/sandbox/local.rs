//! Directory-backed reference sandbox.
//!
//! Every sandbox is a fresh directory under the provider root. File paths
//! are resolved inside that directory and `..` may not climb out of it.
//! Processes run as ordinary children of the daemon with the sandbox
//! directory as their default working directory. This confines paths, not
//! processes.

use std::io::{Read, Write};
use std::os::unix::process::ExitStatusExt;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use portable_pty::{native_pty_system, CommandBuilder, MasterPty, PtySize};
use protocol::{ExitStatus, StreamData};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use super::{
    FileOps, FsOptions, ProcessControl, ProcessFd, ProcessSpawner, Sandbox, SandboxError,
    SandboxProvider, SpawnRequest, SpawnedProcess,
};
use crate::config::Config;

/// Buffer size for reading process output.
const READ_BUFFER_SIZE: usize = 4096;

/// Terminal size until the client resizes.
const DEFAULT_COLS: u16 = 80;
const DEFAULT_ROWS: u16 = 24;

/// Creates [`LocalSandbox`]es under one root directory.
#[derive(Debug, Clone)]
pub struct LocalSandboxProvider {
    root: PathBuf,
}

impl LocalSandboxProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Provider rooted at `<data_dir>/boxes`.
    pub fn from_config(config: &Config) -> Self {
        Self::new(config.daemon.data_dir.join("boxes"))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl SandboxProvider for LocalSandboxProvider {
    async fn create(&self) -> Result<Arc<dyn Sandbox>, SandboxError> {
        let name = Uuid::new_v4().to_string();
        let root = self.root.join(&name);
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| SandboxError::Creation(format!("{}: {}", root.display(), e)))?;

        tracing::info!(sandbox = %name, root = %root.display(), "Created local sandbox");
        Ok(Arc::new(LocalSandbox { name, root }))
    }
}

/// A sandbox rooted at one directory.
#[derive(Debug)]
pub struct LocalSandbox {
    name: String,
    root: PathBuf,
}

impl LocalSandbox {
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Maps a sandbox path onto the host, rejecting paths that leave the root.
    ///
    /// Absolute paths are taken relative to the sandbox root.
    fn resolve(&self, path: &str) -> Result<PathBuf, SandboxError> {
        let mut resolved = self.root.clone();
        let mut depth = 0usize;
        for component in Path::new(path).components() {
            match component {
                Component::Normal(part) => {
                    resolved.push(part);
                    depth += 1;
                }
                Component::ParentDir => {
                    if depth == 0 {
                        return Err(SandboxError::io(
                            format!("path escapes sandbox: {}", path),
                            "EACCES",
                        ));
                    }
                    resolved.pop();
                    depth -= 1;
                }
                Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
            }
        }
        Ok(resolved)
    }

    fn resolve_all(&self, paths: &[String]) -> Result<Vec<PathBuf>, SandboxError> {
        paths.iter().map(|path| self.resolve(path)).collect()
    }
}

#[async_trait]
impl FileOps for LocalSandbox {
    async fn read_file(&self, path: &str, max_size: u64) -> Result<Vec<u8>, SandboxError> {
        let file = self.resolve(path)?;
        let metadata = tokio::fs::metadata(&file).await?;
        if metadata.is_dir() {
            return Err(SandboxError::io(
                format!("illegal operation on a directory: {}", path),
                "EISDIR",
            ));
        }
        if metadata.len() > max_size {
            return Err(SandboxError::io(
                format!(
                    "file too large: {} is {} bytes, limit is {}",
                    path,
                    metadata.len(),
                    max_size
                ),
                "EFBIG",
            ));
        }
        Ok(tokio::fs::read(&file).await?)
    }

    async fn write_file(&self, path: &str, data: Vec<u8>) -> Result<(), SandboxError> {
        let file = self.resolve(path)?;
        tokio::fs::write(&file, data).await?;
        Ok(())
    }

    async fn mkdir(&self, paths: &[String], options: FsOptions) -> Result<(), SandboxError> {
        for dir in self.resolve_all(paths)? {
            if options.parents {
                tokio::fs::create_dir_all(&dir).await?;
            } else {
                tokio::fs::create_dir(&dir).await?;
            }
        }
        Ok(())
    }

    async fn rm(&self, paths: &[String], options: FsOptions) -> Result<(), SandboxError> {
        for (path, target) in paths.iter().zip(self.resolve_all(paths)?) {
            if target == self.root {
                return Err(SandboxError::io("refusing to remove sandbox root", "EPERM"));
            }
            let metadata = match tokio::fs::symlink_metadata(&target).await {
                Ok(metadata) => metadata,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound && options.force => continue,
                Err(e) => return Err(e.into()),
            };
            if metadata.is_dir() {
                if !options.recursive {
                    return Err(SandboxError::io(
                        format!("is a directory: {}", path),
                        "EISDIR",
                    ));
                }
                tokio::fs::remove_dir_all(&target).await?;
            } else {
                tokio::fs::remove_file(&target).await?;
            }
        }
        Ok(())
    }

    async fn cp(
        &self,
        sources: &[String],
        dest: &str,
        options: FsOptions,
    ) -> Result<(), SandboxError> {
        let sources = self.resolve_all(sources)?;
        let dest = self.resolve(dest)?;
        tokio::task::spawn_blocking(move || copy_all(&sources, &dest, options))
            .await
            .map_err(|e| SandboxError::io(format!("copy task failed: {}", e), "EIO"))?
    }

    async fn ln(&self, target: &str, link: &str, options: FsOptions) -> Result<(), SandboxError> {
        let source = self.resolve(target)?;
        let link = self.resolve(link)?;

        if tokio::fs::symlink_metadata(&link).await.is_ok() {
            if !options.force {
                return Err(SandboxError::io(
                    format!("file exists: {}", link.display()),
                    "EEXIST",
                ));
            }
            tokio::fs::remove_file(&link).await?;
        }

        if options.symbolic {
            tokio::fs::symlink(&source, &link).await?;
        } else {
            tokio::fs::hard_link(&source, &link).await?;
        }
        Ok(())
    }
}

fn copy_all(sources: &[PathBuf], dest: &Path, options: FsOptions) -> Result<(), SandboxError> {
    let dest_is_dir = dest.is_dir();
    if sources.len() > 1 && !dest_is_dir {
        return Err(SandboxError::io(
            format!("target is not a directory: {}", dest.display()),
            "ENOTDIR",
        ));
    }

    for source in sources {
        let target = match (dest_is_dir, source.file_name()) {
            (true, Some(name)) => dest.join(name),
            _ => dest.to_path_buf(),
        };
        copy_one(source, &target, options)?;
    }
    Ok(())
}

fn copy_one(source: &Path, target: &Path, options: FsOptions) -> Result<(), SandboxError> {
    let metadata = std::fs::metadata(source)?;
    if metadata.is_dir() {
        if !options.recursive {
            return Err(SandboxError::io(
                format!("omitting directory: {}", source.display()),
                "EISDIR",
            ));
        }
        std::fs::create_dir_all(target)?;
        for entry in std::fs::read_dir(source)? {
            let entry = entry?;
            copy_one(&entry.path(), &target.join(entry.file_name()), options)?;
        }
        return Ok(());
    }

    if target.exists() && !options.force {
        return Err(SandboxError::io(
            format!("file exists: {}", target.display()),
            "EEXIST",
        ));
    }
    std::fs::copy(source, target)?;
    Ok(())
}

#[async_trait]
impl ProcessSpawner for LocalSandbox {
    async fn spawn(&self, request: SpawnRequest) -> Result<SpawnedProcess, SandboxError> {
        if request.extra_streams > 0 {
            return Err(SandboxError::Unsupported(
                "extra descriptors are not available in local sandboxes".to_string(),
            ));
        }
        let cwd = match &request.cwd {
            Some(cwd) => self.resolve(cwd)?,
            None => self.root.clone(),
        };

        if request.term {
            spawn_terminal(&self.name, request, cwd)
        } else {
            spawn_piped(&self.name, request, cwd)
        }
    }
}

#[async_trait]
impl Sandbox for LocalSandbox {
    fn name(&self) -> &str {
        &self.name
    }

    async fn destroy(&self) -> Result<(), SandboxError> {
        match tokio::fs::remove_dir_all(&self.root).await {
            Ok(()) => {
                tracing::info!(sandbox = %self.name, "Destroyed local sandbox");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SandboxError::Destroy(format!("{}: {}", self.root.display(), e))),
        }
    }
}

fn spawn_piped(
    sandbox: &str,
    request: SpawnRequest,
    cwd: PathBuf,
) -> Result<SpawnedProcess, SandboxError> {
    let mut child = Command::new(&request.command)
        .args(&request.args)
        .current_dir(cwd)
        .envs(&request.env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| SandboxError::spawn(&e))?;

    let pid = child.id();
    tracing::debug!(sandbox = %sandbox, command = %request.command, pid = ?pid, "Spawned process");

    let mut stdio = Vec::with_capacity(3);

    let (stdin_tx, stdin_rx) = mpsc::channel(1);
    if let Some(stdin) = child.stdin.take() {
        tokio::spawn(pump_into(stdin, stdin_rx));
    }
    stdio.push(ProcessFd::readable(stdin_tx));

    for output in [
        child.stdout.take().map(|out| Box::new(out) as Box<dyn AsyncRead + Send + Unpin>),
        child.stderr.take().map(|err| Box::new(err) as Box<dyn AsyncRead + Send + Unpin>),
    ] {
        let (tx, rx) = mpsc::channel(1);
        if let Some(output) = output {
            tokio::spawn(pump_from(output, tx));
        }
        stdio.push(ProcessFd::writable(rx));
    }

    let (exit_tx, exit_rx) = oneshot::channel();
    tokio::spawn(async move {
        let status = match child.wait().await {
            Ok(status) => match (status.code(), status.signal()) {
                (Some(code), _) => ExitStatus::code(code),
                (None, Some(signal)) => ExitStatus::signal(signal_name(signal)),
                (None, None) => ExitStatus::code(-1),
            },
            Err(e) => {
                tracing::warn!(error = %e, "Failed to wait for process");
                ExitStatus::code(-1)
            }
        };
        let _ = exit_tx.send(status);
    });

    Ok(SpawnedProcess {
        control: Arc::new(LocalProcessControl { pid, master: None }),
        stdio,
        exit: exit_rx,
    })
}

fn spawn_terminal(
    sandbox: &str,
    request: SpawnRequest,
    cwd: PathBuf,
) -> Result<SpawnedProcess, SandboxError> {
    let spawn_error = |e: anyhow::Error| SandboxError::Spawn {
        message: e.to_string(),
        code: None,
    };

    let pair = native_pty_system()
        .openpty(PtySize {
            rows: DEFAULT_ROWS,
            cols: DEFAULT_COLS,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(spawn_error)?;

    let mut cmd = CommandBuilder::new(&request.command);
    cmd.args(&request.args);
    cmd.cwd(cwd);
    for (key, value) in &request.env {
        cmd.env(key, value);
    }

    let mut child = pair.slave.spawn_command(cmd).map_err(spawn_error)?;
    drop(pair.slave);

    let pid = child.process_id();
    tracing::debug!(sandbox = %sandbox, command = %request.command, pid = ?pid, "Spawned terminal process");

    let mut reader = pair.master.try_clone_reader().map_err(spawn_error)?;
    let mut writer = pair.master.take_writer().map_err(spawn_error)?;

    let (output_tx, output_rx) = mpsc::channel(1);
    tokio::task::spawn_blocking(move || {
        let mut buffer = vec![0u8; READ_BUFFER_SIZE];
        loop {
            match reader.read(&mut buffer) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if output_tx
                        .blocking_send(StreamData::Bytes(buffer[..n].to_vec()))
                        .is_err()
                    {
                        break;
                    }
                }
            }
        }
    });

    let (input_tx, mut input_rx) = mpsc::channel::<StreamData>(1);
    tokio::task::spawn_blocking(move || {
        while let Some(data) = input_rx.blocking_recv() {
            let Some(bytes) = data.as_bytes() else {
                continue;
            };
            if writer.write_all(bytes).and_then(|_| writer.flush()).is_err() {
                break;
            }
        }
    });

    let (exit_tx, exit_rx) = oneshot::channel();
    tokio::task::spawn_blocking(move || {
        let status = match child.wait() {
            Ok(status) => ExitStatus::code(status.exit_code() as i32),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to wait for terminal process");
                ExitStatus::code(-1)
            }
        };
        let _ = exit_tx.send(status);
    });

    Ok(SpawnedProcess {
        control: Arc::new(LocalProcessControl {
            pid,
            master: Some(Mutex::new(pair.master)),
        }),
        stdio: vec![ProcessFd::duplex(input_tx, output_rx)],
        exit: exit_rx,
    })
}

async fn pump_into<W>(mut sink: W, mut rx: mpsc::Receiver<StreamData>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(data) = rx.recv().await {
        let Some(bytes) = data.as_bytes() else {
            continue;
        };
        if sink.write_all(bytes).await.is_err() || sink.flush().await.is_err() {
            break;
        }
    }
    let _ = sink.shutdown().await;
}

async fn pump_from<R>(mut source: R, tx: mpsc::Sender<StreamData>)
where
    R: AsyncRead + Unpin,
{
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    loop {
        match source.read(&mut buffer).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if tx.send(StreamData::Bytes(buffer[..n].to_vec())).await.is_err() {
                    break;
                }
            }
        }
    }
}

fn signal_name(signal: i32) -> String {
    Signal::try_from(signal)
        .map(|s| s.as_str().to_string())
        .unwrap_or_else(|_| format!("SIG{}", signal))
}

struct LocalProcessControl {
    pid: Option<u32>,
    master: Option<Mutex<Box<dyn MasterPty + Send>>>,
}

#[async_trait]
impl ProcessControl for LocalProcessControl {
    async fn kill(&self, signal: &str) -> Result<(), SandboxError> {
        let signal = Signal::from_str(signal)
            .map_err(|_| SandboxError::Control(format!("unknown signal: {}", signal)))?;
        let pid = self
            .pid
            .ok_or_else(|| SandboxError::Control("process has no pid".to_string()))?;
        kill(Pid::from_raw(pid as i32), signal)
            .map_err(|e| SandboxError::Control(format!("kill {}: {}", pid, e)))
    }

    async fn resize(&self, cols: u16, rows: u16) -> Result<(), SandboxError> {
        let Some(master) = &self.master else {
            return Ok(());
        };
        master
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SandboxError::Control(e.to_string()))
    }
}
