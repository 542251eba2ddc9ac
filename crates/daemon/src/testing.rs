//! In-memory sandbox used by unit tests.
//!
//! Files live in a map. Processes are scripted by command name:
//! `echo` prints its arguments, `cat` copies stdin to stdout, `hang` runs
//! until it is signalled and anything else fails to spawn with `ENOENT`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use protocol::{ExitStatus, StreamData};
use tokio::sync::{mpsc, oneshot, Notify};

use crate::sandbox::{
    FileOps, FsOptions, ProcessControl, ProcessFd, ProcessSpawner, Sandbox, SandboxError,
    SandboxProvider, SpawnRequest, SpawnedProcess,
};

#[derive(Default)]
pub struct FakeProvider {
    pub created: AtomicUsize,
    pub fail_create: bool,
    pub fail_destroy: bool,
    /// When set, creation waits until notified.
    pub gate: Option<Arc<Notify>>,
    pub sandboxes: Mutex<Vec<Arc<FakeSandbox>>>,
}

impl FakeProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            fail_create: true,
            ..Self::default()
        })
    }

    pub fn gated(gate: Arc<Notify>) -> Arc<Self> {
        Arc::new(Self {
            gate: Some(gate),
            ..Self::default()
        })
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn sandbox(&self, index: usize) -> Arc<FakeSandbox> {
        self.sandboxes.lock().unwrap()[index].clone()
    }
}

#[async_trait]
impl SandboxProvider for FakeProvider {
    async fn create(&self) -> Result<Arc<dyn Sandbox>, SandboxError> {
        let index = self.created.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        if self.fail_create {
            return Err(SandboxError::Creation("no capacity".to_string()));
        }
        let sandbox = Arc::new(FakeSandbox {
            name: format!("fake-{}", index),
            fail_destroy: self.fail_destroy,
            ..FakeSandbox::default()
        });
        self.sandboxes.lock().unwrap().push(sandbox.clone());
        Ok(sandbox)
    }
}

#[derive(Default)]
pub struct FakeSandbox {
    pub name: String,
    pub files: Mutex<HashMap<String, Vec<u8>>>,
    pub dirs: Mutex<Vec<String>>,
    pub kills: Arc<Mutex<Vec<String>>>,
    pub spawned: Mutex<Vec<SpawnRequest>>,
    pub destroyed: AtomicUsize,
    pub fail_destroy: bool,
}

impl FakeSandbox {
    pub fn kills(&self) -> Vec<String> {
        self.kills.lock().unwrap().clone()
    }

    pub fn destroyed(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FileOps for FakeSandbox {
    async fn read_file(&self, path: &str, max_size: u64) -> Result<Vec<u8>, SandboxError> {
        let files = self.files.lock().unwrap();
        let data = files
            .get(path)
            .ok_or_else(|| SandboxError::io(format!("no such file: {}", path), "ENOENT"))?;
        if data.len() as u64 > max_size {
            return Err(SandboxError::io("file too large", "EFBIG"));
        }
        Ok(data.clone())
    }

    async fn write_file(&self, path: &str, data: Vec<u8>) -> Result<(), SandboxError> {
        self.files.lock().unwrap().insert(path.to_string(), data);
        Ok(())
    }

    async fn mkdir(&self, paths: &[String], _options: FsOptions) -> Result<(), SandboxError> {
        self.dirs.lock().unwrap().extend(paths.iter().cloned());
        Ok(())
    }

    async fn rm(&self, paths: &[String], options: FsOptions) -> Result<(), SandboxError> {
        let mut files = self.files.lock().unwrap();
        for path in paths {
            if files.remove(path).is_none() && !options.force {
                return Err(SandboxError::io(format!("no such file: {}", path), "ENOENT"));
            }
        }
        Ok(())
    }

    async fn cp(&self, sources: &[String], dest: &str, _options: FsOptions) -> Result<(), SandboxError> {
        let mut files = self.files.lock().unwrap();
        for source in sources {
            let data = files
                .get(source)
                .cloned()
                .ok_or_else(|| SandboxError::io(format!("no such file: {}", source), "ENOENT"))?;
            files.insert(dest.to_string(), data);
        }
        Ok(())
    }

    async fn ln(&self, target: &str, link: &str, _options: FsOptions) -> Result<(), SandboxError> {
        let mut files = self.files.lock().unwrap();
        let data = files.get(target).cloned().unwrap_or_default();
        files.insert(link.to_string(), data);
        Ok(())
    }
}

struct FakeControl {
    kills: Arc<Mutex<Vec<String>>>,
    exit: Mutex<Option<oneshot::Sender<ExitStatus>>>,
}

#[async_trait]
impl ProcessControl for FakeControl {
    async fn kill(&self, signal: &str) -> Result<(), SandboxError> {
        self.kills.lock().unwrap().push(signal.to_string());
        if let Some(exit) = self.exit.lock().unwrap().take() {
            let _ = exit.send(ExitStatus::signal(signal));
        }
        Ok(())
    }

    async fn resize(&self, _cols: u16, _rows: u16) -> Result<(), SandboxError> {
        Ok(())
    }
}

#[async_trait]
impl ProcessSpawner for FakeSandbox {
    async fn spawn(&self, request: SpawnRequest) -> Result<SpawnedProcess, SandboxError> {
        self.spawned.lock().unwrap().push(request.clone());

        let (exit_tx, exit_rx) = oneshot::channel();
        let (stdin_tx, mut stdin_rx) = mpsc::channel::<StreamData>(1);
        let (stdout_tx, stdout_rx) = mpsc::channel::<StreamData>(1);
        let (_stderr_tx, stderr_rx) = mpsc::channel::<StreamData>(1);

        let control = Arc::new(FakeControl {
            kills: self.kills.clone(),
            exit: Mutex::new(None),
        });

        match request.command.as_str() {
            "echo" => {
                let line = format!("{}\n", request.args.join(" "));
                tokio::spawn(async move {
                    let _ = stdout_tx.send(StreamData::from(line.into_bytes())).await;
                    let _ = exit_tx.send(ExitStatus::code(0));
                });
            }
            "cat" => {
                tokio::spawn(async move {
                    while let Some(data) = stdin_rx.recv().await {
                        if stdout_tx.send(data).await.is_err() {
                            break;
                        }
                    }
                    let _ = exit_tx.send(ExitStatus::code(0));
                });
            }
            "hang" => {
                *control.exit.lock().unwrap() = Some(exit_tx);
                tokio::spawn(async move {
                    let _keep = stdout_tx;
                    while stdin_rx.recv().await.is_some() {}
                });
            }
            other => {
                return Err(SandboxError::Spawn {
                    message: format!("spawn {} ENOENT", other),
                    code: Some("ENOENT".to_string()),
                });
            }
        }

        let stdio = if request.term {
            // Terminal mode has one combined descriptor: stdout carries
            // the output.
            vec![ProcessFd::duplex(stdin_tx, stdout_rx)]
        } else {
            vec![
                ProcessFd::readable(stdin_tx),
                ProcessFd::writable(stdout_rx),
                ProcessFd::writable(stderr_rx),
            ]
        };

        Ok(SpawnedProcess {
            control,
            stdio,
            exit: exit_rx,
        })
    }
}

#[async_trait]
impl Sandbox for FakeSandbox {
    fn name(&self) -> &str {
        &self.name
    }

    async fn destroy(&self) -> Result<(), SandboxError> {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
        if self.fail_destroy {
            return Err(SandboxError::Destroy("busy".to_string()));
        }
        Ok(())
    }
}
