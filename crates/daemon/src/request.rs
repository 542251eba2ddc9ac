//! Validation of client requests.
//!
//! Calls and exec requests carry untyped JSON arguments. They are checked
//! here, before any sandbox is touched, and turned into typed requests.

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use protocol::messages::{stdio_stream_id, terminal_stream_id};
use protocol::{CallMethod, ErrorObject, ExecOptions, ExecRequest, ProcessId, StreamId, StreamMode};
use serde_json::Value;
use thiserror::Error;

use crate::sandbox::{FsOptions, SpawnRequest};

/// Terminal type injected in terminal mode.
pub const TERM_DEFAULT: &str = "xterm-256color";

/// Most extra streams one process may open beyond stdio.
pub const MAX_EXTRA_STREAMS: usize = 64;

/// Malformed call or exec arguments.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
}

impl ValidationError {
    fn new(reason: impl Into<String>) -> Self {
        ValidationError::InvalidArguments(reason.into())
    }

    pub fn to_error_object(&self) -> ErrorObject {
        ErrorObject::with_code(self.to_string(), "EINVAL")
    }
}

/// Encoding of `writeFile` data given as a string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Utf8,
    Base64,
}

impl Encoding {
    fn parse(value: Option<&Value>) -> Result<Self, ValidationError> {
        match value {
            None | Some(Value::Null) => Ok(Encoding::Utf8),
            Some(Value::String(name)) => match name.to_ascii_lowercase().as_str() {
                "utf8" | "utf-8" => Ok(Encoding::Utf8),
                "base64" => Ok(Encoding::Base64),
                other => Err(ValidationError::new(format!("unknown encoding: {}", other))),
            },
            Some(_) => Err(ValidationError::new("encoding must be a string")),
        }
    }
}

/// A validated file operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileRequest {
    ReadFile {
        path: String,
    },
    WriteFile {
        path: String,
        data: Vec<u8>,
    },
    Mkdir {
        paths: Vec<String>,
        options: FsOptions,
    },
    Rm {
        paths: Vec<String>,
        options: FsOptions,
    },
    Cp {
        sources: Vec<String>,
        dest: String,
        options: FsOptions,
    },
    Ln {
        target: String,
        link: String,
        options: FsOptions,
    },
}

impl FileRequest {
    /// Validates the positional arguments of `method`.
    ///
    /// - `readFile(path)`
    /// - `writeFile(path, data, encoding?)` with `data` a string or byte array
    /// - `mkdir(paths, options?)`, `rm(paths, options?)`
    /// - `cp([...sources, dest], options?)`
    /// - `ln([target, link], options?)`
    pub fn parse(method: CallMethod, args: &[Value]) -> Result<Self, ValidationError> {
        match method {
            CallMethod::ReadFile => Ok(FileRequest::ReadFile {
                path: path_arg(args.first())?,
            }),
            CallMethod::WriteFile => {
                let path = path_arg(args.first())?;
                let encoding = Encoding::parse(args.get(2))?;
                let data = data_arg(args.get(1), encoding)?;
                Ok(FileRequest::WriteFile { path, data })
            }
            CallMethod::Mkdir => Ok(FileRequest::Mkdir {
                paths: paths_arg(args.first(), 1)?,
                options: options_arg(args.get(1))?,
            }),
            CallMethod::Rm => Ok(FileRequest::Rm {
                paths: paths_arg(args.first(), 1)?,
                options: options_arg(args.get(1))?,
            }),
            CallMethod::Cp => {
                let mut sources = paths_arg(args.first(), 2)?;
                let dest = sources.pop().unwrap_or_default();
                Ok(FileRequest::Cp {
                    sources,
                    dest,
                    options: options_arg(args.get(1))?,
                })
            }
            CallMethod::Ln => {
                let paths = paths_arg(args.first(), 2)?;
                let [target, link]: [String; 2] = paths
                    .try_into()
                    .map_err(|_| ValidationError::new("ln takes exactly two paths"))?;
                Ok(FileRequest::Ln {
                    target,
                    link,
                    options: options_arg(args.get(1))?,
                })
            }
        }
    }

    pub fn method(&self) -> CallMethod {
        match self {
            FileRequest::ReadFile { .. } => CallMethod::ReadFile,
            FileRequest::WriteFile { .. } => CallMethod::WriteFile,
            FileRequest::Mkdir { .. } => CallMethod::Mkdir,
            FileRequest::Rm { .. } => CallMethod::Rm,
            FileRequest::Cp { .. } => CallMethod::Cp,
            FileRequest::Ln { .. } => CallMethod::Ln,
        }
    }
}

fn path_arg(value: Option<&Value>) -> Result<String, ValidationError> {
    match value {
        Some(Value::String(path)) if !path.is_empty() => Ok(path.clone()),
        _ => Err(ValidationError::new("path must be a non-empty string")),
    }
}

fn paths_arg(value: Option<&Value>, min: usize) -> Result<Vec<String>, ValidationError> {
    let items = match value {
        Some(Value::Array(items)) => items,
        Some(Value::String(path)) if min == 1 && !path.is_empty() => {
            return Ok(vec![path.clone()]);
        }
        _ => return Err(ValidationError::new("expected an array of paths")),
    };
    if items.len() < min {
        return Err(ValidationError::new(format!(
            "expected at least {} path(s), got {}",
            min,
            items.len()
        )));
    }
    items.iter().map(|item| path_arg(Some(item))).collect()
}

fn options_arg(value: Option<&Value>) -> Result<FsOptions, ValidationError> {
    match value {
        None | Some(Value::Null) => Ok(FsOptions::default()),
        Some(value @ Value::Object(_)) => serde_json::from_value(value.clone())
            .map_err(|e| ValidationError::new(format!("bad options: {}", e))),
        Some(_) => Err(ValidationError::new("options must be an object")),
    }
}

fn data_arg(value: Option<&Value>, encoding: Encoding) -> Result<Vec<u8>, ValidationError> {
    match value {
        Some(Value::String(text)) => match encoding {
            Encoding::Utf8 => Ok(text.as_bytes().to_vec()),
            Encoding::Base64 => BASE64
                .decode(text.as_bytes())
                .map_err(|e| ValidationError::new(format!("bad base64 data: {}", e))),
        },
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_u64()
                    .and_then(|byte| u8::try_from(byte).ok())
                    .ok_or_else(|| ValidationError::new("data array must hold bytes"))
            })
            .collect(),
        _ => Err(ValidationError::new("data must be a string or byte array")),
    }
}

/// How a stream is wired to its process descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client to process.
    Input,
    /// Process to client.
    Output,
    /// Both ways.
    Duplex,
}

impl Direction {
    pub fn is_output(self) -> bool {
        matches!(self, Direction::Output | Direction::Duplex)
    }
}

/// One stream of a process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSpec {
    pub id: StreamId,
    pub mode: StreamMode,
    pub direction: Direction,
}

/// A validated exec request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecSpec {
    pub process_id: ProcessId,
    pub command: String,
    pub args: Vec<String>,
    pub options: ExecOptions,
}

impl ExecSpec {
    pub fn parse(request: &ExecRequest) -> Result<Self, ValidationError> {
        let command = match &request.command {
            Value::String(command) if !command.is_empty() => command.clone(),
            _ => return Err(ValidationError::new("command must be a non-empty string")),
        };

        let args = match &request.args {
            Value::Null => Vec::new(),
            Value::Array(items) => items
                .iter()
                .map(|item| {
                    item.as_str()
                        .map(str::to_string)
                        .ok_or_else(|| ValidationError::new("args must be strings"))
                })
                .collect::<Result<_, _>>()?,
            _ => return Err(ValidationError::new("args must be an array")),
        };

        let options = match &request.options {
            Value::Null => ExecOptions::default(),
            value @ Value::Object(_) => serde_json::from_value(value.clone())
                .map_err(|e| ValidationError::new(format!("bad exec options: {}", e)))?,
            _ => return Err(ValidationError::new("options must be an object")),
        };
        if options.streams > MAX_EXTRA_STREAMS {
            return Err(ValidationError::new(format!(
                "streams must be at most {}, got {}",
                MAX_EXTRA_STREAMS, options.streams
            )));
        }

        Ok(Self {
            process_id: request.process_id,
            command,
            args,
            options,
        })
    }

    /// Environment handed to the backend. In terminal mode `TERM` defaults
    /// to [`TERM_DEFAULT`] and the client's `env` is merged over it.
    pub fn environment(&self) -> HashMap<String, String> {
        let mut env = HashMap::new();
        if self.options.term {
            env.insert("TERM".to_string(), TERM_DEFAULT.to_string());
        }
        env.extend(self.options.env.clone());
        env
    }

    pub fn spawn_request(&self) -> SpawnRequest {
        SpawnRequest {
            command: self.command.clone(),
            args: self.args.clone(),
            cwd: self.options.cwd.clone(),
            env: self.environment(),
            term: self.options.term,
            extra_streams: self.options.streams,
        }
    }

    /// Streams in descriptor order.
    ///
    /// Terminal mode collapses stdio onto `"<pid>"`; otherwise stdio is
    /// `"<pid>.0"`..`"<pid>.2"`. Extras follow from fd 3, each raw unless
    /// its `streamsObjectMode` flag is set.
    pub fn streams(&self) -> Vec<StreamSpec> {
        let pid = self.process_id;
        let mut streams = if self.options.term {
            vec![StreamSpec {
                id: terminal_stream_id(pid),
                mode: StreamMode::Raw,
                direction: Direction::Duplex,
            }]
        } else {
            [Direction::Input, Direction::Output, Direction::Output]
                .into_iter()
                .enumerate()
                .map(|(fd, direction)| StreamSpec {
                    id: stdio_stream_id(pid, fd),
                    mode: StreamMode::Raw,
                    direction,
                })
                .collect()
        };

        for extra in 0..self.options.streams {
            let object = self
                .options
                .streams_object_mode
                .get(extra)
                .copied()
                .unwrap_or(false);
            streams.push(StreamSpec {
                id: stdio_stream_id(pid, 3 + extra),
                mode: if object {
                    StreamMode::Object
                } else {
                    StreamMode::Raw
                },
                direction: Direction::Duplex,
            });
        }
        streams
    }
}
