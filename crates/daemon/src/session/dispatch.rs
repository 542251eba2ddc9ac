//! Per-connection message dispatch.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use protocol::{Ack, Call, Connection, ExecRequest, Link, Message, ProcessMessage};
use serde_json::Value;
use tracing::{debug, warn};

use super::{Session, SessionError};
use crate::process::ProcessHandle;
use crate::request::{ExecSpec, FileRequest};

/// Serves one attached connection until it closes.
pub(super) async fn serve(session: Arc<Session>, mut connection: Connection) {
    let link = connection.link.clone();

    while let Some(message) = connection.recv().await {
        dispatch(&session, &link, message);
    }

    session.detach_connection(link.id());
}

fn dispatch(session: &Arc<Session>, link: &Link, message: Message) {
    match message {
        Message::Call(call) => {
            let session = session.clone();
            let link = link.clone();
            tokio::spawn(async move {
                let ack = handle_call(&session, call).await;
                link.send(Message::Ack(ack));
            });
        }
        Message::Exec(request) => exec(session, link, request),
        Message::Process(frame) => {
            let key = (link.id().clone(), frame.process_id);
            match session.processes.get(&key).map(|entry| entry.value().clone()) {
                Some(handle) => handle.handle_message(frame.message),
                None => debug!(
                    connection_id = %link.id(),
                    process_id = frame.process_id,
                    "Dropping message for unknown process"
                ),
            }
        }
        Message::Stream(envelope) => {
            if !link.route_stream(&envelope.stream_id, envelope.frame) {
                debug!(
                    connection_id = %link.id(),
                    stream_id = %envelope.stream_id,
                    "Dropping frame for unknown stream"
                );
            }
        }
        Message::Auth(_) => debug!(connection_id = %link.id(), "Ignoring repeated auth"),
        Message::Fatal(_) | Message::Ack(_) => {
            debug!(connection_id = %link.id(), "Ignoring server-bound message from client");
        }
    }
}

async fn handle_call(session: &Session, call: Call) -> Ack {
    let request = match FileRequest::parse(call.method, &call.args) {
        Ok(request) => request,
        Err(e) => {
            debug!(identity = %session.identity(), method = %call.method, error = %e, "Rejected call");
            return Ack::err(call.ack, e.to_error_object());
        }
    };

    debug!(identity = %session.identity(), method = %call.method, "Handling call");
    match run_call(session, request).await {
        Ok(result) => Ack::ok(call.ack, result),
        Err(e) => {
            debug!(identity = %session.identity(), method = %call.method, error = %e, "Call failed");
            Ack::err(call.ack, e.to_error_object())
        }
    }
}

async fn run_call(session: &Session, request: FileRequest) -> Result<Option<Value>, SessionError> {
    let sandbox = session.sandbox().await?;

    match request {
        FileRequest::ReadFile { path } => {
            let data = sandbox
                .read_file(&path, session.config().max_read_size)
                .await?;
            Ok(Some(Value::String(BASE64.encode(data))))
        }
        FileRequest::WriteFile { path, data } => {
            sandbox.write_file(&path, data).await?;
            Ok(None)
        }
        FileRequest::Mkdir { paths, options } => {
            sandbox.mkdir(&paths, options).await?;
            Ok(None)
        }
        FileRequest::Rm { paths, options } => {
            sandbox.rm(&paths, options).await?;
            Ok(None)
        }
        FileRequest::Cp {
            sources,
            dest,
            options,
        } => {
            sandbox.cp(&sources, &dest, options).await?;
            Ok(None)
        }
        FileRequest::Ln {
            target,
            link,
            options,
        } => {
            sandbox.ln(&target, &link, options).await?;
            Ok(None)
        }
    }
}

fn exec(session: &Arc<Session>, link: &Link, request: ExecRequest) {
    let spec = match ExecSpec::parse(&request) {
        Ok(spec) => spec,
        Err(e) => {
            debug!(identity = %session.identity(), process_id = request.process_id, error = %e, "Rejected exec");
            link.send(Message::process(
                request.process_id,
                ProcessMessage::Error(e.to_error_object()),
            ));
            return;
        }
    };

    let key = (link.id().clone(), spec.process_id);
    if session.processes.contains_key(&key) {
        warn!(
            connection_id = %link.id(),
            process_id = spec.process_id,
            "Process id already in use; dropping exec"
        );
        return;
    }

    let handle = ProcessHandle::new(link.clone(), &spec, session.config().stream_timeout());
    session.track_process(key, handle.clone());
    debug!(
        identity = %session.identity(),
        process_id = spec.process_id,
        command = %spec.command,
        "Spawning process"
    );

    let session = session.clone();
    tokio::spawn(async move {
        match session.sandbox().await {
            Ok(sandbox) => handle.run(&*sandbox, &spec).await,
            Err(e) => handle.fail_with(e.to_error_object()),
        }
    });
}
