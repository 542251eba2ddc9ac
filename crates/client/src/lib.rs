//! # Boxwire Client Library
//!
//! Talks to a Boxwire daemon over one connection: authenticates, runs file
//! operations in the session's sandbox and starts processes whose stdio is
//! relayed as flow-controlled streams.
//!
//! ## Example
//!
//! ```rust,no_run
//! use client::Client;
//! use protocol::{Endpoint, ExecOptions};
//! use serde_json::json;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let endpoint: Endpoint = "127.0.0.1:8722".parse()?;
//! let client = Client::connect_to(&endpoint, json!("my-token")).await?;
//!
//! client.write_file("hello.txt", "hello").await?;
//! assert_eq!(client.read_to_string("hello.txt").await?, "hello");
//!
//! let process = client.exec("cat", &["hello.txt"], ExecOptions::default());
//! let output = client::read_all(process.stdout()).await;
//! let status = process.wait().await?;
//! println!("{} -> {}", String::from_utf8_lossy(&output), status);
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod error;
pub mod process;

pub use client::Client;
pub use error::{ClientError, Result};
pub use process::{read_all, RemoteProcess};

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::{Ack, Connection, ErrorObject, FsOptions, Message};
    use serde_json::json;

    async fn connected() -> (Client, Connection) {
        let (local, mut server) = Connection::pair();
        let client = Client::connect(local, json!({"token": "secret"}));
        assert_eq!(
            server.recv().await,
            Some(Message::Auth(json!({"token": "secret"})))
        );
        (client, server)
    }

    /// Answers the next call with `reply(args)`.
    async fn answer(
        server: &mut Connection,
        reply: impl FnOnce(&protocol::Call) -> Ack,
    ) -> protocol::Call {
        match server.recv().await {
            Some(Message::Call(call)) => {
                server.link.send(Message::Ack(reply(&call)));
                call
            }
            other => panic!("expected call, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_read_file_decodes_base64() {
        let (client, mut server) = connected().await;
        let read = tokio::spawn({
            let client = client.clone();
            async move { client.read_file("a.txt").await }
        });

        let call = answer(&mut server, |call| Ack::ok(call.ack, Some(json!("aGVsbG8="))))
            .await;
        assert_eq!(call.method, protocol::CallMethod::ReadFile);
        assert_eq!(call.args, vec![json!("a.txt")]);
        assert_eq!(read.await.unwrap().unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_write_file_sends_base64() {
        let (client, mut server) = connected().await;
        let write = tokio::spawn({
            let client = client.clone();
            async move { client.write_file("a.bin", [0u8, 255]).await }
        });

        let call = answer(&mut server, |call| Ack::ok(call.ack, None)).await;
        assert_eq!(call.args, vec![json!("a.bin"), json!("AP8="), json!("base64")]);
        write.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_remote_error_carries_code() {
        let (client, mut server) = connected().await;
        let rm = tokio::spawn({
            let client = client.clone();
            async move { client.rm(&["missing"], FsOptions::default()).await }
        });

        answer(&mut server, |call| {
            Ack::err(call.ack, ErrorObject::with_code("no such file", "ENOENT"))
        })
        .await;
        assert_eq!(rm.await.unwrap().unwrap_err().code(), Some("ENOENT"));
    }

    #[tokio::test]
    async fn test_cp_and_ln_argument_shapes() {
        let (client, mut server) = connected().await;
        let ops = tokio::spawn({
            let client = client.clone();
            async move {
                let recursive = FsOptions {
                    recursive: true,
                    ..FsOptions::default()
                };
                client.cp(&["a", "b"], "dir", recursive).await?;
                let symbolic = FsOptions {
                    symbolic: true,
                    ..FsOptions::default()
                };
                client.ln("target", "link", symbolic).await
            }
        });

        let cp = answer(&mut server, |call| Ack::ok(call.ack, None)).await;
        assert_eq!(cp.args[0], json!(["a", "b", "dir"]));
        assert_eq!(cp.args[1]["recursive"], json!(true));

        let ln = answer(&mut server, |call| Ack::ok(call.ack, None)).await;
        assert_eq!(ln.args[0], json!(["target", "link"]));
        assert_eq!(ln.args[1]["symbolic"], json!(true));
        assert_ne!(cp.ack, ln.ack);

        ops.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_fatal_fails_pending_call() {
        let (client, mut server) = connected().await;
        let read = tokio::spawn({
            let client = client.clone();
            async move { client.read_file("a.txt").await }
        });

        assert!(matches!(server.recv().await, Some(Message::Call(_))));
        server.link.send(Message::fatal("auth failed: invalid token"));
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        server.link.disconnect();

        let err = read.await.unwrap().unwrap_err();
        assert_eq!(err, ClientError::Fatal("auth failed: invalid token".to_string()));
        assert_eq!(
            client.fatal_reason().as_deref(),
            Some("auth failed: invalid token")
        );
        assert!(client.is_closed());
    }

    #[tokio::test]
    async fn test_call_on_closed_connection_fails_fast() {
        let (client, _server) = connected().await;
        client.disconnect();

        assert_eq!(
            client.mkdir(&["dir"], FsOptions::default()).await,
            Err(ClientError::Disconnected)
        );
    }
}
