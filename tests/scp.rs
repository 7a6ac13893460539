// ABOUTME: Integration tests for SCP upload.
// ABOUTME: Uploads files to the shared SSH container and reads them back over exec.

mod support;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use sshpipe::ssh::{Client, Error, ErrorKind, SessionConfig};
use std::io::Write;
use support::ssh_container::shared_container;

async fn client() -> Client {
    support::init_tracing();
    Client::new(shared_container().await.session_config())
}

async fn remote_contents(client: &Client, path: &str) -> String {
    let output = client
        .run(&format!("cat {path}"))
        .await
        .expect("cat should start");
    assert!(output.success(), "cat failed: {}", output.stderr);
    output.stdout
}

/// Remote file contents, base64-encoded on the remote side so arbitrary bytes survive
/// the line-oriented output.
async fn remote_bytes(client: &Client, path: &str) -> Vec<u8> {
    let output = client
        .run(&format!("base64 {path} | tr -d '\\n'"))
        .await
        .expect("base64 should start");
    assert!(output.success(), "base64 failed: {}", output.stderr);
    BASE64
        .decode(output.stdout.trim_end())
        .expect("remote base64 should decode")
}

/// Test: Upload a local file.
/// Expected: Remote file has the same contents.
#[tokio::test]
async fn scp_local_file() {
    let client = client().await;
    let mut local = tempfile::NamedTempFile::new().unwrap();
    writeln!(local, "Example Text...").unwrap();
    writeln!(local, "second line").unwrap();

    client
        .scp(local.path(), "/tmp/sshpipe-scp-local.txt")
        .await
        .expect("upload should succeed");

    assert_eq!(
        remote_contents(&client, "/tmp/sshpipe-scp-local.txt").await,
        "Example Text...\nsecond line\n"
    );
}

/// Test: Upload from an in-memory reader.
/// Expected: Exactly the payload bytes arrive, control bytes included.
#[tokio::test]
async fn write_file_from_reader() {
    let client = client().await;
    let payload: &'static [u8] = b"hello\x00from\x01a\x02reader\n";

    client
        .write_file(payload, payload.len() as u64, "/tmp/sshpipe-write-file.bin")
        .await
        .expect("upload should succeed");

    assert_eq!(
        remote_bytes(&client, "/tmp/sshpipe-write-file.bin").await,
        payload
    );
}

/// Test: Reader holds more than the declared size.
/// Expected: Only the first `size` bytes are written.
#[tokio::test]
async fn write_file_stops_at_size() {
    let client = client().await;
    let payload: &'static [u8] = b"keep-this|drop-this";

    client
        .write_file(payload, 9, "/tmp/sshpipe-truncated.txt")
        .await
        .expect("upload should succeed");

    assert_eq!(
        remote_bytes(&client, "/tmp/sshpipe-truncated.txt").await,
        b"keep-this"
    );
}

/// Test: Upload zero bytes.
/// Expected: Remote file exists and is empty.
#[tokio::test]
async fn write_empty_file() {
    let client = client().await;

    client
        .write_file(tokio::io::empty(), 0, "/tmp/sshpipe-empty.txt")
        .await
        .expect("upload should succeed");

    let output = client
        .run("test -f /tmp/sshpipe-empty.txt && wc -c < /tmp/sshpipe-empty.txt")
        .await
        .expect("check should start");
    assert!(output.success());
    assert_eq!(output.stdout.trim(), "0");
}

/// Test: Upload a file larger than the channel window.
/// Expected: Contents arrive intact.
#[tokio::test]
async fn write_large_file() {
    let client = client().await;
    let payload: Vec<u8> = (0..4 * 1024 * 1024u32).map(|i| (i % 251) as u8).collect();
    let size = payload.len() as u64;

    client
        .write_file(std::io::Cursor::new(payload.clone()), size, "/tmp/sshpipe-large.bin")
        .await
        .expect("upload should succeed");

    let received = remote_bytes(&client, "/tmp/sshpipe-large.bin").await;
    assert_eq!(received.len(), payload.len());
    assert!(received == payload, "uploaded bytes differ from the payload");
}

/// Test: Target path with a space in it.
/// Expected: File lands at the literal path.
#[tokio::test]
async fn target_with_space() {
    let client = client().await;
    let payload: &'static [u8] = b"spaced\n";

    client
        .write_file(payload, payload.len() as u64, "/tmp/sshpipe dir test.txt")
        .await
        .expect("upload should succeed");

    assert_eq!(
        remote_contents(&client, "'/tmp/sshpipe dir test.txt'").await,
        "spaced\n"
    );
}

/// Test: Target directory does not exist.
/// Expected: Transfer error carrying the remote diagnostic.
#[tokio::test]
async fn missing_remote_directory() {
    let client = client().await;
    let payload: &'static [u8] = b"nowhere\n";

    let err = client
        .write_file(payload, payload.len() as u64, "/sshpipe/no/such/dir/file.txt")
        .await
        .expect_err("upload should fail");

    assert_eq!(err.kind(), ErrorKind::Transfer, "got {err:?}");
}

/// Test: Local source file does not exist.
/// Expected: Transfer error raised locally, before any connection is made.
#[tokio::test]
async fn missing_local_source() {
    // Nothing listens here; reaching the network would surface as a dial error instead.
    let client = Client::new(SessionConfig::new("127.0.0.1", "nobody").port(9).password("x"));

    let err = client
        .scp("/sshpipe/no/such/local/file", "/tmp/never.txt")
        .await
        .expect_err("upload should fail");

    assert!(matches!(err, Error::Transfer(_)), "got {err:?}");
    assert_eq!(err.kind(), ErrorKind::Transfer);
    assert!(err.to_string().contains("/sshpipe/no/such/local/file"));
}

/// Test: Local source is a directory.
/// Expected: Transfer error, not a network error.
#[tokio::test]
async fn unreadable_local_source() {
    let client = Client::new(SessionConfig::new("127.0.0.1", "nobody").port(9).password("x"));
    let dir = tempfile::tempdir().unwrap();

    let err = client
        .scp(dir.path(), "/tmp/never.txt")
        .await
        .expect_err("upload should fail");

    assert_eq!(err.kind(), ErrorKind::Transfer, "got {err:?}");
}
