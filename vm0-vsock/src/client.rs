use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::time::timeout;

use crate::error::{VsockError, VsockResult};
use crate::protocol::{ExecRequest, ExecResponse};

/// Entire request/response transaction deadline (§4.6).
pub const TRANSACTION_DEADLINE: Duration = Duration::from_secs(5 * 60);

/// The guest port the runner listens on. Fixed by convention: both the
/// snapshot maker's warmup calls and the restore orchestrator's execution
/// request dial this same port.
pub const RUNNER_PORT: u32 = 10000;

/// The host-side port the file server answers on. Guest-initiated (guest→host)
/// vsock connections are exposed by Firecracker as a UDS at
/// `<configured-uds-path>_<port>`, distinct from the `CONNECT <port>` scheme
/// used for host→guest dials — see [`guest_listener_path`].
pub const FILE_SERVER_PORT: u32 = 10001;

/// Path Firecracker binds for a guest-initiated connection on `port`, given
/// the vsock device's configured UDS path. Host→guest dials use
/// `vsock_uds_path` directly with a `CONNECT <port>` handshake; guest→host
/// listeners live at this derived path instead.
pub fn guest_listener_path(vsock_uds_path: &Path, port: u32) -> PathBuf {
    let mut os = vsock_uds_path.as_os_str().to_os_string();
    os.push(format!("_{port}"));
    PathBuf::from(os)
}

/// Dial the hypervisor's vsock UDS, connect to `port` on the guest, send the
/// single JSON request, and read the single JSON reply.
///
/// The connection is closed after one reply — this client is single-shot by
/// design, not a persistent session.
pub async fn exec(vsock_uds_path: &Path, port: u32, request: &ExecRequest) -> VsockResult<ExecResponse> {
    timeout(TRANSACTION_DEADLINE, exec_inner(vsock_uds_path, port, request))
        .await
        .map_err(|_| VsockError::Timeout(TRANSACTION_DEADLINE))?
}

async fn exec_inner(vsock_uds_path: &Path, port: u32, request: &ExecRequest) -> VsockResult<ExecResponse> {
    let stream = UnixStream::connect(vsock_uds_path).await?;
    let mut stream = handshake(stream, port).await?;

    let mut line = serde_json::to_string(request)?;
    line.push('\n');
    stream.get_mut().write_all(line.as_bytes()).await?;

    let mut reply = String::new();
    let n = stream.read_line(&mut reply).await?;
    if n == 0 {
        return Err(VsockError::ConnectionClosed);
    }

    Ok(serde_json::from_str(reply.trim_end())?)
}

/// Poll `port` on `vsock_uds_path` until the handshake succeeds or
/// `timeout` elapses. Used during snapshot preparation to detect the
/// runner daemon coming up: a successful handshake means the workload
/// server AND the runner's warm session are both ready (§4.4 step 4).
pub async fn wait_ready(vsock_uds_path: &Path, port: u32, poll: Duration, deadline: Duration) -> VsockResult<()> {
    let result = timeout(deadline, async {
        loop {
            if let Ok(stream) = UnixStream::connect(vsock_uds_path).await
                && handshake(stream, port).await.is_ok()
            {
                return;
            }
            tokio::time::sleep(poll).await;
        }
    })
    .await;

    result.map_err(|_| VsockError::Timeout(deadline))
}

/// Send `CONNECT <port>\n` and verify the `OK <local>\n` reply.
async fn handshake(stream: UnixStream, port: u32) -> VsockResult<BufReader<UnixStream>> {
    let mut reader = BufReader::new(stream);
    let connect_line = format!("CONNECT {port}\n");
    reader.get_mut().write_all(connect_line.as_bytes()).await?;

    let mut reply = String::new();
    reader.read_line(&mut reply).await?;
    if !reply.starts_with("OK ") {
        return Err(VsockError::Handshake(reply));
    }

    Ok(reader)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UnixListener;

    #[tokio::test]
    async fn handshake_accepts_ok_reply() {
        let dir = tempfile::tempdir().unwrap_or_else(|e| panic!("{e}"));
        let sock_path = dir.path().join("vsock.sock");
        let listener = UnixListener::bind(&sock_path).unwrap_or_else(|e| panic!("{e}"));

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap_or_else(|e| panic!("{e}"));
            let mut buf = [0u8; 64];
            let n = tokio::io::AsyncReadExt::read(&mut stream, &mut buf)
                .await
                .unwrap_or_else(|e| panic!("{e}"));
            assert_eq!(&buf[..n], b"CONNECT 10000\n");
            stream.write_all(b"OK 40000\n").await.unwrap_or_else(|e| panic!("{e}"));
        });

        let stream = UnixStream::connect(&sock_path).await.unwrap_or_else(|e| panic!("{e}"));
        handshake(stream, 10000).await.unwrap_or_else(|e| panic!("{e}"));
        server.await.unwrap_or_else(|e| panic!("{e}"));
    }

    #[tokio::test]
    async fn handshake_rejects_non_ok_reply() {
        let dir = tempfile::tempdir().unwrap_or_else(|e| panic!("{e}"));
        let sock_path = dir.path().join("vsock.sock");
        let listener = UnixListener::bind(&sock_path).unwrap_or_else(|e| panic!("{e}"));

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap_or_else(|e| panic!("{e}"));
            let mut buf = [0u8; 64];
            let _ = tokio::io::AsyncReadExt::read(&mut stream, &mut buf).await;
            stream.write_all(b"ERR refused\n").await.unwrap_or_else(|e| panic!("{e}"));
        });

        let stream = UnixStream::connect(&sock_path).await.unwrap_or_else(|e| panic!("{e}"));
        let err = handshake(stream, 10000).await.unwrap_err();
        assert!(matches!(err, VsockError::Handshake(_)));
        server.await.unwrap_or_else(|e| panic!("{e}"));
    }

    #[tokio::test]
    async fn exec_round_trips_a_request() {
        let dir = tempfile::tempdir().unwrap_or_else(|e| panic!("{e}"));
        let sock_path = dir.path().join("vsock.sock");
        let listener = UnixListener::bind(&sock_path).unwrap_or_else(|e| panic!("{e}"));

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap_or_else(|e| panic!("{e}"));
            let mut reader = BufReader::new(stream);
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap_or_else(|e| panic!("{e}"));
            assert_eq!(line, "CONNECT 10000\n");
            reader.get_mut().write_all(b"OK 40000\n").await.unwrap_or_else(|e| panic!("{e}"));

            let mut req_line = String::new();
            reader.read_line(&mut req_line).await.unwrap_or_else(|e| panic!("{e}"));
            assert!(req_line.contains("\"code\":\"x = 1\""));

            let resp = r#"{"exit_code":0,"stdout":"","stderr":"","result_repr":null,"error":null}"#;
            reader
                .get_mut()
                .write_all(format!("{resp}\n").as_bytes())
                .await
                .unwrap_or_else(|e| panic!("{e}"));
        });

        let request = ExecRequest {
            code: "x = 1".into(),
            show_tables: false,
            show_table_meta: false,
        };
        let response = exec(&sock_path, 10000, &request).await.unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(response.exit_code, 0);
        server.await.unwrap_or_else(|e| panic!("{e}"));
    }

    #[tokio::test]
    async fn wait_ready_succeeds_once_listener_accepts_handshake() {
        let dir = tempfile::tempdir().unwrap_or_else(|e| panic!("{e}"));
        let sock_path = dir.path().join("vsock.sock");
        let listener = UnixListener::bind(&sock_path).unwrap_or_else(|e| panic!("{e}"));

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap_or_else(|e| panic!("{e}"));
            let mut buf = [0u8; 64];
            let _ = tokio::io::AsyncReadExt::read(&mut stream, &mut buf).await;
            stream.write_all(b"OK 40000\n").await.unwrap_or_else(|e| panic!("{e}"));
        });

        wait_ready(&sock_path, 10000, Duration::from_millis(1), Duration::from_secs(5))
            .await
            .unwrap_or_else(|e| panic!("{e}"));
    }

    #[test]
    fn guest_listener_path_appends_the_port_suffix() {
        let base = Path::new("/run/vm0/abc/vsock.sock");
        assert_eq!(guest_listener_path(base, 10001), Path::new("/run/vm0/abc/vsock.sock_10001"));
    }

    #[tokio::test]
    async fn wait_ready_times_out_when_nothing_listens() {
        let dir = tempfile::tempdir().unwrap_or_else(|e| panic!("{e}"));
        let sock_path = dir.path().join("vsock.sock");

        let err = wait_ready(&sock_path, 10000, Duration::from_millis(1), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, VsockError::Timeout(_)));
    }
}
