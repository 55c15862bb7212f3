use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, warn};

use crate::error::{FileServerError, FileServerResult};
use crate::protocol::{self, Request};
use crate::root::safe_join;

const MAX_FRAME_LEN: u32 = 4 * 1024 * 1024;

/// Bind `listen_path` and serve stat/read/readdir requests, chrooted to
/// `root`, until the returned task is aborted or the process exits.
/// One task per connection; connections carry no state beyond the socket.
pub async fn serve(listen_path: PathBuf, root: PathBuf) -> FileServerResult<()> {
    let _ = std::fs::remove_file(&listen_path);
    let listener = UnixListener::bind(&listen_path).map_err(|e| FileServerError::Bind(listen_path.clone(), e))?;
    let root = Arc::new(root);

    loop {
        let (stream, _) = listener.accept().await?;
        let root = root.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, &root).await {
                debug!(error = %e, "file server connection ended");
            }
        });
    }
}

async fn handle_connection(mut stream: UnixStream, root: &Path) -> FileServerResult<()> {
    loop {
        let frame = match read_frame(&mut stream).await {
            Ok(Some(frame)) => frame,
            Ok(None) => return Ok(()),
            Err(e) => return Err(e),
        };

        let response = match protocol::decode_request(&frame) {
            Ok(request) => handle_request(root, request).await,
            Err(e) => {
                warn!(error = %e, "malformed file server frame");
                protocol::encode_status(protocol::STATUS_IO)
            }
        };

        write_frame(&mut stream, &response).await?;
    }
}

async fn handle_request(root: &Path, request: Request) -> Vec<u8> {
    match request {
        Request::Stat(path) => match safe_join(root, &path) {
            Some(resolved) => match tokio::fs::metadata(&resolved).await {
                Ok(meta) => {
                    use std::os::unix::fs::MetadataExt;
                    protocol::encode_stat_ok(meta.mode(), meta.len(), meta.mtime() as u64, meta.is_dir())
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => protocol::encode_status(protocol::STATUS_NO_ENTRY),
                Err(_) => protocol::encode_status(protocol::STATUS_IO),
            },
            None => protocol::encode_status(protocol::STATUS_NO_ENTRY),
        },
        Request::Read { path, offset, length } => match safe_join(root, &path) {
            Some(resolved) => read_range(&resolved, offset, length).await,
            None => protocol::encode_status(protocol::STATUS_NO_ENTRY),
        },
        Request::Readdir(path) => match safe_join(root, &path) {
            Some(resolved) => readdir(&resolved).await,
            None => protocol::encode_status(protocol::STATUS_NO_ENTRY),
        },
    }
}

async fn read_range(path: &Path, offset: u64, length: u32) -> Vec<u8> {
    use tokio::io::AsyncSeekExt;

    let mut file = match tokio::fs::File::open(path).await {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return protocol::encode_status(protocol::STATUS_NO_ENTRY),
        Err(_) => return protocol::encode_status(protocol::STATUS_IO),
    };

    if file.seek(std::io::SeekFrom::Start(offset)).await.is_err() {
        return protocol::encode_status(protocol::STATUS_IO);
    }

    let mut buf = vec![0u8; length as usize];
    let mut read = 0usize;
    while read < buf.len() {
        match file.read(&mut buf[read..]).await {
            Ok(0) => break,
            Ok(n) => read += n,
            Err(_) => return protocol::encode_status(protocol::STATUS_IO),
        }
    }
    buf.truncate(read);
    protocol::encode_read_ok(&buf)
}

async fn readdir(path: &Path) -> Vec<u8> {
    let mut entries = Vec::new();
    let mut dir = match tokio::fs::read_dir(path).await {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return protocol::encode_status(protocol::STATUS_NO_ENTRY),
        Err(_) => return protocol::encode_status(protocol::STATUS_IO),
    };

    loop {
        match dir.next_entry().await {
            Ok(Some(entry)) => {
                let name = entry.file_name().to_string_lossy().into_owned();
                let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
                entries.push((name, is_dir));
            }
            Ok(None) => break,
            Err(_) => return protocol::encode_status(protocol::STATUS_IO),
        }
    }

    protocol::encode_readdir_ok(&entries)
}

async fn read_frame(stream: &mut UnixStream) -> FileServerResult<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    if let Err(e) = stream.read_exact(&mut len_buf).await {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            return Ok(None);
        }
        return Err(e.into());
    }

    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        return Err(FileServerError::Malformed("frame exceeds maximum length"));
    }

    let mut body = vec![0u8; len as usize];
    stream.read_exact(&mut body).await?;
    Ok(Some(body))
}

async fn write_frame(stream: &mut UnixStream, body: &[u8]) -> FileServerResult<()> {
    stream.write_all(&(body.len() as u32).to_be_bytes()).await?;
    stream.write_all(body).await?;
    Ok(())
}
