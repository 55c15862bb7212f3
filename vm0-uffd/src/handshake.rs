use std::io::IoSliceMut;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;

use nix::cmsg_space;
use nix::sys::socket::{ControlMessageOwned, MsgFlags, recvmsg};

use crate::error::{UffdError, UffdResult};
use crate::region::MemoryRegion;

const MAX_HANDSHAKE_ATTEMPTS: u32 = 5;
const JSON_BUF_LEN: usize = 64 * 1024;

/// Bind the handshake UDS and wait for the VMM to connect and deliver the
/// UFFD fd (via `SCM_RIGHTS`) plus the JSON region list in the same
/// message. Retries up to 5 times before declaring the handshake failed
/// (§7 "UFFD handshake error").
pub fn accept_handshake(path: &Path) -> UffdResult<(OwnedFd, Vec<MemoryRegion>)> {
    let _ = std::fs::remove_file(path);
    let listener = UnixListener::bind(path).map_err(|e| UffdError::Bind(path.to_path_buf(), e))?;

    let mut last_err = String::from("listener never accepted a connection");
    for attempt in 1..=MAX_HANDSHAKE_ATTEMPTS {
        let stream = match listener.accept() {
            Ok((stream, _)) => stream,
            Err(e) => {
                last_err = e.to_string();
                continue;
            }
        };

        match recv_handshake(&stream) {
            Ok(result) => return Ok(result),
            Err(e) => {
                tracing::warn!(attempt, error = %e, "uffd handshake attempt failed");
                last_err = e.to_string();
            }
        }
    }

    let _ = std::fs::remove_file(path);
    Err(UffdError::Handshake(MAX_HANDSHAKE_ATTEMPTS, last_err))
}

fn recv_handshake(stream: &UnixStream) -> UffdResult<(OwnedFd, Vec<MemoryRegion>)> {
    let mut json_buf = vec![0u8; JSON_BUF_LEN];
    let mut iov = [IoSliceMut::new(&mut json_buf)];
    let mut cmsg_buffer = cmsg_space!(RawFd);

    let msg = recvmsg::<()>(stream.as_raw_fd(), &mut iov, Some(&mut cmsg_buffer), MsgFlags::empty())
        .map_err(|e| UffdError::Handshake(1, e.to_string()))?;

    let fd = msg
        .cmsgs()
        .map_err(|e| UffdError::Handshake(1, e.to_string()))?
        .find_map(|cmsg| match cmsg {
            ControlMessageOwned::ScmRights(fds) => fds.into_iter().next(),
            _ => None,
        })
        .ok_or_else(|| UffdError::Handshake(1, "no file descriptor in SCM_RIGHTS message".into()))?;
    // SAFETY: the fd was just received via SCM_RIGHTS; we are its sole owner.
    let uffd_fd = unsafe { OwnedFd::from_raw_fd(fd) };

    let received = msg.bytes;
    let regions: Vec<MemoryRegion> =
        serde_json::from_slice(&json_buf[..received]).map_err(|e| UffdError::MalformedRegions(e.to_string()))?;

    Ok((uffd_fd, regions))
}
