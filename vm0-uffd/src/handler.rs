use std::collections::HashSet;
use std::ffi::c_void;
use std::fs::File;
use std::num::NonZeroUsize;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, IntoRawFd};
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::mman::{MapFlags, MmapAdvise, ProtFlags, madvise, mmap, munmap};
use tokio::sync::Semaphore;
use tracing::{info, warn};
use userfaultfd::{Event, Uffd};

use crate::error::{UffdError, UffdResult};
use crate::handshake::accept_handshake;
use crate::region::{Extent, MemoryRegion, scan_extents};

/// Matches transparent-huge-page granularity; 4 KiB fallback is used only
/// when clipping against a region's end (§4.5 "Alignment & correctness").
const CHUNK_SIZE: u64 = 2 * 1024 * 1024;
const PAGE_SIZE: u64 = 4096;
const FAULT_WORKERS: usize = 4;
const EAGER_JOB_SIZE: u64 = 128 * 1024 * 1024;
const DEFAULT_EAGER_PREFIX_MIB: u64 = 256;
const FAULT_POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Which pages get copied before the VM resumes versus lazily on fault.
#[derive(Debug, Clone, Copy)]
pub enum FaultMode {
    /// Copy every data extent before resume; holes are still served lazily.
    Eager,
    /// Copy only the first `eager_prefix_bytes` of data extents before
    /// resume (covers kernel/interpreter/JIT cache); everything else is
    /// served on demand. The default mode.
    Hybrid { eager_prefix_bytes: u64 },
}

impl FaultMode {
    pub fn hybrid_from_env() -> Self {
        let mib = std::env::var("VM0_EAGER_PREFIX_MIB")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(DEFAULT_EAGER_PREFIX_MIB);
        Self::Hybrid {
            eager_prefix_bytes: mib * 1024 * 1024,
        }
    }
}

struct Mapping {
    base: NonNull<c_void>,
    len: usize,
    _file: File,
}

// SAFETY: the mapping is read-only and never mutated through `base`; sharing
// the pointer across fault workers is the entire point of this struct.
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: `base`/`len` are exactly the values returned by the mmap
        // call that created this mapping.
        if let Err(e) = unsafe { munmap(self.base, self.len) } {
            warn!(error = %e, "munmap failed during uffd handler teardown");
        }
    }
}

/// Owns the handshake UDS, the received UFFD fd, the snapshot memory
/// mapping, and the extent list. One handler instance serves exactly one
/// VM's faults for its entire lifetime.
pub struct UffdHandler {
    sock_path: PathBuf,
    uffd: Arc<Uffd>,
    regions: Vec<MemoryRegion>,
    mapping: Arc<Mapping>,
    extents: Vec<Extent>,
    dedup: Arc<Mutex<HashSet<u64>>>,
    stop: Arc<AtomicBool>,
}

impl UffdHandler {
    /// Preload (§4.5 "Preload"): open and mmap the memory file, advise the
    /// kernel, scan extents, and launch a background page-cache warmer —
    /// all before the handshake blocks on the VMM's connection, so the two
    /// overlap with VMM launch as the design requires.
    pub fn preload(sock_path: PathBuf, mem_file_path: &Path) -> UffdResult<PreloadedHandler> {
        let file = File::open(mem_file_path)?;
        let len = file.metadata()?.len();
        let map_len = NonZeroUsize::new(len as usize)
            .ok_or_else(|| UffdError::MalformedRegions("memory file is empty".into()))?;

        // SAFETY: `file` is kept alive inside `Mapping` for as long as the
        // mapping exists; read-only + private, so no writer can observe it.
        let base = unsafe { mmap(None, map_len, ProtFlags::PROT_READ, MapFlags::MAP_PRIVATE, &file, 0) }
            .map_err(UffdError::Mmap)?;

        // Best-effort kernel hints; failures here are not fatal.
        unsafe {
            let _ = madvise(base, map_len.get(), MmapAdvise::MADV_HUGEPAGE);
            let _ = madvise(base, map_len.get(), MmapAdvise::MADV_SEQUENTIAL);
            let _ = madvise(base, map_len.get(), MmapAdvise::MADV_WILLNEED);
        }

        let extents = scan_extents(&file, len)?;
        let mapping = Arc::new(Mapping {
            base,
            len: map_len.get(),
            _file: file,
        });

        spawn_page_cache_warmer(mapping.clone(), extents.clone());

        Ok(PreloadedHandler {
            sock_path,
            mapping,
            extents,
        })
    }

    /// Enumerate all data extents clipped to a region's bounds and issue
    /// page-copy ioctls for them before the caller resumes the VM.
    ///
    /// In [`FaultMode::Hybrid`] mode only the leading `eager_prefix_bytes`
    /// worth of data is copied here; the rest is served lazily.
    pub async fn run_eager_copy(&self, mode: FaultMode) -> UffdResult<()> {
        let jobs = match mode {
            FaultMode::Eager => split_into_jobs(&self.extents, &self.regions, u64::MAX),
            FaultMode::Hybrid { eager_prefix_bytes } => {
                split_into_jobs(&self.extents, &self.regions, eager_prefix_bytes)
            }
        };

        let semaphore = Arc::new(Semaphore::new(FAULT_WORKERS));
        let mut handles = Vec::with_capacity(jobs.len());
        for job in jobs {
            let permit = semaphore.clone().acquire_owned().await.map_err(|_| {
                UffdError::Copy {
                    addr: job.guest_addr as usize,
                    source: std::io::Error::other("semaphore closed"),
                }
            })?;
            let uffd = self.uffd.clone();
            let mapping = self.mapping.clone();
            let dedup = self.dedup.clone();
            handles.push(tokio::task::spawn_blocking(move || {
                let _permit = permit;
                copy_chunk(&uffd, &mapping, &dedup, job.guest_addr, job.mapping_offset, job.len)
            }));
        }

        for handle in handles {
            handle
                .await
                .map_err(|e| UffdError::Copy {
                    addr: 0,
                    source: std::io::Error::other(e.to_string()),
                })??;
        }
        Ok(())
    }

    /// Serve page faults until [`Self::stop`] is called. Runs on the
    /// current task; callers typically `tokio::spawn` it.
    pub async fn run_fault_loop(&self) {
        let semaphore = Arc::new(Semaphore::new(FAULT_WORKERS));
        while !self.stop.load(Ordering::Relaxed) {
            let uffd = self.uffd.clone();
            let ready = tokio::task::spawn_blocking(move || poll_for_fault(&uffd)).await;

            let event = match ready {
                Ok(Ok(event)) => event,
                Ok(Err(e)) => {
                    warn!(error = %e, "uffd poll failed; stopping fault loop");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "uffd poll task panicked; stopping fault loop");
                    break;
                }
            };

            let Some(SendEvent(event)) = event else { continue };
            match event {
                Event::Pagefault { addr, .. } => {
                    let fault_addr = addr.addr() as u64;
                    let Some(region) = self.regions.iter().find(|r| r.contains(fault_addr)) else {
                        warn!(addr = fault_addr, "fault outside every known region; zero-filling");
                        let _ = zero_chunk(&self.uffd, fault_addr, PAGE_SIZE);
                        continue;
                    };

                    let chunk_addr = align_down(fault_addr, CHUNK_SIZE);
                    let chunk_len = CHUNK_SIZE.min(region.base + region.size - chunk_addr);
                    let mapping_offset = region.offset + (chunk_addr - region.base);

                    let permit = match semaphore.clone().acquire_owned().await {
                        Ok(p) => p,
                        Err(_) => break,
                    };
                    let uffd = self.uffd.clone();
                    let mapping = self.mapping.clone();
                    let dedup = self.dedup.clone();
                    tokio::task::spawn_blocking(move || {
                        let _permit = permit;
                        if let Err(e) = copy_chunk(&uffd, &mapping, &dedup, chunk_addr, mapping_offset, chunk_len) {
                            warn!(error = %e, addr = chunk_addr, "page-copy ioctl failed");
                        }
                    });
                }
                Event::Remove { .. } => {
                    // Balloon deflation; no action required (§4.5 "Lazy service").
                }
                other => {
                    tracing::debug!(?other, "ignoring unhandled uffd event");
                }
            }
        }
    }

    /// Signal [`Self::run_fault_loop`] to exit on its next poll cycle.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

/// Returned by [`UffdHandler::preload`]; call [`Self::await_handshake`]
/// once the VMM has been told to dial `sock_path`.
pub struct PreloadedHandler {
    sock_path: PathBuf,
    mapping: Arc<Mapping>,
    extents: Vec<Extent>,
}

impl PreloadedHandler {
    /// Block (on a blocking task) until the VMM connects and delivers the
    /// UFFD fd plus region list.
    pub async fn await_handshake(self) -> UffdResult<UffdHandler> {
        let sock_path = self.sock_path.clone();
        let (uffd_fd, regions) = tokio::task::spawn_blocking(move || accept_handshake(&sock_path))
            .await
            .map_err(|e| UffdError::Handshake(1, e.to_string()))??;

        // SAFETY: `uffd_fd` was received fresh from the VMM over SCM_RIGHTS
        // and is an open, valid userfaultfd descriptor.
        let uffd = unsafe { Uffd::from_raw_fd(uffd_fd.into_raw_fd()) };

        info!(regions = regions.len(), "uffd handshake complete");

        Ok(UffdHandler {
            sock_path: self.sock_path,
            uffd: Arc::new(uffd),
            regions,
            mapping: self.mapping,
            extents: self.extents,
            dedup: Arc::new(Mutex::new(HashSet::new())),
            stop: Arc::new(AtomicBool::new(false)),
        })
    }
}

impl Drop for UffdHandler {
    fn drop(&mut self) {
        self.stop();
        let _ = std::fs::remove_file(&self.sock_path);
    }
}

struct CopyJob {
    guest_addr: u64,
    mapping_offset: u64,
    len: u64,
}

/// Split data extents (clipped to their owning region) into jobs no larger
/// than [`EAGER_JOB_SIZE`], stopping once `budget_bytes` worth has been
/// queued (`u64::MAX` for the fully-eager mode).
fn split_into_jobs(extents: &[Extent], regions: &[MemoryRegion], budget_bytes: u64) -> Vec<CopyJob> {
    let mut jobs = Vec::new();
    let mut queued = 0u64;

    for extent in extents {
        if queued >= budget_bytes {
            break;
        }
        let Some(region) = regions.iter().find(|r| extent.offset >= r.offset && extent.offset < r.offset + r.size)
        else {
            continue;
        };

        let mut offset = extent.offset;
        let mut remaining = extent.len.min(region.offset + region.size - extent.offset);
        while remaining > 0 && queued < budget_bytes {
            let len = remaining.min(EAGER_JOB_SIZE).min(budget_bytes - queued);
            let guest_addr = region.base + (offset - region.offset);
            jobs.push(CopyJob {
                guest_addr,
                mapping_offset: offset,
                len,
            });
            offset += len;
            remaining -= len;
            queued += len;
        }
    }

    jobs
}

fn align_down(addr: u64, align: u64) -> u64 {
    addr - (addr % align)
}

fn copy_chunk(uffd: &Uffd, mapping: &Mapping, dedup: &Mutex<HashSet<u64>>, guest_addr: u64, mapping_offset: u64, len: u64) -> UffdResult<()> {
    {
        let mut seen = dedup.lock().unwrap_or_else(|p| p.into_inner());
        if !seen.insert(guest_addr) {
            return Ok(());
        }
    }

    let src = unsafe { (mapping.base.as_ptr() as *const u8).add(mapping_offset as usize) } as *const c_void;
    let dst = guest_addr as *mut c_void;

    // SAFETY: `src` points `len` bytes into the still-mapped snapshot file;
    // `dst` is within a region the VMM registered with this same uffd.
    match unsafe { uffd.copy(src, dst, len as usize, true) } {
        Ok(_) => Ok(()),
        // The destination chunk may have been populated by a concurrent
        // copy for an overlapping fault; benign per §4.5.
        Err(e) if is_already_populated(&e) => Ok(()),
        Err(e) => Err(UffdError::Copy {
            addr: guest_addr as usize,
            source: std::io::Error::other(e.to_string()),
        }),
    }
}

fn zero_chunk(uffd: &Uffd, addr: u64, len: u64) -> UffdResult<()> {
    // SAFETY: last-resort unblocker for a fault outside every known region;
    // zeroing is always a valid response to a page fault.
    match unsafe { uffd.zeropage(addr as *mut c_void, len as usize, true) } {
        Ok(_) => Ok(()),
        Err(e) if is_already_populated(&e) => Ok(()),
        Err(e) => Err(UffdError::Zeropage {
            addr: addr as usize,
            source: std::io::Error::other(e.to_string()),
        }),
    }
}

/// Probe whether this host can actually create a userfaultfd object
/// (§7 "UFFD unavailable" — typically missing `CAP_SYS_PTRACE` or a kernel
/// built without `CONFIG_USERFAULTFD`). The probe object is dropped
/// immediately; only the syscall's success/failure matters.
pub fn uffd_available() -> bool {
    userfaultfd::UffdBuilder::new()
        .close_on_exec(true)
        .non_blocking(false)
        .create()
        .is_ok()
}

fn is_already_populated(e: &userfaultfd::Error) -> bool {
    matches!(
        e,
        userfaultfd::Error::CopyFailed(source) | userfaultfd::Error::ZeropageFailed(source)
            if *source == nix::errno::Errno::EEXIST
    )
}

// `Event` carries raw `*mut c_void` fields that are only ever treated as
// address values (never dereferenced), so it is safe to move across the
// `spawn_blocking` boundary even though the upstream type isn't `Send`.
struct SendEvent(Event);
unsafe impl Send for SendEvent {}

fn poll_for_fault(uffd: &Uffd) -> UffdResult<Option<SendEvent>> {
    // SAFETY: `uffd` outlives this borrow; the fd is not closed for its duration.
    let fd = unsafe { BorrowedFd::borrow_raw(uffd.as_raw_fd()) };
    let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
    let ready = poll(&mut fds, PollTimeout::from(FAULT_POLL_TIMEOUT.as_millis() as u16)).map_err(std::io::Error::from)?;
    if ready == 0 {
        return Ok(None);
    }
    uffd.read_event()
        .map_err(|e| UffdError::Copy {
            addr: 0,
            source: std::io::Error::other(e.to_string()),
        })
        .map(|opt| opt.map(SendEvent))
}

fn spawn_page_cache_warmer(mapping: Arc<Mapping>, extents: Vec<Extent>) {
    tokio::task::spawn_blocking(move || {
        let base = mapping.base.as_ptr() as *const u8;
        let mut buf = vec![0u8; 1024 * 1024];
        for extent in extents {
            let mut done = 0u64;
            while done < extent.len {
                let chunk = buf.len().min((extent.len - done) as usize);
                // SAFETY: reading within the mmap'd, file-backed region; this
                // only warms the page cache, it never writes.
                unsafe {
                    std::ptr::copy_nonoverlapping(base.add((extent.offset + done) as usize), buf.as_mut_ptr(), chunk);
                }
                done += chunk as u64;
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(base: u64, size: u64, offset: u64) -> MemoryRegion {
        MemoryRegion {
            base,
            size,
            offset,
            page_size: 4096,
        }
    }

    #[test]
    fn align_down_rounds_to_chunk_boundary() {
        assert_eq!(align_down(0x20_1234, CHUNK_SIZE), 0x20_0000);
        assert_eq!(align_down(0, CHUNK_SIZE), 0);
    }

    #[test]
    fn split_into_jobs_respects_the_budget() {
        let regions = vec![region(0, 4 * CHUNK_SIZE, 0)];
        let extents = vec![Extent { offset: 0, len: 4 * CHUNK_SIZE }];

        let jobs = split_into_jobs(&extents, &regions, 2 * CHUNK_SIZE);
        let total: u64 = jobs.iter().map(|j| j.len).sum();
        assert_eq!(total, 2 * CHUNK_SIZE);
    }

    #[test]
    fn split_into_jobs_covers_everything_with_max_budget() {
        let regions = vec![region(0, 300 * 1024 * 1024, 0)];
        let extents = vec![Extent {
            offset: 0,
            len: 300 * 1024 * 1024,
        }];

        let jobs = split_into_jobs(&extents, &regions, u64::MAX);
        let total: u64 = jobs.iter().map(|j| j.len).sum();
        assert_eq!(total, 300 * 1024 * 1024);
        assert!(jobs.iter().all(|j| j.len <= EAGER_JOB_SIZE));
    }

    #[test]
    fn split_into_jobs_skips_extents_outside_any_region() {
        let regions = vec![region(0, CHUNK_SIZE, 0)];
        let extents = vec![Extent {
            offset: 10 * CHUNK_SIZE,
            len: CHUNK_SIZE,
        }];
        assert!(split_into_jobs(&extents, &regions, u64::MAX).is_empty());
    }
}
