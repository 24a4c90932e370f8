// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Linux backend: userfaultfd + madvise + eventfd.
//!
//! The userfault ABI is consumed raw (the ioctl structs below mirror
//! `linux/userfaultfd.h`); faults are delivered as bare 64-bit host
//! addresses read off the descriptor.

use crate::{FaultChannel, FaultEvent, HostMemory, Result, SysError};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::eventfd::{EfdFlags, EventFd};
use nix::sys::mman::{
    madvise, mlockall, mmap_anonymous, munlockall, munmap, MapFlags, MlockAllFlags, MmapAdvise,
    ProtFlags,
};
use std::io;
use std::num::NonZeroUsize;
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr::NonNull;
use std::sync::Arc;
use tracing::{debug, warn};

const UFFD_API: u64 = 0xAA;
const UFFDIO: u8 = 0xAA;

const UFFDIO_REGISTER_MODE_MISSING: u64 = 1 << 0;

// _UFFDIO_* ioctl ordinals.
const NR_REGISTER: u8 = 0x00;
const NR_UNREGISTER: u8 = 0x01;
const NR_WAKE: u8 = 0x02;
const NR_COPY: u8 = 0x03;
const NR_ZEROPAGE: u8 = 0x04;
const NR_API: u8 = 0x3F;

#[repr(C)]
struct UffdioApi {
    api: u64,
    features: u64,
    ioctls: u64,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct UffdioRange {
    start: u64,
    len: u64,
}

#[repr(C)]
struct UffdioRegister {
    range: UffdioRange,
    mode: u64,
    ioctls: u64,
}

#[repr(C)]
struct UffdioCopy {
    dst: u64,
    src: u64,
    len: u64,
    mode: u64,
    copy: i64,
}

#[repr(C)]
struct UffdioZeropage {
    range: UffdioRange,
    mode: u64,
    zeropage: i64,
}

nix::ioctl_readwrite!(uffdio_api, UFFDIO, NR_API, UffdioApi);
nix::ioctl_readwrite!(uffdio_register, UFFDIO, NR_REGISTER, UffdioRegister);
nix::ioctl_read!(uffdio_unregister, UFFDIO, NR_UNREGISTER, UffdioRange);
nix::ioctl_read!(uffdio_wake, UFFDIO, NR_WAKE, UffdioRange);
nix::ioctl_readwrite!(uffdio_copy, UFFDIO, NR_COPY, UffdioCopy);
nix::ioctl_readwrite!(uffdio_zeropage, UFFDIO, NR_ZEROPAGE, UffdioZeropage);

fn open_userfault_fd(nonblocking: bool) -> Result<OwnedFd> {
    let mut flags = libc::O_CLOEXEC;
    if nonblocking {
        flags |= libc::O_NONBLOCK;
    }
    // SAFETY: plain syscall; on success the kernel hands us a fresh
    // descriptor which OwnedFd takes sole ownership of.
    let fd = unsafe { libc::syscall(libc::SYS_userfaultfd, flags) };
    if fd < 0 {
        let err = io::Error::last_os_error();
        return Err(SysError::Unsupported(format!(
            "userfaultfd not available: {err}"
        )));
    }
    // SAFETY: checked above that the descriptor is valid.
    Ok(unsafe { OwnedFd::from_raw_fd(fd as RawFd) })
}

/// API handshake: declare the ABI version we speak and confirm the
/// descriptor supports REGISTER and UNREGISTER.
fn api_handshake(uffd: &OwnedFd) -> Result<()> {
    let mut api = UffdioApi {
        api: UFFD_API,
        features: 0,
        ioctls: 0,
    };
    // SAFETY: `api` is a valid UffdioApi for the duration of the call.
    if let Err(e) = unsafe { uffdio_api(uffd.as_raw_fd(), &mut api) } {
        return Err(SysError::Unsupported(format!("UFFDIO_API failed: {e}")));
    }
    let need = (1u64 << NR_REGISTER) | (1u64 << NR_UNREGISTER);
    if api.ioctls & need != need {
        return Err(SysError::Unsupported(format!(
            "missing userfault ioctls: {:#x}",
            !api.ioctls & need
        )));
    }
    Ok(())
}

fn map_anon_page(len: usize) -> Result<NonNull<libc::c_void>> {
    let len = NonZeroUsize::new(len)
        .ok_or_else(|| SysError::Unsupported("zero page size".into()))?;
    // SAFETY: anonymous private mapping with no fixed address.
    unsafe {
        mmap_anonymous(
            None,
            len,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_PRIVATE,
        )
    }
    .map_err(|e| SysError::Io(e.into()))
}

fn advise(addr: u64, len: u64, advice: MmapAdvise) -> Result<()> {
    let ptr = NonNull::new(addr as *mut libc::c_void).ok_or(SysError::BadAddress(addr))?;
    // SAFETY: caller contract of HostMemory: the range is mapped and owned
    // by the embedder.
    unsafe { madvise(ptr, len as usize, advice) }.map_err(|e| SysError::Io(e.into()))
}

/// The production [`HostMemory`] backend.
#[derive(Debug, Default, Clone, Copy)]
pub struct LinuxMemory;

impl LinuxMemory {
    pub fn new() -> Self {
        LinuxMemory
    }
}

impl HostMemory for LinuxMemory {
    fn page_size(&self) -> usize {
        page_size::get()
    }

    fn probe(&self, target_page_size: usize) -> Result<()> {
        let pagesize = self.page_size();
        if target_page_size > pagesize {
            return Err(SysError::Unsupported(format!(
                "target page size {target_page_size} bigger than host page size {pagesize}"
            )));
        }

        let uffd = open_userfault_fd(false)?;
        api_handshake(&uffd)?;

        // Userfault and mlock don't go together; if the migration succeeds
        // the embedder can ask for memory to be re-locked at cleanup.
        munlockall().map_err(|e| SysError::Io(e.into()))?;

        // Confirm the ops we rely on are supported on anonymous memory by
        // registering a probe page and inspecting the advertised ioctls.
        let testarea = map_anon_page(pagesize)?;
        let result = (|| {
            let mut reg = UffdioRegister {
                range: UffdioRange {
                    start: testarea.as_ptr() as u64,
                    len: pagesize as u64,
                },
                mode: UFFDIO_REGISTER_MODE_MISSING,
                ioctls: 0,
            };
            // SAFETY: `reg` is valid and the range was just mapped.
            if let Err(e) = unsafe { uffdio_register(uffd.as_raw_fd(), &mut reg) } {
                return Err(SysError::Unsupported(format!(
                    "userfault register probe failed: {e}"
                )));
            }
            let mut range = reg.range;
            // SAFETY: same range as the registration above.
            if let Err(e) = unsafe { uffdio_unregister(uffd.as_raw_fd(), &mut range) } {
                return Err(SysError::Unsupported(format!(
                    "userfault unregister probe failed: {e}"
                )));
            }
            let need = (1u64 << NR_WAKE) | (1u64 << NR_COPY) | (1u64 << NR_ZEROPAGE);
            if reg.ioctls & need != need {
                return Err(SysError::Unsupported(format!(
                    "missing userfault range ioctls: {:#x}",
                    !reg.ioctls & need
                )));
            }
            Ok(())
        })();

        // SAFETY: unmapping the page mapped above.
        if let Err(e) = unsafe { munmap(testarea, pagesize) } {
            warn!("failed to unmap userfault probe page: {e}");
        }
        result?;
        debug!("userfault capability probe passed");
        Ok(())
    }

    fn discard(&self, addr: u64, len: u64) -> Result<()> {
        advise(addr, len, MmapAdvise::MADV_DONTNEED)
    }

    fn nohuge(&self, addr: u64, len: u64) -> Result<()> {
        advise(addr, len, MmapAdvise::MADV_NOHUGEPAGE)
    }

    fn huge(&self, addr: u64, len: u64) -> Result<()> {
        advise(addr, len, MmapAdvise::MADV_HUGEPAGE)
    }

    fn lock_all(&self) -> Result<()> {
        mlockall(MlockAllFlags::MCL_CURRENT | MlockAllFlags::MCL_FUTURE)
            .map_err(|e| SysError::Io(e.into()))
    }

    fn alloc_page(&self) -> Result<u64> {
        let page = map_anon_page(self.page_size())?;
        // The staging page must not leak into children; its contents are
        // consumed by UFFDIO_COPY from this process only.
        advise(page.as_ptr() as u64, self.page_size() as u64, MmapAdvise::MADV_DONTFORK)?;
        Ok(page.as_ptr() as u64)
    }

    fn free_page(&self, addr: u64) -> Result<()> {
        let ptr = NonNull::new(addr as *mut libc::c_void).ok_or(SysError::BadAddress(addr))?;
        // SAFETY: only addresses handed out by alloc_page reach this.
        unsafe { munmap(ptr, self.page_size()) }.map_err(|e| SysError::Io(e.into()))
    }

    fn write(&self, addr: u64, data: &[u8]) -> Result<()> {
        // SAFETY: caller contract: `addr..addr+len` is a mapped range the
        // caller owns.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), addr as *mut u8, data.len());
        }
        Ok(())
    }

    fn read(&self, addr: u64, len: usize) -> Result<Vec<u8>> {
        let mut out = vec![0u8; len];
        // SAFETY: caller contract as for `write`.
        unsafe {
            std::ptr::copy_nonoverlapping(addr as *const u8, out.as_mut_ptr(), len);
        }
        Ok(out)
    }

    fn open_fault_channel(&self, nonblocking: bool) -> Result<Arc<dyn FaultChannel>> {
        let uffd = open_userfault_fd(nonblocking)?;
        // The host probe already checked the API, but re-run the handshake
        // as an ABI check on the new descriptor.
        api_handshake(&uffd)?;
        let quit = EventFd::from_value_and_flags(0, EfdFlags::EFD_CLOEXEC)
            .map_err(|e| SysError::Io(e.into()))?;
        Ok(Arc::new(LinuxFaultChannel { uffd, quit }))
    }
}

pub struct LinuxFaultChannel {
    uffd: OwnedFd,
    quit: EventFd,
}

impl FaultChannel for LinuxFaultChannel {
    fn register(&self, start: u64, len: u64) -> Result<()> {
        let mut reg = UffdioRegister {
            range: UffdioRange { start, len },
            mode: UFFDIO_REGISTER_MODE_MISSING,
            ioctls: 0,
        };
        // SAFETY: `reg` is a valid UffdioRegister.
        unsafe { uffdio_register(self.uffd.as_raw_fd(), &mut reg) }
            .map_err(|e| SysError::Io(e.into()))?;
        Ok(())
    }

    fn unregister(&self, start: u64, len: u64) -> Result<()> {
        let mut range = UffdioRange { start, len };
        // SAFETY: `range` is a valid UffdioRange.
        unsafe { uffdio_unregister(self.uffd.as_raw_fd(), &mut range) }
            .map_err(|e| SysError::Io(e.into()))?;
        Ok(())
    }

    fn copy(&self, dst: u64, src: u64, len: u64) -> Result<()> {
        let mut copy = UffdioCopy {
            dst,
            src,
            len,
            mode: 0,
            copy: 0,
        };
        // SAFETY: `copy` is a valid UffdioCopy; the kernel installs the page
        // and wakes anyone blocked on it.
        unsafe { uffdio_copy(self.uffd.as_raw_fd(), &mut copy) }
            .map_err(|e| SysError::Io(e.into()))?;
        Ok(())
    }

    fn zeropage(&self, start: u64, len: u64) -> Result<()> {
        let mut zero = UffdioZeropage {
            range: UffdioRange { start, len },
            mode: 0,
            zeropage: 0,
        };
        // SAFETY: `zero` is a valid UffdioZeropage.
        unsafe { uffdio_zeropage(self.uffd.as_raw_fd(), &mut zero) }
            .map_err(|e| SysError::Io(e.into()))?;
        Ok(())
    }

    fn wake(&self, start: u64, len: u64) -> Result<()> {
        let mut range = UffdioRange { start, len };
        // SAFETY: `range` is a valid UffdioRange.
        unsafe { uffdio_wake(self.uffd.as_raw_fd(), &mut range) }
            .map_err(|e| SysError::Io(e.into()))?;
        Ok(())
    }

    fn next_event(&self) -> Result<FaultEvent> {
        loop {
            let mut fds = [
                PollFd::new(self.uffd.as_fd(), PollFlags::POLLIN),
                PollFd::new(self.quit.as_fd(), PollFlags::POLLIN),
            ];
            poll(&mut fds, PollTimeout::NONE).map_err(|e| SysError::Io(e.into()))?;

            if fds[1]
                .revents()
                .is_some_and(|r| r.intersects(PollFlags::POLLIN))
            {
                return Ok(FaultEvent::Quit);
            }

            // The kernel hands us the faulting address as a bare 64-bit
            // value, never a partial one.
            let mut addr = 0u64;
            // SAFETY: reading into an 8-byte local from our own descriptor.
            let n = unsafe {
                libc::read(
                    self.uffd.as_raw_fd(),
                    &mut addr as *mut u64 as *mut libc::c_void,
                    8,
                )
            };
            if n == 8 {
                return Ok(FaultEvent::Fault { addr });
            }
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EAGAIN) {
                    // A wake on another thread raced our poll; nothing to
                    // read this time around.
                    continue;
                }
                return Err(SysError::Io(err));
            }
            // Lost alignment; there is no way to know what we'd read next.
            return Err(SysError::ShortFaultRead(n as usize));
        }
    }

    fn request_quit(&self) -> Result<()> {
        let one: u64 = 1;
        // SAFETY: writing an 8-byte value to our own eventfd.
        let n = unsafe {
            libc::write(
                self.quit.as_fd().as_raw_fd(),
                &one as *const u64 as *const libc::c_void,
                8,
            )
        };
        if n != 8 {
            return Err(SysError::Io(io::Error::last_os_error()));
        }
        Ok(())
    }
}
