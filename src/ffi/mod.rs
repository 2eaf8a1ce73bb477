use std::fs::File;
use std::io::{Error, Result};
use std::mem::{size_of, zeroed};
use std::os::fd::{AsRawFd, FromRawFd};
use std::ptr::null_mut;

use libc::{epoll_event, itimerspec, timespec};

pub const NSEC_PER_SEC: u64 = 1_000_000_000;
pub const NSEC_PER_MSEC: u64 = 1_000_000;

pub fn timerfd_create(clockid: i32, flags: i32) -> Result<File> {
    let fd = unsafe { libc::timerfd_create(clockid, flags) };
    if fd != -1 {
        Ok(unsafe { File::from_raw_fd(fd) })
    } else {
        Err(Error::last_os_error())
    }
}

pub fn timerfd_settime(file: &File, flags: i32, new: &itimerspec) -> Result<()> {
    let result = unsafe { libc::timerfd_settime(file.as_raw_fd(), flags, new, null_mut()) };
    if result != -1 {
        Ok(())
    } else {
        Err(Error::last_os_error())
    }
}

pub fn timerfd_gettime(file: &File) -> Result<itimerspec> {
    let mut cur: itimerspec = unsafe { zeroed() };
    let result = unsafe { libc::timerfd_gettime(file.as_raw_fd(), &mut cur) };
    if result != -1 {
        Ok(cur)
    } else {
        Err(Error::last_os_error())
    }
}

pub fn eventfd(init: u32, flags: i32) -> Result<File> {
    let fd = unsafe { libc::eventfd(init, flags) };
    if fd != -1 {
        Ok(unsafe { File::from_raw_fd(fd) })
    } else {
        Err(Error::last_os_error())
    }
}

pub fn read_u64(file: &File) -> Result<u64> {
    let mut buf = 0_u64;
    let ptr = &mut buf as *mut u64;
    let bytes = unsafe { libc::read(file.as_raw_fd(), ptr as _, size_of::<u64>()) };
    if bytes != -1 {
        Ok(buf)
    } else {
        Err(Error::last_os_error())
    }
}

pub fn write_u64(file: &File, val: u64) -> Result<()> {
    let ptr = &val as *const u64;
    let bytes = unsafe { libc::write(file.as_raw_fd(), ptr as _, size_of::<u64>()) };
    if bytes != -1 {
        Ok(())
    } else {
        Err(Error::last_os_error())
    }
}

pub fn epoll_create1(flags: i32) -> Result<File> {
    let fd = unsafe { libc::epoll_create1(flags) };
    if fd != -1 {
        Ok(unsafe { File::from_raw_fd(fd) })
    } else {
        Err(Error::last_os_error())
    }
}

pub fn epoll_ctl(epoll: &File, op: i32, file: &File, event: &mut epoll_event) -> Result<()> {
    let result = unsafe { libc::epoll_ctl(epoll.as_raw_fd(), op, file.as_raw_fd(), event as _) };
    if result != -1 {
        Ok(())
    } else {
        Err(Error::last_os_error())
    }
}

pub fn epoll_wait<'a>(
    epoll: &File,
    events: &'a mut [epoll_event],
    timeout: i32,
) -> Result<&'a [epoll_event]> {
    let len = unsafe {
        libc::epoll_wait(
            epoll.as_raw_fd(),
            events.as_mut_ptr(),
            events.len() as _,
            timeout,
        )
    };
    if len != -1 {
        Ok(&events[..len as _])
    } else {
        Err(Error::last_os_error())
    }
}

/// Monotonic time since boot in nanoseconds.
///
/// `CLOCK_MONOTONIC` cannot fail for a valid timespec pointer, so this
/// returns 0 instead of an error in the impossible case.
pub fn monotonic_ns() -> u64 {
    let mut ts: timespec = unsafe { zeroed() };
    let result = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    if result != -1 {
        ts.tv_sec as u64 * NSEC_PER_SEC + ts.tv_nsec as u64
    } else {
        0
    }
}

/// Resolution of `clockid` in nanoseconds, at least 1.
pub fn clock_resolution_ns(clockid: i32) -> Result<u64> {
    let mut ts: timespec = unsafe { zeroed() };
    let result = unsafe { libc::clock_getres(clockid, &mut ts) };
    if result != -1 {
        Ok((ts.tv_sec as u64 * NSEC_PER_SEC + ts.tv_nsec as u64).max(1))
    } else {
        Err(Error::last_os_error())
    }
}

/// Serializing TSC read. Falls back to monotonic time on non-x86 hosts so
/// the reference-cycle fields stay monotonically increasing.
#[cfg(target_arch = "x86_64")]
pub fn rdtsc_ordered() -> u64 {
    unsafe {
        core::arch::x86_64::_mm_lfence();
        core::arch::x86_64::_rdtsc()
    }
}

#[cfg(not(target_arch = "x86_64"))]
pub fn rdtsc_ordered() -> u64 {
    monotonic_ns()
}

pub fn sched_getcpu() -> u32 {
    unsafe { libc::sched_getcpu() as u32 }
}

/// Pin the calling thread to `cpu`.
pub fn pin_to_cpu(cpu: u32) -> Result<()> {
    let mut set: libc::cpu_set_t = unsafe { zeroed() };
    unsafe {
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu as usize, &mut set);
    }
    let result = unsafe { libc::sched_setaffinity(0, size_of::<libc::cpu_set_t>(), &set) };
    if result != -1 {
        Ok(())
    } else {
        Err(Error::last_os_error())
    }
}

/// Number of configured CPUs on this host.
pub fn nr_cpus() -> u32 {
    let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_CONF) };
    if n > 0 {
        n as u32
    } else {
        1
    }
}
