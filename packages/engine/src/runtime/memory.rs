// packages/engine/src/runtime/memory.rs
//! Resident memory sampling

/// Resident set size of `pid` in bytes, if the platform exposes it.
///
/// Reads `/proc/<pid>/statm` (`size resident shared ...`, in pages).
#[cfg(target_os = "linux")]
pub fn resident_bytes(pid: u32) -> Option<u64> {
    let contents = std::fs::read_to_string(format!("/proc/{}/statm", pid)).ok()?;
    let resident_pages: u64 = contents.split_whitespace().nth(1)?.parse().ok()?;
    Some(resident_pages * page_size())
}

#[cfg(not(target_os = "linux"))]
pub fn resident_bytes(_pid: u32) -> Option<u64> {
    None
}

#[cfg(target_os = "linux")]
fn page_size() -> u64 {
    // SAFETY: sysconf has no preconditions
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as u64
    } else {
        4096
    }
}

/// Convert bytes to MiB, rounding down
pub fn bytes_to_mib(bytes: u64) -> u64 {
    bytes / (1024 * 1024)
}
