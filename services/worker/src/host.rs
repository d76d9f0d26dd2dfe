//! Host capacity measurement.
//!
//! The allocatable budget is configured, not measured. These figures are
//! only used to sanity-check that configuration at startup and to report
//! disk usage for the data directory.

use std::ffi::CString;
use std::io;
use std::path::Path;

use crate::resources::ResourceQuantity;

/// What the host actually has.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostResources {
    pub cpu_cores: u32,
    pub total_memory_bytes: u64,
    pub available_memory_bytes: u64,
    pub disk: Option<DiskUsage>,
}

/// Filesystem usage for one path, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskUsage {
    pub free: u64,
    pub total: u64,
    pub used: u64,
}

impl HostResources {
    /// Measures CPU and memory, and disk usage of the filesystem holding
    /// `data_dir`. A disk measurement failure leaves `disk` empty.
    pub fn measure(data_dir: &Path) -> Self {
        let (total_memory_bytes, available_memory_bytes) = memory_info();
        Self {
            cpu_cores: cpu_count(),
            total_memory_bytes,
            available_memory_bytes,
            disk: disk_usage(data_dir).ok(),
        }
    }

    /// The host's size in the ledger's units (millicpu, MiB).
    pub fn capacity(&self) -> ResourceQuantity {
        ResourceQuantity::new(
            i64::from(self.cpu_cores) * 1000,
            (self.total_memory_bytes / (1024 * 1024)) as i64,
        )
    }

    /// Which halves of `reserved` exceed the host.
    pub fn overcommitted(&self, reserved: ResourceQuantity) -> (bool, bool) {
        let capacity = self.capacity();
        (reserved.cpu > capacity.cpu, reserved.memory > capacity.memory)
    }
}

/// Free/total/used bytes of the filesystem containing `path`.
/// Free counts only blocks available to unprivileged users.
pub fn disk_usage(path: &Path) -> io::Result<DiskUsage> {
    let c_path = CString::new(path.as_os_str().as_encoded_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }

    let block = stat.f_frsize as u64;
    let free = stat.f_bavail as u64 * block;
    let total = stat.f_blocks as u64 * block;
    Ok(DiskUsage {
        free,
        total,
        used: total.saturating_sub(free),
    })
}

fn cpu_count() -> u32 {
    let count = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if count > 0 {
        return count as u32;
    }

    std::thread::available_parallelism()
        .map(|p| p.get() as u32)
        .unwrap_or(1)
}

#[cfg(target_os = "linux")]
fn memory_info() -> (u64, u64) {
    if let Ok(meminfo) = std::fs::read_to_string("/proc/meminfo") {
        let parsed = parse_meminfo(&meminfo);
        if parsed.0 > 0 {
            return parsed;
        }
    }
    sysconf_memory()
}

#[cfg(not(target_os = "linux"))]
fn memory_info() -> (u64, u64) {
    sysconf_memory()
}

fn sysconf_memory() -> (u64, u64) {
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    let total_pages = unsafe { libc::sysconf(libc::_SC_PHYS_PAGES) };
    if page_size > 0 && total_pages > 0 {
        let total = page_size as u64 * total_pages as u64;
        return (total, total);
    }
    (0, 0)
}

/// Returns (total, available) bytes from `/proc/meminfo` contents.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_meminfo(content: &str) -> (u64, u64) {
    let mut total = 0;
    let mut available = None;
    let mut free = 0;
    let mut buffers = 0;
    let mut cached = 0;

    for line in content.lines() {
        let mut parts = line.split_whitespace();
        let (Some(key), Some(value)) = (parts.next(), parts.next()) else {
            continue;
        };
        let bytes = value.parse::<u64>().unwrap_or(0) * 1024;
        match key {
            "MemTotal:" => total = bytes,
            "MemAvailable:" => available = Some(bytes),
            "MemFree:" => free = bytes,
            "Buffers:" => buffers = bytes,
            "Cached:" => cached = bytes,
            _ => {}
        }
    }

    (total, available.unwrap_or(free + buffers + cached))
}
