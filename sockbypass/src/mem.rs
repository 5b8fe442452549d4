/*!
 * Remote process memory access.
 *
 * Reads go straight through the per-process memory pseudo-file. Writes try
 * the same path first; when the kernel denies them (user namespaces with
 * stricter policy), the write is forwarded to an in-namespace agent process
 * that is spawned lazily and cached per target pid.
 */

use crate::nsagent::NsAgentClient;
use sockbypass_common::{BypassError, Result};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use tracing::{debug, warn};

fn mem_path(pid: u32) -> String {
    format!("/proc/{}/mem", pid)
}

/// Read up to `len` bytes at `offset` in the target's address space.
/// A short read returns the truncated slice.
pub fn read(pid: u32, offset: u64, len: usize) -> Result<Vec<u8>> {
    let file = File::open(mem_path(pid))
        .map_err(|e| BypassError::MemoryAccess(format!("open /proc/{}/mem: {}", pid, e)))?;
    let mut buf = vec![0u8; len];
    let n = file
        .read_at(&mut buf, offset)
        .map_err(|e| BypassError::MemoryAccess(format!("pread pid={} offset=0x{:x}: {}", pid, offset, e)))?;
    buf.truncate(n);
    Ok(buf)
}

fn write_direct(pid: u32, offset: u64, data: &[u8]) -> io::Result<()> {
    let file = OpenOptions::new().write(true).open(mem_path(pid))?;
    let n = file.write_at(data, offset)?;
    if n != data.len() {
        return Err(io::Error::new(
            io::ErrorKind::WriteZero,
            format!("short write: {} of {} bytes", n, data.len()),
        ));
    }
    Ok(())
}

fn is_denied(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EPERM) | Some(libc::EACCES) | Some(libc::EIO)
    )
}

/// Writer with the agent fallback. One instance per session task; the agent
/// cache lives as long as the session.
#[derive(Default)]
pub struct MemWriter {
    agents: HashMap<u32, NsAgentClient>,
}

impl MemWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write(&mut self, pid: u32, offset: u64, data: &[u8]) -> Result<()> {
        match write_direct(pid, offset, data) {
            Ok(()) => Ok(()),
            Err(e) if is_denied(&e) => {
                debug!(pid, "direct memory write denied ({}), using agent", e);
                self.write_via_agent(pid, offset, data)
            }
            Err(e) => Err(BypassError::MemoryAccess(format!(
                "pwrite pid={} offset=0x{:x}: {}",
                pid, offset, e
            ))),
        }
    }

    fn write_via_agent(&mut self, pid: u32, offset: u64, data: &[u8]) -> Result<()> {
        if !self.agents.contains_key(&pid) {
            warn!(pid, "starting in-namespace memory agent");
            let agent = NsAgentClient::spawn(pid)?;
            self.agents.insert(pid, agent);
        }
        // The entry is present by now on every path.
        let agent = self
            .agents
            .get_mut(&pid)
            .ok_or_else(|| BypassError::MemoryAccess("agent cache corrupted".to_string()))?;
        agent.write(offset, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_own_process_memory() {
        let data = b"sockbypass memory probe";
        let got = read(std::process::id(), data.as_ptr() as u64, data.len()).unwrap();
        assert_eq!(&got, data);
    }

    #[test]
    fn read_of_unmapped_range_fails() {
        // Page zero is never mapped.
        assert!(matches!(
            read(std::process::id(), 0, 16),
            Err(BypassError::MemoryAccess(_))
        ));
    }

    #[test]
    fn writes_own_process_memory_directly() {
        let mut buf = vec![0u8; 8];
        let addr = buf.as_mut_ptr() as u64;
        let mut writer = MemWriter::new();
        writer.write(std::process::id(), addr, b"rewrote!").unwrap();
        assert_eq!(&buf, b"rewrote!");
    }
}
