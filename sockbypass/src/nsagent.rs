/*!
 * In-namespace memory write agent.
 *
 * A subordinate copy of this binary, re-executed with `--nsagent` and entered
 * into the target's mount namespace. Its sole duty is performing positional
 * writes on the target's memory pseudo-file on the supervisor's behalf, for
 * configurations where writes from outside the namespace are denied.
 *
 * The wire format is an append-only stream of fixed-header frames on the
 * agent's stdin/stdout pipe pair:
 *
 *   request:  offset u64 LE | length u32 LE | payload bytes
 *   response: status i32 LE (0 on success, negated errno otherwise)
 */

use nix::errno::Errno;
use nix::sched::{setns, CloneFlags};
use sockbypass_common::{BypassError, Result};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::FileExt;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use tracing::{debug, info};

const FRAME_HEADER_LEN: usize = 12;

/// Largest payload a single frame may carry. Sockaddr rewrites are a few
/// bytes; anything bigger indicates a corrupted stream.
const MAX_FRAME_LEN: usize = 4096;

pub(crate) struct WriteFrame {
    pub offset: u64,
    pub data: Vec<u8>,
}

pub(crate) fn encode_frame(offset: u64, data: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + data.len());
    buf.extend_from_slice(&offset.to_le_bytes());
    buf.extend_from_slice(&(data.len() as u32).to_le_bytes());
    buf.extend_from_slice(data);
    buf
}

/// Read one frame; `Ok(None)` on a clean end-of-stream at a frame boundary.
pub(crate) fn read_frame(r: &mut impl Read) -> Result<Option<WriteFrame>> {
    let mut header = [0u8; FRAME_HEADER_LEN];
    match r.read_exact(&mut header) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(BypassError::MemoryAccess(format!("reading frame header: {}", e))),
    }
    let mut offset_bytes = [0u8; 8];
    offset_bytes.copy_from_slice(&header[0..8]);
    let offset = u64::from_le_bytes(offset_bytes);
    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&header[8..12]);
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_FRAME_LEN {
        return Err(BypassError::MemoryAccess(format!(
            "frame length {} exceeds limit",
            len
        )));
    }
    let mut data = vec![0u8; len];
    r.read_exact(&mut data)
        .map_err(|e| BypassError::MemoryAccess(format!("reading frame payload: {}", e)))?;
    Ok(Some(WriteFrame { offset, data }))
}

/// Agent entrypoint, reached via `sockbypass --nsagent --mem-nsenter-pid N`.
///
/// The memory fd is opened before switching namespaces; it stays valid across
/// setns, and the open-time permission check runs in the supervisor's context.
/// setns(CLONE_NEWNS) requires the process to still be single-threaded, which
/// is why this runs before any runtime is built.
pub fn run(pid: u32) -> Result<()> {
    let mem = OpenOptions::new()
        .write(true)
        .open(format!("/proc/{}/mem", pid))
        .map_err(|e| BypassError::MemoryAccess(format!("open /proc/{}/mem: {}", pid, e)))?;

    let mnt = File::open(format!("/proc/{}/ns/mnt", pid))?;
    setns(&mnt, CloneFlags::CLONE_NEWNS)?;
    info!(pid, "entered target mount namespace");

    let mut stdin = io::stdin().lock();
    let mut stdout = io::stdout().lock();
    loop {
        let frame = match read_frame(&mut stdin)? {
            Some(f) => f,
            None => break,
        };
        let status: i32 = match mem.write_at(&frame.data, frame.offset) {
            Ok(n) if n == frame.data.len() => 0,
            Ok(_) => -libc::EIO,
            Err(e) => -e.raw_os_error().unwrap_or(libc::EIO),
        };
        debug!(offset = frame.offset, len = frame.data.len(), status, "agent write");
        stdout.write_all(&status.to_le_bytes())?;
        stdout.flush()?;
    }
    info!(pid, "agent stream closed, exiting");
    Ok(())
}

/// Supervisor-side handle to one spawned agent.
pub struct NsAgentClient {
    child: Child,
    stdin: ChildStdin,
    stdout: ChildStdout,
}

impl NsAgentClient {
    pub fn spawn(pid: u32) -> Result<Self> {
        let exe = std::env::current_exe()?;
        let mut child = Command::new(exe)
            .arg("--nsagent")
            .arg("--mem-nsenter-pid")
            .arg(pid.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .map_err(|e| BypassError::MemoryAccess(format!("spawning nsagent for pid {}: {}", pid, e)))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| BypassError::MemoryAccess("nsagent stdin missing".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BypassError::MemoryAccess("nsagent stdout missing".to_string()))?;
        Ok(NsAgentClient {
            child,
            stdin,
            stdout,
        })
    }

    pub fn write(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        self.stdin
            .write_all(&encode_frame(offset, data))
            .and_then(|_| self.stdin.flush())
            .map_err(|e| BypassError::MemoryAccess(format!("sending write frame: {}", e)))?;

        let mut status = [0u8; 4];
        self.stdout
            .read_exact(&mut status)
            .map_err(|e| BypassError::MemoryAccess(format!("reading write ack: {}", e)))?;
        let status = i32::from_le_bytes(status);
        if status != 0 {
            return Err(BypassError::MemoryAccess(format!(
                "agent write failed: {}",
                Errno::from_i32(-status)
            )));
        }
        Ok(())
    }
}

impl Drop for NsAgentClient {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trip() {
        let encoded = encode_frame(0x1122334455667788, b"\xde\xad\xbe\xef");
        let frame = read_frame(&mut encoded.as_slice()).unwrap().unwrap();
        assert_eq!(frame.offset, 0x1122334455667788);
        assert_eq!(frame.data, b"\xde\xad\xbe\xef");
    }

    #[test]
    fn empty_stream_is_a_clean_end() {
        assert!(read_frame(&mut io::empty()).unwrap().is_none());
    }

    #[test]
    fn truncated_payload_is_an_error() {
        let mut encoded = encode_frame(0, b"0123456789");
        encoded.truncate(FRAME_HEADER_LEN + 4);
        assert!(read_frame(&mut encoded.as_slice()).is_err());
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut header = Vec::new();
        header.extend_from_slice(&0u64.to_le_bytes());
        header.extend_from_slice(&(MAX_FRAME_LEN as u32 + 1).to_le_bytes());
        assert!(read_frame(&mut header.as_slice()).is_err());
    }
}
