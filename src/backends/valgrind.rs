//! Trace parse backend
//!
//! Runs the target under a dynamic translation tool and rebuilds the
//! coverage map from the superblock records it emits on stderr. Much
//! slower than the fork server, but works without an instrumented
//! emulator.

use std::io::{Read, Write};
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::Instant;

use super::{Backend, BackendError, Execution, Result};
use crate::config::Config;
use crate::feedback::{Trace, MAP_SIZE};

/// Dynamic translation tool emitting `SB <hex-address>` records
const VALGRIND_RUNNER: &str = "valgrind";

/// Trace parse backend state
pub struct ValgrindBackend {
    target: PathBuf,
}

impl ValgrindBackend {
    /// Create a new `ValgrindBackend` instance
    pub fn new(config: &Config) -> Self {
        Self {
            target: PathBuf::from(&config.exe_config.target),
        }
    }
}

impl Backend for ValgrindBackend {
    fn run(&mut self, data: &[u8]) -> Result<Execution> {
        let start = Instant::now();

        let mut child = Command::new(VALGRIND_RUNNER)
            .arg("--tool=none")
            .arg("--trace-superblocks=yes")
            .arg(&self.target)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(BackendError::Spawn)?;

        if let Some(mut stdin) = child.stdin.take() {
            // The target may exit without draining its input
            match stdin.write_all(data) {
                Ok(()) => {}
                Err(ref error) if error.kind() == std::io::ErrorKind::BrokenPipe => {}
                Err(error) => return Err(BackendError::Ipc(error)),
            }
        }

        let mut log = Vec::new();
        if let Some(mut stderr) = child.stderr.take() {
            stderr
                .read_to_end(&mut log)
                .map_err(BackendError::Ipc)?;
        }

        let status = child.wait().map_err(BackendError::Ipc)?;
        let duration = start.elapsed();

        let map = parse_trace(&String::from_utf8_lossy(&log));
        let (did_crash, exit_signal, exit_code) = match status.signal() {
            Some(signal) => (true, signal as u8, 0),
            None => (false, 0, status.code().unwrap_or(0) as u8),
        };

        Ok(Execution::Completed(Trace::new(
            map,
            did_crash,
            exit_signal,
            exit_code,
            duration,
        )))
    }

    fn cleanup(&mut self) {
        // Nothing outlives a single execution
    }
}

/// Rebuild a coverage map from the superblock start records.
///
/// Each `SB <hex-address>` line contributes one edge, hashed AFL style
/// from the previous and current superblock addresses. Lines that do
/// not match are ignored.
fn parse_trace(log: &str) -> Vec<u8> {
    let mut map = vec![0u8; MAP_SIZE];
    let mut prev: usize = 0;

    for line in log.lines() {
        let mut fields = line.split_whitespace();
        if fields.next() != Some("SB") {
            continue;
        }
        let addr = match fields
            .next()
            .and_then(|field| usize::from_str_radix(field.trim_start_matches("0x"), 16).ok())
        {
            Some(addr) => addr,
            None => continue,
        };

        let cur = ((addr >> 4) ^ (addr << 8)) & (MAP_SIZE - 1);
        let cell = &mut map[cur ^ prev];
        *cell = cell.saturating_add(1);
        prev = cur >> 1;
    }

    map
}

#[cfg(test)]
mod tests {
    use super::parse_trace;

    #[test]
    fn test_parse_edge_hash_chain() {
        let map = parse_trace("SB 1000\nSB 2000\nSB 1000\n");

        // First record: cur = 0x100, prev was 0 -> cell 0x100
        assert_eq!(map[0x100], 1);
        // Second: cur = 0x200 xor prev 0x80 -> cell 0x280
        assert_eq!(map[0x280], 1);
        // Third: cur = 0x100 xor prev 0x100 -> cell 0
        assert_eq!(map[0x000], 1);

        assert_eq!(map.iter().filter(|&&count| count != 0).count(), 3);
    }

    #[test]
    fn test_parse_ignores_noise() {
        let map = parse_trace("==1234== some tool banner\nSB zzzz\nSB\n\nSB 10\n");

        assert_eq!(map.iter().filter(|&&count| count != 0).count(), 1);
    }

    #[test]
    fn test_parse_mixed_case_hex() {
        let first = parse_trace("SB dEaD\n");
        let second = parse_trace("SB DEAD\n");

        assert_eq!(first, second);
        assert_eq!(first.iter().filter(|&&count| count != 0).count(), 1);
    }

    #[test]
    fn test_parse_saturates() {
        let mut log = String::new();
        for _ in 0..300 {
            log.push_str("SB 0\n");
        }
        let map = parse_trace(&log);

        // Hit counts cap at 255
        assert!(map.iter().all(|&count| count <= 255));
        assert_eq!(*map.iter().max().unwrap(), 255);
    }

    #[test]
    fn test_parse_empty_log() {
        let map = parse_trace("");

        assert!(map.iter().all(|&count| count == 0));
    }
}
