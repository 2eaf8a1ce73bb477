use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;

/// Per-CPU NMI count reader over `/proc/interrupts`.
///
/// The file is opened and the read buffer allocated up front, so taking a
/// reading from the instrumentation paths costs one `pread` and a scan.
/// If the file cannot be read or the CPU column is missing, the reader
/// degrades to always returning 0.
pub(crate) struct NmiReader {
    file: Option<File>,
    buf: Vec<u8>,
    col: usize,
}

impl NmiReader {
    pub fn open(cpu: u32) -> Self {
        Self::try_open(cpu).unwrap_or(Self {
            file: None,
            buf: Vec::new(),
            col: 0,
        })
    }

    fn try_open(cpu: u32) -> io::Result<Self> {
        let text = std::fs::read_to_string("/proc/interrupts")?;
        let name = format!("CPU{cpu}");
        let col = text
            .lines()
            .next()
            .unwrap_or("")
            .split_whitespace()
            .position(|tok| tok == name)
            .ok_or(io::ErrorKind::NotFound)?;
        let file = File::open("/proc/interrupts")?;
        // Leave headroom, interrupt lines come and go.
        let buf = vec![0; (text.len() * 2).max(64 * 1024)];
        Ok(Self {
            file: Some(file),
            buf,
            col,
        })
    }

    /// Current NMI count of the measured CPU, 0 if unavailable.
    pub fn count(&mut self) -> u64 {
        let Some(file) = &self.file else {
            return 0;
        };
        let len = match file.read_at(&mut self.buf, 0) {
            Ok(len) => len,
            Err(_) => return 0,
        };
        let text = std::str::from_utf8(&self.buf[..len]).unwrap_or("");
        for line in text.lines() {
            let mut toks = line.split_whitespace();
            if toks.next() != Some("NMI:") {
                continue;
            }
            return toks
                .nth(self.col)
                .and_then(|val| val.parse().ok())
                .unwrap_or(0);
        }
        0
    }
}
