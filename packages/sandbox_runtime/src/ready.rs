//! Server-ready detection.
//!
//! Dev servers announce themselves by printing a local URL
//! (`Local: http://localhost:5173/`). The scanner strips ANSI styling,
//! splits output into lines and reports each newly seen port once.

use std::borrow::Cow;
use std::collections::HashSet;
use std::sync::LazyLock;

use regex_lite::Regex;

use crate::runtime::ServerReady;

static LOCAL_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"https?://(?:localhost|127\.0\.0\.1|0\.0\.0\.0|\[::1?\]):(\d+)")
        .expect("local URL pattern is valid")
});

/// Longest partial line kept between chunks
const MAX_PENDING_BYTES: usize = 4096;

/// Incremental scanner fed with raw process output
#[derive(Debug, Default)]
pub struct ReadyScanner {
    pending: String,
    seen_ports: HashSet<u16>,
}

impl ReadyScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of output. Returns the ready notifications for ports not seen before.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<ServerReady> {
        self.pending.push_str(&String::from_utf8_lossy(chunk));

        let mut found = Vec::new();
        while let Some(newline) = self.pending.find('\n') {
            let line: String = self.pending.drain(..=newline).collect();
            if let Some(ready) = detect_server_url(&strip_ansi(&line)) {
                if self.seen_ports.insert(ready.port) {
                    found.push(ready);
                }
            }
        }

        if self.pending.len() > MAX_PENDING_BYTES {
            self.pending.clear();
        }
        found
    }
}

/// Remove escape sequences and stray control bytes, keeping tabs and newlines
pub fn strip_ansi(input: &str) -> Cow<'_, str> {
    let bytes = input.as_bytes();
    if !bytes.iter().any(|b| *b == 0x1b || is_stray_control(*b)) {
        return Cow::Borrowed(input);
    }

    // Every byte consumed below is ASCII, so the slices stay on char boundaries
    let mut cleaned = String::with_capacity(input.len());
    let mut last_copy = 0;
    let mut idx = 0;
    while idx < bytes.len() {
        match bytes[idx] {
            0x1b => {
                cleaned.push_str(&input[last_copy..idx]);
                idx = skip_escape(bytes, idx);
                last_copy = idx;
            }
            b if is_stray_control(b) => {
                cleaned.push_str(&input[last_copy..idx]);
                idx += 1;
                last_copy = idx;
            }
            _ => idx += 1,
        }
    }
    cleaned.push_str(&input[last_copy..]);
    Cow::Owned(cleaned)
}

fn is_stray_control(byte: u8) -> bool {
    matches!(byte, 0x00..=0x08 | 0x0b..=0x1a | 0x1c..=0x1f | 0x7f)
}

/// Index just past the sequence starting at `esc`
fn skip_escape(bytes: &[u8], esc: usize) -> usize {
    let len = bytes.len();
    let Some(&kind) = bytes.get(esc + 1) else {
        return len;
    };
    let mut idx = esc + 2;
    match kind {
        // CSI: parameters, then one final byte in @..~
        b'[' => {
            while idx < len {
                if (0x40..=0x7e).contains(&bytes[idx]) {
                    return idx + 1;
                }
                idx += 1;
            }
            len
        }
        // OSC: until BEL or ESC \
        b']' => {
            while idx < len {
                match bytes[idx] {
                    0x07 => return idx + 1,
                    0x1b if bytes.get(idx + 1) == Some(&b'\\') => return idx + 2,
                    _ => idx += 1,
                }
            }
            len
        }
        b if b.is_ascii() => esc + 2,
        _ => esc + 1,
    }
}

/// Find the first local `http(s)://host:port` URL in a line of output
pub fn detect_server_url(line: &str) -> Option<ServerReady> {
    LOCAL_URL.captures_iter(line).find_map(|caps| {
        let port = caps.get(1)?.as_str().parse::<u16>().ok()?;
        (port > 0).then(|| ServerReady {
            port,
            address: format!("http://localhost:{}", port),
        })
    })
}
