//! Reply line splitting

/// A received line grew past the configured cap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineOverflow;

/// Splits a byte stream into text lines.
///
/// CR, LF and CR LF each end one line. Backspace removes the previous
/// byte of the current line.
#[derive(Debug)]
pub struct LineAssembler {
    buf: Vec<u8>,
    cap: usize,
    after_cr: bool,
}

impl LineAssembler {
    /// Create an assembler that rejects lines longer than `cap` bytes
    pub fn new(cap: usize) -> Self {
        Self {
            buf: Vec::new(),
            cap,
            after_cr: false,
        }
    }

    /// Feed one byte; returns a line when `byte` completes one
    pub fn push(&mut self, byte: u8) -> Option<Result<String, LineOverflow>> {
        let after_cr = std::mem::replace(&mut self.after_cr, false);
        match byte {
            b'\r' => {
                self.after_cr = true;
                Some(Ok(self.take()))
            }
            b'\n' if after_cr => None,
            b'\n' => Some(Ok(self.take())),
            0x08 => {
                self.buf.pop();
                None
            }
            _ if self.buf.len() >= self.cap => {
                self.buf.clear();
                Some(Err(LineOverflow))
            }
            _ => {
                self.buf.push(byte);
                None
            }
        }
    }

    /// True when bytes of an unterminated line are held
    pub fn has_partial(&self) -> bool {
        !self.buf.is_empty()
    }

    /// Take the unterminated line, if any
    pub fn take_partial(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            None
        } else {
            Some(self.take())
        }
    }

    fn take(&mut self) -> String {
        let line = String::from_utf8_lossy(&self.buf).into_owned();
        self.buf.clear();
        line
    }
}

/// Strip the bytes `<= ' '` from both ends
pub fn trim_control(line: &str) -> &str {
    line.trim_matches(|c: char| c <= ' ')
}

/// True when `line` is the device repeating `command`
pub fn is_echo(line: &str, command: &str) -> bool {
    let line = trim_control(line);
    !line.is_empty() && line == trim_control(command)
}
