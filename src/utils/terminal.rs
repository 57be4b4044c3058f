//! Console line discipline
//!
//! The relay and the operator prompts read the console a byte at a time,
//! so an interactive stdin is switched out of canonical mode for the
//! lifetime of a [`RawModeGuard`]. Redirected stdin is left untouched.

/// Restores the saved terminal settings on drop
#[cfg(unix)]
pub struct RawModeGuard {
    saved: nix::sys::termios::Termios,
}

#[cfg(unix)]
impl RawModeGuard {
    /// Put stdin into raw mode. `Ok(None)` when stdin is not a terminal.
    pub fn enable_stdin() -> std::io::Result<Option<Self>> {
        use nix::sys::termios::{
            tcgetattr, tcsetattr, InputFlags, LocalFlags, SetArg, SpecialCharacterIndices,
        };

        if !atty::is(atty::Stream::Stdin) {
            return Ok(None);
        }

        let saved = tcgetattr(std::io::stdin())?;
        let mut raw = saved.clone();
        raw.local_flags.remove(
            LocalFlags::ECHO
                | LocalFlags::ECHOE
                | LocalFlags::ECHOK
                | LocalFlags::ECHONL
                | LocalFlags::ECHOCTL
                | LocalFlags::ECHOKE
                | LocalFlags::ICANON
                | LocalFlags::IEXTEN
                | LocalFlags::ISIG,
        );
        raw.input_flags.remove(InputFlags::ICRNL | InputFlags::IXON);
        raw.control_chars[SpecialCharacterIndices::VMIN as usize] = 1;
        raw.control_chars[SpecialCharacterIndices::VTIME as usize] = 0;
        tcsetattr(std::io::stdin(), SetArg::TCSANOW, &raw)?;

        tracing::debug!("console switched to raw mode");
        Ok(Some(Self { saved }))
    }
}

#[cfg(unix)]
impl Drop for RawModeGuard {
    fn drop(&mut self) {
        use nix::sys::termios::{tcsetattr, SetArg};

        if let Err(e) = tcsetattr(std::io::stdin(), SetArg::TCSANOW, &self.saved) {
            tracing::warn!("Unable to restore console settings: {}", e);
        }
    }
}

/// No line discipline to change on this platform
#[cfg(not(unix))]
pub struct RawModeGuard;

#[cfg(not(unix))]
impl RawModeGuard {
    /// Always `Ok(None)`
    pub fn enable_stdin() -> std::io::Result<Option<Self>> {
        Ok(None)
    }
}
