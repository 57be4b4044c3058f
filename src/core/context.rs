//! Shared runtime context
//!
//! Every loop and worker receives a [`RuntimeContext`] instead of reading
//! process globals. The quit flag is a [`CancellationToken`]; cloning the
//! context shares the token, and [`RuntimeContext::for_session`] derives a
//! child whose cancellation does not reach the parent.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Diagnostic verbosity, 0 (silent) through 8
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Verbosity(u8);

impl Verbosity {
    /// Nothing beyond errors
    pub const SILENT: Self = Self(0);
    /// Normal operator messages
    pub const NORMAL: Self = Self(1);
    /// Progress detail
    pub const INFORMATIVE: Self = Self(2);
    /// Traffic dumps are emitted from this level up
    pub const CHATTY: Self = Self(3);
    /// Internal state changes
    pub const GEEKY: Self = Self(4);
    /// Highest supported level
    pub const MAX: Self = Self(8);

    /// Create a verbosity level, saturating at [`Verbosity::MAX`]
    pub fn new(level: u8) -> Self {
        Self(level.min(Self::MAX.0))
    }

    /// Numeric level
    pub fn level(self) -> u8 {
        self.0
    }

    /// True when `self` is at least `other`
    pub fn at_least(self, other: Self) -> bool {
        self >= other
    }
}

/// Line ending appended to transmitted lines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LineTerminator {
    /// Carriage return only
    Cr,
    /// Line feed only
    Lf,
    /// Carriage return followed by line feed
    #[default]
    CrLf,
}

impl LineTerminator {
    /// Byte sequence written after each line
    pub fn bytes(self) -> &'static [u8] {
        match self {
            Self::Cr => b"\r",
            Self::Lf => b"\n",
            Self::CrLf => b"\r\n",
        }
    }

    /// Terminator as text, for re-terminating collected replies
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cr => "\r",
            Self::Lf => "\n",
            Self::CrLf => "\r\n",
        }
    }
}

impl std::str::FromStr for LineTerminator {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "cr" | "\r" => Ok(Self::Cr),
            "lf" | "nl" | "\n" => Ok(Self::Lf),
            "crlf" | "\r\n" => Ok(Self::CrLf),
            other => Err(format!("unknown line terminator '{other}'")),
        }
    }
}

/// How the device control lines are used between sessions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowControl {
    /// Lines left alone
    #[default]
    None,
    /// DTR and RTS asserted before traffic starts
    Lines,
}

#[derive(Debug)]
struct Flags {
    echo_enabled: AtomicBool,
}

/// Settings and flags shared by every component of one run
#[derive(Debug, Clone)]
pub struct RuntimeContext {
    verbosity: Verbosity,
    terminator: LineTerminator,
    flow_control: FlowControl,
    quiet: bool,
    quit: CancellationToken,
    flags: Arc<Flags>,
}

impl Default for RuntimeContext {
    fn default() -> Self {
        Self::new(Verbosity::default(), LineTerminator::default())
    }
}

impl RuntimeContext {
    /// Create a context with a fresh quit token
    pub fn new(verbosity: Verbosity, terminator: LineTerminator) -> Self {
        Self {
            verbosity,
            terminator,
            flow_control: FlowControl::None,
            quiet: false,
            quit: CancellationToken::new(),
            flags: Arc::new(Flags {
                echo_enabled: AtomicBool::new(true),
            }),
        }
    }

    /// Set flow control mode
    #[must_use]
    pub fn with_flow_control(mut self, flow_control: FlowControl) -> Self {
        self.flow_control = flow_control;
        self
    }

    /// Suppress operator chatter
    #[must_use]
    pub fn with_quiet(mut self, quiet: bool) -> Self {
        self.quiet = quiet;
        self
    }

    /// Context for one accepted session: child quit token, fresh flags
    pub fn for_session(&self) -> Self {
        Self {
            verbosity: self.verbosity,
            terminator: self.terminator,
            flow_control: self.flow_control,
            quiet: self.quiet,
            quit: self.quit.child_token(),
            flags: Arc::new(Flags {
                echo_enabled: AtomicBool::new(true),
            }),
        }
    }

    /// Current verbosity
    pub fn verbosity(&self) -> Verbosity {
        self.verbosity
    }

    /// Configured line terminator
    pub fn terminator(&self) -> LineTerminator {
        self.terminator
    }

    /// Configured flow control mode
    pub fn flow_control(&self) -> FlowControl {
        self.flow_control
    }

    /// Quiet mode
    pub fn is_quiet(&self) -> bool {
        self.quiet
    }

    /// Request cooperative shutdown of every loop sharing this context
    pub fn request_quit(&self) {
        self.quit.cancel();
    }

    /// True once quit was requested here or on a parent
    pub fn should_quit(&self) -> bool {
        self.quit.is_cancelled()
    }

    /// Resolves when quit is requested
    pub async fn quit_requested(&self) {
        self.quit.cancelled().await;
    }

    /// The underlying token, for workers that need their own child
    pub fn quit_token(&self) -> &CancellationToken {
        &self.quit
    }

    /// Suppress echo for the next read only
    pub fn suppress_next_echo(&self) {
        self.flags.echo_enabled.store(false, Ordering::SeqCst);
    }

    /// Consume the echo flag: returns whether echo is on for this read and
    /// re-arms it for the next one
    pub fn take_echo(&self) -> bool {
        self.flags.echo_enabled.swap(true, Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_echo_suppression_is_one_shot() {
        let ctx = RuntimeContext::default();
        assert!(ctx.take_echo());
        ctx.suppress_next_echo();
        assert!(!ctx.take_echo());
        assert!(ctx.take_echo());
    }

    #[test]
    fn test_session_quit_does_not_reach_parent() {
        let ctx = RuntimeContext::default();
        let session = ctx.for_session();
        session.request_quit();
        assert!(session.should_quit());
        assert!(!ctx.should_quit());

        let other = ctx.for_session();
        ctx.request_quit();
        assert!(other.should_quit());
    }

    #[test]
    fn test_terminator_parse() {
        assert_eq!("CR".parse::<LineTerminator>(), Ok(LineTerminator::Cr));
        assert_eq!("lf".parse::<LineTerminator>(), Ok(LineTerminator::Lf));
        assert_eq!(LineTerminator::default().bytes(), b"\r\n");
        assert!("tab".parse::<LineTerminator>().is_err());
    }

    #[test]
    fn test_verbosity_saturates() {
        assert_eq!(Verbosity::new(42), Verbosity::MAX);
        assert!(Verbosity::new(3).at_least(Verbosity::CHATTY));
        assert!(!Verbosity::NORMAL.at_least(Verbosity::CHATTY));
    }
}
