//! Terminal progress display and cancel-key polling.

use faceid_core::session::NO_DISTANCE;
use faceid_core::{FaceBox, Feedback};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::termios::{self, LocalFlags, SetArg, SpecialCharacterIndices, Termios};
use nix::unistd;
use std::io::{IsTerminal, Write};
use std::os::fd::{AsFd, BorrowedFd};
use std::time::Duration;

/// Puts stdin into non-canonical, no-echo mode so single key presses are
/// readable. The previous settings are restored on drop.
struct RawMode {
    original: Termios,
}

impl RawMode {
    fn enable() -> Option<Self> {
        let stdin = std::io::stdin();
        if !stdin.is_terminal() {
            return None;
        }

        let original = match termios::tcgetattr(&stdin) {
            Ok(t) => t,
            Err(err) => {
                tracing::warn!(error = %err, "cannot read terminal settings; cancel key needs Enter");
                return None;
            }
        };

        let mut raw = original.clone();
        raw.local_flags.remove(LocalFlags::ICANON | LocalFlags::ECHO);
        raw.control_chars[SpecialCharacterIndices::VMIN as usize] = 0;
        raw.control_chars[SpecialCharacterIndices::VTIME as usize] = 0;

        if let Err(err) = termios::tcsetattr(&stdin, SetArg::TCSANOW, &raw) {
            tracing::warn!(error = %err, "cannot switch terminal to raw mode; cancel key needs Enter");
            return None;
        }
        Some(Self { original })
    }
}

impl Drop for RawMode {
    fn drop(&mut self) {
        if let Err(err) = termios::tcsetattr(std::io::stdin(), SetArg::TCSANOW, &self.original) {
            tracing::warn!(error = %err, "failed to restore terminal settings");
        }
    }
}

/// [`Feedback`] implementation that draws a single status line on stderr and
/// reads the cancel key from stdin.
pub struct TerminalFeedback {
    _raw: Option<RawMode>,
    stdin_open: bool,
    last_line: String,
}

impl TerminalFeedback {
    pub fn new() -> Self {
        Self {
            _raw: RawMode::enable(),
            stdin_open: true,
            last_line: String::new(),
        }
    }

    fn draw(&mut self, line: String) {
        if line == self.last_line {
            return;
        }
        let mut err = std::io::stderr().lock();
        // Status output is best effort.
        let _ = write!(err, "\r\x1b[K{line}");
        let _ = err.flush();
        self.last_line = line;
    }

    fn read_key(&mut self, timeout: Duration) -> Option<u8> {
        match read_byte(std::io::stdin().as_fd(), timeout) {
            KeyRead::Key(byte) => Some(byte),
            KeyRead::Idle => None,
            KeyRead::Closed => {
                tracing::debug!("stdin closed; cancel key disabled");
                self.stdin_open = false;
                None
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyRead {
    Key(u8),
    /// Nothing pending, or a transient error.
    Idle,
    /// End of file.
    Closed,
}

/// Wait up to `timeout` for one byte on `fd`.
///
/// Reads the fd directly so no bytes get stuck in std's stdin buffer.
fn read_byte(fd: BorrowedFd<'_>, timeout: Duration) -> KeyRead {
    let timeout = u16::try_from(timeout.as_millis())
        .map(PollTimeout::from)
        .unwrap_or(PollTimeout::MAX);

    let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
    match poll(&mut fds, timeout) {
        Ok(ready) if ready > 0 => {}
        Ok(_) => return KeyRead::Idle,
        Err(err) => {
            tracing::debug!(error = %err, "stdin poll failed");
            return KeyRead::Idle;
        }
    }

    let mut byte = [0u8; 1];
    match unistd::read(fd, &mut byte) {
        Ok(0) => KeyRead::Closed,
        Ok(_) => KeyRead::Key(byte[0]),
        Err(err) => {
            tracing::debug!(error = %err, "stdin read failed");
            KeyRead::Idle
        }
    }
}

impl Default for TerminalFeedback {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TerminalFeedback {
    fn drop(&mut self) {
        if !self.last_line.is_empty() {
            eprintln!();
        }
    }
}

impl Feedback for TerminalFeedback {
    fn show_enroll_progress(&mut self, face: Option<&FaceBox>, captured: usize, target: usize) {
        self.draw(enroll_line(face, captured, target));
    }

    fn show_lock_progress(
        &mut self,
        face: Option<&FaceBox>,
        streak: usize,
        required: usize,
        last_distance: f32,
    ) {
        self.draw(lock_line(face, streak, required, last_distance));
    }

    fn poll_key(&mut self, timeout: Duration) -> Option<char> {
        if !self.stdin_open {
            return None;
        }
        self.read_key(timeout).map(char::from)
    }
}

fn face_marker(face: Option<&FaceBox>) -> String {
    match face {
        Some(f) => format!("face {}x{} @ ({}, {})", f.w, f.h, f.x, f.y),
        None => "no face".to_string(),
    }
}

fn enroll_line(face: Option<&FaceBox>, captured: usize, target: usize) -> String {
    format!(
        "Enroll: look at camera ({captured}/{target})  [{}]  press Q to quit",
        face_marker(face)
    )
}

fn lock_line(face: Option<&FaceBox>, streak: usize, required: usize, last_distance: f32) -> String {
    let dist = if last_distance >= NO_DISTANCE {
        "--".to_string()
    } else {
        format!("{last_distance:.4}")
    };
    format!(
        "LOCKED  match streak: {streak}/{required}  dist={dist}  [{}]  press Q to quit",
        face_marker(face)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enroll_line() {
        let face = FaceBox { x: 12, y: 34, w: 100, h: 120, score: 0.9 };
        assert_eq!(
            enroll_line(Some(&face), 3, 20),
            "Enroll: look at camera (3/20)  [face 100x120 @ (12, 34)]  press Q to quit"
        );
    }

    #[test]
    fn test_lock_line_without_comparison() {
        let line = lock_line(None, 0, 8, NO_DISTANCE);
        assert_eq!(line, "LOCKED  match streak: 0/8  dist=--  [no face]  press Q to quit");
    }

    #[test]
    fn test_lock_line_with_distance() {
        let face = FaceBox { x: 0, y: 0, w: 50, h: 60, score: 0.7 };
        let line = lock_line(Some(&face), 5, 8, 0.123_456);
        assert!(line.starts_with("LOCKED  match streak: 5/8  dist=0.1235"), "{line}");
    }

    #[test]
    fn test_read_byte_key_idle_and_eof() {
        use std::os::unix::net::UnixStream;

        let (reader, mut writer) = UnixStream::pair().unwrap();
        let tick = Duration::from_millis(1);

        assert_eq!(read_byte(reader.as_fd(), tick), KeyRead::Idle);

        writer.write_all(b"q").unwrap();
        assert_eq!(read_byte(reader.as_fd(), Duration::from_millis(100)), KeyRead::Key(b'q'));
        assert_eq!(read_byte(reader.as_fd(), tick), KeyRead::Idle);

        drop(writer);
        assert_eq!(read_byte(reader.as_fd(), Duration::from_millis(100)), KeyRead::Closed);
    }
}
