//! Interactive console input for HTIF getchar.
//!
//! There is no reader thread: input only moves when the machine's run loop
//! polls at its host-poll cadence, so the interpreter never races the TTY
//! and never blocks on it. A zero-timeout `select` checks stdin for
//! readiness and a buffered read drains whatever is available.

/// Raw-mode TTY guard with synchronous, non-blocking input polling.
///
/// Construction switches stdin to raw input (echo, canonical mode and
/// signal keys off, output processing left intact); dropping the guard
/// restores the original settings on every exit path.
pub struct Console {
    original_termios: Option<libc::termios>,
    buf: [u8; 64],
    buf_pos: usize,
    buf_len: usize,
    /// stdin reached end of file; one EOT byte was delivered to the guest.
    eof: bool,
}

impl Console {
    pub fn new() -> Self {
        let mut original_termios = None;
        if unsafe { libc::isatty(libc::STDIN_FILENO) } == 1 {
            let mut tty: libc::termios = unsafe { std::mem::zeroed() };
            if unsafe { libc::tcgetattr(libc::STDIN_FILENO, &mut tty) } == 0 {
                original_termios = Some(tty);
                let mut raw = tty;
                raw.c_lflag &= !(libc::ECHO
                    | libc::ECHONL
                    | libc::ICANON
                    | libc::ISIG
                    | libc::IEXTEN);
                raw.c_iflag &= !(libc::IGNBRK
                    | libc::BRKINT
                    | libc::PARMRK
                    | libc::ICRNL
                    | libc::ISTRIP
                    | libc::INLCR
                    | libc::IGNCR
                    | libc::IXON);
                // Output processing stays on so guest newlines still return
                // the cursor to column zero.
                raw.c_oflag |= libc::OPOST;
                raw.c_cflag &= !(libc::CSIZE | libc::PARENB);
                raw.c_cflag |= libc::CS8;
                // Reads return immediately with whatever is pending.
                raw.c_cc[libc::VMIN] = 0;
                raw.c_cc[libc::VTIME] = 0;
                unsafe {
                    libc::tcsetattr(libc::STDIN_FILENO, libc::TCSANOW, &raw);
                }
            }
        }
        Console { original_termios, buf: [0; 64], buf_pos: 0, buf_len: 0, eof: false }
    }

    /// Next queued input byte, if any. Never blocks.
    pub fn poll(&mut self) -> Option<u8> {
        if self.buf_pos >= self.buf_len {
            self.refill();
        }
        if self.buf_pos < self.buf_len {
            let byte = self.buf[self.buf_pos];
            self.buf_pos += 1;
            Some(byte)
        } else {
            None
        }
    }

    /// Refill the input buffer from stdin if data is ready right now.
    fn refill(&mut self) {
        self.buf_pos = 0;
        self.buf_len = 0;
        if self.eof {
            return;
        }
        unsafe {
            let mut rfds: libc::fd_set = std::mem::zeroed();
            libc::FD_ZERO(&mut rfds);
            libc::FD_SET(libc::STDIN_FILENO, &mut rfds);
            let mut tv = libc::timeval { tv_sec: 0, tv_usec: 0 };
            let ready = libc::select(
                libc::STDIN_FILENO + 1,
                &mut rfds,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                &mut tv,
            );
            if ready <= 0 || !libc::FD_ISSET(libc::STDIN_FILENO, &rfds) {
                return;
            }
            let n = libc::read(
                libc::STDIN_FILENO,
                self.buf.as_mut_ptr() as *mut libc::c_void,
                self.buf.len(),
            );
            if n > 0 {
                self.buf_len = n as usize;
            } else {
                // Closed stdin surfaces to the guest as a single EOT.
                self.buf[0] = 0x04;
                self.buf_len = 1;
                self.eof = true;
            }
        }
    }
}

impl Default for Console {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Console {
    fn drop(&mut self) {
        if let Some(termios) = self.original_termios {
            unsafe {
                libc::tcsetattr(libc::STDIN_FILENO, libc::TCSANOW, &termios);
            }
        }
    }
}
