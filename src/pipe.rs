use std::fmt;
use std::io::{self, Read, Write};
use std::sync::{Arc, Condvar, Mutex};

/// Creates a synchronous in-memory pipe.
///
/// There is no buffer: each write rendezvouses with a read and
/// completes only once a reader has taken bytes from it. One exchange
/// per call - a write may transfer fewer bytes than offered, per the
/// usual `io::Write` contract.
///
/// Closing the writer (or dropping it) gives readers end-of-stream
/// (`Ok(0)`); closing the reader gives writers `ErrorKind::BrokenPipe`.
pub fn pipe() -> (PipeReader, PipeWriter) {
    let shared = Arc::new(Shared {
        state: Mutex::new(State {
            offer: Vec::new(),
            offered: false,
            taken: 0,
            done: false,
            read_closed: false,
            write_closed: false,
        }),
        cond: Condvar::new(),
    });
    (
        PipeReader {
            shared: Arc::clone(&shared),
        },
        PipeWriter { shared },
    )
}

struct State {
    /// Bytes the parked writer is offering.
    offer: Vec<u8>,
    /// A writer is mid-exchange.
    offered: bool,
    /// Bytes the reader took from the current offer.
    taken: usize,
    /// The reader has consumed from the current offer.
    done: bool,
    read_closed: bool,
    write_closed: bool,
}

struct Shared {
    state: Mutex<State>,
    cond: Condvar,
}

/// Read half of a [`pipe`]. End-of-stream after the writer closes.
pub struct PipeReader {
    shared: Arc<Shared>,
}

/// Write half of a [`pipe`]. Blocks until a reader takes the bytes.
pub struct PipeWriter {
    shared: Arc<Shared>,
}

impl PipeReader {
    /// Close the read half. Parked and future writers fail with
    /// `BrokenPipe`. Idempotent.
    pub fn close(&self) {
        let mut state = self.shared.state.lock().unwrap();
        state.read_closed = true;
        self.shared.cond.notify_all();
    }
}

impl PipeWriter {
    /// Close the write half. Readers see end-of-stream. Idempotent.
    pub fn close(&self) {
        let mut state = self.shared.state.lock().unwrap();
        state.write_closed = true;
        self.shared.cond.notify_all();
    }
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut state = self.shared.state.lock().unwrap();
        loop {
            if state.offered && !state.done {
                let n = buf.len().min(state.offer.len());
                buf[..n].copy_from_slice(&state.offer[..n]);
                state.taken = n;
                state.done = true;
                self.shared.cond.notify_all();
                return Ok(n);
            }
            if state.write_closed {
                return Ok(0);
            }
            if state.read_closed {
                return Err(closed_pipe());
            }
            state = self.shared.cond.wait(state).unwrap();
        }
    }
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut state = self.shared.state.lock().unwrap();

        // One offer at a time; queue behind an exchange in progress.
        loop {
            if state.read_closed || state.write_closed {
                return Err(closed_pipe());
            }
            if !state.offered {
                break;
            }
            state = self.shared.cond.wait(state).unwrap();
        }

        state.offer.clear();
        state.offer.extend_from_slice(buf);
        state.offered = true;
        state.taken = 0;
        state.done = false;
        self.shared.cond.notify_all();

        // Park until a reader takes from the offer.
        loop {
            if state.done {
                let n = state.taken;
                state.offered = false;
                state.done = false;
                state.offer.clear();
                self.shared.cond.notify_all();
                return Ok(n);
            }
            if state.read_closed {
                // Withdraw the offer; nobody is left to take it.
                state.offered = false;
                state.offer.clear();
                self.shared.cond.notify_all();
                return Err(closed_pipe());
            }
            state = self.shared.cond.wait(state).unwrap();
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        // Nothing is buffered: every write already rendezvoused.
        Ok(())
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        self.close();
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for PipeReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipeReader").finish_non_exhaustive()
    }
}

impl fmt::Debug for PipeWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipeWriter").finish_non_exhaustive()
    }
}

fn closed_pipe() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "pipe is closed")
}
