use parking_lot::Mutex;

/// Append-only byte buffer shared between a pipe reader and its consumers
///
/// Bytes beyond `limit` are dropped and the buffer is marked truncated. A single
/// read cursor serves incremental polling: each delta starts where the previous
/// one ended, so consecutive deltas concatenate to the full output.
pub struct OutputBuffer {
    inner: Mutex<OutputState>,
}

struct OutputState {
    bytes: Vec<u8>,
    cursor: usize,
    limit: usize,
    truncated: bool,
}

impl OutputBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            inner: Mutex::new(OutputState {
                bytes: Vec::new(),
                cursor: 0,
                limit,
                truncated: false,
            }),
        }
    }

    /// Appends as much of `chunk` as the limit allows
    pub fn append(&self, chunk: &[u8]) {
        let mut state = self.inner.lock();
        let room = state.limit.saturating_sub(state.bytes.len());
        if chunk.len() > room {
            state.truncated = true;
        }
        let accepted = chunk.len().min(room);
        state.bytes.extend_from_slice(&chunk[..accepted]);
    }

    /// Appends text produced by the judge itself (diagnostics, notices)
    pub fn append_str(&self, text: &str) {
        self.append(text.as_bytes());
    }

    pub fn len(&self) -> usize {
        self.inner.lock().bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_truncated(&self) -> bool {
        self.inner.lock().truncated
    }

    /// Whole buffer, lossily decoded; does not move the cursor
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.inner.lock().bytes).into_owned()
    }

    /// Everything appended since the previous call.
    ///
    /// Unless `complete` is set, a multi-byte character whose tail has not
    /// arrived yet is held back for the next delta.
    pub fn read_delta(&self, complete: bool) -> String {
        let mut state = self.inner.lock();
        let pending = &state.bytes[state.cursor..];
        let take = if complete {
            pending.len()
        } else {
            pending.len() - incomplete_tail(pending)
        };
        let delta = String::from_utf8_lossy(&pending[..take]).into_owned();
        state.cursor += take;
        delta
    }
}

/// Length of a trailing UTF-8 sequence that is not complete yet
fn incomplete_tail(bytes: &[u8]) -> usize {
    for back in 1..=bytes.len().min(3) {
        let byte = bytes[bytes.len() - back];
        if byte & 0b1100_0000 == 0b1000_0000 {
            continue; // continuation byte
        }
        let width = match byte {
            0xF0.. => 4,
            0xE0.. => 3,
            0xC0.. => 2,
            _ => 1,
        };
        return if width > back { back } else { 0 };
    }
    0
}
