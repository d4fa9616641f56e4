//! Accumulates channel payloads until a consumer takes them.
//!
//! A consumer callback may take only part of the available data (say, the
//! complete lines of a text stream).  Whatever it leaves is kept and handed
//! back, joined with the next payload, on the following call.

use bridgemux_core::Payload;

/// Receives the joined buffered data and returns how many bytes it consumed.
pub type BufferCallback = Box<dyn FnMut(&Payload) -> usize + Send>;

/// Buffered payloads of one channel.
pub struct ChannelBuffer {
    binary: bool,
    chunks: Vec<Payload>,
    callback: Option<BufferCallback>,
}

impl std::fmt::Debug for ChannelBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelBuffer")
            .field("binary", &self.binary)
            .field("len", &self.len())
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

impl ChannelBuffer {
    pub fn new(binary: bool) -> Self {
        Self {
            binary,
            chunks: Vec::new(),
            callback: None,
        }
    }

    /// Installs the consumer and offers it whatever is already buffered.
    pub fn set_callback(&mut self, callback: BufferCallback) {
        self.callback = Some(callback);
        self.flush();
    }

    /// Appends a payload and offers the joined data to the consumer.
    pub fn push(&mut self, payload: Payload) {
        self.chunks.push(payload);
        self.flush();
    }

    /// All buffered data joined, without consuming it.
    pub fn squash(&self) -> Payload {
        join(&self.chunks, self.binary)
    }

    /// All buffered data joined; the buffer is left empty.
    pub fn take(&mut self) -> Payload {
        let joined = self.squash();
        self.chunks.clear();
        joined
    }

    /// Buffered size in bytes.
    pub fn len(&self) -> usize {
        self.chunks.iter().map(Payload::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn flush(&mut self) {
        let Some(callback) = self.callback.as_mut() else {
            return;
        };
        let block = join(&self.chunks, self.binary);
        if block.is_empty() {
            return;
        }

        let consumed = callback(&block);
        self.chunks.clear();
        if consumed >= block.len() {
            return;
        }
        let rest = if consumed == 0 { block } else { tail(block, consumed) };
        if !rest.is_empty() {
            self.chunks.push(rest);
        }
    }
}

/// Concatenates payloads; in text mode binary chunks are decoded lossily.
fn join(chunks: &[Payload], binary: bool) -> Payload {
    if binary {
        let mut bytes = Vec::with_capacity(chunks.iter().map(Payload::len).sum());
        for chunk in chunks {
            bytes.extend_from_slice(chunk.as_bytes());
        }
        Payload::Binary(bytes)
    } else {
        let mut text = String::new();
        for chunk in chunks {
            match chunk {
                Payload::Text(s) => text.push_str(s),
                Payload::Binary(b) => text.push_str(&String::from_utf8_lossy(b)),
            }
        }
        Payload::Text(text)
    }
}

/// Drops the first `consumed` bytes.  Text is cut at the nearest character
/// boundary at or before `consumed`.
fn tail(block: Payload, consumed: usize) -> Payload {
    match block {
        Payload::Binary(mut bytes) => Payload::Binary(bytes.split_off(consumed)),
        Payload::Text(mut text) => {
            let mut at = consumed;
            while !text.is_char_boundary(at) {
                at -= 1;
            }
            Payload::Text(text.split_off(at))
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
