//! Streaming prompt detection.
//!
//! A prompt-driven server ends every response with a short fixed string. TCP
//! may split that string across any number of reads, so the detector keeps a
//! carry of at most `prompt.len()` bytes: the longest suffix of the data seen
//! so far that is also a prefix of the prompt. Those bytes are withheld from
//! the caller until the next read proves them to be either the prompt or
//! ordinary body text.
//!
//! The matcher is a plain suffix/prefix scan, `O(P²)` per read for a prompt of
//! `P` bytes; `P` is capped at [`MAX_PROMPT`].

use crate::error::{Error, Result};

use tracing::trace;

/// Longest prompt a detector accepts.
pub const MAX_PROMPT: usize = 32;

/// Outcome of one detection pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Detection {
    /// The buffer ended with the complete prompt.
    pub found: bool,
    /// Leading bytes of the buffer confirmed as body text. Never includes
    /// prompt bytes or bytes still held in the carry.
    pub visible: usize,
}

#[derive(Debug, Clone)]
pub struct PromptDetector {
    prompt: Vec<u8>,
    carry: [u8; MAX_PROMPT],
    carry_len: usize,
}

impl PromptDetector {
    /// Fails if the prompt is empty or longer than [`MAX_PROMPT`].
    pub fn new(prompt: impl AsRef<[u8]>) -> Result<Self> {
        let prompt = prompt.as_ref();

        if prompt.is_empty() || prompt.len() > MAX_PROMPT {
            return Err(Error::InvalidPrompt {
                len: prompt.len(),
                max: MAX_PROMPT,
            });
        }

        Ok(Self {
            prompt: prompt.to_vec(),
            carry: [0; MAX_PROMPT],
            carry_len: 0,
        })
    }

    pub fn prompt(&self) -> &[u8] {
        &self.prompt
    }

    pub fn prompt_len(&self) -> usize {
        self.prompt.len()
    }

    /// Bytes withheld as a possible start of the prompt.
    pub fn carry(&self) -> &[u8] {
        &self.carry[..self.carry_len]
    }

    pub fn clear_carry(&mut self) {
        self.carry_len = 0;
    }

    /// Copies the carry to the front of `buf` so the next read can be
    /// appended right after it. Returns the number of bytes written.
    ///
    /// The carry is left in place; the next [`detect`](Self::detect)
    /// replaces it.
    pub fn restore_carry(&self, buf: &mut [u8]) -> usize {
        let n = self.carry_len.min(buf.len());
        buf[..n].copy_from_slice(&self.carry[..n]);
        n
    }

    /// Classifies `buf`, which must start with the restored carry followed by
    /// freshly read bytes.
    pub fn detect(&mut self, buf: &[u8]) -> Detection {
        let n = buf.len();
        let prompt_len = self.prompt.len();
        let tail_len = n.min(prompt_len);
        let tail = &buf[n - tail_len..];

        self.carry[..tail_len].copy_from_slice(tail);

        let start = (0..tail_len)
            .find(|&i| tail[i..] == self.prompt[..tail_len - i])
            .unwrap_or(tail_len);

        if start == 0 && tail_len == prompt_len {
            self.carry_len = 0;
            trace!(target: "appframe::client", visible = n - prompt_len, "prompt matched");

            return Detection {
                found: true,
                visible: n - prompt_len,
            };
        }

        self.carry.copy_within(start..tail_len, 0);
        self.carry_len = tail_len - start;
        trace!(
            target: "appframe::client",
            visible = n - self.carry_len,
            carried = self.carry_len,
            "no prompt yet"
        );

        Detection {
            found: false,
            visible: n - self.carry_len,
        }
    }

    /// Feeds one chunk, appending confirmed body bytes to `body`.
    ///
    /// Convenience for callers that do not manage their own read buffer.
    pub fn feed(&mut self, chunk: &[u8], body: &mut Vec<u8>) -> bool {
        let mut combined = Vec::with_capacity(self.carry_len + chunk.len());
        combined.extend_from_slice(self.carry());
        combined.extend_from_slice(chunk);

        let detection = self.detect(&combined);
        body.extend_from_slice(&combined[..detection.visible]);

        detection.found
    }
}
