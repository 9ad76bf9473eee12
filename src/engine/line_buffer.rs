use bytes::{Buf, BytesMut};

/// Splits arbitrarily sized output chunks into complete lines. A trailing
/// partial line is held until more data arrives or [`LineBuffer::finish`].
#[derive(Debug, Default)]
pub(crate) struct LineBuffer {
    pending: BytesMut,
}

impl LineBuffer {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line = self.pending.split_to(pos + 1);
            lines.push(decode(&line[..pos]));
        }
        lines
    }

    /// Flush the held partial line, if any.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = self.pending.split();
        let line = decode(rest.chunk());
        Some(line)
    }
}

fn decode(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}
