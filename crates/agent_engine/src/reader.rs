use tokio::io::{AsyncRead, AsyncReadExt};

const CHUNK_SIZE_BYTES: usize = 8192;

/// One delimited read from the subprocess stdout.
#[derive(Debug)]
pub(crate) enum BoundedLine {
    Line {
        bytes: Vec<u8>,
    },
    /// The line grew past the cap; its bytes were discarded up to the next
    /// newline (or EOF) so iteration can continue.
    TooLong {
        observed_bytes: usize,
        max_line_bytes: usize,
    },
    Io {
        error: std::io::Error,
    },
}

/// Reads newline-delimited records without ever buffering more than the cap
/// for a single line.
pub(crate) struct BoundedLineReader<R: AsyncRead + Unpin> {
    reader: R,
    max_line_bytes: usize,
    buffer: [u8; CHUNK_SIZE_BYTES],
    buffer_pos: usize,
    buffer_len: usize,
    current_line: Vec<u8>,
    observed_bytes: usize,
    discard_mode: bool,
    done: bool,
    pending_too_long: bool,
}

impl<R: AsyncRead + Unpin> BoundedLineReader<R> {
    pub(crate) fn new(reader: R, max_line_bytes: usize) -> Self {
        Self {
            reader,
            max_line_bytes,
            buffer: [0u8; CHUNK_SIZE_BYTES],
            buffer_pos: 0,
            buffer_len: 0,
            current_line: Vec::new(),
            observed_bytes: 0,
            discard_mode: false,
            done: false,
            pending_too_long: false,
        }
    }

    /// Next line, without its terminator. `None` at EOF.
    pub(crate) async fn next_line(&mut self) -> Option<BoundedLine> {
        if self.done {
            return None;
        }

        loop {
            if self.buffer_pos >= self.buffer_len {
                self.buffer_pos = 0;
                match self.reader.read(&mut self.buffer).await {
                    Ok(0) => {
                        self.done = true;
                        if self.pending_too_long || !self.current_line.is_empty() {
                            return Some(self.finish_line());
                        }
                        return None;
                    }
                    Ok(n) => self.buffer_len = n,
                    Err(error) => {
                        self.done = true;
                        return Some(BoundedLine::Io { error });
                    }
                }
            }

            let slice = &self.buffer[self.buffer_pos..self.buffer_len];
            let Some(newline_idx) = slice.iter().position(|b| *b == b'\n') else {
                let len = slice.len();
                self.observe_bytes(len);
                if !self.discard_mode {
                    let slice = &self.buffer[self.buffer_pos..self.buffer_len];
                    self.current_line.extend_from_slice(slice);
                }
                self.buffer_pos = self.buffer_len;
                continue;
            };

            self.observe_bytes(newline_idx);
            if !self.discard_mode {
                let segment = &self.buffer[self.buffer_pos..self.buffer_pos + newline_idx];
                self.current_line.extend_from_slice(segment);
            }
            self.buffer_pos = self.buffer_pos + newline_idx + 1;
            return Some(self.finish_line());
        }
    }

    fn finish_line(&mut self) -> BoundedLine {
        if self.pending_too_long {
            let observed_bytes = self.observed_bytes;
            let max_line_bytes = self.max_line_bytes;
            self.reset_line_state();
            return BoundedLine::TooLong {
                observed_bytes,
                max_line_bytes,
            };
        }

        let bytes = std::mem::take(&mut self.current_line);
        self.reset_line_state();
        BoundedLine::Line { bytes }
    }

    fn reset_line_state(&mut self) {
        self.current_line.clear();
        self.observed_bytes = 0;
        self.discard_mode = false;
        self.pending_too_long = false;
    }

    fn observe_bytes(&mut self, additional: usize) {
        self.observed_bytes = self.observed_bytes.saturating_add(additional);
        if self.observed_bytes > self.max_line_bytes && !self.discard_mode {
            self.discard_mode = true;
            self.pending_too_long = true;
            self.current_line.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn collect(data: &[u8], cap: usize) -> Vec<BoundedLine> {
        let mut reader = BoundedLineReader::new(std::io::Cursor::new(data.to_vec()), cap);
        let mut out = Vec::new();
        while let Some(line) = reader.next_line().await {
            out.push(line);
        }
        out
    }

    #[tokio::test]
    async fn splits_on_newlines_and_drops_terminators() {
        let lines = collect(b"one\ntwo\nthree\n", 64).await;
        assert_eq!(lines.len(), 3);
        match &lines[1] {
            BoundedLine::Line { bytes } => assert_eq!(bytes, b"two"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn final_unterminated_line_is_returned() {
        let lines = collect(b"one\ntail", 64).await;
        assert_eq!(lines.len(), 2);
        match &lines[1] {
            BoundedLine::Line { bytes } => assert_eq!(bytes, b"tail"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn oversized_line_is_discarded_and_iteration_continues() {
        let mut data = Vec::new();
        data.extend_from_slice(b"ok\n");
        data.extend_from_slice(&vec![b'a'; 50]);
        data.extend_from_slice(b"\nnext\n");

        let lines = collect(&data, 16).await;
        assert!(matches!(lines[0], BoundedLine::Line { .. }));
        assert!(matches!(
            lines[1],
            BoundedLine::TooLong {
                observed_bytes: 50,
                max_line_bytes: 16
            }
        ));
        assert!(matches!(lines[2], BoundedLine::Line { .. }));
    }

    #[tokio::test]
    async fn oversized_line_at_eof_is_reported() {
        let data = vec![b'a'; 50];
        let lines = collect(&data, 16).await;
        assert_eq!(lines.len(), 1);
        assert!(matches!(lines[0], BoundedLine::TooLong { .. }));
    }
}
