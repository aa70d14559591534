/// Incremental parser for the `text/event-stream` payloads the generation
/// endpoint emits: `data:` lines, events delimited by blank lines, CRLF
/// tolerated. Fields other than `data` are ignored.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
    data: String,
    has_data: bool,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one chunk of the byte stream (already UTF-8 decoded) and returns
    /// every complete event payload it closed.
    pub fn feed(&mut self, chunk: &str) -> Vec<String> {
        self.buffer.push_str(chunk);
        let mut payloads = Vec::new();
        let mut buffer = std::mem::take(&mut self.buffer);
        let mut start = 0usize;

        while let Some(rel) = buffer[start..].find('\n') {
            let line_end = start + rel;
            let line = buffer[start..line_end].trim_end_matches('\r');

            if line.is_empty() {
                if self.has_data {
                    // Multi-line data joins with newlines; drop the last one.
                    if self.data.ends_with('\n') {
                        self.data.pop();
                    }
                    payloads.push(std::mem::take(&mut self.data));
                    self.has_data = false;
                }
            } else {
                self.process_line(line);
            }

            start = line_end + 1;
        }

        if start > 0 {
            buffer.drain(..start);
        }
        self.buffer = buffer;
        payloads
    }

    /// Closes the event still buffered when the stream ends without a
    /// trailing blank line.
    pub fn flush(&mut self) -> Option<String> {
        if !self.buffer.is_empty() {
            let line = std::mem::take(&mut self.buffer);
            self.process_line(line.trim_end_matches('\r'));
        }

        if self.has_data {
            if self.data.ends_with('\n') {
                self.data.pop();
            }
            self.has_data = false;
            Some(std::mem::take(&mut self.data))
        } else {
            None
        }
    }

    fn process_line(&mut self, line: &str) {
        if line.starts_with(':') {
            return;
        }
        let Some((field, value)) = line.split_once(':') else {
            return;
        };
        if field != "data" {
            return;
        }
        let value = value.strip_prefix(' ').unwrap_or(value);
        self.data.push_str(value);
        self.data.push('\n');
        self.has_data = true;
    }
}
