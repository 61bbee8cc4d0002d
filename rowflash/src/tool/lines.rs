//! Incremental decoding of the flashing tool's output into lines
//!
//! The tool redraws its progress indicator by emitting a carriage return
//! without a newline, so both `\r` and `\n` terminate a line here. Output
//! arrives in arbitrary chunks which may split lines as well as multi-byte
//! UTF-8 sequences.

/// How a decoded line was terminated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineEnding {
    /// `\n` or `\r\n`
    Newline,
    /// A lone `\r`: the next line overwrites this one
    CarriageReturn,
    /// The stream ended without a terminator
    EndOfStream,
}

/// A single line of tool output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub text: String,
    pub ending: LineEnding,
}

impl OutputLine {
    pub fn new(text: impl Into<String>, ending: LineEnding) -> Self {
        Self {
            text: text.into(),
            ending,
        }
    }

    /// Whether the line is redrawn in place by the line which follows it
    pub fn overwrites(&self) -> bool {
        self.ending == LineEnding::CarriageReturn
    }
}

#[derive(Debug, Default)]
struct Utf8Merger {
    incomplete_utf8_buffer: Vec<u8>,
}

impl Utf8Merger {
    fn process_utf8(&mut self, buff: &[u8]) -> String {
        let mut buffer = std::mem::take(&mut self.incomplete_utf8_buffer);
        buffer.extend_from_slice(buff);

        // Convert the longest prefix which does not end in a partial sequence;
        // invalid sequences are replaced, incomplete ones wait for more input.
        let mut len = 0;

        loop {
            match std::str::from_utf8(&buffer[len..]) {
                Ok(str) if len == 0 => return String::from(str),
                Ok(_) => return String::from_utf8_lossy(&buffer).to_string(),
                Err(e) => {
                    len += e.valid_up_to();
                    if let Some(error_len) = e.error_len() {
                        len += error_len;
                    } else {
                        let (bytes, incomplete) = buffer.split_at(len);
                        self.incomplete_utf8_buffer = incomplete.to_vec();
                        return String::from_utf8_lossy(bytes).to_string();
                    }
                }
            }
        }
    }

    fn take_remaining(&mut self) -> String {
        let rest = std::mem::take(&mut self.incomplete_utf8_buffer);
        String::from_utf8_lossy(&rest).to_string()
    }
}

/// Splits a byte stream into [OutputLine]s
#[derive(Debug, Default)]
pub struct LineDecoder {
    merger: Utf8Merger,
    fragment: String,
    // A chunk ended with `\r`; a `\n` opening the next chunk belongs to it.
    swallow_lf: bool,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode a chunk, dispatching every line completed by it
    pub fn feed(&mut self, bytes: &[u8], emit: &mut dyn FnMut(OutputLine)) {
        let text = self.merger.process_utf8(bytes);
        if text.is_empty() {
            return;
        }

        let mut chars = text.chars().peekable();
        if std::mem::take(&mut self.swallow_lf) && chars.peek() == Some(&'\n') {
            chars.next();
        }

        while let Some(c) = chars.next() {
            match c {
                '\r' => match chars.peek() {
                    Some('\n') => {
                        chars.next();
                        self.dispatch(LineEnding::Newline, emit);
                    }
                    Some(_) => self.dispatch(LineEnding::CarriageReturn, emit),
                    None => {
                        self.dispatch(LineEnding::CarriageReturn, emit);
                        self.swallow_lf = true;
                    }
                },
                '\n' => self.dispatch(LineEnding::Newline, emit),
                c => self.fragment.push(c),
            }
        }
    }

    /// Flush whatever is left once the stream has ended
    pub fn finish(&mut self, emit: &mut dyn FnMut(OutputLine)) {
        let rest = self.merger.take_remaining();
        self.fragment.push_str(&rest);
        self.swallow_lf = false;
        self.dispatch(LineEnding::EndOfStream, emit);
    }

    fn dispatch(&mut self, ending: LineEnding, emit: &mut dyn FnMut(OutputLine)) {
        let text = std::mem::take(&mut self.fragment);
        if !text.is_empty() {
            emit(OutputLine::new(text, ending));
        }
    }
}
