//! Reassembly of text lines from arbitrary byte chunks.

/// Buffers raw process output and hands back complete lines.
///
/// Lines are split on `\n` with a single trailing `\r` removed, and decoded
/// lossily. Bytes after the last separator stay pending until more data
/// arrives, [`LineAssembler::take_partial_if`] releases them, or the stream
/// ends.
#[derive(Debug, Default)]
pub struct LineAssembler {
    pending: Vec<u8>,
}

impl LineAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);

        let mut lines = Vec::new();
        let mut start = 0usize;
        while let Some(offset) = self.pending[start..].iter().position(|b| *b == b'\n') {
            let end = start + offset;
            lines.push(decode_line(&self.pending[start..end]));
            start = end + 1;
        }
        self.pending.drain(..start);
        lines
    }

    pub fn partial(&self) -> String {
        decode_line(&self.pending)
    }

    /// Releases the unterminated tail as a line when `accept` says it is
    /// already complete. Prompts are written without a line terminator.
    pub fn take_partial_if(&mut self, accept: impl Fn(&str) -> bool) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let partial = self.partial();
        if !accept(&partial) {
            return None;
        }
        self.pending.clear();
        Some(partial)
    }

    /// Flushes whatever is left at end of stream.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = self.partial();
        self.pending.clear();
        Some(rest)
    }
}

fn decode_line(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joins_lines_across_chunks() {
        let mut asm = LineAssembler::new();
        assert!(asm.push(b"hel").is_empty());
        assert_eq!(asm.push(b"lo\r\nwor"), vec!["hello".to_string()]);
        assert_eq!(asm.push(b"ld\r\n\r\n"), vec!["world".to_string(), String::new()]);
        assert!(asm.finish().is_none());
    }

    #[test]
    fn crlf_split_between_chunks() {
        let mut asm = LineAssembler::new();
        assert!(asm.push(b"abc\r").is_empty());
        assert_eq!(asm.push(b"\n"), vec!["abc".to_string()]);
    }

    #[test]
    fn partial_prompt_is_released_on_request() {
        let mut asm = LineAssembler::new();
        assert_eq!(asm.push(b"2\r\nMagik> "), vec!["2".to_string()]);
        assert!(asm.take_partial_if(|p| p.starts_with("Global")).is_none());
        assert_eq!(
            asm.take_partial_if(|p| p.starts_with("Magik>")).as_deref(),
            Some("Magik> ")
        );
        assert!(asm.finish().is_none());
    }

    #[test]
    fn invalid_utf8_is_replaced_not_dropped() {
        let mut asm = LineAssembler::new();
        let lines = asm.push(b"caf\xff\n");
        assert_eq!(lines, vec!["caf\u{fffd}".to_string()]);
    }

    #[test]
    fn multibyte_character_split_across_chunks() {
        let mut asm = LineAssembler::new();
        let bytes = "né\n".as_bytes();
        assert!(asm.push(&bytes[..2]).is_empty());
        assert_eq!(asm.push(&bytes[2..]), vec!["né".to_string()]);
    }
}
