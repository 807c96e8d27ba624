//! Sudo password injection
//!
//! Commands run as `sudo -p <sentinel> -S <cmd>`. The output stream is
//! scanned for the sentinel prompt; the first sighting answers it with the
//! password on stdin, and every sighting is stripped from what the caller
//! sees. Chunks may split the sentinel, so a possible prefix is held back
//! until the next chunk decides it.

/// Prompt sudo is told to print
pub const SUDO_PROMPT: &str = "sudo_password";

/// Wrap a command so sudo reads its password from stdin
pub fn sudo_command(cmd: &str) -> String {
    format!("sudo -p {SUDO_PROMPT} -S {cmd}")
}

/// Streaming output filter for sudo commands
pub struct SudoFilter {
    password: Option<String>,
    pending: Vec<u8>,
}

impl SudoFilter {
    pub fn new(password: &str) -> Self {
        Self {
            password: Some(password.to_string()),
            pending: Vec::new(),
        }
    }

    /// Feed one output chunk.
    ///
    /// Appends what is safe to show to `out` and returns the stdin reply the
    /// first time the prompt is seen.
    pub fn feed(&mut self, chunk: &[u8], out: &mut Vec<u8>) -> Option<Vec<u8>> {
        // the tty echoes a bare newline after the password
        if matches!(chunk, b"\r\n" | b"\n" | b"\r") {
            return None;
        }

        self.pending.extend_from_slice(chunk);
        let prompt = SUDO_PROMPT.as_bytes();
        let mut reply = None;

        while let Some(pos) = find(&self.pending, prompt) {
            out.extend_from_slice(&self.pending[..pos]);
            self.pending.drain(..pos + prompt.len());
            if let Some(password) = self.password.take() {
                reply = Some(format!("{password}\n").into_bytes());
            }
        }

        let keep = partial_prefix_len(&self.pending, prompt);
        let emit = self.pending.len() - keep;
        out.extend(self.pending.drain(..emit));
        reply
    }

    /// Flush whatever was held back
    pub fn finish(&mut self, out: &mut Vec<u8>) {
        out.append(&mut self.pending);
    }

    /// Whether the password has been sent
    pub fn answered(&self) -> bool {
        self.password.is_none()
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Length of the longest suffix of `buf` that starts `prompt`
fn partial_prefix_len(buf: &[u8], prompt: &[u8]) -> usize {
    let max = buf.len().min(prompt.len() - 1);
    (1..=max)
        .rev()
        .find(|&n| buf[buf.len() - n..] == prompt[..n])
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(chunks: &[&[u8]]) -> (String, Vec<Vec<u8>>) {
        let mut filter = SudoFilter::new("pw");
        let mut out = Vec::new();
        let mut replies = Vec::new();
        for chunk in chunks {
            if let Some(r) = filter.feed(chunk, &mut out) {
                replies.push(r);
            }
        }
        filter.finish(&mut out);
        (String::from_utf8(out).unwrap(), replies)
    }

    #[test]
    fn test_command_shape() {
        assert_eq!(sudo_command("id -u"), "sudo -p sudo_password -S id -u");
    }

    #[test]
    fn test_prompt_stripped_and_answered_once() {
        let (out, replies) = run(&[b"sudo_password", b"\r\n", b"0\r\n"]);
        assert_eq!(out, "0\r\n");
        assert_eq!(replies, vec![b"pw\n".to_vec()]);
    }

    #[test]
    fn test_prompt_split_across_chunks() {
        let (out, replies) = run(&[b"before sudo_pa", b"ssword", b"after"]);
        assert_eq!(out, "before after");
        assert_eq!(replies.len(), 1);
    }

    #[test]
    fn test_reprompt_is_stripped_but_not_answered() {
        let (out, replies) = run(&[b"sudo_password", b"Sorry, try again.\nsudo_password"]);
        assert_eq!(out, "Sorry, try again.\n");
        assert_eq!(replies.len(), 1);
    }

    #[test]
    fn test_trailing_prefix_flushed_on_finish() {
        let (out, replies) = run(&[b"done sudo"]);
        assert_eq!(out, "done sudo");
        assert!(replies.is_empty());
    }

    #[test]
    fn test_plain_output_passes_through() {
        let (out, _) = run(&[b"line one\n", b"line two\n"]);
        assert_eq!(out, "line one\nline two\n");
    }
}
