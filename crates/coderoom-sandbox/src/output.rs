//! Captured console output with a byte cap.

/// Lines captured from a run. Every line costs its UTF-8 length plus one
/// byte for the newline; once the cap is hit the last line is cut so the
/// total lands on the cap and no further output is accepted.
#[derive(Debug)]
pub struct OutputBuffer {
    lines: Vec<String>,
    used: usize,
    cap: usize,
    truncated: bool,
}

impl OutputBuffer {
    pub fn new(cap: usize) -> Self {
        Self {
            lines: Vec::new(),
            used: 0,
            cap,
            truncated: false,
        }
    }

    /// Append a line; `false` once the cap is reached and the run must stop.
    pub fn push(&mut self, line: String) -> bool {
        if self.truncated {
            return false;
        }
        let cost = line.len() + 1;
        if self.used + cost <= self.cap {
            self.used += cost;
            self.lines.push(line);
            return true;
        }

        self.truncated = true;
        let remaining = self.cap - self.used;
        if remaining > 0 {
            let mut end = remaining - 1;
            while !line.is_char_boundary(end) {
                end -= 1;
            }
            self.used += end + 1;
            self.lines.push(line[..end].to_string());
        }
        false
    }

    /// Append a notice outside the cap.
    pub fn notice(&mut self, line: String) {
        self.lines.push(line);
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub fn into_lines(self) -> Vec<String> {
        self.lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lines_within_cap() {
        let mut out = OutputBuffer::new(10);
        assert!(out.push("abc".into()));
        assert!(out.push("defgh".into()));
        assert_eq!(out.used(), 10);
        assert!(!out.is_truncated());
    }

    #[test]
    fn test_last_line_is_cut_to_cap() {
        let mut out = OutputBuffer::new(10);
        assert!(out.push("abcd".into()));
        assert!(!out.push("0123456789".into()));
        assert!(out.is_truncated());
        assert_eq!(out.used(), 10);
        assert_eq!(out.into_lines(), vec!["abcd".to_string(), "0123".into()]);
    }

    #[test]
    fn test_multibyte_cut_stays_on_boundary() {
        let mut out = OutputBuffer::new(4);
        assert!(!out.push("ééé".into()));
        assert_eq!(out.into_lines(), vec!["é".to_string()]);
    }

    #[test]
    fn test_notice_bypasses_cap() {
        let mut out = OutputBuffer::new(2);
        assert!(!out.push("long line".into()));
        out.notice("[Error] boom".into());
        assert_eq!(out.used(), 2);
        assert_eq!(out.into_lines().len(), 2);
    }
}
