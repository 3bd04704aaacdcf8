use std::io::BufRead;
use std::str::FromStr;

use crate::error::{IgaError, Result};

/// Whitespace-delimited token reader for the kernel's text formats.
///
/// Skips `#` comments to end of line. Every `next_*` method fails with
/// [`IgaError::Parse`] on EOF or on a token of the wrong shape, so callers
/// can propagate with `?` and keep the happy path linear.
pub struct TextReader<R> {
    src: R,
    peeked: Option<String>,
}

impl<R: BufRead> TextReader<R> {
    pub fn new(src: R) -> Self {
        Self { src, peeked: None }
    }

    fn read_token(&mut self) -> Result<Option<String>> {
        let mut tok = String::new();
        let mut in_comment = false;
        loop {
            let buf = self.src.fill_buf()?;
            if buf.is_empty() {
                break;
            }
            let mut used = 0;
            for &b in buf {
                let c = b as char;
                used += 1;
                if in_comment {
                    if c == '\n' {
                        in_comment = false;
                    }
                    continue;
                }
                if c == '#' {
                    if !tok.is_empty() {
                        self.src.consume(used);
                        return Ok(Some(tok));
                    }
                    in_comment = true;
                    continue;
                }
                if c.is_whitespace() {
                    if !tok.is_empty() {
                        self.src.consume(used);
                        return Ok(Some(tok));
                    }
                    continue;
                }
                tok.push(c);
            }
            self.src.consume(used);
        }
        if tok.is_empty() {
            Ok(None)
        } else {
            Ok(Some(tok))
        }
    }

    /// Next token, or a parse error at end of input.
    pub fn token(&mut self) -> Result<String> {
        if let Some(t) = self.peeked.take() {
            return Ok(t);
        }
        self.read_token()?
            .ok_or_else(|| IgaError::Parse("unexpected end of input".into()))
    }

    /// Look at the next token without consuming it. `None` at end of input.
    pub fn peek(&mut self) -> Result<Option<&str>> {
        if self.peeked.is_none() {
            self.peeked = self.read_token()?;
        }
        Ok(self.peeked.as_deref())
    }

    /// Consume the next token and check it equals `word`.
    pub fn expect(&mut self, word: &str) -> Result<()> {
        let t = self.token()?;
        if t == word {
            Ok(())
        } else {
            Err(IgaError::Parse(format!("expected '{word}', found '{t}'")))
        }
    }

    fn parse<T: FromStr>(&mut self, what: &str) -> Result<T> {
        let t = self.token()?;
        t.parse()
            .map_err(|_| IgaError::Parse(format!("expected {what}, found '{t}'")))
    }

    pub fn usize(&mut self) -> Result<usize> {
        self.parse("a non-negative integer")
    }

    pub fn isize(&mut self) -> Result<isize> {
        self.parse("an integer")
    }

    pub fn f64(&mut self) -> Result<f64> {
        self.parse("a number")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizes_and_skips_comments() {
        let text = "alpha 3 # trailing comment\n# full line\n 2.5\tbeta";
        let mut r = TextReader::new(text.as_bytes());
        assert_eq!(r.token().unwrap(), "alpha");
        assert_eq!(r.usize().unwrap(), 3);
        assert_eq!(r.f64().unwrap(), 2.5);
        assert_eq!(r.peek().unwrap(), Some("beta"));
        assert_eq!(r.token().unwrap(), "beta");
        assert!(r.peek().unwrap().is_none());
        assert!(r.token().is_err());
    }

    #[test]
    fn expect_reports_mismatch() {
        let mut r = TextReader::new("dimension".as_bytes());
        let err = r.expect("knotvectors").unwrap_err();
        assert!(matches!(err, IgaError::Parse(_)));
    }
}
