//! Split a dump into statements.
//!
//! A statement ends at a `;` immediately followed by a newline, or at a `;`
//! that ends the stream. A `;` followed by anything else (inside a routine
//! body, a string literal) does not end the statement.
//!
//! Whatever follows the last statement is returned as a final statement only
//! if it carries something other than whitespace, `--` comment lines or NUL
//! bytes. That is how the push filler and terminator are dropped.

use tokio::io::{AsyncBufRead, AsyncBufReadExt};

const TERMINATOR: u8 = b';';

pub struct StatementReader<R> {
    inner: R,
    buf: Vec<u8>,
    statements: u64,
}

impl<R: AsyncBufRead + Unpin> StatementReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: Vec::new(),
            statements: 0,
        }
    }

    /// Statements returned so far.
    pub fn statements(&self) -> u64 {
        self.statements
    }

    /// Next statement including its `;`, leading whitespace trimmed.
    pub async fn next_statement(&mut self) -> std::io::Result<Option<Vec<u8>>> {
        loop {
            let n = self.inner.read_until(TERMINATOR, &mut self.buf).await?;
            if n == 0 {
                return Ok(self.finish());
            }
            if self.buf.last() != Some(&TERMINATOR) {
                // Stream ended mid-statement; the next read returns 0.
                continue;
            }

            let next = self.inner.fill_buf().await?;
            match next.first() {
                Some(b'\n') => {
                    self.inner.consume(1);
                    return Ok(Some(self.take()));
                }
                None => return Ok(Some(self.take())),
                Some(_) => continue,
            }
        }
    }

    fn take(&mut self) -> Vec<u8> {
        let start = self
            .buf
            .iter()
            .position(|b| !b.is_ascii_whitespace())
            .unwrap_or(self.buf.len());
        let statement = self.buf.split_off(start);
        self.buf.clear();
        self.statements += 1;
        statement
    }

    fn finish(&mut self) -> Option<Vec<u8>> {
        if self.buf.is_empty() {
            return None;
        }
        if is_trailing_noise(&self.buf) {
            tracing::trace!("Discarding {} trailing bytes after last statement", self.buf.len());
            self.buf.clear();
            return None;
        }
        Some(self.take())
    }
}

fn is_trailing_noise(rest: &[u8]) -> bool {
    rest.split(|&b| b == b'\n').all(|line| {
        let line = trim(line);
        line.is_empty() || line.starts_with(b"--")
    })
}

fn trim(line: &[u8]) -> &[u8] {
    let noise = |b: &u8| b.is_ascii_whitespace() || *b == 0;
    let start = line.iter().position(|b| !noise(b)).unwrap_or(line.len());
    let end = line.iter().rposition(|b| !noise(b)).map_or(start, |i| i + 1);
    &line[start..end]
}
