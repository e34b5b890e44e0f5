//! Wire format of the remote copy sink (`scp -t`).
//!
//! The sink expects one control line declaring mode, size and name, then
//! exactly `size` bytes, then a NUL. We never know the size of a live dump, so
//! we declare a ceiling and pad the real payload with a filler block the sink
//! writes out as part of the file:
//!
//! ```text
//! C0600 107374182400 orders-20240101000000.sql\n
//! <payload ...>
//! \n-- zzzzzzzzzzzzzzz ... zzzz\n        (FILLER_LEN bytes)
//! \0
//! ```
//!
//! The filler is an SQL line comment, so the restore side reads it as trailing
//! noise. It is an order of magnitude larger than the sink's copy buffer so the
//! last real chunk is always flushed to disk before the session is torn down.

use bytes::{BufMut, Bytes, BytesMut};

/// Declared transfer size: 100 GiB, larger than any dump we expect.
pub const DECLARED_SIZE: u64 = 100 * 1024 * 1024 * 1024;

/// Internal copy buffer of OpenSSH scp (`COPY_BUFLEN`).
pub const SINK_COPY_BUFLEN: usize = 16 * 1024;

/// Filler block length.
pub const FILLER_LEN: usize = SINK_COPY_BUFLEN * 10;

/// End-of-file marker of the control protocol.
pub const TERMINATOR: u8 = 0;

/// Control line announcing a file: `C<mode> <size> <name>\n`.
pub fn file_header(mode: u32, size: u64, filename: &str) -> String {
    format!("C{:04o} {} {}\n", mode & 0o7777, size, filename)
}

/// Parse a control line back into `(mode, size, filename)`.
pub fn parse_file_header(line: &str) -> Option<(u32, u64, String)> {
    let line = line.strip_suffix('\n').unwrap_or(line);
    let rest = line.strip_prefix('C')?;
    let mut parts = rest.splitn(3, ' ');
    let mode = u32::from_str_radix(parts.next()?, 8).ok()?;
    let size = parts.next()?.parse().ok()?;
    let filename = parts.next()?.to_string();
    if filename.is_empty() || filename.contains('/') {
        return None;
    }
    Some((mode, size, filename))
}

/// Build a filler block of `len` bytes: newline, `-- `, `z` padding, newline.
pub fn filler_block(len: usize) -> Bytes {
    const PREFIX: &[u8] = b"\n-- ";
    let len = len.max(PREFIX.len() + 1);

    let mut buf = BytesMut::with_capacity(len);
    buf.put_slice(PREFIX);
    buf.put_bytes(b'z', len - PREFIX.len() - 1);
    buf.put_u8(b'\n');
    buf.freeze()
}
