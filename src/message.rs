//! Framed key/value message codec.
//!
//! A [`Message`] is an ordered collection of text headers plus an opaque
//! binary payload. On the wire a message is a start line, one `key:value`
//! record per header in insertion order, a blank line, and the payload:
//!
//! ```text
//! PACKIT\n
//! Content-Length:5\n
//! Hello:World\n
//! \n
//! <5 payload bytes>
//! ```
//!
//! `Content-Length` is maintained by the codec itself: emission always
//! writes it, and it always reflects the current payload length. Keys are
//! unique; re-adding a key replaces its value while keeping its position in
//! the emission order.

use std::io::{self, Cursor, Write};
use std::str;

use bytes::{Buf, Bytes};

/// Start line preceding every message on the wire.
const START_LINE: &[u8] = b"PACKIT\n";

/// Separator between a header key and its value.
const KV_SEP: u8 = b':';

/// Terminator of each header record; alone on a line it ends the header
/// block.
const RECORD_SEP: u8 = b'\n';

/// Upper bound on header key length, in bytes.
pub const MAX_KEY: usize = 64;

/// Upper bound on header value length, in bytes.
pub const MAX_VALUE: usize = 1024;

/// Header carrying the payload length in decimal ASCII.
pub const CONTENT_LENGTH: &str = "Content-Length";

/// Bucket count of the key index. Collisions chain within a bucket.
const HASH_BUCKETS: usize = 32;

/// Error produced by codec operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Not enough bytes buffered to decode a complete message.
    #[error("stream ended early")]
    Incomplete,

    /// A header key exceeded [`MAX_KEY`] bytes.
    #[error("header key exceeds {MAX_KEY} bytes")]
    KeyTooLong,

    /// A header value exceeded [`MAX_VALUE`] bytes.
    #[error("header value exceeds {MAX_VALUE} bytes")]
    ValueTooLong,

    /// A header key contained `':'` or a newline.
    #[error("header key contains ':' or newline")]
    InvalidKey,

    /// A header value contained a newline.
    #[error("header value contains newline")]
    InvalidValue,

    /// Input bytes did not follow the wire format.
    #[error("protocol error; {0}")]
    Protocol(&'static str),

    /// The destination refused bytes during emission.
    #[error("transmit failed")]
    Transmit(#[from] io::Error),
}

/// One `(key, value)` header inside a message.
#[derive(Debug)]
struct Record {
    key: String,
    value: String,
}

/// A framed key/value message: ordered headers plus a payload reference.
///
/// The payload is borrowed, not copied: [`Message::set_payload`] takes a
/// [`Bytes`] handle and emission writes those bytes as-is. Dropping the
/// message never touches payload storage.
///
/// A `Message` is not thread-safe; share it across tasks only behind
/// external synchronization.
#[derive(Debug)]
pub struct Message {
    /// Records in insertion order. This order drives iteration and the
    /// wire layout.
    records: Vec<Record>,

    /// Key index: bucket of positions into `records`.
    index: [Vec<usize>; HASH_BUCKETS],

    /// Payload byte count as advertised by `Content-Length`. Follows the
    /// payload, unless a `Content-Length` header is set by hand.
    clen: usize,

    /// Payload bytes.
    payload: Bytes,
}

impl Message {
    /// Creates an empty message with a zero-length payload.
    pub fn new() -> Message {
        Message {
            records: Vec::new(),
            index: std::array::from_fn(|_| Vec::new()),
            clen: 0,
            payload: Bytes::new(),
        }
    }

    /// Adds a header, or replaces the value of an existing one.
    ///
    /// Keys are validated before any state changes, so a failed add leaves
    /// the message exactly as it was; in particular the prior value of a
    /// replaced key survives an invalid replacement attempt.
    ///
    /// Setting `Content-Length` by hand also updates the advertised payload
    /// length, so a hand-built header block stays consistent with what
    /// emission reports.
    pub fn add(&mut self, key: &str, value: &str) -> Result<(), Error> {
        if key.len() > MAX_KEY {
            return Err(Error::KeyTooLong);
        }
        if value.len() > MAX_VALUE {
            return Err(Error::ValueTooLong);
        }
        if key.bytes().any(|b| b == KV_SEP || b == RECORD_SEP) {
            return Err(Error::InvalidKey);
        }
        if value.bytes().any(|b| b == RECORD_SEP) {
            return Err(Error::InvalidValue);
        }

        if key == CONTENT_LENGTH {
            if let Some(clen) = atoi::atoi::<usize>(value.as_bytes()) {
                self.clen = clen;
            }
        }

        let bucket = hash(key);
        match self.lookup(bucket, key) {
            Some(pos) => {
                // Keys are immutable once inserted; only the value moves.
                self.records[pos].value = value.to_owned();
            }
            None => {
                let pos = self.records.len();
                self.records.push(Record {
                    key: key.to_owned(),
                    value: value.to_owned(),
                });
                self.index[bucket].push(pos);
            }
        }
        Ok(())
    }

    /// Adds an unsigned integer header, rendered in decimal ASCII.
    pub fn add_uint(&mut self, key: &str, value: u64) -> Result<(), Error> {
        self.add(key, &value.to_string())
    }

    /// Adds a signed integer header, rendered in decimal ASCII.
    pub fn add_int(&mut self, key: &str, value: i64) -> Result<(), Error> {
        self.add(key, &value.to_string())
    }

    /// Looks up a header value by key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.lookup(hash(key), key)
            .map(|pos| self.records[pos].value.as_str())
    }

    /// Iterates over `(key, value)` pairs in insertion order.
    pub fn headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.records
            .iter()
            .map(|r| (r.key.as_str(), r.value.as_str()))
    }

    /// Number of headers currently in the message.
    pub fn header_count(&self) -> usize {
        self.records.len()
    }

    /// Sets the payload. The bytes are shared, never copied.
    pub fn set_payload(&mut self, payload: Bytes) {
        self.clen = payload.len();
        self.payload = payload;
    }

    /// The current payload bytes.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Emits the message to `dst`.
    ///
    /// Writes the start line, every header in insertion order, the blank
    /// header terminator, and the payload, refreshing `Content-Length`
    /// first. Emitting an unchanged message twice produces identical byte
    /// sequences.
    ///
    /// Any write failure aborts emission with [`Error::Transmit`]; `dst`
    /// may have received a partial message in that case.
    pub fn write_to<W: Write>(&mut self, dst: &mut W) -> Result<(), Error> {
        let clen = self.clen as u64;
        self.add_uint(CONTENT_LENGTH, clen)?;

        dst.write_all(START_LINE)?;
        for record in &self.records {
            dst.write_all(record.key.as_bytes())?;
            dst.write_all(&[KV_SEP])?;
            dst.write_all(record.value.as_bytes())?;
            dst.write_all(&[RECORD_SEP])?;
        }
        dst.write_all(&[RECORD_SEP])?;

        let body = &self.payload[..self.clen.min(self.payload.len())];
        if !body.is_empty() {
            dst.write_all(body)?;
        }
        Ok(())
    }

    /// Checks whether `src` holds one complete message, without building
    /// anything.
    ///
    /// On success the cursor is positioned after the message. Returns
    /// [`Error::Incomplete`] when more bytes are needed.
    pub fn check(src: &mut Cursor<&[u8]>) -> Result<(), Error> {
        expect_start(src)?;

        let mut clen = None;
        loop {
            let line = get_line(src)?;
            if line.is_empty() {
                break;
            }
            let (key, value) = split_record(line)?;
            if key == CONTENT_LENGTH.as_bytes() {
                clen = Some(get_decimal(value)?);
            }
        }

        let clen = clen.ok_or(Error::Protocol("missing Content-Length"))?;
        if src.remaining() < clen {
            return Err(Error::Incomplete);
        }
        src.advance(clen);
        Ok(())
    }

    /// Parses one complete message out of `src`.
    ///
    /// The reconstructed message carries the header set in wire order and a
    /// copy of the payload bytes. Callers normally run [`Message::check`]
    /// first and only parse once a full message is buffered.
    pub fn parse(src: &mut Cursor<&[u8]>) -> Result<Message, Error> {
        expect_start(src)?;

        let mut message = Message::new();
        loop {
            let line = get_line(src)?;
            if line.is_empty() {
                break;
            }
            let (key, value) = split_record(line)?;
            let key =
                str::from_utf8(key).map_err(|_| Error::Protocol("header key is not utf-8"))?;
            let value =
                str::from_utf8(value).map_err(|_| Error::Protocol("header value is not utf-8"))?;
            message.add(key, value)?;
        }

        if message.get(CONTENT_LENGTH).is_none() {
            return Err(Error::Protocol("missing Content-Length"));
        }
        let clen = message.clen;
        if src.remaining() < clen {
            return Err(Error::Incomplete);
        }
        message.set_payload(src.copy_to_bytes(clen));
        Ok(message)
    }

    fn lookup(&self, bucket: usize, key: &str) -> Option<usize> {
        self.index[bucket]
            .iter()
            .copied()
            .find(|&pos| self.records[pos].key == key)
    }
}

impl Default for Message {
    fn default() -> Message {
        Message::new()
    }
}

/// Sums `byte × 31` over the key, modulo the bucket count. Short header
/// keys spread well enough; anagrams collide, which chaining absorbs.
fn hash(key: &str) -> usize {
    let mut h = 0u32;
    for &b in key.as_bytes() {
        h = h.wrapping_add(u32::from(b).wrapping_mul(31));
    }
    h as usize % HASH_BUCKETS
}

fn expect_start(src: &mut Cursor<&[u8]>) -> Result<(), Error> {
    if src.remaining() < START_LINE.len() {
        return Err(Error::Incomplete);
    }
    let pos = src.position() as usize;
    if &src.get_ref()[pos..pos + START_LINE.len()] != START_LINE {
        return Err(Error::Protocol("missing start line"));
    }
    src.advance(START_LINE.len());
    Ok(())
}

/// Returns the bytes up to the next record separator, consuming it.
fn get_line<'a>(src: &mut Cursor<&'a [u8]>) -> Result<&'a [u8], Error> {
    let start = src.position() as usize;
    let buf = *src.get_ref();

    for i in start..buf.len() {
        if buf[i] == RECORD_SEP {
            src.set_position((i + 1) as u64);
            return Ok(&buf[start..i]);
        }
    }

    Err(Error::Incomplete)
}

/// Splits a header line at the first key/value separator and validates the
/// halves against the length limits.
fn split_record(line: &[u8]) -> Result<(&[u8], &[u8]), Error> {
    let sep = line
        .iter()
        .position(|&b| b == KV_SEP)
        .ok_or(Error::Protocol("header record without separator"))?;
    let (key, value) = (&line[..sep], &line[sep + 1..]);
    if key.len() > MAX_KEY {
        return Err(Error::KeyTooLong);
    }
    if value.len() > MAX_VALUE {
        return Err(Error::ValueTooLong);
    }
    Ok((key, value))
}

fn get_decimal(src: &[u8]) -> Result<usize, Error> {
    atoi::atoi::<usize>(src).ok_or(Error::Protocol("invalid Content-Length"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emit(message: &mut Message) -> Vec<u8> {
        let mut out = Vec::new();
        message.write_to(&mut out).unwrap();
        out
    }

    #[test]
    fn emits_headers_in_insertion_order() {
        let mut message = Message::new();
        message.add(CONTENT_LENGTH, "0").unwrap();
        message.add("Hello", "World").unwrap();
        message.add("Test", "Program").unwrap();

        assert_eq!(
            emit(&mut message),
            b"PACKIT\nContent-Length:0\nHello:World\nTest:Program\n\n"
        );
    }

    #[test]
    fn replacement_keeps_position_and_uniqueness() {
        let mut message = Message::new();
        message.add(CONTENT_LENGTH, "0").unwrap();
        message.add("Hello", "World").unwrap();
        message.add("Test", "Program").unwrap();
        message.add_uint(CONTENT_LENGTH, 10).unwrap();

        let out = emit(&mut message);
        assert_eq!(
            out,
            b"PACKIT\nContent-Length:10\nHello:World\nTest:Program\n\n"
        );

        let hits = message
            .headers()
            .filter(|(k, _)| *k == CONTENT_LENGTH)
            .count();
        assert_eq!(hits, 1);
    }

    #[test]
    fn lookup_by_key() {
        let mut message = Message::new();
        message.add(CONTENT_LENGTH, "0").unwrap();
        message.add("Hello", "World").unwrap();
        message.add("Test", "Program").unwrap();

        assert_eq!(message.get("Hello"), Some("World"));
        assert_eq!(message.get("Test"), Some("Program"));
        assert_eq!(message.get(CONTENT_LENGTH), Some("0"));
        assert_eq!(message.get("Blah"), None);
    }

    #[test]
    fn replacement_updates_lookup() {
        let mut message = Message::new();
        message.add("k", "v1").unwrap();
        message.add("k", "v2").unwrap();

        assert_eq!(message.get("k"), Some("v2"));
        assert_eq!(message.header_count(), 1);
    }

    #[test]
    fn emission_is_idempotent() {
        let mut message = Message::new();
        message.add("Hello", "World").unwrap();
        message.set_payload(Bytes::from_static(b"abcde"));

        let first = emit(&mut message);
        let second = emit(&mut message);
        assert_eq!(first, second);
        assert_eq!(message.get(CONTENT_LENGTH), Some("5"));
    }

    #[test]
    fn content_length_is_injected_when_absent() {
        let mut message = Message::new();
        message.add("Hello", "World").unwrap();

        let out = emit(&mut message);
        assert_eq!(out, b"PACKIT\nHello:World\nContent-Length:0\n\n");
    }

    #[test]
    fn round_trips_through_parse() {
        let mut message = Message::new();
        message.add("Hello", "World").unwrap();
        message.add("Empty", "").unwrap();
        message.add("Spaced", "a b:c").unwrap();
        message.set_payload(Bytes::from_static(b"payload bytes"));

        let wire = emit(&mut message);
        let mut cursor = Cursor::new(&wire[..]);
        Message::check(&mut cursor).unwrap();
        assert_eq!(cursor.position() as usize, wire.len());

        cursor.set_position(0);
        let parsed = Message::parse(&mut cursor).unwrap();

        let sent: Vec<_> = message.headers().collect();
        let received: Vec<_> = parsed.headers().collect();
        assert_eq!(sent, received);
        assert_eq!(parsed.payload().as_ref(), b"payload bytes");
    }

    #[test]
    fn check_reports_incomplete_input() {
        let mut message = Message::new();
        message.add("Hello", "World").unwrap();
        message.set_payload(Bytes::from_static(b"0123456789"));
        let wire = emit(&mut message);

        for cut in [3, wire.len() / 2, wire.len() - 1] {
            let mut cursor = Cursor::new(&wire[..cut]);
            assert!(matches!(
                Message::check(&mut cursor),
                Err(Error::Incomplete)
            ));
        }
    }

    #[test]
    fn parse_rejects_garbage_start() {
        let mut cursor = Cursor::new(&b"HELLO\r\nContent-Length:0\n\n"[..]);
        assert!(matches!(
            Message::parse(&mut cursor),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn parse_requires_content_length() {
        let mut cursor = Cursor::new(&b"PACKIT\nHello:World\n\n"[..]);
        assert!(matches!(
            Message::parse(&mut cursor),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn rejects_oversized_and_malformed_headers() {
        let mut message = Message::new();
        let long_key = "k".repeat(MAX_KEY + 1);
        let long_value = "v".repeat(MAX_VALUE + 1);

        assert!(matches!(
            message.add(&long_key, "v"),
            Err(Error::KeyTooLong)
        ));
        assert!(matches!(
            message.add("k", &long_value),
            Err(Error::ValueTooLong)
        ));
        assert!(matches!(message.add("a:b", "v"), Err(Error::InvalidKey)));
        assert!(matches!(message.add("a\nb", "v"), Err(Error::InvalidKey)));
        assert!(matches!(message.add("k", "a\nb"), Err(Error::InvalidValue)));
        assert_eq!(message.header_count(), 0);
    }

    #[test]
    fn failed_replacement_preserves_prior_value() {
        let mut message = Message::new();
        message.add("k", "original").unwrap();

        let bad = "v".repeat(MAX_VALUE + 1);
        assert!(message.add("k", &bad).is_err());
        assert_eq!(message.get("k"), Some("original"));
    }

    #[test]
    fn limit_lengths_are_accepted() {
        let mut message = Message::new();
        let key = "k".repeat(MAX_KEY);
        let value = "v".repeat(MAX_VALUE);
        message.add(&key, &value).unwrap();
        assert_eq!(message.get(&key), Some(value.as_str()));
    }

    #[test]
    fn empty_key_occupies_a_single_slot() {
        let mut message = Message::new();
        message.add("", "first").unwrap();
        message.add("", "second").unwrap();

        assert_eq!(message.get(""), Some("second"));
        assert_eq!(message.header_count(), 1);

        let out = emit(&mut message);
        let mut cursor = Cursor::new(&out[..]);
        let parsed = Message::parse(&mut cursor).unwrap();
        assert_eq!(parsed.get(""), Some("second"));
    }

    #[test]
    fn colliding_keys_chain_within_a_bucket() {
        // Anagrams hash identically under the summing hash.
        let mut message = Message::new();
        message.add("abc", "1").unwrap();
        message.add("bca", "2").unwrap();
        message.add("cab", "3").unwrap();

        assert_eq!(message.get("abc"), Some("1"));
        assert_eq!(message.get("bca"), Some("2"));
        assert_eq!(message.get("cab"), Some("3"));
    }

    #[test]
    fn transmit_failure_aborts_emission() {
        struct Refuse;
        impl Write for Refuse {
            fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
                Err(io::Error::new(io::ErrorKind::BrokenPipe, "refused"))
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let mut message = Message::new();
        message.add("Hello", "World").unwrap();
        assert!(matches!(
            message.write_to(&mut Refuse),
            Err(Error::Transmit(_))
        ));
    }
}
