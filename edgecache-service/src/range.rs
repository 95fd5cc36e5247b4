//! Parsing of HTTP `Range` request headers.
//!
//! Only single byte ranges are supported, in the three forms defined by RFC 7233:
//!
//! - `bytes=<start>-<end>`: an explicit, inclusive interval.
//! - `bytes=<start>-`: everything from `start` to the end of the object.
//! - `bytes=-<suffix>`: the last `suffix` bytes of the object.
//!
//! Multi-range requests (comma-separated) are rejected as malformed. A parsed range is never
//! clamped: a range that does not fit the object is rejected as a whole.

use std::fmt;

use thiserror::Error;

/// The unit prefix of all supported range headers.
const BYTES_UNIT: &str = "bytes=";

/// An inclusive byte interval within an object.
///
/// Invariant: `start <= end < size` for the object size the range was parsed against.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ByteRange {
    /// Offset of the first byte in the range.
    pub start: u64,
    /// Offset of the last byte in the range, inclusive.
    pub end: u64,
}

impl ByteRange {
    /// Creates a new range from inclusive bounds.
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    /// Returns the number of bytes covered by this range.
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Always `false`, a byte range covers at least one byte.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Renders the `Content-Range` header value for a partial response.
    pub fn content_range(&self, size: u64) -> String {
        format!("bytes {}-{}/{size}", self.start, self.end)
    }

    /// Renders the range in request header form, as sent to the origin.
    pub fn to_header(&self) -> String {
        format!("{BYTES_UNIT}{}-{}", self.start, self.end)
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// Reasons for rejecting a `Range` header.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum RangeError {
    /// The header does not follow the `bytes=<spec>` syntax.
    #[error("malformed range header")]
    Malformed,
    /// The header is well-formed, but the interval does not fit the object.
    #[error("range not satisfiable")]
    Unsatisfiable,
}

/// Renders the `Content-Range` header value for a `416 Range Not Satisfiable` response.
pub fn unsatisfied_range(size: u64) -> String {
    format!("bytes */{size}")
}

/// Parses a `Range` header value against the size of the object it applies to.
pub fn parse_range(header: &str, size: u64) -> Result<ByteRange, RangeError> {
    let spec = header
        .strip_prefix(BYTES_UNIT)
        .ok_or(RangeError::Malformed)?
        .trim();

    if spec.contains(',') {
        return Err(RangeError::Malformed);
    }

    let (first, last) = spec.split_once('-').ok_or(RangeError::Malformed)?;
    let (first, last) = (first.trim(), last.trim());

    let (start, end) = match (first.is_empty(), last.is_empty()) {
        (true, true) => return Err(RangeError::Malformed),
        // Suffix range, the last `n` bytes.
        (true, false) => {
            let suffix = parse_position(last)?;
            (size.saturating_sub(suffix), size.checked_sub(1))
        }
        // Open-ended range until the end of the object.
        (false, true) => (parse_position(first)?, size.checked_sub(1)),
        (false, false) => (parse_position(first)?, Some(parse_position(last)?)),
    };

    // An empty object has no last byte, so nothing is satisfiable.
    let end = end.ok_or(RangeError::Unsatisfiable)?;
    if start >= size || end < start || end >= size {
        return Err(RangeError::Unsatisfiable);
    }

    Ok(ByteRange { start, end })
}

fn parse_position(s: &str) -> Result<u64, RangeError> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return Err(RangeError::Malformed);
    }
    s.parse().map_err(|_| RangeError::Malformed)
}
