//! HTTP Range request handling (RFC 7233, single byte ranges)
//!
//! Syntactically invalid and multi-range headers are ignored, which means the full
//! resource is served with 200. A well-formed range that starts at or beyond the
//! content length is unsatisfiable (416).

use crate::error::StreamError;

/// One parsed `bytes=` range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeSpec {
    /// `bytes=a-`
    From(u64),
    /// `bytes=a-b`, inclusive
    FromTo(u64, u64),
    /// `bytes=-n`, the last n bytes
    Suffix(u64),
}

/// Inclusive byte span selected for a response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteSpan {
    pub start: u64,
    pub end: u64,
}

impl ByteSpan {
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// `Content-Range` value; `*` when the total is unknown
    pub fn content_range(&self, total: Option<u64>) -> String {
        match total {
            Some(total) => format!("bytes {}-{}/{}", self.start, self.end, total),
            None => format!("bytes {}-{}/*", self.start, self.end),
        }
    }
}

/// Parse a `Range` header value. `None` means the header must be ignored.
pub fn parse_range(header: &str) -> Option<RangeSpec> {
    let spec = header.trim().strip_prefix("bytes=")?.trim();
    if spec.contains(',') {
        return None;
    }
    let (start, end) = spec.split_once('-')?;
    let (start, end) = (start.trim(), end.trim());

    match (start.is_empty(), end.is_empty()) {
        (true, true) => None,
        (true, false) => end.parse().ok().map(RangeSpec::Suffix),
        (false, true) => start.parse().ok().map(RangeSpec::From),
        (false, false) => {
            let a: u64 = start.parse().ok()?;
            let b: u64 = end.parse().ok()?;
            if b < a {
                None
            } else {
                Some(RangeSpec::FromTo(a, b))
            }
        }
    }
}

impl RangeSpec {
    /// Resolve against a known content length.
    pub fn resolve(&self, length: u64) -> Result<ByteSpan, StreamError> {
        let unsatisfiable = StreamError::RangeNotSatisfiable {
            length: Some(length),
        };
        if length == 0 {
            return Err(unsatisfiable);
        }
        let last = length - 1;
        match *self {
            RangeSpec::From(a) if a < length => Ok(ByteSpan { start: a, end: last }),
            RangeSpec::FromTo(a, b) if a < length => Ok(ByteSpan {
                start: a,
                end: b.min(last),
            }),
            RangeSpec::Suffix(n) if n > 0 => Ok(ByteSpan {
                start: length.saturating_sub(n),
                end: last,
            }),
            _ => Err(unsatisfiable),
        }
    }

    /// Span servable without knowing the length: only closed ranges qualify.
    pub fn resolve_unknown(&self) -> Option<ByteSpan> {
        match *self {
            RangeSpec::FromTo(a, b) => Some(ByteSpan { start: a, end: b }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_ranges() {
        assert_eq!(parse_range("bytes=0-1023"), Some(RangeSpec::FromTo(0, 1023)));
        assert_eq!(parse_range("bytes=9999000-"), Some(RangeSpec::From(9_999_000)));
        assert_eq!(parse_range("bytes=-500"), Some(RangeSpec::Suffix(500)));
        assert_eq!(parse_range(" bytes= 5 - 9 "), Some(RangeSpec::FromTo(5, 9)));
    }

    #[test]
    fn invalid_or_multi_ranges_are_ignored() {
        assert_eq!(parse_range("items=0-10"), None);
        assert_eq!(parse_range("bytes=-"), None);
        assert_eq!(parse_range("bytes=10-5"), None);
        assert_eq!(parse_range("bytes=abc-"), None);
        assert_eq!(parse_range("bytes=0-1,5-9"), None);
    }

    #[test]
    fn resolves_against_length() {
        let len = 10_000_000;
        let span = RangeSpec::FromTo(0, 1023).resolve(len).unwrap();
        assert_eq!((span.start, span.end, span.len()), (0, 1023, 1024));
        assert_eq!(span.content_range(Some(len)), "bytes 0-1023/10000000");

        let tail = RangeSpec::From(9_999_000).resolve(len).unwrap();
        assert_eq!(tail.len(), 1000);

        let clamped = RangeSpec::FromTo(9_999_990, 20_000_000).resolve(len).unwrap();
        assert_eq!(clamped.end, len - 1);

        let suffix = RangeSpec::Suffix(20_000_000).resolve(len).unwrap();
        assert_eq!((suffix.start, suffix.end), (0, len - 1));
    }

    #[test]
    fn start_beyond_length_is_unsatisfiable() {
        let err = RangeSpec::From(20_000_000).resolve(10_000_000).unwrap_err();
        assert_eq!(
            err,
            StreamError::RangeNotSatisfiable {
                length: Some(10_000_000)
            }
        );
        assert!(RangeSpec::From(10).resolve(10).is_err());
        assert!(RangeSpec::Suffix(0).resolve(10).is_err());
        assert!(RangeSpec::From(0).resolve(0).is_err());
    }

    #[test]
    fn unknown_length_serves_only_closed_ranges() {
        let span = RangeSpec::FromTo(100, 199).resolve_unknown().unwrap();
        assert_eq!(span.content_range(None), "bytes 100-199/*");
        assert!(RangeSpec::From(100).resolve_unknown().is_none());
        assert!(RangeSpec::Suffix(100).resolve_unknown().is_none());
    }
}
