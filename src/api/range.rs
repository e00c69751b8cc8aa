//! Byte-range header handling.
//!
//! A `RangeSpec` is a canonicalized, inclusive `(start, end)` pair that is
//! guaranteed satisfiable against the object it was resolved for. Parsing
//! and canonicalization happen in one step so handlers never see a raw
//! header value.

/// Canonicalized byte range with `0 <= start <= end < size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeSpec {
    pub start: u64,
    pub end: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeError {
    /// The header does not parse as `bytes=<start>-<end>` / `bytes=-<suffix>`
    Malformed,
    /// Parses, but no byte of it overlaps the object (416 territory)
    Unsatisfiable,
}

impl RangeSpec {
    /// Resolve a `Range` header value against an object of `size` bytes.
    ///
    /// - `bytes=a-b`: `end` clamped to `size - 1`
    /// - `bytes=a-`: to end of object
    /// - `bytes=-k`: suffix form, last `min(k, size)` bytes
    ///
    /// `start >= size` (and any range against an empty object) is
    /// unsatisfiable. Multi-range headers are not supported.
    pub fn resolve(header: &str, size: u64) -> Result<RangeSpec, RangeError> {
        let spec = header.trim().strip_prefix("bytes=").ok_or(RangeError::Malformed)?;
        if spec.contains(',') {
            return Err(RangeError::Malformed);
        }

        let (raw_start, raw_end) = spec.split_once('-').ok_or(RangeError::Malformed)?;
        let raw_start = raw_start.trim();
        let raw_end = raw_end.trim();

        // Suffix form: bytes=-k
        if raw_start.is_empty() {
            let suffix: u64 = raw_end.parse().map_err(|_| RangeError::Malformed)?;
            if suffix == 0 || size == 0 {
                return Err(RangeError::Unsatisfiable);
            }
            let start = size.saturating_sub(suffix);
            return Ok(RangeSpec {
                start,
                end: size - 1,
            });
        }

        let start: u64 = raw_start.parse().map_err(|_| RangeError::Malformed)?;
        if start >= size {
            return Err(RangeError::Unsatisfiable);
        }

        let end = if raw_end.is_empty() {
            size - 1
        } else {
            let end: u64 = raw_end.parse().map_err(|_| RangeError::Malformed)?;
            if end < start {
                return Err(RangeError::Malformed);
            }
            end.min(size - 1)
        };

        Ok(RangeSpec { start, end })
    }

    /// Number of bytes the range covers; always at least one.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// `Content-Range` header value for a 206 response.
    pub fn content_range(&self, size: u64) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_ranges() {
        let r = RangeSpec::resolve("bytes=0-499", 1000).unwrap();
        assert_eq!((r.start, r.end, r.len()), (0, 499, 500));
        assert_eq!(r.content_range(1000), "bytes 0-499/1000");

        let r = RangeSpec::resolve("bytes=500-", 1000).unwrap();
        assert_eq!((r.start, r.end), (500, 999));
    }

    #[test]
    fn single_byte_range() {
        let r = RangeSpec::resolve("bytes=0-0", 1000).unwrap();
        assert_eq!(r.len(), 1);
        assert_eq!(r.content_range(1000), "bytes 0-0/1000");
    }

    #[test]
    fn end_is_clamped() {
        let r = RangeSpec::resolve("bytes=900-2000", 1000).unwrap();
        assert_eq!((r.start, r.end), (900, 999));
    }

    #[test]
    fn start_past_end_is_unsatisfiable() {
        assert_eq!(
            RangeSpec::resolve("bytes=1000-2000", 1000),
            Err(RangeError::Unsatisfiable)
        );
        assert_eq!(
            RangeSpec::resolve("bytes=1000-", 1000),
            Err(RangeError::Unsatisfiable)
        );
        assert_eq!(
            RangeSpec::resolve("bytes=0-", 0),
            Err(RangeError::Unsatisfiable)
        );
    }

    #[test]
    fn suffix_ranges() {
        let r = RangeSpec::resolve("bytes=-100", 1000).unwrap();
        assert_eq!((r.start, r.end), (900, 999));

        // Suffix longer than the object is the whole object
        let r = RangeSpec::resolve("bytes=-5000", 1000).unwrap();
        assert_eq!((r.start, r.end), (0, 999));

        assert_eq!(
            RangeSpec::resolve("bytes=-0", 1000),
            Err(RangeError::Unsatisfiable)
        );
    }

    #[test]
    fn malformed_headers() {
        for header in [
            "bits=0-10",
            "bytes=",
            "bytes=abc-10",
            "bytes=10-abc",
            "bytes=10-5",
            "bytes=0-10,20-30",
            "bytes=--5",
        ] {
            assert_eq!(
                RangeSpec::resolve(header, 1000),
                Err(RangeError::Malformed),
                "{header}"
            );
        }
    }
}
