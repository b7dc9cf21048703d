use crc32fast::Hasher;

/// Calculate a CRC32 checksum of the given script body, line by line.
///
/// A leading byte-order-mark is stripped, and each line is fed into the
/// hasher without its line ending. This makes the digest stable across
/// platforms: CRLF vs LF and trailing newlines do not change the result.
/// The algorithm is part of the stored-format contract; changing it
/// requires a metadata layout upgrade plus a repair pass.
pub fn calculate_checksum(body: &str) -> i32 {
    let body = body.strip_prefix('\u{feff}').unwrap_or(body);
    let mut hasher = Hasher::new();
    for line in body.lines() {
        hasher.update(line.as_bytes());
    }
    hasher.finalize() as i32
}
