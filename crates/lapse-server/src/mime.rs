//! Content type detection from magic numbers.
//!
//! Uploaders can claim any content type they like, so the type stored with a
//! file is always sniffed from its first bytes.

/// How many leading bytes [`sniff`] looks at.
pub const SNIFF_LEN: usize = 512;

/// Fallback when nothing matches.
pub const UNKNOWN: &str = "application/octet-stream";

/// Types accepted by default.
pub const DEFAULT_ALLOWED_TYPES: &[&str] = &[
    "image/apng",
    "video/x-msvideo",
    "image/gif",
    "image/jpeg",
    "audio/mpeg",
    "video/mp4",
    "audio/ogg",
    "video/ogg",
    "image/png",
    "audio/wav",
    "audio/webm",
    "video/webm",
    "image/webp",
];

/// Detect a content type from the start of a file.
pub fn sniff(data: &[u8]) -> &'static str {
    // PNG, animated if an acTL chunk comes right after IHDR
    if data.starts_with(b"\x89PNG\r\n\x1a\n") {
        if data.get(37..41) == Some(b"acTL".as_slice()) {
            return "image/apng";
        }
        return "image/png";
    }

    if data.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return "image/jpeg";
    }

    if data.starts_with(b"GIF87a") || data.starts_with(b"GIF89a") {
        return "image/gif";
    }

    // RIFF containers
    if data.starts_with(b"RIFF") && data.len() >= 12 {
        match &data[8..12] {
            b"WEBP" => return "image/webp",
            b"WAVE" => return "audio/wav",
            b"AVI " => return "video/x-msvideo",
            _ => {}
        }
    }

    // ISO base media: size, then "ftyp"
    if data.get(4..8) == Some(b"ftyp".as_slice()) {
        return "video/mp4";
    }

    if data.starts_with(b"OggS") {
        if data.get(28..35) == Some(b"\x80theora".as_slice()) {
            return "video/ogg";
        }
        return "audio/ogg";
    }

    // EBML header; only WebM declares the "webm" doctype
    if data.starts_with(&[0x1A, 0x45, 0xDF, 0xA3]) && contains(data, b"webm") {
        return "video/webm";
    }

    // ID3 tag, or a bare MPEG audio frame sync
    if data.starts_with(b"ID3") || (data.len() >= 2 && data[0] == 0xFF && data[1] & 0xE0 == 0xE0)
    {
        return "audio/mpeg";
    }

    UNKNOWN
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}
