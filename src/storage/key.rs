//! Object key construction and prefix rules.
//!
//! Keys are opaque outside this module; the two reserved prefixes are
//! `uploads/` for originals and `transcoded/<file_id>/` for derived variants.

use chrono::{Datelike, Utc};
use uuid::Uuid;

pub const UPLOAD_PREFIX: &str = "uploads/";
pub const TRANSCODED_PREFIX: &str = "transcoded/";

/// Mint a unique key for a freshly uploaded object: `uploads/YYYY/MM/<uuid><ext>`.
///
/// The original filename contributes only its extension; collisions are
/// impossible short of a UUID collision.
pub fn upload_key(filename: &str) -> String {
    let now = Utc::now();
    let ext = extension(filename);
    format!(
        "{}{}/{:02}/{}{}",
        UPLOAD_PREFIX,
        now.year(),
        now.month(),
        Uuid::new_v4(),
        ext
    )
}

/// Key for a transcoded variant: `transcoded/<file_id>/<basename>_<height>p.mp4`.
pub fn variant_key(file_id: i64, original_filename: &str, quality: i64) -> String {
    let base = basename(original_filename);
    format!("{}{}/{}_{}p.mp4", TRANSCODED_PREFIX, file_id, base, quality)
}

/// Whether a key lies under the originals prefix. Used to reject
/// registration of objects the API did not mint a key for.
pub fn is_upload_key(key: &str) -> bool {
    key.starts_with(UPLOAD_PREFIX)
}

fn extension(filename: &str) -> &str {
    match filename.rfind('.') {
        // A leading dot is a hidden file, not an extension
        Some(idx) if idx > 0 => &filename[idx..],
        _ => "",
    }
}

fn basename(filename: &str) -> &str {
    match filename.rfind('.') {
        Some(idx) if idx > 0 => &filename[..idx],
        _ => filename,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_key_has_dated_prefix_and_extension() {
        let key = upload_key("movie.mkv");
        assert!(key.starts_with("uploads/"));
        assert!(key.ends_with(".mkv"));
        // uploads/YYYY/MM/<uuid>.mkv
        let parts: Vec<&str> = key.split('/').collect();
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[2].len(), 2, "month must be zero-padded");
    }

    #[test]
    fn upload_key_without_extension() {
        let key = upload_key("README");
        assert!(!key.contains('.'));
    }

    #[test]
    fn upload_keys_are_unique() {
        assert_ne!(upload_key("a.bin"), upload_key("a.bin"));
    }

    #[test]
    fn variant_key_format() {
        assert_eq!(
            variant_key(7, "holiday.mkv", 720),
            "transcoded/7/holiday_720p.mp4"
        );
        assert_eq!(variant_key(7, "clip", 480), "transcoded/7/clip_480p.mp4");
    }

    #[test]
    fn prefix_check() {
        assert!(is_upload_key("uploads/2024/11/abc.mp4"));
        assert!(!is_upload_key("transcoded/1/a_480p.mp4"));
        assert!(!is_upload_key("../uploads/escape"));
    }
}
