use bytesize::ByteSize;
use url::Url;

/// Extension that marks a file or URL as an installable package
pub const PACKAGE_EXTENSION: &str = "ipa";

/// Used when a package URL has no usable last path segment
pub const DEFAULT_PACKAGE_FILENAME: &str = "app.ipa";

/// Formats a byte count for display, e.g. `1.5 MiB`
pub fn format_bytes(bytes: u64) -> String {
    ByteSize::b(bytes).to_string()
}

/// Checks the extension of a path or URL path case-insensitively
pub fn has_package_extension(path: &str) -> bool {
    std::path::Path::new(path)
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case(PACKAGE_EXTENSION))
}

/// Derives a destination filename from the last non-empty path segment of a URL.
///
/// The segment is percent-decoded and path separators are replaced so the
/// result can never escape the storage directory.
pub fn filename_from_url(url: &Url) -> String {
    let segment = url
        .path_segments()
        .and_then(|mut segments| segments.rfind(|segment| !segment.is_empty()))
        .unwrap_or("");

    let decoded = urlencoding::decode(segment)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| segment.to_string());

    let name: String = decoded
        .chars()
        .map(|c| if matches!(c, '/' | '\\') { '_' } else { c })
        .collect();

    match name.trim() {
        "" | "." | ".." => DEFAULT_PACKAGE_FILENAME.to_string(),
        _ => name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_package_extension_case_insensitive() {
        assert!(has_package_extension("/apps/Game.IPA"));
        assert!(has_package_extension("app.ipa"));
        assert!(!has_package_extension("/apps/app.ipa.zip"));
        assert!(!has_package_extension("/apps/ipa"));
    }

    #[test]
    fn test_filename_from_url() {
        let url = Url::parse("https://host/files/real.ipa?token=abc").unwrap();
        assert_eq!(filename_from_url(&url), "real.ipa");
    }

    #[test]
    fn test_filename_is_percent_decoded() {
        let url = Url::parse("https://host/files/My%20App.ipa").unwrap();
        assert_eq!(filename_from_url(&url), "My App.ipa");

        let url = Url::parse("https://host/files/..%2F..%2Fetc.ipa").unwrap();
        assert_eq!(filename_from_url(&url), ".._.._etc.ipa");
    }

    #[test]
    fn test_filename_defaults_when_empty() {
        let url = Url::parse("https://host/").unwrap();
        assert_eq!(filename_from_url(&url), DEFAULT_PACKAGE_FILENAME);

        let url = Url::parse("https://host//").unwrap();
        assert_eq!(filename_from_url(&url), DEFAULT_PACKAGE_FILENAME);
    }

    #[test]
    fn test_filename_skips_trailing_slash() {
        let url = Url::parse("https://host/builds/real.ipa/").unwrap();
        assert_eq!(filename_from_url(&url), "real.ipa");

        let url = Url::parse("https://host/builds/real.ipa//?token=abc").unwrap();
        assert_eq!(filename_from_url(&url), "real.ipa");
    }

    #[test]
    fn test_format_bytes() {
        assert!(format_bytes(0).starts_with('0'));
        assert_ne!(format_bytes(1024 * 1024), format_bytes(1024));
    }
}
