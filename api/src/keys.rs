/// Object key for an uploaded photo, e.g. "photo-booth-images/1739871000000".
pub fn photo_key(prefix: &str, uploaded_at_ms: i64) -> String {
    format!("{prefix}{uploaded_at_ms}")
}

/// URL clients fetch the photo from: `{public_url}/{bucket}/{key}`.
pub fn public_url(base: &str, bucket: &str, key: &str) -> String {
    format!("{}/{bucket}/{key}", base.trim_end_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_format() {
        let k = photo_key("photo-booth-images/", 1739871000000);
        assert_eq!(k, "photo-booth-images/1739871000000");
        assert_eq!(photo_key("", 42), "42");
    }

    #[test]
    fn test_public_url() {
        assert_eq!(
            public_url("http://localhost:9000/", "photo-booth", "photo-booth-images/1"),
            "http://localhost:9000/photo-booth/photo-booth-images/1"
        );
        assert_eq!(
            public_url("https://cdn.example", "b", "k"),
            "https://cdn.example/b/k"
        );
    }
}
