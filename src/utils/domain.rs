use url::Url;

/// Extracts the hostname used as the partition key for per-site tracking.
/// Malformed URLs fall back to the raw input so a bad value still lands in a
/// stable bucket instead of failing the caller.
pub fn extract_domain(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(parsed) => match parsed.host_str() {
            Some(host) => host.to_owned(),
            None => raw.to_owned(),
        },
        Err(_) => raw.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::extract_domain;

    #[test]
    fn extracts_hostname() {
        assert_eq!(extract_domain("https://x.com/watch?v=1"), "x.com");
        assert_eq!(extract_domain("http://sub.example.org"), "sub.example.org");
    }

    #[test]
    fn malformed_url_falls_back_to_raw_string() {
        assert_eq!(extract_domain("not a url"), "not a url");
        assert_eq!(extract_domain(""), "");
    }

    #[test]
    fn hostless_url_falls_back_to_raw_string() {
        assert_eq!(extract_domain("file:///tmp/page.html"), "file:///tmp/page.html");
    }
}
