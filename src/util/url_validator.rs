use std::net::IpAddr;
use thiserror::Error;
use url::Url;

/// Errors that can occur during URL validation.
///
/// These errors cover both parsing failures and security policy violations
/// designed to prevent SSRF (Server-Side Request Forgery) attacks when
/// following links posted by strangers.
#[derive(Error, Debug)]
pub enum UrlValidationError {
    /// The URL string could not be parsed.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    /// The URL uses a scheme other than http or https.
    #[error("Unsupported scheme: {0} (only http/https allowed)")]
    UnsupportedScheme(String),
    /// The URL points to a private/internal IP address.
    #[error("Private IP address not allowed: {0}")]
    PrivateIp(String),
    /// The URL points to localhost.
    #[error("Localhost not allowed")]
    Localhost,
}

/// Validates a link address before the resolver follows it.
///
/// Rejects:
/// - Non-HTTP(S) schemes (e.g., `file://`, `ftp://`)
/// - Localhost addresses (`localhost`, `127.0.0.1`, `::1`)
/// - Private IP ranges (RFC 1918, link-local, unique local IPv6)
///
/// # Examples
///
/// ```
/// use linkharvest::util::validate_url;
///
/// assert!(validate_url("https://t.co/abc123").is_ok());
/// assert!(validate_url("http://localhost/admin").is_err());
/// assert!(validate_url("http://192.168.1.1/").is_err());
/// assert!(validate_url("file:///etc/passwd").is_err());
/// ```
pub fn validate_url(url_str: &str) -> Result<Url, UrlValidationError> {
    let url = Url::parse(url_str)?;
    check_public(&url)?;
    Ok(url)
}

/// Applies the scheme and host rules of [`validate_url`] to an already parsed URL.
///
/// Used for every redirect hop, not just the first request.
pub fn check_public(url: &Url) -> Result<(), UrlValidationError> {
    match url.scheme() {
        "http" | "https" => {}
        scheme => return Err(UrlValidationError::UnsupportedScheme(scheme.to_owned())),
    }

    if let Some(host) = url.host_str() {
        if host.eq_ignore_ascii_case("localhost") {
            return Err(UrlValidationError::Localhost);
        }

        // Strip brackets from IPv6 addresses for parsing
        let host_for_parse = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);

        if let Ok(ip) = host_for_parse.parse::<IpAddr>() {
            if ip.is_loopback() {
                return Err(UrlValidationError::Localhost);
            }
            if is_private_ip(&ip) {
                return Err(UrlValidationError::PrivateIp(ip.to_string()));
            }
        }
    }

    Ok(())
}

/// The canonical form of a resolved address: the final URL with its fragment removed.
///
/// Fragments never reach the server, so `page#intro` and `page#comments`
/// are the same document and must share one tally.
pub fn canonical_address(url: &Url) -> String {
    let mut canonical = url.clone();
    canonical.set_fragment(None);
    canonical.to_string()
}

fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(ipv4) => {
            ipv4.is_private() || ipv4.is_loopback() || ipv4.is_link_local() || ipv4.is_unspecified()
        }
        IpAddr::V6(ipv6) => {
            if ipv6.is_loopback() || ipv6.is_unspecified() {
                return true;
            }
            let segments = ipv6.segments();
            // Unique Local (fc00::/7)
            let is_unique_local = (segments[0] & 0xfe00) == 0xfc00;
            // Link-Local (fe80::/10)
            let is_link_local = (segments[0] & 0xffc0) == 0xfe80;
            is_unique_local || is_link_local
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_links_accepted() {
        assert!(validate_url("https://t.co/xyz").is_ok());
        assert!(validate_url("http://blog.example.org/post/1").is_ok());
        assert!(validate_url("https://example.com:8443/a").is_ok());
    }

    #[test]
    fn test_invalid_schemes() {
        assert!(matches!(
            validate_url("ftp://example.com"),
            Err(UrlValidationError::UnsupportedScheme(_))
        ));
        assert!(validate_url("javascript:alert(1)").is_err());
    }

    #[test]
    fn test_localhost_rejected() {
        assert!(matches!(
            validate_url("http://LOCALHOST/x"),
            Err(UrlValidationError::Localhost)
        ));
        assert!(validate_url("http://127.0.0.1/x").is_err());
        assert!(validate_url("http://[::1]/x").is_err());
    }

    #[test]
    fn test_private_ranges_rejected() {
        for addr in [
            "http://10.0.0.1/",
            "http://172.16.0.1/",
            "http://192.168.1.1:8080/",
            "http://169.254.1.1/",
            "http://0.0.0.0/",
            "http://[fe80::1]/",
            "http://[fd00::1]/",
        ] {
            assert!(validate_url(addr).is_err(), "{} should be rejected", addr);
        }
    }

    #[test]
    fn test_check_public_on_parsed_redirect_target() {
        let url = Url::parse("http://192.168.0.10/internal").unwrap();
        assert!(matches!(check_public(&url), Err(UrlValidationError::PrivateIp(_))));
    }

    #[test]
    fn test_canonical_address_drops_fragment() {
        let url = Url::parse("https://Example.com:443/post?id=1#comments").unwrap();
        assert_eq!(canonical_address(&url), "https://example.com/post?id=1");
    }
}
