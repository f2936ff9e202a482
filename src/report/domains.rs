//! Server domain extraction from mitmproxy TLS failure messages.
//!
//! The proxy does not expose the failing domain as a field, so it is recovered from the
//! human readable message. Only two message templates are understood; the wording is
//! owned by mitmproxy and may change between releases, in which case extraction quietly
//! yields `None` rather than a wrong domain.

use once_cell::sync::Lazy;
use regex::Regex;

pub const UNTRUSTED_CERTIFICATE_MARKER: &str = "The client does not trust the proxy's certificate for";

static DOMAIN_TEMPLATES: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(
            r"The client disconnected during the handshake\. If this happens consistently for (.+?),",
        )
        .expect("valid regex"),
        Regex::new(r"The client does not trust the proxy's certificate for (.+?) ").expect("valid regex"),
    ]
});

pub fn domain_from_error_message(message: &str) -> Option<&str> {
    DOMAIN_TEMPLATES.iter().find_map(|template| {
        template
            .captures(message)
            .and_then(|captures| captures.get(1))
            .map(|domain| domain.as_str())
    })
}

/// The only failure shape that indicates certificate pinning.
pub fn is_untrusted_certificate_error(message: &str) -> bool {
    message.contains(UNTRUSTED_CERTIFICATE_MARKER)
}

#[cfg(test)]
mod tests {
    use super::{domain_from_error_message, is_untrusted_certificate_error};

    #[test]
    fn extracts_domain_from_untrusted_certificate_message() {
        let message = "The client does not trust the proxy's certificate for x.example.com (OpenSSL Error([('SSL routines', '', 'sslv3 alert certificate unknown')]))";
        assert_eq!(domain_from_error_message(message), Some("x.example.com"));
        assert!(is_untrusted_certificate_error(message));
    }

    #[test]
    fn extracts_domain_from_handshake_disconnect_message() {
        let message = "The client disconnected during the handshake. If this happens consistently for api.example.org, this may indicate that the client does not trust the proxy's certificate.";
        assert_eq!(domain_from_error_message(message), Some("api.example.org"));
        assert!(!is_untrusted_certificate_error(message));
    }

    #[test]
    fn unknown_shapes_yield_nothing() {
        assert_eq!(domain_from_error_message("connection closed early"), None);
        assert_eq!(
            domain_from_error_message("Client and mitmproxy cannot agree on a TLS version to use."),
            None
        );
        assert_eq!(domain_from_error_message(""), None);
        // Template without the trailing separator does not match.
        assert_eq!(
            domain_from_error_message("The client does not trust the proxy's certificate for x.example.com"),
            None
        );
    }
}
