//! Header containers.
//!
//! Headers travel as an [`http::HeaderMap`]: names compare
//! case-insensitively and the values of one name keep their insertion
//! order. The dispatch core reads `Location` and strips body or credential
//! headers when following a redirect; everything else passes through to the
//! transport untouched.

use crate::error::RequestError;
use http::header::{HeaderMap, HeaderName, HeaderValue};

/// Request and response headers.
pub type Headers = HeaderMap;

/// Parse one header pair, rejecting names that are not tokens and values
/// that could not be written on the wire.
///
/// # Errors
///
/// Returns [`RequestError::InvalidHeader`] naming the offending part.
///
/// # Examples
///
/// ```
/// use courier_core::headers::parse_pair;
///
/// let (name, value) = parse_pair("X-Trace", "abc").unwrap();
/// assert_eq!(name, "x-trace");
/// assert_eq!(value, "abc");
///
/// assert!(parse_pair("X-Evil", "a\r\nInjected: yes").is_err());
/// ```
pub fn parse_pair(name: &str, value: &str) -> Result<(HeaderName, HeaderValue), RequestError> {
    let name = HeaderName::from_bytes(name.as_bytes())
        .map_err(|_| RequestError::InvalidHeader(format!("bad name {name:?}")))?;
    let value = HeaderValue::from_str(value)
        .map_err(|_| RequestError::InvalidHeader(format!("bad value for {name}")))?;
    Ok((name, value))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> Headers {
        let mut headers = Headers::new();
        for (name, value) in pairs {
            let (name, value) = parse_pair(name, value).unwrap();
            headers.append(name, value);
        }
        headers
    }

    #[test]
    fn names_compare_case_insensitively() {
        let headers = headers(&[("Content-Type", "text/plain")]);
        assert_eq!(headers["content-type"], "text/plain");
        assert!(headers.contains_key("CONTENT-TYPE"));
        assert!(!headers.contains_key("content-length"));
    }

    #[test]
    fn values_of_one_name_keep_insertion_order() {
        let headers = headers(&[("Accept", "a"), ("Host", "example.com"), ("accept", "b")]);
        let accept: Vec<_> = headers.get_all("accept").iter().collect();
        assert_eq!(accept, vec!["a", "b"]);
    }

    #[test]
    fn bad_names_and_values_are_rejected() {
        let cases = [
            ("Bad Name", "v"),
            ("", "v"),
            ("X-Evil", "a\r\nb"),
            ("X-Nul", "a\0"),
        ];
        for (name, value) in cases {
            assert!(
                matches!(parse_pair(name, value), Err(RequestError::InvalidHeader(_))),
                "{name:?}: {value:?}"
            );
        }
    }
}
