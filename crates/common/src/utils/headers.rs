use http::{HeaderMap, HeaderName, HeaderValue};

use crate::protocol::Headers;

/// Connection-scoped headers that are never relayed across the tunnel
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "upgrade",
    "te",
    "trailer",
];

/// Check whether a header only applies to a single connection
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}

/// Convert HTTP headers to our internal format
/// Supports multiple values per header name; hop-by-hop headers are skipped
pub fn headers_to_map(headers: &HeaderMap) -> Headers {
    let mut map = Headers::new();

    for (name, value) in headers.iter() {
        if is_hop_by_hop(name.as_str()) {
            continue;
        }
        let key = name.as_str().to_string();
        let val = String::from_utf8_lossy(value.as_bytes()).into_owned();

        map.entry(key).or_default().push(val);
    }

    map
}

/// Convert our internal header format to HTTP HeaderMap
/// Invalid names or values and hop-by-hop headers are dropped
pub fn map_to_headers(map: &Headers) -> HeaderMap {
    let mut headers = HeaderMap::new();

    for (name, values) in map.iter() {
        if is_hop_by_hop(name) {
            continue;
        }
        if let Ok(header_name) = HeaderName::from_bytes(name.as_bytes()) {
            for value in values {
                if let Ok(header_value) = HeaderValue::from_str(value) {
                    headers.append(header_name.clone(), header_value);
                }
            }
        }
    }

    headers
}

/// Case-insensitive lookup of the first value of a header
pub fn header_value<'a>(map: &'a Headers, name: &str) -> Option<&'a str> {
    map.iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .and_then(|(_, values)| values.first())
        .map(String::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_headers_to_map_empty() {
        let headers = HeaderMap::new();
        let map = headers_to_map(&headers);
        assert!(map.is_empty());
    }

    #[test]
    fn test_headers_to_map_multiple_values() {
        let mut headers = HeaderMap::new();
        headers.insert("set-cookie", "session=abc".parse().unwrap());
        headers.append("set-cookie", "token=xyz".parse().unwrap());

        let map = headers_to_map(&headers);
        assert_eq!(map.len(), 1);
        assert_eq!(
            map.get("set-cookie").unwrap(),
            &vec!["session=abc".to_string(), "token=xyz".to_string()]
        );
    }

    #[test]
    fn test_headers_to_map_skips_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", "application/json".parse().unwrap());
        headers.insert("connection", "keep-alive".parse().unwrap());
        headers.insert("transfer-encoding", "chunked".parse().unwrap());

        let map = headers_to_map(&headers);
        assert_eq!(map.len(), 1);
        assert!(map.contains_key("content-type"));
    }

    #[test]
    fn test_map_to_headers_normalizes_case() {
        let mut map = Headers::new();
        map.insert("Location".to_string(), vec!["/".to_string()]);

        let headers = map_to_headers(&map);
        assert_eq!(headers.get("location").unwrap(), "/");
    }

    #[test]
    fn test_map_to_headers_invalid_header_name() {
        let mut map = Headers::new();
        map.insert("valid-header".to_string(), vec!["value".to_string()]);
        map.insert("invalid header".to_string(), vec!["value".to_string()]);

        let headers = map_to_headers(&map);
        assert_eq!(headers.len(), 1);
        assert!(headers.get("valid-header").is_some());
    }

    #[test]
    fn test_roundtrip_with_multiple_values() {
        let mut original = HeaderMap::new();
        original.insert("accept", "text/html".parse().unwrap());
        original.append("accept", "application/json".parse().unwrap());

        let converted = map_to_headers(&headers_to_map(&original));
        let accept_values: Vec<_> = converted
            .get_all("accept")
            .iter()
            .map(|v| v.to_str().unwrap())
            .collect();
        assert_eq!(accept_values, vec!["text/html", "application/json"]);
    }

    #[test]
    fn test_header_value_is_case_insensitive() {
        let mut map = Headers::new();
        map.insert(
            "content-type".to_string(),
            vec!["application/x-www-form-urlencoded".to_string()],
        );

        assert_eq!(
            header_value(&map, "Content-Type"),
            Some("application/x-www-form-urlencoded")
        );
        assert_eq!(header_value(&map, "location"), None);
    }
}
