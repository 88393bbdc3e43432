use std::collections::{BTreeMap, HashSet};

/// Headers that apply to a single transport connection and must not cross
/// the proxy in either direction.
pub const HOP_HEADERS: [&str; 9] = [
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Noisy edge/CDN headers skipped when logging captured requests.
pub const HEADERS_TO_OMIT: [&str; 8] = [
    "x-forwarded-proto",
    "cf-ipcountry",
    "cf-ray",
    "x-real-ip",
    "cf-visitor",
    "cf-connecting-ip",
    "cdn-loop",
    "x-forwarded-for",
];

/// Join two path components with exactly one slash. An empty `b` leaves `a`
/// untouched; an empty `a` yields an absolute `b`.
pub fn single_joining_slash(a: &str, b: &str) -> String {
    let a_slash = a.ends_with('/');
    let b_slash = b.starts_with('/');
    match (a_slash, b_slash) {
        (true, true) => format!("{}{}", a, &b[1..]),
        (false, false) => {
            if b.is_empty() {
                a.to_string()
            } else if a.is_empty() {
                format!("/{}", b)
            } else {
                format!("{}/{}", a, b)
            }
        }
        _ => format!("{}{}", a, b),
    }
}

/// The full set of header names to strip: the fixed hop-by-hop list plus any
/// names carried in the message's own `Connection` header value.
pub fn hop_by_hop_names(connection_value: Option<&str>) -> HashSet<String> {
    let mut names: HashSet<String> = HOP_HEADERS.iter().map(|h| h.to_string()).collect();
    if let Some(value) = connection_value {
        for part in value.split(',') {
            let name = part.trim().to_ascii_lowercase();
            if !name.is_empty() {
                names.insert(name);
            }
        }
    }
    names
}

/// Serialize header (name, value) pairs to a JSON object of
/// `name -> [values...]`, names lowercased.
pub fn headers_to_json(
    pairs: impl Iterator<Item = (String, String)>,
) -> anyhow::Result<String> {
    let mut map: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, value) in pairs {
        map.entry(name.to_ascii_lowercase()).or_default().push(value);
    }
    Ok(serde_json::to_string(&map)?)
}

/// Serialize a raw query string to a JSON object of `name -> [values...]`.
pub fn query_params_json(query: &str) -> anyhow::Result<String> {
    let mut map: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, value) in url::form_urlencoded::parse(query.as_bytes()) {
        map.entry(name.into_owned())
            .or_default()
            .push(value.into_owned());
    }
    Ok(serde_json::to_string(&map)?)
}

/// Client IP reported upstream: leftmost `X-Forwarded-For` entry, then
/// `X-Real-IP`, then the host portion of the peer address.
pub fn forwarded_client_ip(
    headers: &actix_web::http::header::HeaderMap,
    peer_addr: &str,
) -> String {
    if let Some(fwd) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = fwd.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    if let Some(real) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        if !real.is_empty() {
            return real.to_string();
        }
    }
    host_of_addr(peer_addr)
}

/// Host portion of a `host:port` address; returns the input unchanged when
/// no port separator is present.
pub fn host_of_addr(addr: &str) -> String {
    match addr.rfind(':') {
        Some(idx) => addr[..idx].to_string(),
        None => addr.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::http::header::{HeaderMap, HeaderName, HeaderValue};

    #[test]
    fn joining_slash_covers_all_shapes() {
        assert_eq!(single_joining_slash("/base/", "/foo"), "/base/foo");
        assert_eq!(single_joining_slash("/base", "foo"), "/base/foo");
        assert_eq!(single_joining_slash("/base/", "foo"), "/base/foo");
        assert_eq!(single_joining_slash("/base", "/foo"), "/base/foo");
        assert_eq!(single_joining_slash("", "foo"), "/foo");
        assert_eq!(single_joining_slash("", "/foo"), "/foo");
        assert_eq!(single_joining_slash("/base", ""), "/base");
        assert_eq!(single_joining_slash("/", "/foo"), "/foo");
    }

    #[test]
    fn joining_slash_never_doubles() {
        for a in ["", "/", "/a", "/a/"] {
            for b in ["", "/", "/b", "b"] {
                let joined = single_joining_slash(a, b);
                assert!(!joined.contains("//"), "{:?} + {:?} = {:?}", a, b, joined);
            }
        }
    }

    #[test]
    fn hop_names_include_connection_listed() {
        let names = hop_by_hop_names(Some("X-Custom, Keep-Alive"));
        assert!(names.contains("x-custom"));
        assert!(names.contains("keep-alive"));
        assert!(names.contains("transfer-encoding"));
        assert!(names.contains("upgrade"));

        let names = hop_by_hop_names(None);
        assert_eq!(names.len(), HOP_HEADERS.len());
    }

    #[test]
    fn headers_json_groups_values() {
        let pairs = vec![
            ("Accept".to_string(), "text/html".to_string()),
            ("accept".to_string(), "application/json".to_string()),
            ("X-One".to_string(), "1".to_string()),
        ];
        let json = headers_to_json(pairs.into_iter()).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["accept"].as_array().unwrap().len(), 2);
        assert_eq!(parsed["x-one"][0], "1");
    }

    #[test]
    fn query_params_json_groups_values() {
        let json = query_params_json("x=1&y=a&y=b").unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["x"][0], "1");
        assert_eq!(parsed["y"].as_array().unwrap().len(), 2);

        assert_eq!(query_params_json("").unwrap(), "{}");
    }

    #[test]
    fn client_ip_precedence() {
        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::from_static("x-forwarded-for"),
            HeaderValue::from_static("10.0.0.1, 10.0.0.2"),
        );
        headers.insert(
            HeaderName::from_static("x-real-ip"),
            HeaderValue::from_static("10.0.0.9"),
        );
        assert_eq!(forwarded_client_ip(&headers, "127.0.0.1:5000"), "10.0.0.1");

        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::from_static("x-real-ip"),
            HeaderValue::from_static("10.0.0.9"),
        );
        assert_eq!(forwarded_client_ip(&headers, "127.0.0.1:5000"), "10.0.0.9");

        let headers = HeaderMap::new();
        assert_eq!(forwarded_client_ip(&headers, "127.0.0.1:5000"), "127.0.0.1");
    }

    #[test]
    fn host_of_addr_trims_port_only() {
        assert_eq!(host_of_addr("127.0.0.1:5000"), "127.0.0.1");
        assert_eq!(host_of_addr("[::1]:5000"), "[::1]");
        assert_eq!(host_of_addr("localhost"), "localhost");
    }
}
