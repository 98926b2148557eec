//! Protocol-neutral view of one inbound request.
//!
//! Every rule evaluates against an [`Entity`]: a tagged variant over the three
//! request shapes the proxies produce (HTTP request, DNS request, raw packet).
//! Accessors return [`EntityError::NotSupported`] for operations a variant
//! cannot answer; `ip()` never fails.
//!
//! Body-bearing entities buffer their payload once at construction, so reads
//! are idempotent: any number of `body()`/`raw()` calls observe identical
//! bytes, and the eventual upstream forwarding replays the same buffer.

use std::net::IpAddr;

use bytes::Bytes;
use http::{HeaderMap, Method, Version};
use parking_lot::Mutex;

/// Error returned by entity accessors.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EntityError {
    /// The operation does not apply to this entity variant.
    #[error("not supported")]
    NotSupported,
}

/// One question from a DNS request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsQuestion {
    /// Record type, rendered (`A`, `AAAA`, `TXT`, ...).
    pub qtype: String,
    /// Queried name, as it appeared on the wire (trailing dot kept).
    pub name: String,
}

/// A buffered HTTP request.
#[derive(Debug)]
pub struct HttpEntity {
    ip: IpAddr,
    method: Method,
    path: String,
    query: Option<String>,
    version: Version,
    headers: HeaderMap,
    body: Bytes,
}

impl HttpEntity {
    /// Build an entity from the already-buffered parts of a request.
    ///
    /// `trust_headers` permits `X-Forwarded-For` / `X-Real-Ip` to override the
    /// socket peer address; otherwise the peer address wins. IPv4-mapped IPv6
    /// addresses are unmapped either way.
    pub fn new(
        peer: IpAddr,
        trust_headers: bool,
        method: Method,
        uri: &http::Uri,
        version: Version,
        headers: HeaderMap,
        body: Bytes,
    ) -> Self {
        let ip = if trust_headers {
            forwarded_ip(&headers).unwrap_or(peer)
        } else {
            peer
        };
        Self {
            ip: ip.to_canonical(),
            method,
            path: uri.path().to_string(),
            query: uri.query().map(str::to_string),
            version,
            headers,
            body,
        }
    }

    /// Canonical wire form of the request, headers and body included.
    fn dump(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256 + self.body.len());
        let target = match &self.query {
            Some(q) => format!("{}?{}", self.path, q),
            None => self.path.clone(),
        };
        out.extend_from_slice(
            format!("{} {} {:?}\r\n", self.method, target, self.version).as_bytes(),
        );
        for (name, value) in &self.headers {
            out.extend_from_slice(name.as_str().as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out
    }
}

/// Pull the client address out of proxy headers, first match wins.
fn forwarded_ip(headers: &HeaderMap) -> Option<IpAddr> {
    if let Some(xff) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = xff.split(',').next() {
            if let Ok(ip) = first.trim().parse::<IpAddr>() {
                return Some(ip);
            }
        }
    }
    headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

/// A parsed DNS request.
#[derive(Debug)]
pub struct DnsEntity {
    ip: IpAddr,
    questions: Vec<DnsQuestion>,
}

/// Accumulating byte buffer for TCP/UDP flows.
///
/// The TCP frontend shares one entity between both directions of a spliced
/// connection: the ingress side appends and re-evaluates under the content
/// lock, the egress side clears it. The lock keeps a single mutator at a time.
#[derive(Debug)]
pub struct RawEntity {
    from: IpAddr,
    content: Mutex<Vec<u8>>,
}

impl RawEntity {
    pub fn new(from: IpAddr, content: Vec<u8>) -> Self {
        Self {
            from: from.to_canonical(),
            content: Mutex::new(content),
        }
    }

    /// Append ingress bytes to the buffer.
    pub fn extend(&self, data: &[u8]) {
        self.content.lock().extend_from_slice(data);
    }

    /// Reset the buffer (egress observed a response; the next request starts
    /// fresh).
    pub fn clear(&self) {
        self.content.lock().clear();
    }

    /// Copy of the current buffer.
    pub fn snapshot(&self) -> Vec<u8> {
        self.content.lock().clone()
    }
}

/// The polymorphic subject of a decision.
#[derive(Debug)]
pub enum Entity {
    Http(HttpEntity),
    Dns(DnsEntity),
    Raw(RawEntity),
}

impl Entity {
    /// Build a DNS entity from the peer address and parsed questions.
    pub fn dns(peer: IpAddr, questions: Vec<DnsQuestion>) -> Self {
        Entity::Dns(DnsEntity {
            ip: peer.to_canonical(),
            questions,
        })
    }

    /// Source address of the request. Never fails.
    pub fn ip(&self) -> IpAddr {
        match self {
            Entity::Http(e) => e.ip,
            Entity::Dns(e) => e.ip,
            Entity::Raw(e) => e.from,
        }
    }

    /// Raw bytes of the request.
    ///
    /// HTTP: the canonical wire form including headers and body. DNS: one
    /// `"<TYPE> <NAME>\n"` line per question. Raw: a copy of the buffer.
    pub fn raw(&self) -> Result<Vec<u8>, EntityError> {
        match self {
            Entity::Http(e) => Ok(e.dump()),
            Entity::Dns(e) => {
                let mut out = Vec::new();
                for q in &e.questions {
                    out.extend_from_slice(q.qtype.as_bytes());
                    out.push(b' ');
                    out.extend_from_slice(q.name.as_bytes());
                    out.push(b'\n');
                }
                Ok(out)
            }
            Entity::Raw(e) => Ok(e.snapshot()),
        }
    }

    /// Request body. Repeatable: every call yields identical bytes.
    pub fn body(&self) -> Result<Bytes, EntityError> {
        match self {
            Entity::Http(e) => Ok(e.body.clone()),
            Entity::Dns(_) => Err(EntityError::NotSupported),
            Entity::Raw(e) => Ok(Bytes::from(e.snapshot())),
        }
    }

    /// HTTP method.
    pub fn method(&self) -> Result<&Method, EntityError> {
        match self {
            Entity::Http(e) => Ok(&e.method),
            _ => Err(EntityError::NotSupported),
        }
    }

    /// URL path component.
    pub fn path(&self) -> Result<&str, EntityError> {
        match self {
            Entity::Http(e) => Ok(&e.path),
            _ => Err(EntityError::NotSupported),
        }
    }

    /// Decoded query parameters, in order of appearance.
    pub fn query_pairs(&self) -> Result<Vec<(String, String)>, EntityError> {
        match self {
            Entity::Http(e) => Ok(e
                .query
                .as_deref()
                .map(|q| {
                    form_urlencoded::parse(q.as_bytes())
                        .map(|(k, v)| (k.into_owned(), v.into_owned()))
                        .collect()
                })
                .unwrap_or_default()),
            _ => Err(EntityError::NotSupported),
        }
    }

    /// All request headers.
    pub fn headers(&self) -> Result<&HeaderMap, EntityError> {
        match self {
            Entity::Http(e) => Ok(&e.headers),
            _ => Err(EntityError::NotSupported),
        }
    }

    /// Values of one header, case-insensitive. Non-UTF-8 values are skipped.
    pub fn header_values(&self, name: &str) -> Result<Vec<String>, EntityError> {
        let headers = self.headers()?;
        Ok(headers
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok().map(str::to_string))
            .collect())
    }

    /// Request cookies as name/value pairs.
    pub fn cookies(&self) -> Result<Vec<(String, String)>, EntityError> {
        let headers = self.headers()?;
        let mut out = Vec::new();
        for value in headers.get_all(http::header::COOKIE) {
            let Ok(value) = value.to_str() else { continue };
            for pair in value.split(';') {
                if let Some((k, v)) = pair.trim().split_once('=') {
                    out.push((k.to_string(), v.to_string()));
                }
            }
        }
        Ok(out)
    }

    /// Questions of a DNS request.
    pub fn questions(&self) -> Result<&[DnsQuestion], EntityError> {
        match self {
            Entity::Dns(e) => Ok(&e.questions),
            _ => Err(EntityError::NotSupported),
        }
    }

    /// Whether this entity exposes the HTTP surface.
    pub fn is_http(&self) -> bool {
        matches!(self, Entity::Http(_))
    }

    /// Access the raw-packet buffer, when this is a raw entity.
    pub fn as_raw(&self) -> Option<&RawEntity> {
        match self {
            Entity::Raw(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn http_entity(trust: bool, headers: HeaderMap, body: &[u8]) -> Entity {
        Entity::Http(HttpEntity::new(
            IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7)),
            trust,
            Method::POST,
            &"/api/v1/event?id=x".parse().unwrap(),
            Version::HTTP_11,
            headers,
            Bytes::copy_from_slice(body),
        ))
    }

    #[test]
    fn body_is_repeatable() {
        let e = http_entity(false, HeaderMap::new(), b"payload");
        for _ in 0..5 {
            assert_eq!(e.body().unwrap(), Bytes::from_static(b"payload"));
        }
    }

    #[test]
    fn raw_contains_request_line_headers_and_body() {
        let mut headers = HeaderMap::new();
        headers.insert("cookie", "k=v".parse().unwrap());
        let e = http_entity(false, headers, b"data");
        let raw = e.raw().unwrap();
        let raw = String::from_utf8(raw).unwrap();
        assert!(raw.starts_with("POST /api/v1/event?id=x HTTP/1.1\r\n"));
        assert!(raw.contains("cookie: k=v\r\n"));
        assert!(raw.ends_with("\r\n\r\ndata"));
    }

    #[test]
    fn peer_wins_without_trusted_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "198.51.100.1".parse().unwrap());
        let e = http_entity(false, headers, b"");
        assert_eq!(e.ip(), IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7)));
    }

    #[test]
    fn forwarded_for_wins_when_trusted() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            "198.51.100.1, 10.0.0.1".parse().unwrap(),
        );
        let e = http_entity(true, headers, b"");
        assert_eq!(e.ip(), IpAddr::V4(Ipv4Addr::new(198, 51, 100, 1)));
    }

    #[test]
    fn real_ip_fallback_when_trusted() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", "198.51.100.9".parse().unwrap());
        let e = http_entity(true, headers, b"");
        assert_eq!(e.ip(), IpAddr::V4(Ipv4Addr::new(198, 51, 100, 9)));
    }

    #[test]
    fn mapped_ipv6_is_unmapped() {
        let mapped = IpAddr::V6(Ipv6Addr::new(0, 0, 0, 0, 0, 0xffff, 0x0a00, 0x0001));
        let e = Entity::Raw(RawEntity::new(mapped, Vec::new()));
        assert_eq!(e.ip(), IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));
    }

    #[test]
    fn dns_raw_renders_one_line_per_question() {
        let e = Entity::dns(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            vec![
                DnsQuestion {
                    qtype: "A".into(),
                    name: "example.com.".into(),
                },
                DnsQuestion {
                    qtype: "TXT".into(),
                    name: "x.example.com.".into(),
                },
            ],
        );
        assert_eq!(
            e.raw().unwrap(),
            b"A example.com.\nTXT x.example.com.\n".to_vec()
        );
        assert_eq!(e.body(), Err(EntityError::NotSupported));
        assert_eq!(e.method().unwrap_err(), EntityError::NotSupported);
    }

    #[test]
    fn raw_packet_extend_and_clear() {
        let raw = RawEntity::new(IpAddr::V4(Ipv4Addr::LOCALHOST), b"ab".to_vec());
        raw.extend(b"cd");
        assert_eq!(raw.snapshot(), b"abcd");
        raw.clear();
        assert_eq!(raw.snapshot(), b"");
    }

    #[test]
    fn cookies_are_parsed_from_all_cookie_headers() {
        let mut headers = HeaderMap::new();
        headers.append("cookie", "a=1; b=2".parse().unwrap());
        headers.append("cookie", "c=3".parse().unwrap());
        let e = http_entity(false, headers, b"");
        assert_eq!(
            e.cookies().unwrap(),
            vec![
                ("a".to_string(), "1".to_string()),
                ("b".to_string(), "2".to_string()),
                ("c".to_string(), "3".to_string()),
            ]
        );
    }

    #[test]
    fn query_pairs_decode() {
        let e = Entity::Http(HttpEntity::new(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            false,
            Method::GET,
            &"/p?id=x&v=a%20b".parse().unwrap(),
            Version::HTTP_11,
            HeaderMap::new(),
            Bytes::new(),
        ));
        assert_eq!(
            e.query_pairs().unwrap(),
            vec![
                ("id".to_string(), "x".to_string()),
                ("v".to_string(), "a b".to_string()),
            ]
        );
    }
}
