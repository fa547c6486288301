use crate::Buffer;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
    Head,
    Options,
}

impl HttpMethod {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "GET" => Some(Self::Get),
            "POST" => Some(Self::Post),
            "PUT" => Some(Self::Put),
            "DELETE" => Some(Self::Delete),
            "HEAD" => Some(Self::Head),
            "OPTIONS" => Some(Self::Options),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Head => "HEAD",
            Self::Options => "OPTIONS",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum HttpVersion {
    Http10,
    #[default]
    Http11,
}

impl HttpVersion {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "HTTP/1.0" => Some(Self::Http10),
            "HTTP/1.1" => Some(Self::Http11),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http10 => "HTTP/1.0",
            Self::Http11 => "HTTP/1.1",
        }
    }
}

/// Ordered header list; lookup is case-insensitive and duplicates are
/// kept.
#[derive(Clone, Debug, Default)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// First value for `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.entries
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Clone, Debug)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub path: String,
    pub query: Option<String>,
    pub version: HttpVersion,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl Default for HttpRequest {
    fn default() -> Self {
        Self {
            method: HttpMethod::Get,
            path: "/".to_owned(),
            query: None,
            version: HttpVersion::Http11,
            headers: Headers::default(),
            body: Vec::new(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct HttpResponse {
    pub version: HttpVersion,
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl Default for HttpResponse {
    fn default() -> Self {
        Self {
            version: HttpVersion::Http11,
            status: 200,
            reason: "OK".to_owned(),
            headers: Headers::default(),
            body: Vec::new(),
        }
    }
}

impl HttpResponse {
    pub fn new(status: u16, reason: impl Into<String>) -> Self {
        Self { status, reason: reason.into(), ..Self::default() }
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Serialises start line, headers and body; Content-Length is filled
    /// in unless the caller already set a framing header.
    pub fn encode(&self, buffer: &mut Buffer) {
        buffer.append(
            format!("{} {} {}\r\n", self.version.as_str(), self.status, self.reason).as_bytes(),
        );
        for (name, value) in self.headers.iter() {
            buffer.append(format!("{name}: {value}\r\n").as_bytes());
        }
        if self.headers.get("Content-Length").is_none() && self.headers.get("Transfer-Encoding").is_none()
        {
            buffer.append(format!("Content-Length: {}\r\n", self.body.len()).as_bytes());
        }
        buffer.append(b"\r\n");
        buffer.append(&self.body);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_lookup_is_case_insensitive_and_keeps_duplicates() {
        let mut headers = Headers::default();
        headers.add("Content-Type", "text/plain");
        headers.add("Set-Cookie", "a=1");
        headers.add("set-cookie", "b=2");
        assert_eq!(headers.get("content-type"), Some("text/plain"));
        let cookies: Vec<&str> = headers.get_all("SET-COOKIE").collect();
        assert_eq!(cookies, vec!["a=1", "b=2"]);
    }

    #[test]
    fn response_encodes_with_content_length() {
        let response = HttpResponse::new(404, "Not Found").with_body("nope");
        let mut buffer = Buffer::new();
        response.encode(&mut buffer);
        let text = String::from_utf8(buffer.peek().to_vec()).unwrap();
        assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(text.contains("Content-Length: 4\r\n"));
        assert!(text.ends_with("\r\n\r\nnope"));
    }
}
