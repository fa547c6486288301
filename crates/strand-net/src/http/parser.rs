use thiserror::Error;

use crate::Buffer;
use crate::http::message::{HttpMethod, HttpRequest, HttpResponse, HttpVersion};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HttpParseError {
    #[error("malformed start line")]
    BadStartLine,
    #[error("unsupported method")]
    BadMethod,
    #[error("unsupported version")]
    BadVersion,
    #[error("malformed header")]
    BadHeader,
    #[error("malformed chunk")]
    BadChunk,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ParseState {
    ExpectStartLine,
    ExpectHeaders,
    ExpectBody,
    Complete,
}

/// Which start line this end of the connection expects to parse.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HttpRole {
    /// Parses requests.
    Server,
    /// Parses responses.
    Client,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BodyFraming {
    /// No framing header: bytes stream until the connection closes.
    /// The long-lived RPC tunnel runs in this mode.
    Stream,
    Length(usize),
    Chunked,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ChunkStage {
    Size,
    Data(usize),
    DataCrlf,
    Trailer,
}

/// Incremental HTTP/1.1 message parser over a byte buffer.
///
/// State advances monotonically `start line → headers → body →
/// complete`; `reset` rewinds for the next message on the same
/// connection.
pub struct HttpParser {
    role: HttpRole,
    state: ParseState,
    framing: BodyFraming,
    received_body: usize,
    chunk: ChunkStage,
    request: HttpRequest,
    response: HttpResponse,
}

impl HttpParser {
    pub fn new(role: HttpRole) -> Self {
        Self {
            role,
            state: ParseState::ExpectStartLine,
            framing: BodyFraming::Stream,
            received_body: 0,
            chunk: ChunkStage::Size,
            request: HttpRequest::default(),
            response: HttpResponse::default(),
        }
    }

    pub fn state(&self) -> ParseState {
        self.state
    }

    pub fn headers_done(&self) -> bool {
        self.state >= ParseState::ExpectBody
    }

    pub fn is_complete(&self) -> bool {
        self.state == ParseState::Complete
    }

    /// Whether the message body streams indefinitely (no framing header).
    pub fn streaming_body(&self) -> bool {
        self.headers_done() && self.framing == BodyFraming::Stream
    }

    pub fn request(&self) -> &HttpRequest {
        &self.request
    }

    pub fn response(&self) -> &HttpResponse {
        &self.response
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.role);
    }

    /// Consumes as much of `buffer` as the current state allows. Stops
    /// cleanly when more bytes are needed.
    pub fn parse(&mut self, buffer: &mut Buffer) -> Result<(), HttpParseError> {
        loop {
            match self.state {
                ParseState::ExpectStartLine => {
                    let Some(end) = buffer.find_crlf() else { return Ok(()) };
                    let line = String::from_utf8_lossy(&buffer.peek()[..end]).into_owned();
                    buffer.consume(end + 2);
                    self.parse_start_line(&line)?;
                    self.state = ParseState::ExpectHeaders;
                }
                ParseState::ExpectHeaders => {
                    let Some(end) = buffer.find_crlf() else { return Ok(()) };
                    if end == 0 {
                        buffer.consume(2);
                        self.headers_complete();
                        continue;
                    }
                    let line = String::from_utf8_lossy(&buffer.peek()[..end]).into_owned();
                    buffer.consume(end + 2);
                    let (name, value) = line.split_once(':').ok_or(HttpParseError::BadHeader)?;
                    self.headers_mut().add(name.trim(), value.trim());
                }
                ParseState::ExpectBody => match self.framing {
                    BodyFraming::Stream => return Ok(()),
                    BodyFraming::Length(total) => {
                        let want = total - self.received_body;
                        let take = want.min(buffer.readable_bytes());
                        if take > 0 {
                            self.body_mut().extend_from_slice(&buffer.peek()[..take]);
                            buffer.consume(take);
                            self.received_body += take;
                        }
                        if self.received_body == total {
                            self.state = ParseState::Complete;
                            continue;
                        }
                        return Ok(());
                    }
                    BodyFraming::Chunked => {
                        if !self.parse_chunk(buffer)? {
                            return Ok(());
                        }
                    }
                },
                ParseState::Complete => return Ok(()),
            }
        }
    }

    fn parse_start_line(&mut self, line: &str) -> Result<(), HttpParseError> {
        match self.role {
            HttpRole::Server => {
                let mut parts = line.splitn(3, ' ');
                let method = parts.next().ok_or(HttpParseError::BadStartLine)?;
                let target = parts.next().ok_or(HttpParseError::BadStartLine)?;
                let version = parts.next().ok_or(HttpParseError::BadStartLine)?;
                self.request.method =
                    HttpMethod::parse(method).ok_or(HttpParseError::BadMethod)?;
                self.request.version =
                    HttpVersion::parse(version).ok_or(HttpParseError::BadVersion)?;
                match target.split_once('?') {
                    Some((path, query)) => {
                        self.request.path = path.to_owned();
                        self.request.query = Some(query.to_owned());
                    }
                    None => {
                        self.request.path = target.to_owned();
                        self.request.query = None;
                    }
                }
            }
            HttpRole::Client => {
                let mut parts = line.splitn(3, ' ');
                let version = parts.next().ok_or(HttpParseError::BadStartLine)?;
                let status = parts.next().ok_or(HttpParseError::BadStartLine)?;
                let reason = parts.next().unwrap_or("");
                self.response.version =
                    HttpVersion::parse(version).ok_or(HttpParseError::BadVersion)?;
                self.response.status =
                    status.parse().map_err(|_| HttpParseError::BadStartLine)?;
                self.response.reason = reason.to_owned();
            }
        }
        Ok(())
    }

    fn headers_complete(&mut self) {
        let framing = {
            let headers = self.headers();
            if let Some(len) = headers.get("Content-Length") {
                BodyFraming::Length(len.trim().parse().unwrap_or(0))
            } else if headers
                .get("Transfer-Encoding")
                .is_some_and(|te| te.eq_ignore_ascii_case("chunked"))
            {
                BodyFraming::Chunked
            } else {
                BodyFraming::Stream
            }
        };
        self.framing = framing;
        self.state = if self.framing == BodyFraming::Length(0) {
            ParseState::Complete
        } else {
            ParseState::ExpectBody
        };
    }

    /// One chunked-transfer step; `Ok(true)` means progress was made and
    /// the caller should loop again.
    fn parse_chunk(&mut self, buffer: &mut Buffer) -> Result<bool, HttpParseError> {
        match self.chunk {
            ChunkStage::Size => {
                let Some(end) = buffer.find_crlf() else { return Ok(false) };
                let line = String::from_utf8_lossy(&buffer.peek()[..end]).into_owned();
                buffer.consume(end + 2);
                let size_text = line.split(';').next().unwrap_or("").trim();
                let size =
                    usize::from_str_radix(size_text, 16).map_err(|_| HttpParseError::BadChunk)?;
                self.chunk = if size == 0 { ChunkStage::Trailer } else { ChunkStage::Data(size) };
                Ok(true)
            }
            ChunkStage::Data(remaining) => {
                let take = remaining.min(buffer.readable_bytes());
                if take == 0 {
                    return Ok(false);
                }
                self.body_mut().extend_from_slice(&buffer.peek()[..take]);
                buffer.consume(take);
                self.received_body += take;
                if take == remaining {
                    self.chunk = ChunkStage::DataCrlf;
                } else {
                    self.chunk = ChunkStage::Data(remaining - take);
                }
                Ok(true)
            }
            ChunkStage::DataCrlf => {
                if buffer.readable_bytes() < 2 {
                    return Ok(false);
                }
                if &buffer.peek()[..2] != b"\r\n" {
                    return Err(HttpParseError::BadChunk);
                }
                buffer.consume(2);
                self.chunk = ChunkStage::Size;
                Ok(true)
            }
            ChunkStage::Trailer => {
                // `0\r\n` seen; the message ends at the blank line.
                let Some(end) = buffer.find_crlf() else { return Ok(false) };
                buffer.consume(end + 2);
                if end == 0 {
                    self.state = ParseState::Complete;
                }
                Ok(true)
            }
        }
    }

    fn headers(&self) -> &crate::http::Headers {
        match self.role {
            HttpRole::Server => &self.request.headers,
            HttpRole::Client => &self.response.headers,
        }
    }

    fn headers_mut(&mut self) -> &mut crate::http::Headers {
        match self.role {
            HttpRole::Server => &mut self.request.headers,
            HttpRole::Client => &mut self.response.headers,
        }
    }

    fn body_mut(&mut self) -> &mut Vec<u8> {
        match self.role {
            HttpRole::Server => &mut self.request.body,
            HttpRole::Client => &mut self.response.body,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(parser: &mut HttpParser, bytes: &[u8]) -> Result<(), HttpParseError> {
        let mut buffer = Buffer::with_data(bytes);
        parser.parse(&mut buffer)
    }

    #[test]
    fn parses_request_with_content_length() {
        let mut parser = HttpParser::new(HttpRole::Server);
        feed(&mut parser, b"POST /echo?x=1 HTTP/1.1\r\nHost: a\r\nContent-Length: 5\r\n\r\nhello")
            .unwrap();
        assert!(parser.is_complete());
        assert_eq!(parser.request().method, HttpMethod::Post);
        assert_eq!(parser.request().path, "/echo");
        assert_eq!(parser.request().query.as_deref(), Some("x=1"));
        assert_eq!(parser.request().headers.get("host"), Some("a"));
        assert_eq!(parser.request().body, b"hello");
    }

    #[test]
    fn streams_body_without_framing_headers() {
        let mut parser = HttpParser::new(HttpRole::Client);
        feed(&mut parser, b"HTTP/1.1 200 OK\r\nConnection: Keep-Alive\r\n\r\n").unwrap();
        assert!(parser.headers_done());
        assert!(!parser.is_complete());
        assert!(parser.streaming_body());
        assert_eq!(parser.response().status, 200);
    }

    #[test]
    fn handles_split_delivery() {
        let mut parser = HttpParser::new(HttpRole::Server);
        let mut buffer = Buffer::new();
        buffer.append(b"GET / HT");
        parser.parse(&mut buffer).unwrap();
        assert_eq!(parser.state(), ParseState::ExpectStartLine);
        buffer.append(b"TP/1.1\r\nHo");
        parser.parse(&mut buffer).unwrap();
        assert_eq!(parser.state(), ParseState::ExpectHeaders);
        buffer.append(b"st: x\r\nContent-Length: 0\r\n\r\n");
        parser.parse(&mut buffer).unwrap();
        assert!(parser.is_complete());
    }

    #[test]
    fn parses_chunked_body() {
        let mut parser = HttpParser::new(HttpRole::Client);
        feed(
            &mut parser,
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nwiki\r\n5\r\npedia\r\n0\r\n\r\n",
        )
        .unwrap();
        assert!(parser.is_complete());
        assert_eq!(parser.response().body, b"wikipedia");
    }

    #[test]
    fn rejects_garbage_start_line() {
        let mut parser = HttpParser::new(HttpRole::Server);
        assert_eq!(feed(&mut parser, b"FROB /x HTTP/1.1\r\n"), Err(HttpParseError::BadMethod));
    }

    #[test]
    fn reset_rewinds_for_next_message() {
        let mut parser = HttpParser::new(HttpRole::Server);
        feed(&mut parser, b"GET /a HTTP/1.1\r\nContent-Length: 0\r\n\r\n").unwrap();
        assert!(parser.is_complete());
        parser.reset();
        assert_eq!(parser.state(), ParseState::ExpectStartLine);
        feed(&mut parser, b"GET /b HTTP/1.1\r\nContent-Length: 0\r\n\r\n").unwrap();
        assert_eq!(parser.request().path, "/b");
    }
}
