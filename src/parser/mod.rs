//! Incremental, callback-free HTTP/1.1 tokenizer.
//!
//! Grounded on the external-tokenizer shape described by
//! `original_source/code_root/cc/net/http_parser.{h,cc}` and on the
//! teacher's `nom`/`bstr` combinator style in `parsers.rs` and
//! `htp_request_generic.rs`. The teacher's own parser tracks two
//! transaction-aware streams with security-analysis hooks; this module
//! keeps only what the engine needs: feed bytes in arbitrary-sized pieces,
//! ask whether a full message has been parsed, and read back its pieces.
//!
//! Feeding the exact same byte sequence through any chunking of `execute`
//! calls yields identical parsed output, since all partial state (an
//! unconsumed line fragment, a header being folded, a chunk still being
//! read) is carried in `HttpParser` between calls rather than assumed to
//! arrive in one piece.
mod state;

use bstr::BString;
use nom::{
    bytes::complete::{tag, take_till1, take_while1},
    character::complete::space1,
    combinator::rest,
    sequence::tuple,
    IResult,
};
use state::{HeaderElement, State};

/// Which half of the HTTP exchange a parser instance tokenizes. Set once,
/// before the first `execute` call.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Mode {
    Request,
    Response,
}

fn is_not_space(c: u8) -> bool {
    c != b' '
}

fn is_token(c: u8) -> bool {
    c != b':' && c != b'\r' && c != b'\n'
}

/// `METHOD SP URL SP HTTP/M.m`
fn request_line(input: &[u8]) -> IResult<&[u8], (&[u8], &[u8], &[u8])> {
    let (input, method) = take_while1(is_not_space)(input)?;
    let (input, _) = space1(input)?;
    let (input, url) = take_till1(|c| c == b' ')(input)?;
    let (input, _) = space1(input)?;
    let (input, version) = rest(input)?;
    Ok((input, (method, url, version)))
}

/// `HTTP/M.m SP STATUS SP REASON` (reason may be empty)
fn status_line(input: &[u8]) -> IResult<&[u8], (&[u8], &[u8], &[u8])> {
    let (input, (version, _, status)) =
        tuple((take_while1(is_not_space), space1, take_while1(|c: u8| c.is_ascii_digit())))(input)?;
    let (input, reason) = if input.is_empty() {
        (input, &input[..0])
    } else {
        let (input, _) = space1(input)?;
        rest(input)?
    };
    Ok((input, (version, status, reason)))
}

fn header_line(input: &[u8]) -> IResult<&[u8], (&[u8], &[u8])> {
    let (input, name) = take_while1(is_token)(input)?;
    let (input, _) = tag(":")(input)?;
    let (input, value) = rest(input)?;
    Ok((input, (name, value)))
}

fn trim(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|b| !b.is_ascii_whitespace()).unwrap_or(bytes.len());
    let end = bytes.iter().rposition(|b| !b.is_ascii_whitespace()).map(|i| i + 1).unwrap_or(start);
    &bytes[start..end]
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

/// An incremental HTTP/1.1 message tokenizer, either half.
pub struct HttpParser {
    mode: Mode,
    state: State,
    expect_head_only: bool,
    buf: Vec<u8>,
    ok: bool,
    completed: bool,

    method: BString,
    url: BString,
    http_version: (u8, u8),
    status_code: u16,
    reason: BString,

    headers: Vec<(BString, BString)>,
    last_header_element: HeaderElement,

    body: Vec<u8>,
    content_length: Option<i64>,
    body_remaining: i64,
    chunk_remaining: i64,
}

impl HttpParser {
    pub fn new(mode: Mode) -> Self {
        Self {
            mode,
            state: State::Line,
            expect_head_only: false,
            buf: Vec::new(),
            ok: true,
            completed: false,
            method: BString::from(Vec::new()),
            url: BString::from(Vec::new()),
            http_version: (0, 0),
            status_code: 0,
            reason: BString::from(Vec::new()),
            headers: Vec::new(),
            last_header_element: HeaderElement::Value,
            body: Vec::new(),
            content_length: None,
            body_remaining: 0,
            chunk_remaining: 0,
        }
    }

    /// Marks this parser as only expecting headers, no body (HEAD
    /// responses). Mirrors `HttpParser::set_expect_head_only`.
    pub fn set_expect_head_only(&mut self, value: bool) {
        self.expect_head_only = value;
    }

    /// Feeds another slice of bytes. May be called any number of times with
    /// arbitrarily small slices; parsing progresses as far as the buffered
    /// data allows and stops cleanly when more input is needed.
    pub fn execute(&mut self, data: &[u8]) {
        if !self.ok || self.completed {
            return;
        }
        self.buf.extend_from_slice(data);
        loop {
            if self.completed || !self.ok {
                break;
            }
            match self.state {
                State::Line => {
                    if !self.drain_line(Self::on_first_line) {
                        break;
                    }
                }
                State::Headers => {
                    if !self.drain_line(Self::on_header_line) {
                        break;
                    }
                }
                State::BodyIdentity => {
                    if !self.consume_identity_body() {
                        break;
                    }
                }
                State::BodyChunkedLength => {
                    if !self.drain_line(Self::on_chunk_length_line) {
                        break;
                    }
                }
                State::BodyChunkedData => {
                    if !self.consume_chunk_data() {
                        break;
                    }
                }
                State::BodyChunkedDataEnd => {
                    if !self.drain_line(|_, _| true) {
                        break;
                    }
                    self.state = State::BodyChunkedLength;
                }
                State::Trailers => {
                    if !self.drain_line(Self::on_trailer_line) {
                        break;
                    }
                }
                State::Done => break,
            }
        }
    }

    /// Signals that the underlying stream has closed. Only meaningful for
    /// an identity body with no declared `Content-Length`
    /// (`BODY_IDENTITY_STREAM_CLOSE` in the original taxonomy), where
    /// end-of-message is defined by connection close rather than a count.
    pub fn finish(&mut self) {
        if self.state == State::BodyIdentity && self.content_length.is_none() {
            self.completed = true;
            self.state = State::Done;
        }
    }

    fn drain_line(&mut self, on_line: impl FnOnce(&mut Self, &[u8]) -> bool) -> bool {
        match find_crlf(&self.buf) {
            Some(pos) => {
                let line: Vec<u8> = self.buf[..pos].to_vec();
                self.buf.drain(..pos + 2);
                on_line(self, &line)
            }
            None => false,
        }
    }

    fn fail(&mut self) -> bool {
        self.ok = false;
        true
    }

    fn on_first_line(&mut self, line: &[u8]) -> bool {
        match self.mode {
            Mode::Request => match request_line(line) {
                Ok((_, (method, url, version))) => {
                    self.method = BString::from(method.to_vec());
                    self.url = BString::from(url.to_vec());
                    self.http_version = parse_version(version);
                    self.state = State::Headers;
                    true
                }
                Err(_) => self.fail(),
            },
            Mode::Response => match status_line(line) {
                Ok((_, (version, status, reason))) => {
                    self.http_version = parse_version(version);
                    self.status_code = std::str::from_utf8(status).ok().and_then(|s| s.parse().ok()).unwrap_or(0);
                    self.reason = BString::from(reason.to_vec());
                    self.state = State::Headers;
                    true
                }
                Err(_) => self.fail(),
            },
        }
    }

    fn on_header_line(&mut self, line: &[u8]) -> bool {
        if line.is_empty() {
            return self.on_headers_complete();
        }
        if (line[0] == b' ' || line[0] == b'\t') && !self.headers.is_empty() {
            if let Some((_, last_value)) = self.headers.last_mut() {
                let mut folded: Vec<u8> = last_value.as_bytes().to_vec();
                folded.push(b' ');
                folded.extend_from_slice(trim(line));
                *last_value = BString::from(folded);
            }
            self.last_header_element = HeaderElement::Value;
            return true;
        }
        match header_line(line) {
            Ok((_, (name, value))) => {
                self.headers.push((BString::from(name.to_vec()), BString::from(trim(value).to_vec())));
                self.last_header_element = HeaderElement::Field;
                true
            }
            Err(_) => self.fail(),
        }
    }

    fn on_headers_complete(&mut self) -> bool {
        let chunked = self.header_value("transfer-encoding").map(|v| v.eq_ignore_ascii_case(b"chunked")).unwrap_or(false);
        let content_length = self.header_value("content-length").and_then(|v| {
            std::str::from_utf8(v).ok().and_then(|s| s.trim().parse::<i64>().ok())
        });

        if self.expect_head_only || (self.mode == Mode::Response && self.status_code / 100 == 1) {
            self.completed = true;
            self.state = State::Done;
            return true;
        }

        if chunked {
            self.state = State::BodyChunkedLength;
        } else if let Some(len) = content_length {
            self.content_length = Some(len);
            self.body_remaining = len;
            self.state = if len == 0 {
                self.completed = true;
                State::Done
            } else {
                State::BodyIdentity
            };
        } else if self.mode == Mode::Request {
            // No declared body on a request with neither header: no body.
            self.completed = true;
            self.state = State::Done;
        } else {
            // Response with no length information: body runs to stream close.
            self.state = State::BodyIdentity;
        }
        true
    }

    fn consume_identity_body(&mut self) -> bool {
        if self.buf.is_empty() {
            return false;
        }
        let take = (if self.content_length.is_some() {
            self.body_remaining.max(0) as usize
        } else {
            self.buf.len()
        })
        .min(self.buf.len());
        if take == 0 && self.content_length.is_some() {
            self.completed = true;
            self.state = State::Done;
            return true;
        }
        self.body.extend_from_slice(&self.buf[..take]);
        self.buf.drain(..take);
        if self.content_length.is_some() {
            self.body_remaining -= take as i64;
            if self.body_remaining <= 0 {
                self.completed = true;
                self.state = State::Done;
            }
            true
        } else {
            // Stream-close-terminated body: keep consuming whatever arrives.
            false
        }
    }

    fn on_chunk_length_line(&mut self, line: &[u8]) -> bool {
        let hex_part = line.split(|&b| b == b';').next().unwrap_or(line);
        let hex_part = trim(hex_part);
        match std::str::from_utf8(hex_part).ok().and_then(|s| i64::from_str_radix(s, 16).ok()) {
            Some(0) => {
                self.state = State::Trailers;
                true
            }
            Some(n) if n > 0 => {
                self.chunk_remaining = n;
                self.state = State::BodyChunkedData;
                true
            }
            _ => self.fail(),
        }
    }

    fn consume_chunk_data(&mut self) -> bool {
        if self.buf.is_empty() {
            return false;
        }
        let take = (self.chunk_remaining as usize).min(self.buf.len());
        if take == 0 {
            self.state = State::BodyChunkedDataEnd;
            return true;
        }
        self.body.extend_from_slice(&self.buf[..take]);
        self.buf.drain(..take);
        self.chunk_remaining -= take as i64;
        if self.chunk_remaining == 0 {
            self.state = State::BodyChunkedDataEnd;
        }
        true
    }

    fn on_trailer_line(&mut self, line: &[u8]) -> bool {
        if line.is_empty() {
            self.completed = true;
            self.state = State::Done;
            return true;
        }
        match header_line(line) {
            Ok((_, (name, value))) => {
                self.headers.push((BString::from(name.to_vec()), BString::from(trim(value).to_vec())));
                true
            }
            Err(_) => self.fail(),
        }
    }

    fn header_value(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .rev()
            .find(|(n, _)| n.eq_ignore_ascii_case(name.as_bytes()))
            .map(|(_, v)| v.as_bytes())
    }

    pub fn completed(&self) -> bool {
        self.completed
    }

    pub fn ok(&self) -> bool {
        self.ok
    }

    pub fn method(&self) -> &[u8] {
        &self.method
    }

    pub fn url(&self) -> &[u8] {
        &self.url
    }

    pub fn status_code(&self) -> u16 {
        self.status_code
    }

    pub fn reason(&self) -> &[u8] {
        &self.reason
    }

    pub fn http_version(&self) -> String {
        format!("{}.{}", self.http_version.0, self.http_version.1)
    }

    pub fn header_count(&self) -> usize {
        self.headers.len()
    }

    pub fn header_name(&self, index: usize) -> &[u8] {
        &self.headers[index].0
    }

    pub fn header_value_at(&self, index: usize) -> &[u8] {
        &self.headers[index].1
    }

    pub fn headers(&self) -> &[(BString, BString)] {
        &self.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }
}

fn parse_version(bytes: &[u8]) -> (u8, u8) {
    let s = String::from_utf8_lossy(bytes);
    let s = s.trim();
    let digits = s.strip_prefix("HTTP/").unwrap_or(s);
    let mut parts = digits.splitn(2, '.');
    let major = parts.next().and_then(|p| p.parse().ok()).unwrap_or(1);
    let minor = parts.next().and_then(|p| p.parse().ok()).unwrap_or(1);
    (major, minor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_get_in_arbitrary_chunks() {
        let raw = b"GET /index HTTP/1.1\r\nHost: example.com\r\n\r\n";
        let mut parser = HttpParser::new(Mode::Request);
        for chunk in raw.chunks(6) {
            parser.execute(chunk);
        }
        assert!(parser.ok());
        assert!(parser.completed());
        assert_eq!(parser.method(), b"GET");
        assert_eq!(parser.url(), b"/index");
        assert_eq!(parser.http_version(), "1.1");
        assert_eq!(parser.header_count(), 1);
        assert_eq!(parser.header_name(0), b"Host");
        assert_eq!(parser.header_value_at(0), b"example.com");
        assert!(parser.body().is_empty());
    }

    #[test]
    fn parses_post_with_content_length_fed_in_six_byte_chunks() {
        let raw = b"POST /submit HTTP/1.1\r\nHost: h\r\nContent-Length: 11\r\n\r\nhello world";
        let mut parser = HttpParser::new(Mode::Request);
        for chunk in raw.chunks(6) {
            parser.execute(chunk);
        }
        assert!(parser.ok());
        assert!(parser.completed());
        assert_eq!(parser.body(), b"hello world");
    }

    #[test]
    fn parses_chunked_request_body_fed_in_six_byte_chunks() {
        let raw = b"POST /submit HTTP/1.1\r\nHost: h\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n";
        let mut parser = HttpParser::new(Mode::Request);
        for chunk in raw.chunks(6) {
            parser.execute(chunk);
        }
        assert!(parser.ok());
        assert!(parser.completed());
        assert_eq!(parser.body(), b"Wikipedia");
    }

    #[test]
    fn parses_chunked_response_and_concatenates_body() {
        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nfoo\r\n3\r\nbar\r\n0\r\n\r\n";
        let mut parser = HttpParser::new(Mode::Response);
        parser.execute(raw);
        assert!(parser.ok());
        assert!(parser.completed());
        assert_eq!(parser.status_code(), 200);
        assert_eq!(parser.reason(), b"OK");
        assert_eq!(parser.body(), b"foobar");
    }

    #[test]
    fn duplicate_headers_preserved_in_order() {
        let raw = b"GET / HTTP/1.1\r\nX-A: 1\r\nX-A: 2\r\n\r\n";
        let mut parser = HttpParser::new(Mode::Request);
        parser.execute(raw);
        assert_eq!(parser.header_count(), 2);
        assert_eq!(parser.header_value_at(0), b"1");
        assert_eq!(parser.header_value_at(1), b"2");
    }

    #[test]
    fn folded_header_value_is_appended_to_previous() {
        let raw = b"GET / HTTP/1.1\r\nX-A: first\r\n second\r\n\r\n";
        let mut parser = HttpParser::new(Mode::Request);
        parser.execute(raw);
        assert_eq!(parser.header_count(), 1);
        assert_eq!(parser.header_value_at(0), b"first second");
    }
}
