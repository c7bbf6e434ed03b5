//! A minimal blocking HTTP client used by integration tests, grounded on
//! `original_source/code_root/cc/net/http_client.cc`. Not part of the
//! server's public surface beyond what tests need to drive it end to end.
use crate::parser::{HttpParser, Mode};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};

fn common_lines(method: &str, host: &str, port: &str, url: &str, keep_alive: bool) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(method.as_bytes());
    out.extend_from_slice(b" ");
    out.extend_from_slice(url.as_bytes());
    out.extend_from_slice(b" HTTP/1.1\r\n");
    out.extend_from_slice(format!("Host: {}:{}\r\n", host, port).as_bytes());
    if keep_alive {
        out.extend_from_slice(b"Connection: keep-alive\r\n");
    } else {
        out.extend_from_slice(b"Connection: close\r\n");
    }
    out
}

/// Builds the bytes of a GET request. Grounded on
/// `HttpClient::build_get_header`; exposed standalone so the exact wire
/// format can be tested without a real connection.
pub fn build_get_header(host: &str, port: &str, url: &str, keep_alive: bool) -> Vec<u8> {
    let mut out = common_lines("GET", host, port, url, keep_alive);
    out.extend_from_slice(b"Accept: */*\r\n\r\n");
    out
}

/// Builds the bytes of a POST request's header (not including the body).
/// Grounded on `HttpClient::build_post_header`, which takes and emits
/// `accepted_encoding` as the last header before the blank line.
pub fn build_post_header(
    host: &str,
    port: &str,
    url: &str,
    content_type: &str,
    byte_count: usize,
    extra_headers: &[(&str, &str)],
    accepted_encoding: &str,
    keep_alive: bool,
) -> Vec<u8> {
    let mut out = common_lines("POST", host, port, url, keep_alive);
    out.extend_from_slice(format!("Content-Length: {}\r\n", byte_count).as_bytes());
    out.extend_from_slice(format!("Content-Type: {}\r\n", content_type).as_bytes());
    for (name, value) in extra_headers {
        out.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
    }
    out.extend_from_slice(format!("Accept-Encoding: {}\r\n", accepted_encoding).as_bytes());
    out.extend_from_slice(b"\r\n");
    out
}

pub struct HttpClient {
    stream: TcpStream,
    host: String,
    port: String,
}

impl HttpClient {
    pub fn connect(addr: SocketAddr) -> io::Result<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        Ok(Self { stream, host: addr.ip().to_string(), port: addr.port().to_string() })
    }

    /// Sends a GET request and blocks until a full response has been
    /// parsed. Grounded on `HttpClient::send_get_request`.
    pub fn send_get_request(&mut self, url: &str, keep_alive: bool) -> io::Result<HttpParser> {
        let header = build_get_header(&self.host, &self.port, url, keep_alive);
        self.stream.write_all(&header)?;
        self.retrieve_response()
    }

    /// Sends a POST request with `payload` and blocks until a full response
    /// has been parsed. Grounded on `HttpClient::send_post_request`.
    pub fn send_post_request(
        &mut self,
        url: &str,
        content_type: &str,
        payload: &[u8],
        extra_headers: &[(&str, &str)],
        accepted_encoding: &str,
        keep_alive: bool,
    ) -> io::Result<HttpParser> {
        let mut out = build_post_header(
            &self.host,
            &self.port,
            url,
            content_type,
            payload.len(),
            extra_headers,
            accepted_encoding,
            keep_alive,
        );
        out.extend_from_slice(payload);
        self.stream.write_all(&out)?;
        self.retrieve_response()
    }

    fn retrieve_response(&mut self) -> io::Result<HttpParser> {
        let mut parser = HttpParser::new(Mode::Response);
        let mut buf = [0u8; 1024];
        while !parser.completed() {
            let n = self.stream.read(&mut buf)?;
            if n == 0 {
                parser.finish();
                break;
            }
            parser.execute(&buf[..n]);
            if !parser.ok() {
                return Err(io::Error::new(io::ErrorKind::InvalidData, "malformed response"));
            }
        }
        Ok(parser)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_get_header_emits_exact_bytes() {
        let header = build_get_header("TEST_HOST", "TEST_PORT", "TEST_URL", false);
        assert_eq!(
            header,
            b"GET TEST_URL HTTP/1.1\r\nHost: TEST_HOST:TEST_PORT\r\nConnection: close\r\nAccept: */*\r\n\r\n".to_vec()
        );
    }
}
