use crate::parser::HttpParser;
use crate::reactor::Reactor;
use std::sync::Arc;

/// A request/response-builder instance handed to a [`RequestProcessor`],
/// grounded on `original_source/code_root/cc/net/http_request_instance.cc`.
/// Read accessors delegate to the parsed request; response state
/// accumulates in `headers`/`body` until [`commit`](Self::commit) writes it
/// to the wire exactly once.
pub struct Request {
    reactor: Arc<Reactor>,
    connection_handle: u64,
    instance_id: u64,
    parser: HttpParser,
    committed: bool,

    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl Request {
    pub(crate) fn new(reactor: Arc<Reactor>, connection_handle: u64, instance_id: u64, parser: HttpParser) -> Self {
        Self {
            reactor,
            connection_handle,
            instance_id,
            parser,
            committed: false,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    /// The ready-pool / handle-table id this request was registered under.
    pub fn id(&self) -> u64 {
        self.instance_id
    }

    /// Sets the instance id after the fact, once the handle table has
    /// allocated one for it. `add_ready` constructs the `Request` before
    /// the id exists (the handle table needs the context to exist first),
    /// so this patches it in immediately afterward.
    pub(crate) fn set_id(&mut self, id: u64) {
        self.instance_id = id;
    }

    pub fn http_method(&self) -> &[u8] {
        self.parser.method()
    }

    pub fn http_version(&self) -> String {
        self.parser.http_version()
    }

    pub fn url(&self) -> &[u8] {
        self.parser.url()
    }

    pub fn header_count(&self) -> usize {
        self.parser.header_count()
    }

    pub fn header_name(&self, index: usize) -> &[u8] {
        self.parser.header_name(index)
    }

    pub fn header_value(&self, index: usize) -> &[u8] {
        self.parser.header_value_at(index)
    }

    pub fn body(&self) -> &[u8] {
        self.parser.body()
    }

    /// Sets the response `Content-Type`. Equivalent to calling
    /// `set_response_header("Content-Type", content_type)` — see
    /// DESIGN.md's Open Question (b): unlike the original, this value is
    /// actually emitted on `commit`.
    pub fn set_content_type(&mut self, content_type: impl Into<String>) {
        self.set_response_header("Content-Type", content_type);
    }

    /// Sets (or replaces) a response header. Last write for a given name
    /// (case-sensitively, matching the original's plain string map key)
    /// wins.
    pub fn set_response_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        if let Some(existing) = self.headers.iter_mut().find(|(n, _)| *n == name) {
            existing.1 = value.into();
        } else {
            self.headers.push((name, value.into()));
        }
    }

    /// Appends raw bytes to the response body.
    pub fn append_body(&mut self, data: &[u8]) {
        self.body.extend_from_slice(data);
    }

    /// Appends UTF-8 text to the response body.
    pub fn append_body_text(&mut self, text: &str) {
        self.append_body(text.as_bytes());
    }

    fn build_header(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64 + self.headers.len() * 32);
        // Status line is fixed; see DESIGN.md Open Question (a).
        out.extend_from_slice(b"HTTP/1.1 200 OK\r\n");
        out.extend_from_slice(b"Content-Length: ");
        out.extend_from_slice(self.body.len().to_string().as_bytes());
        out.extend_from_slice(b"\r\n");
        for (name, value) in &self.headers {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out
    }

    /// Writes the response to the wire. Panics if called more than once,
    /// matching the original's `CHECK(!committed_) << "Cannot commit more
    /// than once."` — commit is meant to be called exactly once per
    /// request, whether by a user processor or the timeout processor.
    pub fn commit(&mut self) {
        assert!(!self.committed, "cannot commit more than once");
        let mut payload = self.build_header();
        payload.extend_from_slice(&self.body);
        self.reactor.send_blocking(self.connection_handle, &payload);
        self.committed = true;
    }

    pub(crate) fn is_committed(&self) -> bool {
        self.committed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::Mode;
    use std::net::SocketAddr;

    struct NullFactory;
    impl crate::reactor::ConnectionHandlerFactory for NullFactory {
        fn create(&self, _handle: u64, _peer: SocketAddr) -> Box<dyn crate::reactor::ConnectionHandler> {
            unimplemented!("not exercised by these tests")
        }
    }

    fn test_request() -> Request {
        let reactor = crate::reactor::Reactor::bind("127.0.0.1", 0, 1, Arc::new(NullFactory)).unwrap();
        let mut parser = HttpParser::new(Mode::Request);
        parser.execute(b"GET /x HTTP/1.1\r\n\r\n");
        Request::new(reactor, 0, 0, parser)
    }

    #[test]
    fn build_header_emits_exact_get_header_bytes() {
        let req = test_request();
        let header = req.build_header();
        assert_eq!(header, b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n".to_vec());
    }

    #[test]
    fn set_content_type_is_emitted_as_header() {
        let mut req = test_request();
        req.set_content_type("text/plain");
        req.append_body_text("hi");
        let header = req.build_header();
        assert_eq!(header, b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nContent-Type: text/plain\r\n\r\n".to_vec());
    }

    #[test]
    fn last_write_wins_for_same_header_name() {
        let mut req = test_request();
        req.set_response_header("X-A", "1");
        req.set_response_header("X-A", "2");
        let header = req.build_header();
        assert_eq!(header, b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\nX-A: 2\r\n\r\n".to_vec());
    }

    #[test]
    #[should_panic(expected = "cannot commit more than once")]
    fn committing_twice_panics() {
        let mut req = test_request();
        req.commit();
        req.commit();
    }
}
