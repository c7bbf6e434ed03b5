/// Parser progress, grounded on the `State` enum in the teacher's
/// `connection_parser.rs`, trimmed to the single-pass tokenizer this crate
/// actually needs (no dual in/out streams, no transaction tracking, no
/// CONNECT tunneling).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum State {
    /// Waiting for the request/status line.
    Line,
    /// Accumulating header lines, one at a time.
    Headers,
    /// Reading a fixed-length (`Content-Length`) or unbounded
    /// (stream-close-terminated) identity body.
    BodyIdentity,
    /// Reading a chunk-size line.
    BodyChunkedLength,
    /// Reading `chunk_remaining` bytes of chunk data.
    BodyChunkedData,
    /// Consuming the trailing CRLF after a chunk's data.
    BodyChunkedDataEnd,
    /// Reading trailer header lines after the terminating zero-length chunk.
    Trailers,
    /// The message is fully parsed; no further input is consumed.
    Done,
}

/// Which element a continuation line belongs to, used for RFC 7230 header
/// folding: a line starting with a space or tab extends the previous
/// header's value, never its name. Grounded on `connection_parser.rs`'s
/// `in_header`/`last_header_element`-style bookkeeping for folded headers.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum HeaderElement {
    Field,
    Value,
}
