//! Incremental HTTP/1.1 response parsing.
//!
//! The parser consumes an ever-growing prefix of the driver's receive
//! buffer: the head is re-attempted with [`httparse`] until it is complete,
//! and chunk framing in the body is collapsed in place as bytes arrive, so
//! the region after [`body_start`][ResponseParser::body_start] always holds
//! contiguous decoded payload. Collapsing can shrink the valid prefix;
//! [`incoming`][ResponseParser::incoming] returns the new length so the
//! caller can move its write cursor back.

const MAX_HEADERS: usize = 100;

/// The response could not be parsed as HTTP/1.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ParseError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    StatusLine,
    Headers,
    Body,
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkPhase {
    /// Accumulating a chunk-size line.
    Size,
    /// Copying chunk payload; the remaining byte count of the chunk.
    Data(u64),
    /// Expecting the CRLF that closes a chunk.
    DataCrlf,
    /// Accumulating trailer lines; an empty line ends the message.
    Trailer,
    Done,
}

/// Incremental parser for one HTTP/1.1 response.
///
/// Handed to the completion sink so callers can inspect the status code and
/// headers of the response that produced the delivered body.
#[derive(Debug)]
pub struct ResponseParser {
    state: State,
    status_code: u16,
    headers: Vec<(String, String)>,
    /// Offset of the header block, one past the status line.
    cursor: usize,
    body_start: usize,
    /// One past the decoded payload; bytes beyond it are unconsumed framing.
    decoded_end: usize,
    content_length: Option<u64>,
    /// Total decoded payload bytes, across streaming rewinds.
    body_consumed: u64,
    chunked: bool,
    phase: ChunkPhase,
}

impl Default for ResponseParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseParser {
    pub fn new() -> Self {
        Self {
            state: State::StatusLine,
            status_code: 0,
            headers: Vec::new(),
            cursor: 0,
            body_start: 0,
            decoded_end: 0,
            content_length: None,
            body_consumed: 0,
            chunked: false,
            phase: ChunkPhase::Size,
        }
    }

    pub(crate) fn reset(&mut self) {
        *self = Self::new();
    }

    /// True once the status line and every header have been received.
    pub fn header_finished(&self) -> bool {
        matches!(self.state, State::Body | State::Finished)
    }

    /// True once the full message body has been received.
    pub fn finished(&self) -> bool {
        matches!(self.state, State::Finished)
    }

    pub fn status_code(&self) -> u16 {
        self.status_code
    }

    /// Case-insensitive header lookup; the first occurrence wins.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All headers in arrival order.
    pub fn headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Offset of the body within the receive buffer.
    pub fn body_start(&self) -> usize {
        self.body_start
    }

    /// Length of the contiguous decoded payload currently buffered.
    pub fn body_len(&self) -> usize {
        self.decoded_end - self.body_start
    }

    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    /// Feed the currently valid buffer prefix. Returns the new valid
    /// length, which shrinks when chunk framing is collapsed away.
    pub(crate) fn incoming(&mut self, buf: &mut [u8]) -> Result<usize, ParseError> {
        let mut len = buf.len();
        loop {
            match self.state {
                State::StatusLine => {
                    let Some(eol) = find_crlf(&buf[..len]) else {
                        return Ok(len);
                    };
                    self.parse_status_line(&buf[..eol])?;
                    self.cursor = eol + 2;
                    self.state = State::Headers;
                }
                State::Headers => {
                    let mut storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
                    match httparse::parse_headers(&buf[self.cursor..len], &mut storage) {
                        Ok(httparse::Status::Complete((consumed, parsed))) => {
                            for header in parsed {
                                self.headers.push((
                                    header.name.to_owned(),
                                    String::from_utf8_lossy(header.value).into_owned(),
                                ));
                            }
                            self.body_start = self.cursor + consumed;
                            self.decoded_end = self.body_start;
                            self.interpret_headers()?;
                        }
                        Ok(httparse::Status::Partial) => return Ok(len),
                        Err(_) => return Err(ParseError),
                    }
                }
                State::Body => {
                    return self.advance_body(buf, len);
                }
                State::Finished => return Ok(len),
            }
        }
    }

    /// Streaming mode: the caller has consumed the decoded payload and is
    /// about to move the unparsed tail to the front of its buffer.
    pub(crate) fn rewind_body(&mut self) {
        self.body_start = 0;
        self.decoded_end = 0;
    }

    fn parse_status_line(&mut self, line: &[u8]) -> Result<(), ParseError> {
        let line = std::str::from_utf8(line).map_err(|_| ParseError)?;
        let mut parts = line.split_whitespace();
        let version = parts.next().ok_or(ParseError)?;
        if !version.starts_with("HTTP/") {
            return Err(ParseError);
        }
        let code = parts.next().ok_or(ParseError)?;
        self.status_code = code.parse().map_err(|_| ParseError)?;
        Ok(())
    }

    fn interpret_headers(&mut self) -> Result<(), ParseError> {
        if let Some(te) = self.header("transfer-encoding") {
            self.chunked = te
                .split(',')
                .any(|tok| tok.trim().eq_ignore_ascii_case("chunked"));
        }
        if !self.chunked {
            if let Some(cl) = self.header("content-length") {
                let parsed: u64 = cl.trim().parse().map_err(|_| ParseError)?;
                self.content_length = Some(parsed);
            }
        }

        // 204 and 304 carry no body regardless of framing headers
        if self.status_code == 204 || self.status_code == 304 {
            self.content_length = Some(0);
            self.chunked = false;
        }

        self.state = if self.content_length == Some(0) {
            State::Finished
        } else {
            State::Body
        };
        Ok(())
    }

    fn advance_body(&mut self, buf: &mut [u8], len: usize) -> Result<usize, ParseError> {
        if self.chunked {
            return self.advance_chunked(buf, len);
        }

        let new = (len - self.decoded_end) as u64;
        let take = match self.content_length {
            Some(cl) => new.min(cl - self.body_consumed),
            None => new,
        };
        self.decoded_end += take as usize;
        self.body_consumed += take;
        if self.content_length == Some(self.body_consumed) {
            self.state = State::Finished;
        }
        Ok(len)
    }

    /// Collapse chunk framing in place. Payload is moved down to extend the
    /// decoded region; complete framing tokens are dropped; a partial token
    /// is compacted to the end of the decoded region and rescanned on the
    /// next feed.
    fn advance_chunked(&mut self, buf: &mut [u8], len: usize) -> Result<usize, ParseError> {
        let mut out = self.decoded_end;
        let mut inp = self.decoded_end;

        loop {
            match self.phase {
                ChunkPhase::Size => {
                    let Some(eol) = find_crlf(&buf[inp..len]) else {
                        break;
                    };
                    let size = parse_chunk_size(&buf[inp..inp + eol])?;
                    inp += eol + 2;
                    self.phase = if size == 0 {
                        ChunkPhase::Trailer
                    } else {
                        ChunkPhase::Data(size)
                    };
                }
                ChunkPhase::Data(remaining) => {
                    if inp == len {
                        break;
                    }
                    let take = ((len - inp) as u64).min(remaining) as usize;
                    buf.copy_within(inp..inp + take, out);
                    out += take;
                    inp += take;
                    self.body_consumed += take as u64;
                    let left = remaining - take as u64;
                    self.phase = if left == 0 {
                        ChunkPhase::DataCrlf
                    } else {
                        ChunkPhase::Data(left)
                    };
                }
                ChunkPhase::DataCrlf => {
                    if len - inp < 2 {
                        break;
                    }
                    if &buf[inp..inp + 2] != b"\r\n" {
                        return Err(ParseError);
                    }
                    inp += 2;
                    self.phase = ChunkPhase::Size;
                }
                ChunkPhase::Trailer => {
                    let Some(eol) = find_crlf(&buf[inp..len]) else {
                        break;
                    };
                    let empty = eol == 0;
                    inp += eol + 2;
                    if empty {
                        self.phase = ChunkPhase::Done;
                        self.state = State::Finished;
                    }
                }
                ChunkPhase::Done => break,
            }
        }

        let tail = len - inp;
        buf.copy_within(inp..len, out);
        self.decoded_end = out;
        Ok(out + tail)
    }
}

/// Whether a status code names a followable redirect.
pub fn is_redirect_status(code: u16) -> bool {
    matches!(code, 301 | 302 | 303 | 307 | 308)
}

fn find_crlf(haystack: &[u8]) -> Option<usize> {
    haystack.windows(2).position(|w| w == b"\r\n")
}

fn parse_chunk_size(line: &[u8]) -> Result<u64, ParseError> {
    let line = std::str::from_utf8(line).map_err(|_| ParseError)?;
    let size = line.split(';').next().unwrap_or("").trim();
    if size.is_empty() {
        return Err(ParseError);
    }
    u64::from_str_radix(size, 16).map_err(|_| ParseError)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Feed `raw` into the parser one byte at a time, maintaining the
    /// buffer the way the read loop does.
    fn feed(parser: &mut ResponseParser, raw: &[u8]) -> Result<Vec<u8>, ParseError> {
        let mut buf = Vec::new();
        for &byte in raw {
            buf.push(byte);
            let len = parser.incoming(&mut buf)?;
            buf.truncate(len);
        }
        Ok(buf)
    }

    fn body_of(parser: &ResponseParser, buf: &[u8]) -> Vec<u8> {
        buf[parser.body_start()..parser.body_start() + parser.body_len()].to_vec()
    }

    #[test]
    fn content_length_response() {
        let mut parser = ResponseParser::new();
        let buf = feed(
            &mut parser,
            b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello",
        )
        .unwrap();

        assert!(parser.header_finished());
        assert!(parser.finished());
        assert_eq!(parser.status_code(), 200);
        assert_eq!(parser.content_length(), Some(5));
        assert_eq!(body_of(&parser, &buf), b"hello");
    }

    #[test]
    fn header_finished_before_body_arrives() {
        let mut parser = ResponseParser::new();
        let mut buf = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\n".to_vec();
        let len = parser.incoming(&mut buf).unwrap();
        assert_eq!(len, buf.len());
        assert!(parser.header_finished());
        assert!(!parser.finished());
        assert_eq!(parser.body_len(), 0);
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let mut parser = ResponseParser::new();
        feed(
            &mut parser,
            b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nX-Two: a\r\nX-Two: b\r\n\r\n",
        )
        .unwrap();

        assert_eq!(parser.header("content-type"), Some("text/plain"));
        assert_eq!(parser.header("CONTENT-TYPE"), Some("text/plain"));
        assert_eq!(parser.header("x-two"), Some("a"));
        assert_eq!(parser.header("missing"), None);
    }

    #[test]
    fn chunked_body_is_collapsed_in_place() {
        let mut parser = ResponseParser::new();
        let buf = feed(
            &mut parser,
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n\
              5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n",
        )
        .unwrap();

        assert!(parser.finished());
        assert_eq!(body_of(&parser, &buf), b"hello world");
        // framing is gone from the buffer
        assert_eq!(buf.len(), parser.body_start() + parser.body_len());
    }

    #[test]
    fn chunked_trailer_lines_are_dropped() {
        let mut parser = ResponseParser::new();
        let buf = feed(
            &mut parser,
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n\
              3\r\nabc\r\n0\r\nX-Check: 1\r\n\r\n",
        )
        .unwrap();

        assert!(parser.finished());
        assert_eq!(body_of(&parser, &buf), b"abc");
    }

    #[test]
    fn chunk_extensions_are_ignored() {
        let mut parser = ResponseParser::new();
        let buf = feed(
            &mut parser,
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n\
              4;name=value\r\nwxyz\r\n0\r\n\r\n",
        )
        .unwrap();

        assert!(parser.finished());
        assert_eq!(body_of(&parser, &buf), b"wxyz");
    }

    #[test]
    fn streaming_rewind_keeps_partial_framing() {
        let mut parser = ResponseParser::new();
        let head = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n";
        let mut buf = head.to_vec();
        buf.extend_from_slice(b"5\r\nhel");
        let len = parser.incoming(&mut buf).unwrap();
        buf.truncate(len);
        assert_eq!(body_of(&parser, &buf), b"hel");

        // consume the payload and compact the tail, as the driver does
        let consumed_to = parser.body_start() + parser.body_len();
        buf.drain(..consumed_to);
        parser.rewind_body();

        buf.extend_from_slice(b"lo\r\n3\r\nxyz\r\n0\r\n\r\n");
        let len = parser.incoming(&mut buf).unwrap();
        buf.truncate(len);
        assert!(parser.finished());
        assert_eq!(body_of(&parser, &buf), b"loxyz");
    }

    #[test]
    fn no_body_statuses_finish_at_header_end() {
        for status in ["204 No Content", "304 Not Modified"] {
            let mut parser = ResponseParser::new();
            let raw = format!("HTTP/1.1 {status}\r\nServer: t\r\n\r\n");
            feed(&mut parser, raw.as_bytes()).unwrap();
            assert!(parser.finished(), "{status}");
            assert_eq!(parser.body_len(), 0);
        }
    }

    #[test]
    fn eof_delimited_body_never_finishes() {
        let mut parser = ResponseParser::new();
        let buf = feed(&mut parser, b"HTTP/1.1 200 OK\r\n\r\nsome data").unwrap();
        assert!(parser.header_finished());
        assert!(!parser.finished());
        assert_eq!(body_of(&parser, &buf), b"some data");
    }

    #[test]
    fn rejects_garbage_status_line() {
        let mut parser = ResponseParser::new();
        let mut buf = b"ICY 200 OK\r\n".to_vec();
        assert_eq!(parser.incoming(&mut buf), Err(ParseError));
    }

    #[test]
    fn rejects_bad_chunk_size() {
        let mut parser = ResponseParser::new();
        let mut buf = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\nzz\r\n".to_vec();
        assert_eq!(parser.incoming(&mut buf), Err(ParseError));
    }

    #[test]
    fn rejects_bad_content_length() {
        let mut parser = ResponseParser::new();
        let mut buf = b"HTTP/1.1 200 OK\r\nContent-Length: many\r\n\r\n".to_vec();
        assert_eq!(parser.incoming(&mut buf), Err(ParseError));
    }

    #[test]
    fn redirect_statuses() {
        for code in [301, 302, 303, 307, 308] {
            assert!(is_redirect_status(code), "{code}");
        }
        for code in [200, 204, 300, 305, 400, 500] {
            assert!(!is_redirect_status(code), "{code}");
        }
    }
}
