//! MSRP wire format (RFC 4975)
//!
//! Chunk model, serializer and incremental decoder. A chunk is framed as
//!
//! ```text
//! MSRP <tx-id> SEND\r\n
//! <headers>\r\n
//! \r\n
//! <body>\r\n
//! -------<tx-id>$\r\n
//! ```
//!
//! The closing boundary carries the continuation flag: `$` complete, `+`
//! more chunks follow, `#` aborted. A chunk without a body closes directly
//! after the headers with no blank line.

use bytes::{Bytes, BytesMut};
use rand::Rng;
use thiserror::Error;

pub const END_LINE_DASHES: &str = "-------";

/// Upper bound on a single declared chunk body; anything larger is a
/// framing error rather than a buffering obligation
pub const MAX_CHUNK_BODY: u64 = 1024 * 1024;

#[derive(Error, Debug, Clone)]
pub enum MsrpError {
    #[error("Malformed MSRP framing: {0}")]
    Framing(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Connection terminated")]
    Terminated,
}

/// Continuation flag on the end-line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContinuationFlag {
    /// `$` - message complete
    Complete,
    /// `+` - more chunks follow
    More,
    /// `#` - transfer aborted
    Abort,
}

impl ContinuationFlag {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            b'$' => Some(ContinuationFlag::Complete),
            b'+' => Some(ContinuationFlag::More),
            b'#' => Some(ContinuationFlag::Abort),
            _ => None,
        }
    }

    pub fn as_char(&self) -> char {
        match self {
            ContinuationFlag::Complete => '$',
            ContinuationFlag::More => '+',
            ContinuationFlag::Abort => '#',
        }
    }
}

/// Byte-Range header: `start-end/total`, `*` for unknown end or total
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    /// 1-based first byte of this chunk
    pub start: u64,
    pub end: Option<u64>,
    pub total: Option<u64>,
}

impl ByteRange {
    pub fn whole(total: u64) -> Self {
        Self {
            start: 1,
            end: Some(total),
            total: Some(total),
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let (range, total) = value.trim().split_once('/')?;
        let (start, end) = range.split_once('-')?;
        let start = start.trim().parse().ok()?;
        let end = match end.trim() {
            "*" => None,
            e => Some(e.parse().ok()?),
        };
        let total = match total.trim() {
            "*" => None,
            t => Some(t.parse().ok()?),
        };
        Some(Self { start, end, total })
    }

    /// Chunk body length when the end is known
    pub fn chunk_len(&self) -> Option<u64> {
        let end = self.end?;
        if end < self.start {
            return Some(0);
        }
        Some(end - self.start + 1)
    }
}

impl std::fmt::Display for ByteRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let end = self
            .end
            .map(|e| e.to_string())
            .unwrap_or_else(|| "*".to_string());
        let total = self
            .total
            .map(|t| t.to_string())
            .unwrap_or_else(|| "*".to_string());
        write!(f, "{}-{}/{}", self.start, end, total)
    }
}

/// Request (SEND/REPORT) or response start line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MsrpChunkKind {
    Request(String),
    Response(u16),
}

/// One parsed or to-be-sent MSRP chunk
#[derive(Debug, Clone)]
pub struct MsrpChunk {
    pub transaction_id: String,
    pub kind: MsrpChunkKind,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub continuation: ContinuationFlag,
}

impl MsrpChunk {
    pub fn is_send(&self) -> bool {
        matches!(&self.kind, MsrpChunkKind::Request(m) if m == "SEND")
    }

    pub fn is_report(&self) -> bool {
        matches!(&self.kind, MsrpChunkKind::Request(m) if m == "REPORT")
    }

    pub fn response_code(&self) -> Option<u16> {
        match &self.kind {
            MsrpChunkKind::Response(code) => Some(*code),
            _ => None,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn to_path(&self) -> Option<&str> {
        self.header("To-Path")
    }

    pub fn from_path(&self) -> Option<&str> {
        self.header("From-Path")
    }

    pub fn message_id(&self) -> Option<&str> {
        self.header("Message-ID")
    }

    pub fn byte_range(&self) -> Option<ByteRange> {
        self.header("Byte-Range").and_then(ByteRange::parse)
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header("Content-Type")
    }

    pub fn success_report_requested(&self) -> bool {
        self.header("Success-Report")
            .map(|v| v.eq_ignore_ascii_case("yes"))
            .unwrap_or(false)
    }

    /// Status code from a REPORT's `Status: 000 <code> <phrase>` header
    pub fn report_status(&self) -> Option<u16> {
        self.header("Status")
            .and_then(|v| v.split_whitespace().nth(1))
            .and_then(|c| c.parse().ok())
    }

    /// Data-carrying SEND chunk
    #[allow(clippy::too_many_arguments)]
    pub fn new_send(
        transaction_id: &str,
        to_path: &str,
        from_path: &str,
        message_id: &str,
        byte_range: ByteRange,
        content_type: &str,
        body: Vec<u8>,
        continuation: ContinuationFlag,
    ) -> Self {
        Self {
            transaction_id: transaction_id.to_string(),
            kind: MsrpChunkKind::Request("SEND".to_string()),
            headers: vec![
                ("To-Path".to_string(), to_path.to_string()),
                ("From-Path".to_string(), from_path.to_string()),
                ("Message-ID".to_string(), message_id.to_string()),
                ("Success-Report".to_string(), "yes".to_string()),
                ("Failure-Report".to_string(), "yes".to_string()),
                ("Byte-Range".to_string(), byte_range.to_string()),
                ("Content-Type".to_string(), content_type.to_string()),
            ],
            body,
            continuation,
        }
    }

    /// Bodiless SEND used as a connection keep-alive
    pub fn new_keepalive(transaction_id: &str, to_path: &str, from_path: &str) -> Self {
        Self {
            transaction_id: transaction_id.to_string(),
            kind: MsrpChunkKind::Request("SEND".to_string()),
            headers: vec![
                ("To-Path".to_string(), to_path.to_string()),
                ("From-Path".to_string(), from_path.to_string()),
                ("Message-ID".to_string(), generate_message_id()),
            ],
            body: Vec::new(),
            continuation: ContinuationFlag::Complete,
        }
    }

    /// Transaction response, e.g. `MSRP <tx> 200 OK`
    pub fn new_response(request: &MsrpChunk, code: u16, local_path: &str) -> Self {
        // To-Path of the response is the request's From-Path
        let to_path = request.from_path().unwrap_or_default().to_string();
        Self {
            transaction_id: request.transaction_id.clone(),
            kind: MsrpChunkKind::Response(code),
            headers: vec![
                ("To-Path".to_string(), to_path),
                ("From-Path".to_string(), local_path.to_string()),
            ],
            body: Vec::new(),
            continuation: ContinuationFlag::Complete,
        }
    }

    /// Success/failure REPORT for a received message
    pub fn new_report(
        to_path: &str,
        from_path: &str,
        message_id: &str,
        byte_range: ByteRange,
        code: u16,
        phrase: &str,
    ) -> Self {
        Self {
            transaction_id: generate_transaction_id(),
            kind: MsrpChunkKind::Request("REPORT".to_string()),
            headers: vec![
                ("To-Path".to_string(), to_path.to_string()),
                ("From-Path".to_string(), from_path.to_string()),
                ("Message-ID".to_string(), message_id.to_string()),
                ("Byte-Range".to_string(), byte_range.to_string()),
                ("Status".to_string(), format!("000 {} {}", code, phrase)),
            ],
            body: Vec::new(),
            continuation: ContinuationFlag::Complete,
        }
    }

    /// Serialize to wire bytes
    pub fn to_bytes(&self) -> Bytes {
        let mut out = BytesMut::new();

        let start_line = match &self.kind {
            MsrpChunkKind::Request(method) => {
                format!("MSRP {} {}\r\n", self.transaction_id, method)
            }
            MsrpChunkKind::Response(code) => {
                format!("MSRP {} {} {}\r\n", self.transaction_id, code, status_phrase(*code))
            }
        };
        out.extend_from_slice(start_line.as_bytes());

        for (name, value) in &self.headers {
            out.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
        }

        if !self.body.is_empty() {
            out.extend_from_slice(b"\r\n");
            out.extend_from_slice(&self.body);
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(
            format!(
                "{}{}{}\r\n",
                END_LINE_DASHES,
                self.transaction_id,
                self.continuation.as_char()
            )
            .as_bytes(),
        );

        out.freeze()
    }
}

fn status_phrase(code: u16) -> &'static str {
    match code {
        200 => "OK",
        400 => "Bad Request",
        408 => "Request Timeout",
        413 => "Stop Sending Message",
        415 => "Unsupported Media Type",
        481 => "Session Does Not Exist",
        _ => "Error",
    }
}

/// Random alphanumeric transaction identifier
pub fn generate_transaction_id() -> String {
    let mut rng = rand::thread_rng();
    let random: u64 = rng.gen();
    format!("{:x}", random)
}

pub fn generate_message_id() -> String {
    let mut rng = rand::thread_rng();
    let random: u128 = rng.gen();
    format!("{:x}", random)
}

/// Incremental byte-level decoder fed from a TCP stream.
///
/// `feed` appends raw bytes, `decode` yields at most one chunk per call
/// until the buffer runs dry.
pub struct MsrpDecoder {
    buf: BytesMut,
}

impl MsrpDecoder {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::new(),
        }
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Try to decode one complete chunk from the buffer
    pub fn decode(&mut self) -> Result<Option<MsrpChunk>, MsrpError> {
        let data = &self.buf[..];

        // Start line: MSRP <tx-id> <method|code [phrase]>
        let start_end = match find_crlf(data, 0) {
            Some(pos) => pos,
            None => return Ok(None),
        };
        let start_line = std::str::from_utf8(&data[..start_end])
            .map_err(|_| MsrpError::Framing("non-UTF8 start line".to_string()))?;
        let mut parts = start_line.split_whitespace();
        if parts.next() != Some("MSRP") {
            return Err(MsrpError::Framing(format!(
                "unexpected start line: {}",
                start_line
            )));
        }
        let transaction_id = parts
            .next()
            .ok_or_else(|| MsrpError::Framing("missing transaction id".to_string()))?
            .to_string();
        let token = parts
            .next()
            .ok_or_else(|| MsrpError::Framing("missing method or code".to_string()))?;
        let kind = match token.parse::<u16>() {
            Ok(code) => MsrpChunkKind::Response(code),
            Err(_) => MsrpChunkKind::Request(token.to_string()),
        };

        let end_line = format!("{}{}", END_LINE_DASHES, transaction_id);

        // Headers: terminated by a blank line (body follows) or directly by
        // the end-line (no body)
        let mut headers = Vec::new();
        let mut pos = start_end + 2;
        let body_start;
        loop {
            let line_end = match find_crlf(data, pos) {
                Some(p) => p,
                None => return Ok(None),
            };
            let line = std::str::from_utf8(&data[pos..line_end])
                .map_err(|_| MsrpError::Framing("non-UTF8 header line".to_string()))?;

            if line.is_empty() {
                body_start = Some(line_end + 2);
                break;
            }
            if let Some(rest) = line.strip_prefix(&end_line) {
                // Bodiless chunk
                let flag = rest
                    .bytes()
                    .next()
                    .and_then(ContinuationFlag::from_byte)
                    .ok_or_else(|| MsrpError::Framing("missing continuation flag".to_string()))?;
                let consumed = line_end + 2;
                let chunk = MsrpChunk {
                    transaction_id,
                    kind,
                    headers,
                    body: Vec::new(),
                    continuation: flag,
                };
                let _ = self.buf.split_to(consumed);
                return Ok(Some(chunk));
            }

            let (name, value) = line.split_once(':').ok_or_else(|| {
                MsrpError::Framing(format!("malformed header line: {}", line))
            })?;
            headers.push((name.trim().to_string(), value.trim().to_string()));
            pos = line_end + 2;
        }

        let body_start = body_start.ok_or_else(|| MsrpError::Framing("no body".to_string()))?;
        let chunk = MsrpChunk {
            transaction_id,
            kind,
            headers,
            body: Vec::new(),
            continuation: ContinuationFlag::Complete,
        };

        // Body length: fixed from Byte-Range when the end is known,
        // otherwise scan for the boundary
        let boundary = format!("\r\n{}", end_line);
        let (body_end, flag_pos) = match chunk.byte_range().and_then(|r| r.chunk_len()) {
            Some(len) => {
                if len > MAX_CHUNK_BODY {
                    return Err(MsrpError::Framing(format!(
                        "declared chunk body of {} bytes exceeds the {} byte limit",
                        len, MAX_CHUNK_BODY
                    )));
                }
                let body_end = body_start
                    .checked_add(len as usize)
                    .ok_or_else(|| MsrpError::Framing("Byte-Range overflow".to_string()))?;
                let needed = body_end + boundary.len() + 3; // \r\n...<flag>\r\n
                if data.len() < needed {
                    return Ok(None);
                }
                if &data[body_end..body_end + boundary.len()] != boundary.as_bytes() {
                    return Err(MsrpError::Framing(
                        "body length does not match Byte-Range".to_string(),
                    ));
                }
                (body_end, body_end + boundary.len())
            }
            None => match find_subsequence(&data[body_start..], boundary.as_bytes()) {
                Some(offset) => {
                    let body_end = body_start + offset;
                    (body_end, body_end + boundary.len())
                }
                None => return Ok(None),
            },
        };

        if data.len() < flag_pos + 3 {
            return Ok(None);
        }
        let flag = ContinuationFlag::from_byte(data[flag_pos])
            .ok_or_else(|| MsrpError::Framing("missing continuation flag".to_string()))?;

        let body = data[body_start..body_end].to_vec();
        let consumed = flag_pos + 3; // flag + \r\n

        let mut chunk = chunk;
        chunk.body = body;
        chunk.continuation = flag;
        let _ = self.buf.split_to(consumed);
        Ok(Some(chunk))
    }
}

impl Default for MsrpDecoder {
    fn default() -> Self {
        Self::new()
    }
}

fn find_crlf(data: &[u8], from: usize) -> Option<usize> {
    if from >= data.len() {
        return None;
    }
    data[from..]
        .windows(2)
        .position(|w| w == b"\r\n")
        .map(|p| from + p)
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn send_chunk(body: &[u8], range: &str, flag: char) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(b"MSRP tx1 SEND\r\n");
        data.extend_from_slice(b"To-Path: msrp://10.0.0.2:2855/y;tcp\r\n");
        data.extend_from_slice(b"From-Path: msrp://10.0.0.1:2855/x;tcp\r\n");
        data.extend_from_slice(b"Message-ID: msg1\r\n");
        data.extend_from_slice(format!("Byte-Range: {}\r\n", range).as_bytes());
        data.extend_from_slice(b"Content-Type: text/plain\r\n");
        data.extend_from_slice(b"\r\n");
        data.extend_from_slice(body);
        data.extend_from_slice(format!("\r\n-------tx1{}\r\n", flag).as_bytes());
        data
    }

    #[test]
    fn test_byte_range_parse() {
        let range = ByteRange::parse("1-100/100").unwrap();
        assert_eq!(range.start, 1);
        assert_eq!(range.end, Some(100));
        assert_eq!(range.total, Some(100));
        assert_eq!(range.chunk_len(), Some(100));

        let open = ByteRange::parse("101-*/2048").unwrap();
        assert_eq!(open.end, None);
        assert_eq!(open.total, Some(2048));
        assert_eq!(open.chunk_len(), None);

        assert_eq!(ByteRange::whole(42).to_string(), "1-42/42");
    }

    #[test]
    fn test_decode_complete_send() {
        let body = vec![b'a'; 100];
        let mut decoder = MsrpDecoder::new();
        decoder.feed(&send_chunk(&body, "1-100/100", '$'));

        let chunk = decoder.decode().unwrap().unwrap();
        assert!(chunk.is_send());
        assert_eq!(chunk.transaction_id, "tx1");
        assert_eq!(chunk.body.len(), 100);
        assert_eq!(chunk.continuation, ContinuationFlag::Complete);
        assert_eq!(chunk.content_type(), Some("text/plain"));
        assert_eq!(chunk.message_id(), Some("msg1"));
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_decode_absurd_byte_range_is_error() {
        let mut decoder = MsrpDecoder::new();
        decoder.feed(&send_chunk(
            b"hi",
            "1-18446744073709551615/18446744073709551615",
            '$',
        ));
        assert!(matches!(decoder.decode(), Err(MsrpError::Framing(_))));
    }

    #[test]
    fn test_decode_oversized_declared_body_is_error() {
        let mut decoder = MsrpDecoder::new();
        let range = format!("1-{}/{}", MAX_CHUNK_BODY + 1, MAX_CHUNK_BODY + 1);
        decoder.feed(&send_chunk(b"hi", &range, '$'));
        assert!(matches!(decoder.decode(), Err(MsrpError::Framing(_))));
    }

    #[test]
    fn test_decode_partial_then_complete() {
        let body = vec![b'b'; 50];
        let wire = send_chunk(&body, "1-50/50", '$');

        let mut decoder = MsrpDecoder::new();
        decoder.feed(&wire[..20]);
        assert!(decoder.decode().unwrap().is_none());
        decoder.feed(&wire[20..40]);
        assert!(decoder.decode().unwrap().is_none());
        decoder.feed(&wire[40..]);
        let chunk = decoder.decode().unwrap().unwrap();
        assert_eq!(chunk.body.len(), 50);
    }

    #[test]
    fn test_decode_continuation_flag_more() {
        let body = vec![b'c'; 10];
        let mut decoder = MsrpDecoder::new();
        decoder.feed(&send_chunk(&body, "1-10/20", '+'));
        let chunk = decoder.decode().unwrap().unwrap();
        assert_eq!(chunk.continuation, ContinuationFlag::More);
        let range = chunk.byte_range().unwrap();
        assert_eq!(range.total, Some(20));
    }

    #[test]
    fn test_decode_bodiless_response() {
        let wire = b"MSRP tx9 200 OK\r\n\
            To-Path: msrp://10.0.0.1:2855/x;tcp\r\n\
            From-Path: msrp://10.0.0.2:2855/y;tcp\r\n\
            -------tx9$\r\n";
        let mut decoder = MsrpDecoder::new();
        decoder.feed(wire);
        let chunk = decoder.decode().unwrap().unwrap();
        assert_eq!(chunk.response_code(), Some(200));
        assert!(chunk.body.is_empty());
    }

    #[test]
    fn test_decode_keepalive_send_without_byte_range() {
        let wire = b"MSRP tx5 SEND\r\n\
            To-Path: msrp://10.0.0.2:2855/y;tcp\r\n\
            From-Path: msrp://10.0.0.1:2855/x;tcp\r\n\
            Message-ID: ka1\r\n\
            -------tx5$\r\n";
        let mut decoder = MsrpDecoder::new();
        decoder.feed(wire);
        let chunk = decoder.decode().unwrap().unwrap();
        assert!(chunk.is_send());
        assert!(chunk.body.is_empty());
        assert!(chunk.byte_range().is_none());
    }

    #[test]
    fn test_serialize_roundtrip() {
        let chunk = MsrpChunk::new_send(
            "txabc",
            "msrp://10.0.0.2:2855/y;tcp",
            "msrp://10.0.0.1:2855/x;tcp",
            "msg42",
            ByteRange::whole(11),
            "text/plain",
            b"hello world".to_vec(),
            ContinuationFlag::Complete,
        );
        let wire = chunk.to_bytes();

        let mut decoder = MsrpDecoder::new();
        decoder.feed(&wire);
        let parsed = decoder.decode().unwrap().unwrap();
        assert_eq!(parsed.transaction_id, "txabc");
        assert_eq!(parsed.body, b"hello world");
        assert_eq!(parsed.byte_range().unwrap().total, Some(11));
        assert!(parsed.success_report_requested());
    }

    #[test]
    fn test_two_chunks_in_one_buffer() {
        let mut wire = send_chunk(&[b'x'; 5], "1-5/10", '+');
        wire.extend_from_slice(&send_chunk(&[b'y'; 5], "6-10/10", '$'));

        let mut decoder = MsrpDecoder::new();
        decoder.feed(&wire);
        let first = decoder.decode().unwrap().unwrap();
        assert_eq!(first.continuation, ContinuationFlag::More);
        let second = decoder.decode().unwrap().unwrap();
        assert_eq!(second.continuation, ContinuationFlag::Complete);
        assert!(decoder.decode().unwrap().is_none());
    }

    #[test]
    fn test_malformed_start_line_is_error() {
        let mut decoder = MsrpDecoder::new();
        decoder.feed(b"GARBAGE tx1 SEND\r\n");
        assert!(decoder.decode().is_err());
    }

    #[test]
    fn test_report_status_parse() {
        let report = MsrpChunk::new_report(
            "msrp://a/1;tcp",
            "msrp://b/2;tcp",
            "msg7",
            ByteRange::whole(100),
            200,
            "OK",
        );
        let wire = report.to_bytes();
        let mut decoder = MsrpDecoder::new();
        decoder.feed(&wire);
        let parsed = decoder.decode().unwrap().unwrap();
        assert!(parsed.is_report());
        assert_eq!(parsed.report_status(), Some(200));
    }
}
