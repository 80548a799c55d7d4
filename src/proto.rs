//! Wire protocol codec.
//!
//! The protocol is line-oriented: every frame is a CRLF-terminated control
//! line, and `MSG`/`PUB` frames additionally carry a byte-counted payload
//! followed by its own CRLF. The two JSON-bodied frames (`INFO` from the
//! server, `CONNECT` from the client) are decoded/encoded with serde.
//!
//! Server to client: `INFO`, `MSG`, `PING`, `PONG`, `+OK`, `-ERR`.
//! Client to server: `CONNECT`, `PUB`, `SUB`, `UNSUB`, `PING`, `PONG`.
//!
//! The decoder is incremental: feed bytes into `buffer_mut()`, then call
//! `decode()` until it returns `None` (incomplete input left in place).

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::ClientError;

const CRLF: &[u8] = b"\r\n";

/// Upper bound on a control line before we call the stream garbage.
const MAX_CONTROL_LINE: usize = 4096;

/// Server metadata announced in the `INFO` frame.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ServerInfo {
    pub server_id: String,
    pub server_name: String,
    pub version: String,
    pub host: String,
    pub port: u16,
    pub proto: i32,
    pub auth_required: bool,
    pub tls_required: bool,
    pub tls_available: bool,
    /// Largest payload the server accepts, in bytes.
    pub max_payload: usize,
    /// Cluster-advertised endpoints. Parsed but not merged into the pool.
    pub connect_urls: Vec<String>,
}

/// Client connect options sent in the `CONNECT` frame.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectOptions {
    pub verbose: bool,
    pub pedantic: bool,
    pub tls_required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub lang: &'static str,
    pub version: &'static str,
    pub protocol: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pass: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            verbose: false,
            pedantic: false,
            tls_required: false,
            name: None,
            lang: "rust",
            version: env!("CARGO_PKG_VERSION"),
            protocol: 1,
            user: None,
            pass: None,
            auth_token: None,
        }
    }
}

/// A decoded server-originated frame.
#[derive(Debug)]
pub enum ServerOp {
    Info(ServerInfo),
    Msg {
        subject: String,
        sid: u64,
        reply_to: Option<String>,
        payload: Bytes,
    },
    Ping,
    Pong,
    Ok,
    Err(String),
}

/// Incremental frame decoder over a growable byte buffer.
#[derive(Debug, Default)]
pub struct Decoder {
    buf: BytesMut,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(8 * 1024),
        }
    }

    /// Buffer to read socket bytes into.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// Decodes the next complete frame, or returns `None` when the buffer
    /// holds only a partial frame. Incomplete input is left untouched.
    pub fn decode(&mut self) -> Result<Option<ServerOp>, ClientError> {
        let Some(line_end) = find_crlf(&self.buf) else {
            if self.buf.len() > MAX_CONTROL_LINE {
                return Err(ClientError::Protocol(
                    "control line exceeds maximum length".into(),
                ));
            }
            return Ok(None);
        };

        let line = std::str::from_utf8(&self.buf[..line_end])
            .map_err(|_| ClientError::Protocol("control line is not valid UTF-8".into()))?;

        // MSG needs the payload present before anything is consumed.
        if let Some(args) = strip_op(line, "MSG") {
            let header = parse_msg_header(args)?;
            let total = line_end + CRLF.len() + header.payload_len + CRLF.len();
            if self.buf.len() < total {
                return Ok(None);
            }

            let mut frame = self.buf.split_to(total);
            let mut payload = frame.split_off(line_end + CRLF.len());
            payload.truncate(header.payload_len);

            return Ok(Some(ServerOp::Msg {
                subject: header.subject,
                sid: header.sid,
                reply_to: header.reply_to,
                payload: payload.freeze(),
            }));
        }

        let op = if let Some(json) = strip_op(line, "INFO") {
            let info: ServerInfo = serde_json::from_str(json.trim())
                .map_err(|e| ClientError::Protocol(format!("malformed INFO frame: {e}")))?;
            ServerOp::Info(info)
        } else if line.eq_ignore_ascii_case("PING") {
            ServerOp::Ping
        } else if line.eq_ignore_ascii_case("PONG") {
            ServerOp::Pong
        } else if line.trim_end() == "+OK" {
            ServerOp::Ok
        } else if let Some(reason) = strip_op(line, "-ERR") {
            ServerOp::Err(reason.trim().trim_matches('\'').to_string())
        } else {
            return Err(ClientError::Protocol(format!(
                "unknown control line: {line:?}"
            )));
        };

        let _ = self.buf.split_to(line_end + CRLF.len());
        Ok(Some(op))
    }
}

struct MsgHeader {
    subject: String,
    sid: u64,
    reply_to: Option<String>,
    payload_len: usize,
}

/// `MSG <subject> <sid> [reply-to] <#bytes>`
fn parse_msg_header(args: &str) -> Result<MsgHeader, ClientError> {
    let parts: Vec<&str> = args.split_whitespace().collect();
    let (subject, sid, reply_to, len) = match parts.as_slice() {
        [subject, sid, len] => (*subject, *sid, None, *len),
        [subject, sid, reply, len] => (*subject, *sid, Some((*reply).to_string()), *len),
        _ => {
            return Err(ClientError::Protocol(format!(
                "malformed MSG header: {args:?}"
            )))
        }
    };

    let sid: u64 = sid
        .parse()
        .map_err(|_| ClientError::Protocol(format!("invalid sid in MSG header: {sid:?}")))?;
    let payload_len: usize = len
        .parse()
        .map_err(|_| ClientError::Protocol(format!("invalid length in MSG header: {len:?}")))?;

    Ok(MsgHeader {
        subject: subject.to_string(),
        sid,
        reply_to,
        payload_len,
    })
}

/// Case-insensitively strips a leading op name followed by whitespace.
fn strip_op<'a>(line: &'a str, op: &str) -> Option<&'a str> {
    if line.len() < op.len() || !line[..op.len()].eq_ignore_ascii_case(op) {
        return None;
    }
    let rest = &line[op.len()..];
    if rest.is_empty() {
        return None;
    }
    rest.starts_with([' ', '\t']).then(|| rest.trim_start())
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == CRLF)
}

/// `CONNECT {json}`
pub fn write_connect(dst: &mut BytesMut, opts: &ConnectOptions) -> Result<(), ClientError> {
    let json = serde_json::to_string(opts)
        .map_err(|e| ClientError::Protocol(format!("connect options serialization: {e}")))?;
    dst.extend_from_slice(b"CONNECT ");
    dst.extend_from_slice(json.as_bytes());
    dst.extend_from_slice(CRLF);
    Ok(())
}

/// `PUB <subject> [reply-to] <#bytes>` + payload
pub fn write_pub(dst: &mut BytesMut, subject: &str, reply_to: Option<&str>, payload: &[u8]) {
    match reply_to {
        Some(reply) => dst.extend_from_slice(
            format!("PUB {} {} {}\r\n", subject, reply, payload.len()).as_bytes(),
        ),
        None => {
            dst.extend_from_slice(format!("PUB {} {}\r\n", subject, payload.len()).as_bytes())
        }
    }
    dst.extend_from_slice(payload);
    dst.extend_from_slice(CRLF);
}

/// `SUB <subject> [queue] <sid>`
pub fn write_sub(dst: &mut BytesMut, subject: &str, queue_group: Option<&str>, sid: u64) {
    match queue_group {
        Some(queue) => {
            dst.extend_from_slice(format!("SUB {subject} {queue} {sid}\r\n").as_bytes())
        }
        None => dst.extend_from_slice(format!("SUB {subject} {sid}\r\n").as_bytes()),
    }
}

/// `UNSUB <sid> [max]`
pub fn write_unsub(dst: &mut BytesMut, sid: u64, max_msgs: Option<u64>) {
    match max_msgs {
        Some(max) => dst.extend_from_slice(format!("UNSUB {sid} {max}\r\n").as_bytes()),
        None => dst.extend_from_slice(format!("UNSUB {sid}\r\n").as_bytes()),
    }
}

pub fn write_ping(dst: &mut BytesMut) {
    dst.extend_from_slice(b"PING\r\n");
}

pub fn write_pong(dst: &mut BytesMut) {
    dst.extend_from_slice(b"PONG\r\n");
}
