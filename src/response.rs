//! The fixed response every connection receives.
//!
//! Built once at startup and shared read-only afterwards. Handing out
//! `Bytes` clones keeps the backing storage alive for as long as any write
//! still points into it.

use bytes::{BufMut, Bytes, BytesMut};

/// Body served to every client.
pub const BODY: &str = "<h1>Hello</h1>";

/// Content type of [`BODY`].
pub const CONTENT_TYPE: &str = "text/html";

/// Build the complete HTTP/1.1 200 response for a body.
///
/// `Content-Length` is derived from the body so the two can never disagree.
pub fn build(content_type: &str, body: &[u8]) -> Bytes {
    let head = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nContent-Length: {}\r\n\r\n",
        content_type,
        body.len()
    );

    let mut buf = BytesMut::with_capacity(head.len() + body.len());
    buf.put_slice(head.as_bytes());
    buf.put_slice(body);
    buf.freeze()
}

/// The response served by the server.
pub fn hello() -> Bytes {
    build(CONTENT_TYPE, BODY.as_bytes())
}
