//! Frame serialization.
//!
//! Commands go out as arrays of bulk strings, which every server version
//! understands. Lengths are formatted with `itoa` straight into the output
//! buffer.

use bytes::{BufMut, Bytes, BytesMut};

use crate::types::Frame;

impl Frame {
    /// Appends the wire encoding of this frame to `dst`.
    pub fn serialize(&self, dst: &mut BytesMut) {
        match self {
            Frame::Simple(s) => line(b'+', s.as_bytes(), dst),
            Frame::Error(msg) => line(b'-', msg.as_bytes(), dst),
            Frame::Integer(n) => {
                dst.put_u8(b':');
                write_i64(*n, dst);
                dst.put_slice(b"\r\n");
            }
            Frame::Bulk(data) => {
                header(b'$', data.len(), dst);
                dst.put_slice(data);
                dst.put_slice(b"\r\n");
            }
            Frame::Array(items) => {
                header(b'*', items.len(), dst);
                for item in items {
                    item.serialize(dst);
                }
            }
            Frame::Null => dst.put_slice(b"_\r\n"),
            Frame::Map(pairs) => {
                header(b'%', pairs.len(), dst);
                for (key, val) in pairs {
                    key.serialize(dst);
                    val.serialize(dst);
                }
            }
        }
    }

    /// Encodes this frame into a freshly allocated buffer.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.serialize(&mut buf);
        buf.freeze()
    }
}

fn line(prefix: u8, body: &[u8], dst: &mut BytesMut) {
    dst.reserve(body.len() + 3);
    dst.put_u8(prefix);
    dst.put_slice(body);
    dst.put_slice(b"\r\n");
}

fn header(prefix: u8, len: usize, dst: &mut BytesMut) {
    dst.put_u8(prefix);
    write_i64(len as i64, dst);
    dst.put_slice(b"\r\n");
}

fn write_i64(val: i64, dst: &mut BytesMut) {
    let mut buf = itoa::Buffer::new();
    dst.put_slice(buf.format(val).as_bytes());
}
