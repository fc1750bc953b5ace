//! Wire protocol: the five frame payloads of §4.7/§6 and the length-
//! delimited codec they travel over.

pub mod frame;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Control frames (request/ack/chunk-ack/final) are capped well below the
/// chunk frame ceiling; callers pick which `FrameCodec` to build based on
/// which kind of frame is expected next.
pub const DEFAULT_CONTROL_FRAME_LIMIT: usize = 1024 * 1024;
pub const DEFAULT_CHUNK_FRAME_LIMIT: usize = 100 * 1024 * 1024;

/// A 4-byte little-endian length prefix followed by a UTF-8 JSON body.
///
/// `tokio_util`'s `LengthDelimitedCodec` defaults to big-endian prefixes;
/// §6 mandates little-endian, so this wraps it with the field order and
/// byte order it requires instead of reimplementing framing by hand.
pub struct FrameCodec {
    inner: LengthDelimitedCodec,
}

impl FrameCodec {
    pub fn new(max_frame_length: usize) -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .little_endian()
                .length_field_length(4)
                .max_frame_length(max_frame_length)
                .new_codec(),
        }
    }
}

impl Decoder for FrameCodec {
    type Item = BytesMut;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> std::io::Result<Option<BytesMut>> {
        self.inner.decode(src)
    }
}

impl Encoder<bytes::Bytes> for FrameCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: bytes::Bytes, dst: &mut BytesMut) -> std::io::Result<()> {
        self.inner.encode(item, dst)
    }
}

/// `chunk_%06d.bin`, with the digit width grown past six only if
/// `chunk_count` itself exceeds six digits, so filenames keep sorting
/// lexicographically by index regardless of chunk count.
pub fn staging_filename(index: u64, chunk_count: u64) -> String {
    let width = digit_width(chunk_count).max(6);
    format!("chunk_{index:0width$}.bin", width = width as usize)
}

fn digit_width(n: u64) -> u32 {
    if n == 0 {
        1
    } else {
        (n.checked_sub(1).unwrap_or(0)).to_string().len() as u32
    }
}

/// Prepends a little-endian `u32` length prefix to `body` in place, for
/// contexts that write directly to a stream rather than through
/// `FrameCodec`.
pub fn frame_bytes(body: &[u8]) -> bytes::Bytes {
    let mut out = BytesMut::with_capacity(4 + body.len());
    out.put_u32_le(body.len() as u32);
    out.extend_from_slice(body);
    out.freeze()
}

pub fn read_length_prefix(buf: &[u8]) -> Option<u32> {
    if buf.len() < 4 {
        return None;
    }
    let mut slice = &buf[0..4];
    Some(slice.get_u32_le())
}
