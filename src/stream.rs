//! Chunked transfer encoding for streamed response bodies. The
//! serializer pulls the producer one chunk at a time and flushes each
//! chunk as it arrives, so producer-side pacing is visible end-to-end.

use std::io::Write;

use crate::error::Result;
use crate::http::StreamProducer;

/// Drive `producer` to completion over `writer` as chunked transfer
/// encoding, finishing with the zero chunk and any trailers. Returns
/// the number of body bytes written (excluding framing).
///
/// The producer is consumed here and exactly once; back-pressure is
/// its own blocking `next()`.
pub fn write_chunked<W: Write>(
    writer: &mut W,
    producer: StreamProducer,
    trailers: &[(String, String)],
) -> Result<u64> {
    let mut total: u64 = 0;

    for chunk in producer {
        // A zero-length chunk would terminate the stream early.
        if chunk.is_empty() {
            continue;
        }
        write!(writer, "{:x}\r\n", chunk.len())?;
        writer.write_all(&chunk)?;
        writer.write_all(b"\r\n")?;
        writer.flush()?;
        total += chunk.len() as u64;
    }

    writer.write_all(b"0\r\n")?;
    for (name, value) in trailers {
        write!(writer, "{}: {}\r\n", name, value)?;
    }
    writer.write_all(b"\r\n")?;
    writer.flush()?;

    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn encode(chunks: Vec<&'static [u8]>, trailers: &[(String, String)]) -> Vec<u8> {
        let producer: StreamProducer = Box::new(chunks.into_iter().map(Bytes::from_static));
        let mut out = Vec::new();
        write_chunked(&mut out, producer, trailers).unwrap();
        out
    }

    #[test]
    fn frames_each_chunk_with_hex_length() {
        let out = encode(vec![b"a\n", b"b\n"], &[]);
        assert_eq!(out, b"2\r\na\n\r\n2\r\nb\n\r\n0\r\n\r\n");
    }

    #[test]
    fn empty_stream_is_just_the_terminator() {
        let out = encode(vec![], &[]);
        assert_eq!(out, b"0\r\n\r\n");
    }

    #[test]
    fn empty_chunks_are_skipped() {
        let out = encode(vec![b"", b"data", b""], &[]);
        assert_eq!(out, b"4\r\ndata\r\n0\r\n\r\n");
    }

    #[test]
    fn hex_lengths_above_nine() {
        let out = encode(vec![b"0123456789abcdef01"], &[]);
        assert!(out.starts_with(b"12\r\n"));
    }

    #[test]
    fn trailers_follow_the_zero_chunk() {
        let trailers = vec![("x-checksum".to_string(), "abc123".to_string())];
        let out = encode(vec![b"data"], &trailers);
        assert_eq!(out, b"4\r\ndata\r\n0\r\nx-checksum: abc123\r\n\r\n");
    }

    #[test]
    fn reports_body_byte_total() {
        let producer: StreamProducer =
            Box::new(vec![Bytes::from_static(b"abcd"), Bytes::from_static(b"ef")].into_iter());
        let mut out = Vec::new();
        let total = write_chunked(&mut out, producer, &[]).unwrap();
        assert_eq!(total, 6);
    }
}
