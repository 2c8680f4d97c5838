//! Response body compression, negotiated against the request's `Accept-Encoding` header.
//!
//! Grounded on the teacher's `http/compression` module, which streams through
//! `async-compression`'s tokio bufread encoders rather than buffering the whole body.
//! Scoped to the codecs enabled in this workspace: gzip and brotli.

use bytes::Bytes;
use futures_util::TryStreamExt;
use http::HeaderValue;
use http_body_util::{BodyExt, StreamBody};
use tokio::io::BufReader;
use tokio_util::io::{ReaderStream, StreamReader};

use crate::http::{Body, Error};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
	Gzip,
	Brotli,
}

impl Encoding {
	fn token(self) -> &'static str {
		match self {
			Encoding::Gzip => "gzip",
			Encoding::Brotli => "br",
		}
	}
}

/// Picks the first of our supported encodings that also appears in `accept_encoding`,
/// preferring brotli when the client allows both.
pub fn negotiate(accept_encoding: Option<&HeaderValue>) -> Option<Encoding> {
	let header = accept_encoding?.to_str().ok()?;
	let offered: Vec<&str> = header.split(',').map(|tok| tok.split(';').next().unwrap_or("").trim()).collect();
	if offered.iter().any(|&t| t == "br" || t == "*") {
		Some(Encoding::Brotli)
	} else if offered.iter().any(|&t| t == "gzip" || t == "*") {
		Some(Encoding::Gzip)
	} else {
		None
	}
}

fn body_to_reader(body: Body) -> impl tokio::io::AsyncBufRead {
	let stream = http_body_util::BodyStream::new(body)
		.try_filter_map(|frame| async move { Ok(frame.into_data().ok()) })
		.map_err(|e: Error| std::io::Error::other(e));
	BufReader::new(StreamReader::new(stream))
}

fn reader_to_body(reader: impl tokio::io::AsyncRead + Send + 'static) -> Body {
	let stream = ReaderStream::new(reader).map_ok(http_body::Frame::data).map_err(|e| -> Error { Box::new(e) });
	StreamBody::new(stream).boxed()
}

/// Wraps `body` in the requested encoding's streaming encoder. The caller is responsible
/// for setting the `Content-Encoding` response header and dropping `Content-Length`, since
/// the compressed length isn't known up front.
pub fn encode_body(encoding: Encoding, body: Body) -> Body {
	let reader = body_to_reader(body);
	match encoding {
		Encoding::Gzip => reader_to_body(async_compression::tokio::bufread::GzipEncoder::new(reader)),
		Encoding::Brotli => reader_to_body(async_compression::tokio::bufread::BrotliEncoder::new(reader)),
	}
}

pub fn content_encoding_header(encoding: Encoding) -> HeaderValue {
	HeaderValue::from_static(encoding.token())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn negotiate_prefers_brotli_when_both_offered() {
		let header = HeaderValue::from_static("gzip, br, deflate");
		assert_eq!(negotiate(Some(&header)), Some(Encoding::Brotli));
	}

	#[test]
	fn negotiate_falls_back_to_gzip() {
		let header = HeaderValue::from_static("deflate, gzip");
		assert_eq!(negotiate(Some(&header)), Some(Encoding::Gzip));
	}

	#[test]
	fn negotiate_none_when_unsupported() {
		let header = HeaderValue::from_static("deflate");
		assert_eq!(negotiate(Some(&header)), None);
	}

	#[tokio::test]
	async fn gzip_round_trip_via_decoder() {
		let original = b"the quick brown fox jumps over the lazy dog".repeat(20);
		let body = crate::http::full_body(Bytes::from(original.clone()));
		let compressed = encode_body(Encoding::Gzip, body);
		let bytes = crate::http::to_bytes(compressed, 1 << 20).await.unwrap();
		let mut decoder = async_compression::tokio::bufread::GzipDecoder::new(BufReader::new(&bytes[..]));
		let mut out = Vec::new();
		tokio::io::AsyncReadExt::read_to_end(&mut decoder, &mut out).await.unwrap();
		assert_eq!(out, original);
	}
}
