//! Request/response primitives shared by the client dispatcher and the request pipeline.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll, ready};
use std::time::Duration;

use bytes::Bytes;
use http_body::{Body as HttpBody, Frame, SizeHint};
use http_body_util::{BodyExt, Full, combinators::BoxBody};
use pin_project_lite::pin_project;
use tokio::time::{Instant, Sleep, sleep_until};

pub type Error = Box<dyn std::error::Error + Send + Sync>;
pub type Body = BoxBody<Bytes, Error>;
pub type Request = ::http::Request<Body>;
pub type Response = ::http::Response<Body>;

pub fn empty_body() -> Body {
	Full::new(Bytes::new()).map_err(|never: std::convert::Infallible| match never {}).boxed()
}

pub fn full_body(bytes: impl Into<Bytes>) -> Body {
	Full::new(bytes.into()).map_err(|never: std::convert::Infallible| match never {}).boxed()
}

pub fn boxed<B>(body: B) -> Body
where
	B: HttpBody<Data = Bytes> + Send + 'static,
	B::Error: Into<Error>,
{
	body.map_err(Into::into).boxed()
}

pub async fn to_bytes(body: Body, limit: usize) -> Result<Bytes, Error> {
	let collected = http_body_util::Limited::new(body, limit).collect().await.map_err(|e| -> Error {
		format!("body exceeds limit of {limit} bytes: {e}").into()
	})?;
	Ok(collected.to_bytes())
}

/// Wraps a body so it errors once a deadline passes without a forthcoming frame, used to
/// enforce `max_response_body`/`request_timeout` on streaming bodies rather than buffering.
pin_project! {
	pub struct TimeoutBody<B> {
		deadline: Instant,
		#[pin]
		sleep: Option<Sleep>,
		#[pin]
		body: B,
	}
}

impl<B> TimeoutBody<B> {
	pub fn new(timeout: Duration, body: B) -> Self {
		TimeoutBody { deadline: Instant::now() + timeout, sleep: None, body }
	}
}

impl<B> HttpBody for TimeoutBody<B>
where
	B: HttpBody,
	B::Error: Into<Error>,
{
	type Data = B::Data;
	type Error = Error;

	fn poll_frame(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
		let mut this = self.project();
		let sleep = if let Some(s) = this.sleep.as_mut().as_pin_mut() {
			s
		} else {
			this.sleep.set(Some(sleep_until(*this.deadline)));
			this.sleep.as_mut().as_pin_mut().unwrap()
		};
		if sleep.poll(cx).is_ready() {
			return Poll::Ready(Some(Err("body timed out".into())));
		}
		let frame = ready!(this.body.poll_frame(cx));
		Poll::Ready(frame.transpose().map_err(Into::into).transpose())
	}

	fn is_end_stream(&self) -> bool {
		self.body.is_end_stream()
	}

	fn size_hint(&self) -> SizeHint {
		self.body.size_hint()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn to_bytes_rejects_oversized_body() {
		let body = full_body(Bytes::from_static(b"0123456789"));
		let err = to_bytes(body, 4).await.unwrap_err();
		assert!(err.to_string().contains("exceeds limit"));
	}

	#[tokio::test]
	async fn to_bytes_collects_full_body() {
		let body = full_body(Bytes::from_static(b"hello"));
		let bytes = to_bytes(body, 1024).await.unwrap();
		assert_eq!(&bytes[..], b"hello");
	}

	#[tokio::test(start_paused = true)]
	async fn timeout_body_errors_after_deadline() {
		// A body that never produces a frame; only the deadline resolves it.
		struct Pending;
		impl HttpBody for Pending {
			type Data = Bytes;
			type Error = Error;
			fn poll_frame(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
				Poll::Pending
			}
		}
		let mut body = Box::pin(TimeoutBody::new(Duration::from_millis(50), Pending));
		tokio::time::advance(Duration::from_millis(100)).await;
		let frame = std::future::poll_fn(|cx| body.as_mut().poll_frame(cx)).await;
		assert!(frame.unwrap().is_err());
	}
}
