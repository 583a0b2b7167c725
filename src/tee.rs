//! Body capture that leaves the handler's and the client's view untouched.
//!
//! The request side is buffered once and replaced by an identical, unread
//! body. The response side is never buffered on the way out: [`TeeBody`]
//! hands every frame straight through and copies data frames into a
//! [`CaptureBuffer`] on the side.

use std::{
    fmt,
    pin::Pin,
    sync::{Arc, Mutex, PoisonError},
    task::{ready, Context, Poll},
};

use bytes::{Bytes, BytesMut};
use http::{
    header::{CONNECTION, UPGRADE},
    HeaderMap, Request,
};
use http_body::{Body, Frame, SizeHint};
use http_body_util::BodyExt;
use pin_project_lite::pin_project;
use tower::BoxError;

use crate::error::Error;

type FinishCallback = Box<dyn FnOnce() + Send + 'static>;

/// Reads the whole request body and puts an identical copy back in place.
///
/// On failure the request is left with an empty body and the error must be
/// returned without calling the handler.
pub async fn capture_request_body<B>(request: &mut Request<B>) -> Result<Bytes, Error>
where
    B: Body + From<Bytes>,
    B::Error: Into<BoxError>,
{
    let body = std::mem::replace(request.body_mut(), B::from(Bytes::new()));
    let bytes = body
        .collect()
        .await
        .map_err(|err| Error::BodyRead(err.into()))?
        .to_bytes();

    *request.body_mut() = B::from(bytes.clone());
    Ok(bytes)
}

/// Whether the request asks to switch protocols (websocket and friends).
pub fn is_upgrade_request(headers: &HeaderMap) -> bool {
    let connection_upgrade = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));

    connection_upgrade && headers.contains_key(UPGRADE)
}

/// Side buffer receiving a copy of every response data frame.
#[derive(Clone, Default)]
pub struct CaptureBuffer {
    bytes: Arc<Mutex<BytesMut>>,
}

impl CaptureBuffer {
    /// Everything captured so far.
    pub fn snapshot(&self) -> Bytes {
        self.bytes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .freeze()
    }

    pub fn len(&self) -> usize {
        self.bytes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn extend(&self, data: &[u8]) {
        self.bytes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(data);
    }
}

impl fmt::Debug for CaptureBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaptureBuffer")
            .field("len", &self.len())
            .finish()
    }
}

/// Wraps a response body so that its data is copied into the returned
/// buffer while being streamed to the client.
pub fn wrap_response_body<B>(body: B) -> (TeeBody<B>, CaptureBuffer) {
    let capture = CaptureBuffer::default();
    let body = TeeBody {
        inner: body,
        capture: Some(capture.clone()),
        on_finish: None,
    };
    (body, capture)
}

pin_project! {
    /// Response body that forwards every frame unchanged and optionally copies
    /// data frames into a [`CaptureBuffer`].
    ///
    /// A callback registered with [`TeeBody::on_finish`] runs once, when the
    /// stream ends, fails, or is dropped before completion.
    pub struct TeeBody<B> {
        #[pin]
        inner: B,
        capture: Option<CaptureBuffer>,
        on_finish: Option<FinishCallback>,
    }

    impl<B> PinnedDrop for TeeBody<B> {
        fn drop(this: Pin<&mut Self>) {
            let this = this.project();
            if let Some(on_finish) = this.on_finish.take() {
                on_finish();
            }
        }
    }
}

impl<B> TeeBody<B> {
    /// Body forwarded without any capture.
    pub fn passthrough(body: B) -> Self {
        TeeBody {
            inner: body,
            capture: None,
            on_finish: None,
        }
    }

    pub fn on_finish(mut self, callback: impl FnOnce() + Send + 'static) -> Self {
        self.on_finish = Some(Box::new(callback));
        self
    }

    pub fn is_capturing(&self) -> bool {
        self.capture.is_some()
    }
}

impl<B> Body for TeeBody<B>
where
    B: Body<Data = Bytes>,
{
    type Data = Bytes;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.project();
        let polled = ready!(this.inner.poll_frame(cx));

        match &polled {
            Some(Ok(frame)) => {
                if let (Some(capture), Some(data)) = (this.capture.as_ref(), frame.data_ref()) {
                    capture.extend(data);
                }
            }
            Some(Err(_)) | None => {
                if let Some(on_finish) = this.on_finish.take() {
                    on_finish();
                }
            }
        }

        Poll::Ready(polled)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl<B> fmt::Debug for TeeBody<B>
where
    B: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TeeBody")
            .field("inner", &self.inner)
            .field("capture", &self.capture)
            .finish_non_exhaustive()
    }
}
