//! Body wrappers used by [`MetricsService`](super::MetricsService).

use bytes::{Buf, BufMut, Bytes, BytesMut};
use harlog_core::CapturedBody;
use http::HeaderMap;
use http_body::{Body, Frame, SizeHint};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::BodyExt;
use pin_project_lite::pin_project;
use std::fmt;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

/// Boxed error type carried by [`RequestBody`].
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

type Remainder = UnsyncBoxBody<Bytes, BoxError>;

fn boxed<B>(body: B) -> Remainder
where
    B: Body + Send + 'static,
    B::Error: Into<BoxError>,
{
    body.map_frame(|frame| frame.map_data(|mut data| data.copy_to_bytes(data.remaining())))
        .map_err(Into::into)
        .boxed_unsync()
}

/// The request body handed to the inner service.
///
/// A body that fits the capture limit is read into memory so it can be
/// both recorded and replayed, trailers included. A larger body keeps the
/// prefix that was read and streams the rest from the connection, and a
/// body that is not being logged is streamed untouched.
///
/// If reading the original body failed partway, the bytes read so far are
/// replayed and then the error is.
pub struct RequestBody {
    data: Option<Bytes>,
    rest: Option<Remainder>,
    trailers: Option<HeaderMap>,
    error: Option<BoxError>,
    complete: bool,
}

impl RequestBody {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: Some(data.into()),
            rest: None,
            trailers: None,
            error: None,
            complete: true,
        }
    }

    /// Forward `body` without keeping any of it.
    pub fn streaming<B>(body: B) -> Self
    where
        B: Body + Send + 'static,
        B::Error: Into<BoxError>,
    {
        Self::unread(boxed(body))
    }

    fn unread(rest: Remainder) -> Self {
        Self {
            data: None,
            rest: Some(rest),
            trailers: None,
            error: None,
            complete: false,
        }
    }

    /// Read `body` to the end, unless it turns out to be larger than
    /// `limit` bytes.
    pub async fn read<B>(body: B, limit: usize) -> Self
    where
        B: Body + Send + 'static,
        B::Error: Into<BoxError>,
    {
        if body.size_hint().lower() > limit as u64 {
            return Self::streaming(body);
        }
        let mut body = boxed(body);

        let mut buf = BytesMut::new();
        let mut trailers = None;

        while let Some(frame) = body.frame().await {
            let frame = match frame {
                Ok(frame) => frame,
                Err(e) => {
                    return Self {
                        data: Some(buf.freeze()),
                        rest: None,
                        trailers,
                        error: Some(e),
                        complete: true,
                    }
                }
            };

            match frame.into_data() {
                Ok(data) => {
                    buf.put(data);
                    if buf.len() > limit {
                        return Self {
                            data: Some(buf.freeze()),
                            rest: Some(body),
                            trailers: None,
                            error: None,
                            complete: false,
                        };
                    }
                }
                Err(frame) => {
                    if let Ok(map) = frame.into_trailers() {
                        trailers = Some(map);
                    }
                }
            }
        }

        Self {
            data: Some(buf.freeze()),
            rest: None,
            trailers,
            error: None,
            complete: true,
        }
    }

    /// The buffered bytes, without consuming them.
    pub fn bytes(&self) -> Bytes {
        self.data.clone().unwrap_or_default()
    }

    /// Whether the whole body is held in memory.
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// What the request capturer should record for this body.
    pub fn captured(&self) -> CapturedBody {
        if self.complete {
            CapturedBody::from(self.bytes())
        } else {
            CapturedBody::TooLarge
        }
    }
}

impl Default for RequestBody {
    fn default() -> Self {
        Self::new(Bytes::new())
    }
}

impl fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestBody")
            .field("data", &self.data)
            .field("streaming", &self.rest.is_some())
            .field("trailers", &self.trailers)
            .field("error", &self.error)
            .finish()
    }
}

impl Body for RequestBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        if let Some(data) = self.data.take().filter(|d| !d.is_empty()) {
            return Poll::Ready(Some(Ok(Frame::data(data))));
        }
        if let Some(rest) = self.rest.as_mut() {
            return Pin::new(rest).poll_frame(cx);
        }
        if let Some(trailers) = self.trailers.take() {
            return Poll::Ready(Some(Ok(Frame::trailers(trailers))));
        }
        Poll::Ready(self.error.take().map(Err))
    }

    fn is_end_stream(&self) -> bool {
        self.data.as_ref().map_or(true, Bytes::is_empty)
            && self.rest.as_ref().map_or(true, Body::is_end_stream)
            && self.trailers.is_none()
            && self.error.is_none()
    }

    fn size_hint(&self) -> SizeHint {
        let buffered = self.data.as_ref().map_or(0, |d| d.len() as u64);
        match (&self.rest, &self.error) {
            (_, Some(_)) => SizeHint::default(),
            (Some(rest), None) => {
                let remaining = rest.size_hint();
                let mut hint = SizeHint::new();
                hint.set_lower(remaining.lower() + buffered);
                if let Some(upper) = remaining.upper() {
                    hint.set_upper(upper + buffered);
                }
                hint
            }
            (None, None) => SizeHint::with_exact(buffered),
        }
    }
}

type OnEnd = Box<dyn FnOnce(CapturedBody) + Send>;

pin_project! {
    /// A response body that forwards every frame unchanged while keeping a
    /// copy of the data, up to a limit.
    ///
    /// When the body completes, the callback receives everything that was
    /// sent, or [`CapturedBody::TooLarge`] once the limit was passed. It is
    /// not called if the body errors or is dropped before the end.
    pub struct TeeBody<B> {
        #[pin]
        inner: B,
        captured: BytesMut,
        limit: usize,
        oversized: bool,
        on_end: Option<OnEnd>,
        empty: bool,
    }

    impl<B> PinnedDrop for TeeBody<B> {
        fn drop(this: Pin<&mut Self>) {
            let this = this.project();
            // Servers never poll a body that is empty from the start.
            if *this.empty {
                finish(this.captured, *this.oversized, this.on_end);
            }
        }
    }
}

impl<B> TeeBody<B>
where
    B: Body,
{
    pub fn new<F>(inner: B, limit: usize, on_end: F) -> Self
    where
        F: FnOnce(CapturedBody) + Send + 'static,
    {
        let empty = inner.is_end_stream();
        let oversized = inner.size_hint().lower() > limit as u64;
        Self {
            inner,
            captured: BytesMut::new(),
            limit,
            oversized,
            on_end: Some(Box::new(on_end)),
            empty,
        }
    }

    /// Forward without recording.
    pub fn passthrough(inner: B) -> Self {
        Self {
            inner,
            captured: BytesMut::new(),
            limit: 0,
            oversized: true,
            on_end: None,
            empty: false,
        }
    }
}

fn finish(captured: &mut BytesMut, oversized: bool, on_end: &mut Option<OnEnd>) {
    if let Some(on_end) = on_end.take() {
        let body = if oversized {
            CapturedBody::TooLarge
        } else {
            CapturedBody::from(std::mem::take(captured).freeze())
        };
        on_end(body);
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
        let mut this = self.project();
        let frame = ready!(this.inner.as_mut().poll_frame(cx));

        match &frame {
            Some(Ok(frame)) => {
                if this.on_end.is_some() {
                    if let Some(data) = frame.data_ref().filter(|_| !*this.oversized) {
                        if this.captured.len() + data.len() > *this.limit {
                            *this.oversized = true;
                            *this.captured = BytesMut::new();
                        } else {
                            this.captured.extend_from_slice(data);
                        }
                    }
                    if this.inner.is_end_stream() {
                        finish(this.captured, *this.oversized, this.on_end);
                    }
                }
            }
            Some(Err(_)) => {
                this.on_end.take();
            }
            None => finish(this.captured, *this.oversized, this.on_end),
        }

        Poll::Ready(frame)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}
