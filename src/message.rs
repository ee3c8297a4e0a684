//! Request and response values carried through the pipeline.
//!
//! A [`Request`] is immutable once handed to the client; retries clone it
//! (headers and body are cheap to clone, `Bytes` is reference counted).

use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method, StatusCode, Uri};

/// Description of the call to make.
#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
}

impl Request {
    pub fn new(method: Method, uri: Uri) -> Self {
        Self { method, uri, headers: HeaderMap::new(), body: Bytes::new() }
    }

    /// Shorthand for a `GET` request.
    pub fn get(uri: Uri) -> Self {
        Self::new(Method::GET, uri)
    }

    /// Shorthand for a `POST` request.
    pub fn post(uri: Uri) -> Self {
        Self::new(Method::POST, uri)
    }

    /// Add (append) a header.
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Snapshot of the request line and headers, as recorded in the log.
    pub fn head(&self) -> RequestHead {
        RequestHead {
            method: self.method.clone(),
            uri: self.uri.clone(),
            headers: self.headers.clone(),
        }
    }
}

/// Request line and headers without the body.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestHead {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
}

/// Status line and headers of a response.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub headers: HeaderMap,
}

impl ResponseHead {
    pub fn new(status: StatusCode) -> Self {
        Self { status, headers: HeaderMap::new() }
    }
}

/// A fully received response: head, body, and trailers.
#[derive(Debug, Clone)]
pub struct Response {
    head: ResponseHead,
    body: Bytes,
    trailers: HeaderMap,
}

impl Response {
    pub fn new(status: StatusCode) -> Self {
        Self { head: ResponseHead::new(status), body: Bytes::new(), trailers: HeaderMap::new() }
    }

    /// `200 OK` with an empty body.
    pub fn ok() -> Self {
        Self::new(StatusCode::OK)
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.head.headers.append(name, value);
        self
    }

    pub fn with_trailer(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.trailers.append(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn status(&self) -> StatusCode {
        self.head.status
    }

    pub fn head(&self) -> &ResponseHead {
        &self.head
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.head.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.head.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn trailers(&self) -> &HeaderMap {
        &self.trailers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_clone_shares_body() {
        let request = Request::post(Uri::from_static("http://svc/items"))
            .with_header(http::header::ACCEPT, HeaderValue::from_static("application/json"))
            .with_body("payload");
        let copy = request.clone();
        assert_eq!(copy.body(), request.body());
        assert_eq!(copy.method(), Method::POST);
        assert_eq!(copy.head().headers.get(http::header::ACCEPT).unwrap(), "application/json");
    }

    #[test]
    fn response_keeps_trailers_separate() {
        let name = HeaderName::from_static("grpc-status");
        let response = Response::ok().with_trailer(name.clone(), HeaderValue::from_static("0"));
        assert!(response.headers().get(&name).is_none());
        assert_eq!(response.trailers().get(&name).unwrap(), "0");
    }
}
