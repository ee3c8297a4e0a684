#![allow(dead_code)]

use async_trait::async_trait;
use redial::{Cause, Request, Response, Transport};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

/// The failure raised by scripted transports and decorators in these tests.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("anticipated failure #{0}")]
pub struct AnticipatedError(pub u32);

type Script = dyn Fn(u32) -> Result<Response, Cause> + Send + Sync;

/// Transport answering call `n` (1-based) with `script(n)` and keeping every
/// request it saw.
#[derive(Clone)]
pub struct ScriptedTransport {
    calls: Arc<AtomicU32>,
    requests: Arc<Mutex<Vec<Request>>>,
    script: Arc<Script>,
}

impl ScriptedTransport {
    pub fn new<F>(script: F) -> Self
    where
        F: Fn(u32) -> Result<Response, Cause> + Send + Sync + 'static,
    {
        Self {
            calls: Arc::new(AtomicU32::new(0)),
            requests: Arc::new(Mutex::new(Vec::new())),
            script: Arc::new(script),
        }
    }

    /// Always answers with a clone of `response`.
    pub fn always(response: Response) -> Self {
        Self::new(move |_| Ok(response.clone()))
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<Request> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: Request) -> Result<Response, Cause> {
        self.requests.lock().unwrap().push(request);
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        (self.script)(n)
    }
}

pub fn get(uri: &'static str) -> Request {
    Request::get(http::Uri::from_static(uri))
}

/// Install a test subscriber once; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().with_env_filter("redial=debug").try_init();
}
