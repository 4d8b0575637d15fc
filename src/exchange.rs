//! One request/response cycle over a fresh connection.
//!
//! [`HttpExchange`] is the unit every higher layer works with: a status code
//! and a fixed-length body. Transport-level failures are folded into the
//! same shape as synthetic status codes, so callers interpret exactly one
//! kind of result:
//!
//! * 503: could not connect, or the server never sent a byte
//! * 504: the response stalled after it had started
//!
//! Both are distinct from protocol-level 5xx statuses only by their body
//! text; the target API never produces these codes itself.

use async_trait::async_trait;

use crate::transport;

/// A complete HTTP response: status code and accumulated body.
///
/// Transient by design. Bodies are fixed-length (`Content-Length`) or empty;
/// the target API never chunks.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct HttpExchange {
    pub status_code: u16,
    pub body: Vec<u8>,
}

impl HttpExchange {
    #[must_use]
    pub fn new(status_code: u16, body: Vec<u8>) -> Self {
        Self { status_code, body }
    }

    /// Synthetic 503 for a connection that could not be established.
    #[must_use]
    pub fn unable_to_connect() -> Self {
        Self::synthetic(503, "service unavailable (unable to connect)")
    }

    /// Synthetic 503 for a server that never sent a first byte.
    #[must_use]
    pub fn connect_timeout() -> Self {
        Self::synthetic(503, "service unavailable (timeout)")
    }

    /// Synthetic 504 for a response that stalled after it had started.
    #[must_use]
    pub fn response_timeout() -> Self {
        Self::synthetic(504, "response timeout")
    }

    fn synthetic(status_code: u16, reason: &str) -> Self {
        Self {
            status_code,
            body: reason.as_bytes().to_vec(),
        }
    }

    /// Lossy view of the body for diagnostics and JSON parsing errors.
    #[must_use]
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Seam between the API layers and the wire.
///
/// The production implementation is [`transport::Client`]; tests substitute
/// scripted responses. One exchange is an atomic unit of work: implementors
/// never run two concurrently.
#[async_trait]
pub trait HttpExchanger: Send + Sync {
    /// Performs one exchange over a fresh connection.
    ///
    /// Connect failures and timeouts surface as synthetic 503/504 exchanges,
    /// not as errors; `Err` is reserved for malformed responses.
    async fn exchange(
        &self,
        host: &str,
        port: u16,
        head: &str,
        body: &[u8],
    ) -> transport::Result<HttpExchange>;
}

#[cfg(test)]
pub mod testing {
    //! Scripted exchanger shared by the unit tests: pops canned responses
    //! in order and records every request it saw.

    use std::{
        collections::VecDeque,
        sync::{Arc, Mutex},
    };

    use super::*;

    #[derive(Default)]
    pub struct Scripted {
        responses: Mutex<VecDeque<HttpExchange>>,
        requests: Mutex<Vec<(String, String)>>,
    }

    impl Scripted {
        pub fn respond_with(response: HttpExchange) -> Arc<Self> {
            let scripted = Self::default();
            scripted.push(response);
            Arc::new(scripted)
        }

        pub fn push(&self, response: HttpExchange) {
            self.responses.lock().unwrap().push_back(response);
        }

        /// Recorded `(head, body)` pairs, oldest first.
        pub fn requests(&self) -> Vec<(String, String)> {
            self.requests.lock().unwrap().clone()
        }

        pub fn request_count(&self) -> usize {
            self.requests.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl HttpExchanger for Scripted {
        async fn exchange(
            &self,
            _host: &str,
            _port: u16,
            head: &str,
            body: &[u8],
        ) -> transport::Result<HttpExchange> {
            self.requests
                .lock()
                .unwrap()
                .push((head.to_owned(), String::from_utf8_lossy(body).into_owned()));
            Ok(self
                .responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(HttpExchange::unable_to_connect))
        }
    }
}
