// Copyright Materialize, Inc. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License in the LICENSE file at the
// root of this repository, or online at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! A minimal Stripe client: form encoding, request execution, idempotency
//! keys, pagination, and error classification.
//!
//! The client carries no retry logic of its own. Retries must be layered on
//! top with [`backoff`], and only around requests the caller has made safe
//! with an idempotency key.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use reqwest::{Method, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::time::Instant;
use tracing::debug;

use crate::config::{ClientBuilder, ClientConfig};
use crate::error::{Error, ProviderError};

pub mod form;
pub mod pages;

pub use form::Form;
pub use pages::PageItem;

const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

/// A response body to discard.
#[derive(Deserialize)]
pub(crate) struct Empty {}

/// A Stripe API client.
///
/// The client is designed to be wrapped in an [`Arc`] and used from multiple
/// threads simultaneously. Its only state is the pooled HTTP connection and
/// the optional test clock id.
///
/// [`Arc`]: std::sync::Arc
#[derive(Debug, Clone)]
pub struct Client {
    pub(crate) inner: reqwest::Client,
    pub(crate) api_key: String,
    pub(crate) endpoint: Url,
    pub(crate) clock: Option<String>,
}

impl Client {
    /// Creates a new `Client` from its required configuration parameters.
    pub fn new(config: ClientConfig) -> Client {
        ClientBuilder::default().build(config)
    }

    /// Creates a builder for a `Client` that allows for customization of
    /// optional parameters.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::default()
    }

    /// The test clock id attached to this client, if any.
    pub fn clock(&self) -> Option<&str> {
        self.clock.as_deref()
    }

    /// The non-secret prefix of the configured API key (e.g. `sk_test`).
    pub fn key_prefix(&self) -> &str {
        let mut underscores = 0;
        for (i, b) in self.api_key.bytes().enumerate() {
            if b == b'_' {
                underscores += 1;
                if underscores == 2 {
                    return &self.api_key[..i];
                }
            }
        }
        &self.api_key
    }

    /// Reports whether the configured API key is a live-mode key.
    pub fn is_live(&self) -> bool {
        self.api_key.starts_with("sk_live_")
    }

    /// Executes a single request against the API.
    ///
    /// The form is sent as an `application/x-www-form-urlencoded` body for
    /// mutating methods and as the query string for GET and DELETE. The
    /// form's idempotency key, if set, is carried in the `Idempotency-Key`
    /// header; no key is ever invented here. Dropping the returned future
    /// aborts the in-flight request.
    pub async fn do_req<T>(&self, method: Method, path: &str, form: &Form) -> Result<T, Error>
    where
        T: DeserializeOwned,
    {
        #[derive(Deserialize)]
        struct ErrorEnvelope {
            #[serde(default)]
            error: ErrorBody,
        }

        #[derive(Deserialize, Default)]
        struct ErrorBody {
            #[serde(rename = "type", default)]
            kind: String,
            #[serde(default)]
            code: String,
            #[serde(default)]
            message: String,
            #[serde(default)]
            param: String,
        }

        let url = self
            .endpoint
            .join(path)
            .expect("paths are statically known to join cleanly");
        debug!(%method, path, "stripe request");
        let mut req = self
            .inner
            .request(method.clone(), url)
            .basic_auth(&self.api_key, None::<&str>);
        req = if method == Method::GET || method == Method::DELETE {
            req.query(form.pairs())
        } else {
            req.form(form.pairs())
        };
        if let Some(key) = form.idempotency_key() {
            req = req.header(IDEMPOTENCY_KEY_HEADER, key);
        }
        let res = req.send().await?;
        let status = res.status();
        if status.is_success() {
            Ok(res.json().await?)
        } else {
            let body = res.text().await?;
            let e = match serde_json::from_str::<ErrorEnvelope>(&body) {
                Ok(envelope) => envelope.error,
                Err(_) => {
                    debug!(%status, body = %body, "undecodable error body");
                    ErrorBody {
                        message: body,
                        ..Default::default()
                    }
                }
            };
            if status == StatusCode::UNAUTHORIZED || e.message.starts_with("Invalid API Key") {
                return Err(Error::InvalidApiKey);
            }
            Err(Error::Provider(ProviderError {
                http_status: status,
                kind: e.kind,
                code: e.code,
                message: e.message,
                param: e.param,
            }))
        }
    }

    /// Executes a request, discarding the response body.
    pub async fn send(&self, method: Method, path: &str, form: &Form) -> Result<(), Error> {
        let _: Empty = self.do_req(method, path, form).await?;
        Ok(())
    }
}

/// The base delay of [`backoff`].
pub const BACKOFF_BASE: Duration = Duration::from_millis(100);

/// The delay ceiling of [`backoff`].
pub const BACKOFF_CAP: Duration = Duration::from_secs(3);

/// Runs `op` under a bounded, jittered exponential backoff.
///
/// Transport errors and provider 5xx responses are retried until `deadline`
/// elapses; any other error surfaces immediately. The delay starts at
/// [`BACKOFF_BASE`], doubles per attempt up to [`BACKOFF_CAP`], and each
/// sleep draws uniformly from `[0, delay)`.
///
/// Callers must make the retried request idempotent (by setting an
/// idempotency key) before reaching for this.
pub async fn backoff<T, F, Fut>(deadline: Duration, mut op: F) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let start = Instant::now();
    let mut delay = BACKOFF_BASE;
    loop {
        let err = match op().await {
            Ok(v) => return Ok(v),
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) => e,
        };
        let sleep = delay.mul_f64(rand::thread_rng().gen::<f64>());
        if start.elapsed() + sleep >= deadline {
            return Err(err);
        }
        debug!(delay_ms = sleep.as_millis() as u64, "retrying after error: {err}");
        tokio::time::sleep(sleep).await;
        delay = (delay * 2).min(BACKOFF_CAP);
    }
}
