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

use reqwest::StatusCode;
use thiserror::Error;

use crate::refs::ParseError;

/// An error returned by the control plane or the underlying [`Client`].
///
/// Validation and not-found variants are sentinels: they carry no payload and
/// can be matched directly.
///
/// [`Client`]: crate::stripe::Client
#[derive(Debug, Error)]
pub enum Error {
    /// An error in the underlying transport.
    #[error("transport: {0}")]
    Transport(#[from] reqwest::Error),
    /// The configured API key was rejected by the provider.
    ///
    /// Every 401 response collapses to this value, regardless of body.
    #[error("invalid api key")]
    InvalidApiKey,
    /// A structured error returned by the provider.
    #[error(transparent)]
    Provider(#[from] ProviderError),
    /// A reference failed to parse.
    #[error(transparent)]
    InvalidReference(#[from] ParseError),
    /// The org has no corresponding provider customer.
    #[error("org not found")]
    OrgNotFound,
    /// The feature is not in the org's current phase, or not in the pushed
    /// catalog.
    #[error("feature not found")]
    FeatureNotFound,
    /// The feature has no tier table and cannot accept usage reports.
    #[error("feature not reportable")]
    FeatureNotMetered,
    /// An org info update carried a syntactically invalid email.
    #[error("invalid email")]
    InvalidEmail,
    /// An org info update touched reserved (`tier.`-prefixed) metadata.
    #[error("invalid metadata")]
    InvalidMetadata,
    /// A phase listed more than the maximum number of features.
    #[error("too many items")]
    TooManyItems,
    /// A phase was empty, inconsistent, or otherwise malformed.
    #[error("invalid phase")]
    InvalidPhase,
    /// A feature definition failed validation ahead of a push.
    #[error("invalid feature definition")]
    InvalidFeature,
    /// A pushed feature conflicts with an existing provider product whose
    /// definition differs.
    #[error("feature definition conflicts with existing product {0:?}")]
    Conflict(String),
}

impl Error {
    /// Reports whether retrying the operation could succeed: transport
    /// failures and provider 5xx responses are retryable, everything else is
    /// not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Transport(e) => !e.is_builder() && !e.is_decode(),
            Error::Provider(e) => e.http_status.is_server_error(),
            _ => false,
        }
    }
}

/// A structured error returned by the Stripe API.
#[derive(Debug, Clone, Error)]
#[error("stripe: {http_status} {kind} {code}: {message}")]
pub struct ProviderError {
    /// The HTTP status code of the response.
    pub http_status: StatusCode,
    /// The provider's error type (e.g. `invalid_request_error`).
    pub kind: String,
    /// The provider's short error code (e.g. `resource_missing`).
    pub code: String,
    /// A human-readable message.
    pub message: String,
    /// The request parameter the error relates to, if any.
    pub param: String,
}

impl ProviderError {
    /// Reports whether the error is the provider's "no such object" answer.
    pub fn is_missing(&self) -> bool {
        self.http_status == StatusCode::NOT_FOUND || self.code == "resource_missing"
    }
}
