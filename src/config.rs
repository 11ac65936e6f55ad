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

use std::env;
use std::time::Duration;

use once_cell::sync::Lazy;
use reqwest::Url;

use crate::stripe::Client;

pub static DEFAULT_ENDPOINT: Lazy<Url> = Lazy::new(|| {
    "https://api.stripe.com"
        .parse()
        .expect("url known to be valid")
});

/// The environment variable holding the provider credential.
pub const API_KEY_VAR: &str = "STRIPE_API_KEY";

/// Configures the required parameters of a [`Client`].
pub struct ClientConfig {
    /// The Stripe API key to authenticate with.
    pub api_key: String,
}

impl ClientConfig {
    /// Builds a config from the `STRIPE_API_KEY` environment variable.
    pub fn from_env() -> Result<ClientConfig, env::VarError> {
        Ok(ClientConfig {
            api_key: env::var(API_KEY_VAR)?,
        })
    }
}

/// A builder for a [`Client`].
pub struct ClientBuilder {
    endpoint: Url,
    clock: Option<String>,
}

impl Default for ClientBuilder {
    fn default() -> ClientBuilder {
        ClientBuilder {
            endpoint: DEFAULT_ENDPOINT.clone(),
            clock: None,
        }
    }
}

impl ClientBuilder {
    /// Overrides the API endpoint.
    ///
    /// Used by tests to point the client at a mock server.
    pub fn endpoint(mut self, endpoint: Url) -> ClientBuilder {
        self.endpoint = endpoint;
        self
    }

    /// Attaches a test clock id.
    ///
    /// When set, customers are created against the clock and all time-based
    /// scheduling decisions read the clock's frozen time instead of the
    /// system clock.
    pub fn clock(mut self, clock: impl Into<String>) -> ClientBuilder {
        self.clock = Some(clock.into());
        self
    }

    /// Creates a [`Client`] that incorporates the optional parameters
    /// configured on the builder and the specified required parameters.
    pub fn build(self, config: ClientConfig) -> Client {
        let inner = reqwest::ClientBuilder::new()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(Duration::from_secs(60))
            .build()
            .expect("client construction cannot fail with static configuration");
        Client {
            inner,
            api_key: config.api_key,
            endpoint: self.endpoint,
            clock: self.clock,
        }
    }
}
