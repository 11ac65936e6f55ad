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

//! A pricing control plane for the [Stripe] billing platform.
//!
//! Express a pricing model (plans, features, tiered prices, metered
//! aggregation) declaratively and have it realized as Stripe products,
//! prices, subscription schedules, and usage records. A small HTTP
//! [sidecar](sidecar) exposes the operations to application servers:
//! push/pull the model, subscribe orgs, inspect schedules, report metered
//! usage, and answer entitlement queries.
//!
//! Stripe is the system of record: the crate holds no state of its own, and
//! consistency under concurrency comes from provider-side idempotency keys.
//!
//! [Stripe]: https://stripe.com

#[warn(missing_debug_implementations, missing_docs)]
pub mod config;
pub mod control;
pub mod error;
pub mod refs;
pub mod sidecar;
pub mod stripe;

pub use config::{ClientBuilder, ClientConfig};
pub use control::entitle::Answer;
pub use control::schedule::{OrgInfo, Phase};
pub use control::usage::{Report, Usage};
pub use control::{Account, Aggregate, Feature, Interval, PriceTier, Rounding, Tier, TierMode, INF};
pub use error::{Error, ProviderError};
pub use refs::{FeaturePlan, Name, ParseError, Plan};
pub use stripe::{Client, Form};
