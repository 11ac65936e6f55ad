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

//! The control plane: the bridge between the declarative pricing model
//! (features, plans, phases) and Stripe's concrete model (products, prices,
//! subscription schedules, usage records, customers).
//!
//! Stripe is the system of record. The engines here hold no state beyond the
//! HTTP connection pool; consistency under concurrency relies on
//! provider-side idempotency keys rather than in-process locks.

use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_enum_str::{Deserialize_enum_str, Serialize_enum_str};
use time::OffsetDateTime;

use crate::config::ClientConfig;
use crate::error::Error;
use crate::refs::FeaturePlan;
use crate::stripe::{self, Form};

pub mod catalog;
pub mod entitle;
pub mod schedule;
pub mod usage;

/// The sentinel for an unbounded tier cap or limit.
pub const INF: i64 = i64::MAX;

/// Provider-side metadata keys. Everything under the `tier.` prefix is
/// reserved for the control plane.
pub(crate) mod meta {
    pub const RESERVED_PREFIX: &str = "tier.";

    pub const ORG: &str = "tier.org";
    pub const PLAN: &str = "tier.plan";
    pub const FEATURE: &str = "tier.feature";
    pub const VERSION: &str = "tier.version";
    pub const TITLE: &str = "tier.title";
    pub const PLAN_TITLE: &str = "tier.plan_title";
    pub const INTERVAL: &str = "tier.interval";
    pub const AGGREGATE: &str = "tier.aggregate";
    pub const MODE: &str = "tier.mode";
    pub const CURRENCY: &str = "tier.currency";
    pub const BASE: &str = "tier.base";
    pub const TIERS: &str = "tier.tiers";
    pub const TRANSFORM: &str = "tier.transform";
}

/// A billing interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize_enum_str, Serialize_enum_str)]
pub enum Interval {
    #[serde(rename = "@daily")]
    Daily,
    #[serde(rename = "@monthly")]
    Monthly,
    #[serde(rename = "@yearly")]
    Yearly,
}

impl Default for Interval {
    fn default() -> Interval {
        Interval::Monthly
    }
}

impl Interval {
    /// The Stripe `recurring[interval]` value.
    pub(crate) fn stripe_interval(self) -> &'static str {
        match self {
            Interval::Daily => "day",
            Interval::Monthly => "month",
            Interval::Yearly => "year",
        }
    }
}

/// How metered usage aggregates within a billing period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize_enum_str, Serialize_enum_str)]
pub enum Aggregate {
    #[serde(rename = "sum")]
    Sum,
    #[serde(rename = "perpetual")]
    Perpetual,
    #[serde(rename = "max")]
    Max,
    #[serde(rename = "last")]
    Last,
    #[serde(rename = "last_ever")]
    LastEver,
}

impl Default for Aggregate {
    fn default() -> Aggregate {
        Aggregate::Sum
    }
}

impl Aggregate {
    /// The Stripe `recurring[aggregate_usage]` value.
    ///
    /// `perpetual` has no provider equivalent; `last_ever` is the closest
    /// (usage never resets with the period). The declared mode survives
    /// round-trips via the `tier.aggregate` metadata.
    pub(crate) fn stripe_aggregate(self) -> &'static str {
        match self {
            Aggregate::Sum => "sum",
            Aggregate::Max => "max",
            Aggregate::Last => "last_during_period",
            Aggregate::LastEver | Aggregate::Perpetual => "last_ever",
        }
    }
}

/// How the tier table prices usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize_enum_str, Serialize_enum_str)]
pub enum TierMode {
    #[serde(rename = "graduated")]
    Graduated,
    #[serde(rename = "volume")]
    Volume,
}

impl Default for TierMode {
    fn default() -> TierMode {
        TierMode::Graduated
    }
}

/// The rounding mode applied after the transform divisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize_enum_str, Serialize_enum_str)]
pub enum Rounding {
    #[serde(rename = "up")]
    Up,
    #[serde(rename = "down")]
    Down,
}

impl Default for Rounding {
    fn default() -> Rounding {
        Rounding::Up
    }
}

/// One row of a tiered price table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct PriceTier {
    /// The inclusive usage cap of this tier. `0` and [`INF`] both mean
    /// unbounded.
    #[serde(default)]
    pub upto: i64,
    /// The per-unit price in minor units.
    #[serde(default)]
    pub price: i64,
    /// The flat price of entering this tier, in minor units.
    #[serde(default)]
    pub base: i64,
}

impl PriceTier {
    /// The cap with the `0` spelling normalized to [`INF`].
    pub fn cap(&self) -> i64 {
        if self.upto == 0 {
            INF
        } else {
            self.upto
        }
    }
}

/// A feature as priced under one plan version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Feature {
    /// The feature-plan reference addressing this feature.
    pub feature_plan: FeaturePlan,
    /// The feature's display title.
    pub title: String,
    /// The owning plan's display title.
    pub plan_title: String,
    /// The lowercase ISO 4217 currency code.
    pub currency: String,
    /// The billing interval.
    pub interval: Interval,
    /// The base price in minor units, charged per interval.
    pub base: i64,
    /// The metered price table. Empty for licensed features.
    pub tiers: Vec<PriceTier>,
    /// How the tier table prices usage.
    pub mode: TierMode,
    /// How metered usage aggregates.
    pub aggregate: Aggregate,
    /// Usage is divided by this (when > 1) before pricing.
    pub transform_divide_by: i64,
    /// Rounding applied after the transform divisor.
    pub transform_round: Rounding,
    /// The opaque provider price id, set after a push or pull. Survives
    /// renames of the tier-level references.
    pub provider_id: String,
}

impl Feature {
    /// Creates a licensed (un-metered) feature with defaults.
    pub fn new(feature_plan: FeaturePlan) -> Feature {
        Feature {
            feature_plan,
            title: String::new(),
            plan_title: String::new(),
            currency: "usd".into(),
            interval: Interval::default(),
            base: 0,
            tiers: Vec::new(),
            mode: TierMode::default(),
            aggregate: Aggregate::default(),
            transform_divide_by: 0,
            transform_round: Rounding::default(),
            provider_id: String::new(),
        }
    }

    /// Reports whether the feature meters usage (i.e. has a tier table).
    pub fn is_metered(&self) -> bool {
        !self.tiers.is_empty()
    }

    /// The total usage limit: the saturating sum of tier caps for metered
    /// features, unbounded otherwise.
    pub fn limit(&self) -> i64 {
        if !self.is_metered() {
            return INF;
        }
        self.tiers
            .iter()
            .fold(0_i64, |acc, t| acc.saturating_add(t.cap()))
    }

    /// Validates the feature definition ahead of a push.
    ///
    /// The tier table must be strictly ascending by cap, which also forces
    /// any unbounded row to come last.
    pub fn validate(&self) -> Result<(), Error> {
        if self.currency.len() != 3 || !self.currency.bytes().all(|b| b.is_ascii_lowercase()) {
            return Err(Error::InvalidFeature);
        }
        if self.base < 0 {
            return Err(Error::InvalidFeature);
        }
        for pair in self.tiers.windows(2) {
            if pair[0].cap() >= pair[1].cap() {
                return Err(Error::InvalidFeature);
            }
        }
        if self.tiers.iter().any(|t| t.price < 0 || t.base < 0) {
            return Err(Error::InvalidFeature);
        }
        Ok(())
    }
}

/// The provider account behind the configured API key.
#[derive(Debug, Clone, Deserialize)]
pub struct Account {
    /// The provider account id.
    pub id: String,
    /// The account email, when the key can see it.
    #[serde(default)]
    pub email: Option<String>,
}

/// The control-plane handle.
///
/// `Tier` is safe for concurrent use across independent organizations; wrap
/// it in an [`Arc`] to share. Every operation suspends on network I/O to the
/// provider and is aborted by dropping its future.
///
/// [`Arc`]: std::sync::Arc
#[derive(Debug, Clone)]
pub struct Tier {
    pub(crate) stripe: stripe::Client,
}

impl Tier {
    /// Wraps a configured provider client.
    pub fn new(stripe: stripe::Client) -> Tier {
        Tier { stripe }
    }

    /// Builds a handle from the `STRIPE_API_KEY` environment variable.
    pub fn from_env() -> Result<Tier, std::env::VarError> {
        Ok(Tier::new(stripe::Client::new(ClientConfig::from_env()?)))
    }

    /// The underlying provider client.
    pub fn client(&self) -> &stripe::Client {
        &self.stripe
    }

    /// Describes the provider account behind the configured key.
    pub async fn whoami(&self) -> Result<Account, Error> {
        self.stripe
            .do_req(Method::GET, "/v1/account", &Form::new())
            .await
    }

    /// The provider's notion of now.
    ///
    /// When the client carries a test clock id, this is the clock's frozen
    /// time; all time-based scheduling decisions route through here so tests
    /// advance deterministically.
    pub(crate) async fn provider_now(&self) -> Result<OffsetDateTime, Error> {
        let Some(clock) = self.stripe.clock() else {
            return Ok(OffsetDateTime::now_utc());
        };
        #[derive(Deserialize)]
        struct Clock {
            frozen_time: i64,
        }
        let clock: Clock = self
            .stripe
            .do_req(
                Method::GET,
                &format!("/v1/test_helpers/test_clocks/{clock}"),
                &Form::new(),
            )
            .await?;
        Ok(OffsetDateTime::from_unix_timestamp(clock.frozen_time)
            .unwrap_or(OffsetDateTime::UNIX_EPOCH))
    }
}
