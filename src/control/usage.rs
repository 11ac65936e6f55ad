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

//! The usage engine: metered usage reports and the projection of the org's
//! upcoming invoice back into per-feature usage and limits.

use std::collections::BTreeMap;
use std::time::Duration;

use rand::Rng;
use reqwest::Method;
use serde::Deserialize;
use time::OffsetDateTime;

use crate::control::catalog::{feature_from_price, PriceObj};
use crate::control::Tier;
use crate::error::Error;
use crate::refs::{FeaturePlan, Name};
use crate::stripe::{self, Form, PageItem};

/// The overall deadline for one usage report, retries included.
const REPORT_DEADLINE: Duration = Duration::from_secs(3);

/// A metered usage report.
#[derive(Debug, Clone, Default)]
pub struct Report {
    /// The reported quantity.
    pub n: i64,
    /// When the usage occurred. Defaults to the provider's now.
    pub at: Option<OffsetDateTime>,
    /// Replace the period's usage instead of incrementing it.
    pub clobber: bool,
    /// Overrides the idempotency key. A fresh random key is generated when
    /// absent, which makes provider-side retries safe but distinct reports
    /// additive.
    pub key: Option<String>,
}

/// A feature's usage within the current billing period.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Usage {
    /// The feature-plan the usage belongs to.
    pub feature_plan: FeaturePlan,
    /// The start of the billing period.
    pub start: OffsetDateTime,
    /// The end of the billing period.
    pub end: OffsetDateTime,
    /// Usage consumed so far.
    pub used: i64,
    /// The feature's limit ([`INF`] when unbounded).
    ///
    /// [`INF`]: crate::control::INF
    pub limit: i64,
}

#[derive(Debug, Clone, Deserialize)]
struct SubscriptionObj {
    id: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    items: SubscriptionItemList,
}

impl PageItem for SubscriptionObj {
    fn page_cursor(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct SubscriptionItemList {
    #[serde(default)]
    data: Vec<SubscriptionItemObj>,
}

#[derive(Debug, Clone, Deserialize)]
struct SubscriptionItemObj {
    id: String,
    price: PriceObj,
}

#[derive(Debug, Clone, Deserialize)]
struct InvoiceLineObj {
    id: String,
    #[serde(default)]
    quantity: Option<i64>,
    period: PeriodObj,
    #[serde(default)]
    price: Option<PriceObj>,
}

impl PageItem for InvoiceLineObj {
    fn page_cursor(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Clone, Deserialize)]
struct PeriodObj {
    start: i64,
    end: i64,
}

fn fresh_key() -> String {
    format!("{:016x}", rand::thread_rng().gen::<u64>())
}

fn ts(unix: i64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp(unix).unwrap_or(OffsetDateTime::UNIX_EPOCH)
}

impl Tier {
    /// Reports metered usage of `feature` for `org`.
    ///
    /// The request runs under a bounded backoff with a 3 second deadline;
    /// retries reuse the same idempotency key, so the provider observes the
    /// report at most once.
    pub async fn report_usage(
        &self,
        org: &str,
        feature: &Name,
        report: Report,
    ) -> Result<(), Error> {
        let cus = self.find_customer(org).await?.ok_or(Error::OrgNotFound)?;
        let item = self.lookup_subscription_item(&cus, feature).await?;
        let mut form = Form::new();
        form.set("quantity", report.n);
        if let Some(at) = report.at {
            form.set("timestamp", at);
        }
        form.set("action", if report.clobber { "set" } else { "increment" });
        form.set_idempotency_key(report.key.unwrap_or_else(fresh_key));
        let path = format!("/v1/subscription_items/{item}/usage_records");
        stripe::backoff(REPORT_DEADLINE, || {
            self.stripe.send(Method::POST, &path, &form)
        })
        .await
    }

    /// Projects the org's upcoming invoice into per-feature usage.
    ///
    /// Only lines whose price carries `tier.*` markers contribute. Proration
    /// can split a feature across lines; the line with the larger usage
    /// wins. An org without an upcoming invoice has no usage.
    pub async fn lookup_limits(&self, org: &str) -> Result<Vec<Usage>, Error> {
        let cus = self.find_customer(org).await?.ok_or(Error::OrgNotFound)?;
        let mut form = Form::new();
        form.set("customer", cus.as_str());
        form.set("expand[]", "data.price.tiers");
        let lines: Vec<InvoiceLineObj> = match self
            .stripe
            .slurp(Method::GET, "/v1/invoices/upcoming/lines", &form)
            .await
        {
            Ok(lines) => lines,
            Err(Error::Provider(e)) if e.is_missing() => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut by_feature: BTreeMap<FeaturePlan, Usage> = BTreeMap::new();
        for line in &lines {
            let Some(price) = &line.price else { continue };
            let Some(feature) = feature_from_price(price) else { continue };
            let usage = Usage {
                feature_plan: feature.feature_plan.clone(),
                start: ts(line.period.start),
                end: ts(line.period.end),
                used: line.quantity.unwrap_or(0),
                limit: feature.limit(),
            };
            match by_feature.entry(feature.feature_plan) {
                std::collections::btree_map::Entry::Vacant(e) => {
                    e.insert(usage);
                }
                std::collections::btree_map::Entry::Occupied(mut e) => {
                    if usage.used > e.get().used {
                        e.insert(usage);
                    }
                }
            }
        }
        Ok(by_feature.into_values().collect())
    }

    /// Finds the subscription item carrying `feature` in the org's current
    /// subscription.
    async fn lookup_subscription_item(&self, cus: &str, feature: &Name) -> Result<String, Error> {
        let mut form = Form::new();
        form.set("customer", cus);
        form.set("expand[]", "data.items.data.price");
        let subscriptions: Vec<SubscriptionObj> = self
            .stripe
            .slurp(Method::GET, "/v1/subscriptions", &form)
            .await?;
        let current = subscriptions
            .iter()
            .find(|s| matches!(s.status.as_str(), "" | "active" | "trialing" | "past_due"))
            .ok_or(Error::FeatureNotFound)?;
        for item in &current.items.data {
            let Some(f) = feature_from_price(&item.price) else { continue };
            if f.feature_plan.name() == *feature {
                if !f.is_metered() {
                    return Err(Error::FeatureNotMetered);
                }
                return Ok(item.id.clone());
            }
        }
        Err(Error::FeatureNotFound)
    }
}
