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

//! The catalog translator: feature definitions in, provider products and
//! prices out, and back again.
//!
//! The provider's native price shape is lossy (it has no notion of plans or
//! versions), so every product and price carries the full feature definition
//! under `tier.*` metadata keys. Pulls reconstruct features from that
//! metadata alone, which makes push/pull round-trips lossless modulo the
//! provider-assigned price id.

use std::collections::BTreeMap;

use reqwest::Method;
use serde::Deserialize;
use tracing::debug;

use crate::control::{meta, Feature, Tier, INF};
use crate::error::Error;
use crate::refs::FeaturePlan;
use crate::stripe::{Form, PageItem};

/// A provider price, decoded only as far as the control plane needs.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct PriceObj {
    pub id: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl PageItem for PriceObj {
    fn page_cursor(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Clone, Deserialize)]
struct ProductObj {
    id: String,
    #[serde(default)]
    metadata: BTreeMap<String, String>,
}

/// Derives the deterministic provider product id for a feature-plan.
///
/// `:` is not legal in provider ids, so reference separators sanitize to
/// `-`: `feature:t@plan:test@0` becomes `tier__t-test-0`.
pub(crate) fn product_id(fp: &FeaturePlan) -> String {
    format!(
        "tier__{}-{}-{}",
        fp.base().replace(':', "-"),
        fp.plan().name().replace(':', "-"),
        fp.version()
    )
}

/// The display name of the provider product for a feature.
pub(crate) fn product_name(f: &Feature) -> String {
    format!("{} - {}", f.plan_title, f.title)
}

/// The `tier.*` metadata written to both the product and the price.
pub(crate) fn feature_metadata(f: &Feature) -> BTreeMap<String, String> {
    let fp = &f.feature_plan;
    let mut md = BTreeMap::new();
    md.insert(meta::PLAN.into(), fp.plan().to_string());
    md.insert(meta::FEATURE.into(), fp.name().to_string());
    md.insert(meta::VERSION.into(), fp.version().into());
    md.insert(meta::TITLE.into(), f.title.clone());
    md.insert(meta::PLAN_TITLE.into(), f.plan_title.clone());
    md.insert(meta::INTERVAL.into(), f.interval.to_string());
    md.insert(meta::AGGREGATE.into(), f.aggregate.to_string());
    md.insert(meta::MODE.into(), f.mode.to_string());
    md.insert(meta::CURRENCY.into(), f.currency.clone());
    md.insert(meta::BASE.into(), f.base.to_string());
    md.insert(
        meta::TIERS.into(),
        serde_json::to_string(&f.tiers).expect("tier table serializes"),
    );
    if f.transform_divide_by > 1 {
        md.insert(meta::TRANSFORM.into(), format!("{}/{}", f.transform_divide_by, f.transform_round));
    }
    md
}

/// Reconstructs a feature from `tier.*` metadata. Returns `None` when the
/// markers are absent or unreadable.
pub(crate) fn feature_from_metadata(md: &BTreeMap<String, String>) -> Option<Feature> {
    let plan = md.get(meta::PLAN)?;
    let name = md.get(meta::FEATURE)?;
    let fp = FeaturePlan::parse(&format!("{name}@{plan}")).ok()?;
    let mut f = Feature::new(fp);
    f.title = md.get(meta::TITLE).cloned().unwrap_or_default();
    f.plan_title = md.get(meta::PLAN_TITLE).cloned().unwrap_or_default();
    if let Some(currency) = md.get(meta::CURRENCY) {
        f.currency = currency.clone();
    }
    f.interval = md
        .get(meta::INTERVAL)
        .and_then(|s| s.parse().ok())
        .unwrap_or_default();
    f.aggregate = md
        .get(meta::AGGREGATE)
        .and_then(|s| s.parse().ok())
        .unwrap_or_default();
    f.mode = md
        .get(meta::MODE)
        .and_then(|s| s.parse().ok())
        .unwrap_or_default();
    f.base = md.get(meta::BASE).and_then(|s| s.parse().ok()).unwrap_or(0);
    f.tiers = md
        .get(meta::TIERS)
        .and_then(|s| serde_json::from_str(s).ok())
        .unwrap_or_default();
    if let Some(transform) = md.get(meta::TRANSFORM) {
        if let Some((divide_by, round)) = transform.split_once('/') {
            f.transform_divide_by = divide_by.parse().unwrap_or(0);
            f.transform_round = round.parse().unwrap_or_default();
        }
    }
    Some(f)
}

/// Reconstructs a feature from a provider price, id included.
pub(crate) fn feature_from_price(p: &PriceObj) -> Option<Feature> {
    let mut f = feature_from_metadata(&p.metadata)?;
    f.provider_id = p.id.clone();
    Some(f)
}

/// The subset of `metadata` under the reserved prefix.
fn tier_metadata(md: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    md.iter()
        .filter(|(k, _)| k.starts_with(meta::RESERVED_PREFIX))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

impl Tier {
    /// Pushes feature definitions to the provider.
    ///
    /// Each feature's outcome is reported through `report` with the assigned
    /// provider price id or the error; a failing feature never aborts the
    /// push of the others.
    pub async fn push<F>(&self, features: &[Feature], mut report: F)
    where
        F: FnMut(&Feature, Result<&str, &Error>),
    {
        for f in features {
            match self.push_feature(f).await {
                Ok(provider_id) => report(f, Ok(&provider_id)),
                Err(e) => report(f, Err(&e)),
            }
        }
    }

    /// Pushes a single feature, returning the provider price id.
    pub async fn push_feature(&self, f: &Feature) -> Result<String, Error> {
        f.validate()?;
        let product = product_id(&f.feature_plan);
        let want = feature_metadata(f);

        match self
            .stripe
            .do_req::<ProductObj>(Method::GET, &format!("/v1/products/{product}"), &Form::new())
            .await
        {
            Ok(existing) => {
                // Products are immutable once pushed: a definition change is
                // a new plan version, not an edit.
                if tier_metadata(&existing.metadata) != want {
                    return Err(Error::Conflict(existing.id));
                }
            }
            Err(Error::Provider(e)) if e.is_missing() => {
                let mut form = Form::new();
                form.set("id", product.as_str());
                form.set("name", product_name(f));
                for (k, v) in &want {
                    form.set(format!("metadata[{k}]"), v.as_str());
                }
                form.set_idempotency_key(product.as_str());
                let _: ProductObj = self
                    .stripe
                    .do_req(Method::POST, "/v1/products", &form)
                    .await?;
            }
            Err(e) => return Err(e),
        }

        // Prices are never mutated either: reuse one whose definition
        // matches, otherwise mint a new one under the product.
        let mut form = Form::new();
        form.set("product", product.as_str());
        let prices: Vec<PriceObj> = self.stripe.slurp(Method::GET, "/v1/prices", &form).await?;
        if let Some(p) = prices.iter().find(|p| tier_metadata(&p.metadata) == want) {
            debug!(price = %p.id, %product, "reusing existing price");
            return Ok(p.id.clone());
        }

        let form = price_form(f, &product, &want);
        let price: PriceObj = self.stripe.do_req(Method::POST, "/v1/prices", &form).await?;
        Ok(price.id)
    }

    /// Pulls the entire feature catalog back out of the provider.
    ///
    /// Prices without `tier.*` markers are ignored. When several prices
    /// decode to the same feature-plan, the provider's newest-first list
    /// order wins.
    pub async fn pull(&self) -> Result<Vec<Feature>, Error> {
        let prices: Vec<PriceObj> = self
            .stripe
            .slurp(Method::GET, "/v1/prices", &Form::new())
            .await?;
        let mut features: BTreeMap<FeaturePlan, Feature> = BTreeMap::new();
        for f in prices.iter().filter_map(feature_from_price) {
            features.entry(f.feature_plan.clone()).or_insert(f);
        }
        Ok(features.into_values().collect())
    }
}

fn price_form(f: &Feature, product: &str, md: &BTreeMap<String, String>) -> Form {
    let mut form = Form::new();
    form.set("product", product);
    form.set("currency", f.currency.as_str());
    for (k, v) in md {
        form.set(format!("metadata[{k}]"), v.as_str());
    }
    form.set("recurring[interval]", f.interval.stripe_interval());
    if f.is_metered() {
        form.set("recurring[usage_type]", "metered");
        form.set("recurring[aggregate_usage]", f.aggregate.stripe_aggregate());
        form.set("billing_scheme", "tiered");
        form.set("tiers_mode", f.mode.to_string());
        for (i, t) in f.tiers.iter().enumerate() {
            if t.cap() == INF {
                form.set(format!("tiers[{i}][up_to]"), "inf");
            } else {
                form.set(format!("tiers[{i}][up_to]"), t.upto);
            }
            form.set(format!("tiers[{i}][unit_amount]"), t.price);
            form.set(format!("tiers[{i}][flat_amount]"), t.base);
        }
        if f.transform_divide_by > 1 {
            form.set("transform_quantity[divide_by]", f.transform_divide_by);
            form.set("transform_quantity[round]", f.transform_round.to_string());
        }
    } else {
        form.set("recurring[usage_type]", "licensed");
        form.set("unit_amount", f.base);
    }
    // One logical price per product definition, so the product id doubles as
    // the create key and concurrent pushes collapse provider-side.
    form.set_idempotency_key(format!("{product}#price"));
    form
}
