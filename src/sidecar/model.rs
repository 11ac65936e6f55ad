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

//! The pricing model as pushed and pulled over the sidecar surface.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::control::{Aggregate, Feature, Interval, PriceTier, Rounding, TierMode};
use crate::refs::{FeaturePlan, Name, Plan};

fn is_zero(n: &i64) -> bool {
    *n == 0
}

/// The declarative pricing model: plans keyed by plan reference.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Model {
    #[serde(default)]
    pub plans: BTreeMap<Plan, ModelPlan>,
}

/// One plan of the model: a titled bundle of features.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelPlan {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<Interval>,
    #[serde(default)]
    pub features: BTreeMap<Name, ModelFeature>,
}

/// One feature of a plan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelFeature {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub title: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub base: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tiers: Vec<PriceTier>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<TierMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregate: Option<Aggregate>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub divide_by: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub round: Option<Rounding>,
}

impl Model {
    /// Flattens the model into feature definitions.
    ///
    /// Titles default to the reference text, currency to `usd`, interval to
    /// `@monthly`, tier mode to `graduated`, and aggregation to `sum`.
    pub fn to_features(&self) -> Vec<Feature> {
        let mut features = Vec::new();
        for (plan, mp) in &self.plans {
            for (name, mf) in &mp.features {
                let mut f = Feature::new(FeaturePlan::new(name, plan));
                f.title = if mf.title.is_empty() {
                    name.to_string()
                } else {
                    mf.title.clone()
                };
                f.plan_title = if mp.title.is_empty() {
                    plan.to_string()
                } else {
                    mp.title.clone()
                };
                if let Some(currency) = &mp.currency {
                    f.currency = currency.clone();
                }
                f.interval = mp.interval.unwrap_or_default();
                f.base = mf.base;
                f.tiers = mf.tiers.clone();
                f.mode = mf.mode.unwrap_or_default();
                f.aggregate = mf.aggregate.unwrap_or_default();
                f.transform_divide_by = mf.divide_by;
                f.transform_round = mf.round.unwrap_or_default();
                features.push(f);
            }
        }
        features.sort_by(|a, b| a.feature_plan.cmp(&b.feature_plan));
        features
    }

    /// Rebuilds a model from pulled feature definitions.
    pub fn from_features(features: &[Feature]) -> Model {
        let mut model = Model::default();
        for f in features {
            let plan = model
                .plans
                .entry(f.feature_plan.plan())
                .or_insert_with(|| ModelPlan {
                    title: f.plan_title.clone(),
                    currency: Some(f.currency.clone()),
                    interval: Some(f.interval),
                    ..Default::default()
                });
            plan.features.insert(
                f.feature_plan.name(),
                ModelFeature {
                    title: f.title.clone(),
                    base: f.base,
                    tiers: f.tiers.clone(),
                    mode: f.is_metered().then_some(f.mode),
                    aggregate: f.is_metered().then_some(f.aggregate),
                    divide_by: f.transform_divide_by,
                    round: (f.transform_divide_by > 1).then_some(f.transform_round),
                },
            );
        }
        model
    }
}
