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

//! The schedule engine: subscription schedules, phases, and organizations.
//!
//! An organization is a provider customer tagged with `tier.org` metadata;
//! the provider owns the `cus_*` id. Each org has at most one subscription
//! schedule, an ordered sequence of phases. Creating the customer is the one
//! place concurrency matters: parallel subscribes collapse provider-side on
//! an idempotency key derived from the org id, so no in-process locking is
//! needed.

use std::collections::{BTreeMap, BTreeSet};

use reqwest::Method;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::debug;

use crate::control::catalog::{feature_from_price, PriceObj};
use crate::control::{meta, Feature, Tier};
use crate::error::Error;
use crate::refs::{FeaturePlan, ParseError, Plan};
use crate::stripe::{Form, PageItem};

/// The maximum number of features in a single phase.
pub const MAX_PHASE_ITEMS: usize = 20;

/// A slice of an organization's subscription timeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Phase {
    /// The organization the phase belongs to.
    pub org: String,
    /// When the phase takes effect.
    pub effective: OffsetDateTime,
    /// When the phase ends, if a later phase follows.
    pub end: Option<OffsetDateTime>,
    /// Every feature-plan covered by the phase.
    pub features: Vec<FeaturePlan>,
    /// Plans for which every feature of the plan is present in `features`.
    pub plans: Vec<Plan>,
    /// Features whose plan is only partially present.
    pub fragments: Vec<FeaturePlan>,
    /// Whether this is the phase in effect at the provider's now.
    pub current: bool,
}

impl Phase {
    /// Creates an input phase for a schedule write.
    pub fn new(effective: OffsetDateTime, features: Vec<FeaturePlan>) -> Phase {
        Phase {
            org: String::new(),
            effective,
            end: None,
            features,
            plans: Vec::new(),
            fragments: Vec::new(),
            current: false,
        }
    }
}

/// Organization metadata mirrored onto the provider customer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrgInfo {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub phone: String,
    /// User metadata. Keys under the `tier.` prefix are reserved; an empty
    /// string value removes the key, and absent keys are left intact.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct CustomerObj {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl PageItem for CustomerObj {
    fn page_cursor(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ScheduleObj {
    pub id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub subscription: Option<String>,
    #[serde(default)]
    pub phases: Vec<SchedulePhaseObj>,
}

impl PageItem for ScheduleObj {
    fn page_cursor(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct SchedulePhaseObj {
    pub start_date: i64,
    #[serde(default)]
    pub end_date: Option<i64>,
    #[serde(default)]
    pub items: Vec<ScheduleItemObj>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ScheduleItemObj {
    pub price: PriceObj,
    #[serde(default)]
    pub quantity: Option<u64>,
}

/// A phase with references resolved to provider price ids.
#[derive(Debug, Clone)]
struct ResolvedPhase {
    effective: OffsetDateTime,
    items: Vec<ResolvedItem>,
}

#[derive(Debug, Clone)]
struct ResolvedItem {
    price: String,
    // licensed prices carry quantity 1; metered prices carry none
    quantity: Option<u64>,
}

fn check_org(org: &str) -> Result<(), Error> {
    if org.strip_prefix("org:").map_or(false, |rest| !rest.is_empty()) {
        Ok(())
    } else {
        Err(ParseError::new(org, "must be prefixed with \"org:\"").into())
    }
}

fn validate_info(info: &OrgInfo) -> Result<(), Error> {
    if !info.email.is_empty() && !validator::validate_email(info.email.as_str()) {
        return Err(Error::InvalidEmail);
    }
    if info
        .metadata
        .keys()
        .any(|k| k.starts_with(meta::RESERVED_PREFIX))
    {
        return Err(Error::InvalidMetadata);
    }
    Ok(())
}

fn info_form(form: &mut Form, info: &OrgInfo) {
    if !info.email.is_empty() {
        form.set("email", info.email.as_str());
    }
    if !info.name.is_empty() {
        form.set("name", info.name.as_str());
    }
    if !info.description.is_empty() {
        form.set("description", info.description.as_str());
    }
    if !info.phone.is_empty() {
        form.set("phone", info.phone.as_str());
    }
    for (k, v) in &info.metadata {
        // an empty value deletes the key provider-side
        form.set(format!("metadata[{k}]"), v.as_str());
    }
}

/// Splits a phase's features into fully-covered plans and fragments.
fn classify(catalog: &[Feature], features: &[FeaturePlan]) -> (Vec<Plan>, Vec<FeaturePlan>) {
    let mut by_plan: BTreeMap<Plan, BTreeSet<&FeaturePlan>> = BTreeMap::new();
    for f in catalog {
        by_plan
            .entry(f.feature_plan.plan())
            .or_default()
            .insert(&f.feature_plan);
    }
    let present: BTreeSet<&FeaturePlan> = features.iter().collect();
    let mut plans = Vec::new();
    let mut fragments = Vec::new();
    for (plan, all) in by_plan {
        if !features.iter().any(|fp| fp.plan() == plan) {
            continue;
        }
        if all.iter().all(|fp| present.contains(*fp)) {
            plans.push(plan);
        } else {
            fragments.extend(
                features
                    .iter()
                    .filter(|fp| fp.plan() == plan)
                    .cloned(),
            );
        }
    }
    (plans, fragments)
}

fn resolve_phases(catalog: &[Feature], phases: &[Phase]) -> Result<Vec<ResolvedPhase>, Error> {
    let by_ref: BTreeMap<&FeaturePlan, &Feature> =
        catalog.iter().map(|f| (&f.feature_plan, f)).collect();
    let mut resolved = Vec::with_capacity(phases.len());
    for phase in phases {
        if phase.features.is_empty() {
            return Err(Error::InvalidPhase);
        }
        if phase.features.len() > MAX_PHASE_ITEMS {
            return Err(Error::TooManyItems);
        }
        let mut items = Vec::with_capacity(phase.features.len());
        let mut currency = None;
        for fp in &phase.features {
            let f = by_ref.get(fp).ok_or(Error::FeatureNotFound)?;
            match currency {
                None => currency = Some(&f.currency),
                Some(c) if *c == f.currency => {}
                Some(_) => return Err(Error::InvalidPhase),
            }
            items.push(ResolvedItem {
                price: f.provider_id.clone(),
                quantity: (!f.is_metered()).then_some(1),
            });
        }
        resolved.push(ResolvedPhase {
            effective: phase.effective,
            items,
        });
    }
    Ok(resolved)
}

impl Tier {
    /// Replaces the org's schedule with a single phase containing exactly
    /// `features`, effective now, prorating immediately.
    pub async fn subscribe(&self, org: &str, features: &[FeaturePlan]) -> Result<(), Error> {
        let now = self.provider_now().await?;
        self.schedule(org, None, &[Phase::new(now, features.to_vec())])
            .await
    }

    /// Appends a phase containing exactly `features`, effective now,
    /// preserving all earlier phases as history.
    pub async fn subscribe_to(&self, org: &str, features: &[FeaturePlan]) -> Result<(), Error> {
        let now = self.provider_now().await?;
        self.schedule_append(org, None, &[Phase::new(now, features.to_vec())])
            .await
    }

    /// Replaces the org's entire schedule, optionally updating org info.
    ///
    /// The org's customer is created on first use. With no phases this only
    /// provisions or updates the customer.
    pub async fn schedule(
        &self,
        org: &str,
        info: Option<&OrgInfo>,
        phases: &[Phase],
    ) -> Result<(), Error> {
        check_org(org)?;
        if let Some(info) = info {
            validate_info(info)?;
        }
        let catalog = self.pull().await?;
        let resolved = resolve_phases(&catalog, phases)?;
        let cus = self.put_org(org, info).await?;
        if resolved.is_empty() {
            return Ok(());
        }
        let existing = self.lookup_schedule(&cus).await?;
        self.write_schedule(existing.as_ref(), &cus, org, &resolved)
            .await
    }

    /// Appends phases to the org's schedule.
    ///
    /// Existing phases that take effect strictly before the first new phase
    /// are preserved untouched; everything at or after it is replaced by the
    /// new phases.
    pub async fn schedule_append(
        &self,
        org: &str,
        info: Option<&OrgInfo>,
        phases: &[Phase],
    ) -> Result<(), Error> {
        check_org(org)?;
        if let Some(info) = info {
            validate_info(info)?;
        }
        let catalog = self.pull().await?;
        let new = resolve_phases(&catalog, phases)?;
        let cus = self.put_org(org, info).await?;
        if new.is_empty() {
            return Ok(());
        }
        let existing = self.lookup_schedule(&cus).await?;
        let mut target = Vec::new();
        if let Some(s) = &existing {
            let cutoff = new[0].effective;
            for p in &s.phases {
                let start = OffsetDateTime::from_unix_timestamp(p.start_date)
                    .unwrap_or(OffsetDateTime::UNIX_EPOCH);
                if start < cutoff {
                    target.push(ResolvedPhase {
                        effective: start,
                        items: p
                            .items
                            .iter()
                            .map(|it| ResolvedItem {
                                price: it.price.id.clone(),
                                quantity: it.quantity,
                            })
                            .collect(),
                    });
                }
            }
        }
        target.extend(new);
        self.write_schedule(existing.as_ref(), &cus, org, &target)
            .await
    }

    /// Updates only the org's info. The org must already exist.
    pub async fn schedule_now(&self, org: &str, info: &OrgInfo) -> Result<(), Error> {
        self.put_customer(org, info).await
    }

    /// Updates the provider customer backing `org`.
    ///
    /// Validation happens before any provider call, so a rejected update
    /// changes nothing.
    pub async fn put_customer(&self, org: &str, info: &OrgInfo) -> Result<(), Error> {
        check_org(org)?;
        validate_info(info)?;
        let cus = self.find_customer(org).await?.ok_or(Error::OrgNotFound)?;
        let mut form = Form::new();
        info_form(&mut form, info);
        if form.is_empty() {
            return Ok(());
        }
        self.stripe
            .send(Method::POST, &format!("/v1/customers/{cus}"), &form)
            .await
    }

    /// Returns every phase ever scheduled for the org, chronological, with
    /// the phase in effect at the provider's now marked current.
    pub async fn lookup_phases(&self, org: &str) -> Result<Vec<Phase>, Error> {
        check_org(org)?;
        let cus = self.find_customer(org).await?.ok_or(Error::OrgNotFound)?;
        let Some(schedule) = self.lookup_schedule(&cus).await? else {
            return Ok(Vec::new());
        };
        let catalog = self.pull().await?;
        let now = self.provider_now().await?;

        let mut phases: Vec<Phase> = schedule
            .phases
            .iter()
            .map(|p| {
                let mut features: Vec<FeaturePlan> = p
                    .items
                    .iter()
                    .filter_map(|it| feature_from_price(&it.price))
                    .map(|f| f.feature_plan)
                    .collect();
                features.sort();
                features.dedup();
                let (plans, fragments) = classify(&catalog, &features);
                Phase {
                    org: org.into(),
                    effective: OffsetDateTime::from_unix_timestamp(p.start_date)
                        .unwrap_or(OffsetDateTime::UNIX_EPOCH),
                    end: p
                        .end_date
                        .and_then(|t| OffsetDateTime::from_unix_timestamp(t).ok()),
                    features,
                    plans,
                    fragments,
                    current: false,
                }
            })
            .collect();
        phases.sort_by_key(|p| p.effective);

        let mut current = None;
        for (i, p) in phases.iter().enumerate() {
            if p.effective <= now {
                current = Some(i);
            }
        }
        if let Some(i) = current {
            phases[i].current = true;
        }
        Ok(phases)
    }

    /// Resolves the provider customer id for `org`.
    pub async fn whois(&self, org: &str) -> Result<String, Error> {
        check_org(org)?;
        self.find_customer(org).await?.ok_or(Error::OrgNotFound)
    }

    /// Resolves the provider customer id and info for `org`.
    pub async fn whois_info(&self, org: &str) -> Result<(String, OrgInfo), Error> {
        let cus = self.whois(org).await?;
        let c: CustomerObj = self
            .stripe
            .do_req(Method::GET, &format!("/v1/customers/{cus}"), &Form::new())
            .await?;
        let info = OrgInfo {
            email: c.email.unwrap_or_default(),
            name: c.name.unwrap_or_default(),
            description: c.description.unwrap_or_default(),
            phone: c.phone.unwrap_or_default(),
            metadata: c
                .metadata
                .into_iter()
                .filter(|(k, _)| !k.starts_with(meta::RESERVED_PREFIX))
                .collect(),
        };
        Ok((cus, info))
    }

    /// Lists every known org and its provider customer id.
    pub async fn list_orgs(&self) -> Result<Vec<(String, String)>, Error> {
        let customers: Vec<CustomerObj> = self
            .stripe
            .slurp(Method::GET, "/v1/customers", &Form::new())
            .await?;
        let mut orgs: Vec<(String, String)> = customers
            .into_iter()
            .filter_map(|c| c.metadata.get(meta::ORG).map(|org| (org.clone(), c.id)))
            .collect();
        orgs.sort();
        Ok(orgs)
    }

    pub(crate) async fn find_customer(&self, org: &str) -> Result<Option<String>, Error> {
        let customers: Vec<CustomerObj> = self
            .stripe
            .slurp(Method::GET, "/v1/customers", &Form::new())
            .await?;
        // ties from concurrent creation resolve to the smallest id
        Ok(customers
            .into_iter()
            .filter(|c| c.metadata.get(meta::ORG).map(String::as_str) == Some(org))
            .map(|c| c.id)
            .min())
    }

    /// Finds or creates the customer for `org`, applying `info` when given.
    async fn put_org(&self, org: &str, info: Option<&OrgInfo>) -> Result<String, Error> {
        if let Some(cus) = self.find_customer(org).await? {
            if let Some(info) = info {
                let mut form = Form::new();
                info_form(&mut form, info);
                if !form.is_empty() {
                    self.stripe
                        .send(Method::POST, &format!("/v1/customers/{cus}"), &form)
                        .await?;
                }
            }
            return Ok(cus);
        }

        let mut form = Form::new();
        form.set(format!("metadata[{}]", meta::ORG), org);
        if let Some(clock) = self.stripe.clock() {
            form.set("test_clock", clock);
        }
        if let Some(info) = info {
            info_form(&mut form, info);
        }
        // Concurrent creators compute the same key and collapse
        // provider-side into a single customer.
        form.set_idempotency_key(org);
        let created: CustomerObj = self
            .stripe
            .do_req(Method::POST, "/v1/customers", &form)
            .await?;
        debug!(%org, customer = %created.id, "created customer");
        Ok(self.find_customer(org).await?.unwrap_or(created.id))
    }

    pub(crate) async fn lookup_schedule(&self, cus: &str) -> Result<Option<ScheduleObj>, Error> {
        let mut form = Form::new();
        form.set("customer", cus);
        form.set("expand[]", "data.phases.items.price");
        let schedules: Vec<ScheduleObj> = self
            .stripe
            .slurp(Method::GET, "/v1/subscription_schedules", &form)
            .await?;
        Ok(schedules
            .into_iter()
            .find(|s| matches!(s.status.as_str(), "" | "not_started" | "active")))
    }

    async fn write_schedule(
        &self,
        existing: Option<&ScheduleObj>,
        cus: &str,
        org: &str,
        phases: &[ResolvedPhase],
    ) -> Result<(), Error> {
        let mut form = Form::new();
        for (i, p) in phases.iter().enumerate() {
            form.set(format!("phases[{i}][start_date]"), p.effective);
            if let Some(next) = phases.get(i + 1) {
                form.set(format!("phases[{i}][end_date]"), next.effective);
            }
            for (j, item) in p.items.iter().enumerate() {
                form.set(format!("phases[{i}][items][{j}][price]"), item.price.as_str());
                if let Some(q) = item.quantity {
                    form.set(format!("phases[{i}][items][{j}][quantity]"), q);
                }
            }
        }
        match existing {
            None => {
                form.set("customer", cus);
                form.set(format!("metadata[{}]", meta::ORG), org);
                form.set("end_behavior", "release");
                self.stripe
                    .send(Method::POST, "/v1/subscription_schedules", &form)
                    .await
            }
            Some(s) => {
                form.set("proration_behavior", "create_prorations");
                self.stripe
                    .send(
                        Method::POST,
                        &format!("/v1/subscription_schedules/{}", s.id),
                        &form,
                    )
                    .await
            }
        }
    }
}
