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

//! The entitlement facade.
//!
//! Provider availability must not cause a correct application to deny
//! service, so a failed limits lookup answers "yes" and keeps the error
//! around for callers that want strict semantics.

use tracing::warn;

use crate::control::usage::Report;
use crate::control::Tier;
use crate::error::Error;
use crate::refs::Name;

/// The answer to an entitlement query.
#[derive(Debug)]
pub struct Answer<'a> {
    ok: bool,
    err: Option<Error>,
    report: Option<(&'a Tier, String, Name)>,
}

impl Answer<'_> {
    /// Whether the org may use the feature.
    pub fn ok(&self) -> bool {
        self.ok
    }

    /// The lookup error swallowed by the fail-open policy, if any.
    ///
    /// Strict callers can treat `ok() && err().is_some()` as a denial.
    pub fn err(&self) -> Option<&Error> {
        self.err.as_ref()
    }

    /// Reports one unit of usage.
    pub async fn report(&self) -> Result<(), Error> {
        self.report_n(1).await
    }

    /// Reports `n` units of usage.
    ///
    /// A no-op for answers without an armed reporter (denials and
    /// failed-open lookups).
    pub async fn report_n(&self, n: i64) -> Result<(), Error> {
        match &self.report {
            None => Ok(()),
            Some((tier, org, feature)) => {
                tier.report_usage(
                    org,
                    feature,
                    Report {
                        n,
                        ..Default::default()
                    },
                )
                .await
            }
        }
    }
}

impl Tier {
    /// Answers whether `org` can use `feature`, with deferred reporting.
    ///
    /// A feature absent from the limits projection answers "yes"
    /// optimistically; the deferred report surfaces the real state of the
    /// subscription if the optimism was misplaced.
    pub async fn can<'a>(&'a self, org: &str, feature: &Name) -> Answer<'a> {
        let usage = match self.lookup_limits(org).await {
            Ok(usage) => usage,
            Err(err) => {
                warn!(%org, %feature, "entitlement lookup failed open: {err}");
                return Answer {
                    ok: true,
                    err: Some(err),
                    report: None,
                };
            }
        };
        match usage.iter().find(|u| u.feature_plan.name() == *feature) {
            Some(u) if u.used >= u.limit => Answer {
                ok: false,
                err: None,
                report: None,
            },
            _ => Answer {
                ok: true,
                err: None,
                report: Some((self, org.to_string(), feature.clone())),
            },
        }
    }
}
