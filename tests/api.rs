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

//! Integration tests.
//!
//! Stripe is stood in for by a wiremock server, so these run hermetically
//! and in parallel. Each test mounts exactly the provider responses its flow
//! touches; an unexpected request hits no mock and fails the flow with a
//! provider error.

use std::sync::Arc;

use axum::body::Body;
use axum::http::Request as HttpRequest;
use reqwest::Method;
use serde::Deserialize;
use serde_json::json;
use test_log::test;
use tower::ServiceExt;
use wiremock::matchers::{body_string_contains, header, method, path, query_param};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

use tier_billing::sidecar::{self, ApiError, WhoAmIResponse};
use tier_billing::stripe::PageItem;
use tier_billing::{
    Client, ClientConfig, Error, FeaturePlan, Form, Name, OrgInfo, Tier, INF,
};

/// 2023-01-01T00:00:00Z.
const T0: i64 = 1672531200;
/// 2023-02-01T00:00:00Z.
const T1: i64 = 1675209600;

fn new_client(server: &MockServer) -> Client {
    Client::builder()
        .endpoint(server.uri().parse().unwrap())
        .build(ClientConfig {
            api_key: "sk_test_123".into(),
        })
}

fn new_tier(server: &MockServer) -> Tier {
    Tier::new(new_client(server))
}

fn new_tier_with_clock(server: &MockServer, clock: &str) -> Tier {
    Tier::new(
        Client::builder()
            .endpoint(server.uri().parse().unwrap())
            .clock(clock)
            .build(ClientConfig {
                api_key: "sk_test_123".into(),
            }),
    )
}

fn fp(s: &str) -> FeaturePlan {
    FeaturePlan::parse(s).unwrap()
}

fn feature_name(s: &str) -> Name {
    Name::parse(s).unwrap()
}

/// Price metadata for the metered `feature:t@plan:test@0` with a single
/// unbounded tier.
fn metered_metadata() -> serde_json::Value {
    json!({
        "tier.plan": "plan:test@0",
        "tier.feature": "feature:t",
        "tier.version": "0",
        "tier.title": "Transcode",
        "tier.plan_title": "Test",
        "tier.interval": "@monthly",
        "tier.aggregate": "sum",
        "tier.mode": "graduated",
        "tier.currency": "usd",
        "tier.base": "0",
        "tier.tiers": "[{\"upto\":9223372036854775807,\"price\":100,\"base\":0}]",
    })
}

/// Price metadata for the licensed `feature:x@plan:test@0`.
fn licensed_metadata() -> serde_json::Value {
    json!({
        "tier.plan": "plan:test@0",
        "tier.feature": "feature:x",
        "tier.version": "0",
        "tier.title": "Convert",
        "tier.plan_title": "Test",
        "tier.interval": "@monthly",
        "tier.aggregate": "sum",
        "tier.mode": "graduated",
        "tier.currency": "usd",
        "tier.base": "100",
        "tier.tiers": "[]",
    })
}

fn page(data: serde_json::Value) -> serde_json::Value {
    json!({"object": "list", "data": data, "has_more": false})
}

async fn mount_catalog(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/v1/prices"))
        .respond_with(ResponseTemplate::new(200).set_body_json(page(json!([
            {"id": "price_t", "metadata": metered_metadata()},
            {"id": "price_x", "metadata": licensed_metadata()},
        ]))))
        .mount(server)
        .await;
}

async fn mount_org(server: &MockServer, org: &str, cus: &str) {
    Mock::given(method("GET"))
        .and(path("/v1/customers"))
        .respond_with(ResponseTemplate::new(200).set_body_json(page(json!([
            {"id": cus, "metadata": {"tier.org": org}},
        ]))))
        .mount(server)
        .await;
}

// --- provider client ---

#[test(tokio::test)]
async fn idempotency_key_rides_the_header() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/widgets"))
        .and(header("Idempotency-Key", "foo"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(1)
        .mount(&server)
        .await;

    let client = new_client(&server);
    let mut form = Form::new();
    form.set_idempotency_key("foo");
    client.send(Method::POST, "/v1/widgets", &form).await.unwrap();

    // without a key the header is absent, so the mock must not match
    let err = client
        .send(Method::POST, "/v1/widgets", &Form::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Provider(_)));
}

#[test(tokio::test)]
async fn any_401_collapses_to_invalid_api_key() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/account"))
        .respond_with(ResponseTemplate::new(401).set_body_string("not even json"))
        .mount(&server)
        .await;
    let err = new_tier(&server).whoami().await.unwrap_err();
    assert!(matches!(err, Error::InvalidApiKey));
}

#[test(tokio::test)]
async fn invalid_api_key_message_collapses_too() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/account"))
        .respond_with(ResponseTemplate::new(403).set_body_json(json!({
            "error": {"message": "Invalid API Key provided: sk_test_***"},
        })))
        .mount(&server)
        .await;
    let err = new_tier(&server).whoami().await.unwrap_err();
    assert!(matches!(err, Error::InvalidApiKey));
}

#[test(tokio::test)]
async fn provider_errors_carry_the_envelope() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/account"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({
            "error": {
                "type": "invalid_request_error",
                "code": "resource_missing",
                "message": "No such account",
                "param": "account",
            },
        })))
        .mount(&server)
        .await;
    match new_tier(&server).whoami().await.unwrap_err() {
        Error::Provider(e) => {
            assert_eq!(e.http_status.as_u16(), 404);
            assert_eq!(e.kind, "invalid_request_error");
            assert_eq!(e.code, "resource_missing");
            assert_eq!(e.message, "No such account");
            assert_eq!(e.param, "account");
        }
        other => panic!("expected provider error, got {other:?}"),
    }
}

#[derive(Debug, Deserialize)]
struct Thing {
    id: String,
}

impl PageItem for Thing {
    fn page_cursor(&self) -> &str {
        &self.id
    }
}

#[test(tokio::test)]
async fn pagination_walks_the_cursor() {
    let server = MockServer::start().await;
    let no_cursor = |req: &Request| !req.url.query_pairs().any(|(k, _)| k == "starting_after");
    Mock::given(method("GET"))
        .and(path("/v1/things"))
        .and(query_param("status", "active"))
        .and(query_param("limit", "100"))
        .and(no_cursor)
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [{"id": "th_1"}, {"id": "th_2"}],
            "has_more": true,
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/things"))
        .and(query_param("status", "active"))
        .and(query_param("starting_after", "th_2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [{"id": "th_3"}],
            "has_more": false,
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = new_client(&server);
    let mut form = Form::new();
    form.set("status", "active");
    let things: Vec<Thing> = client.slurp(Method::GET, "/v1/things", &form).await.unwrap();
    let ids: Vec<_> = things.iter().map(|t| t.id.as_str()).collect();
    assert_eq!(ids, ["th_1", "th_2", "th_3"]);
}

// --- catalog ---

#[test(tokio::test)]
async fn push_creates_product_and_price() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/products/tier__x-test-0"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({
            "error": {"type": "invalid_request_error", "code": "resource_missing",
                      "message": "No such product", "param": "id"},
        })))
        .mount(&server)
        .await;
    // the product name law: "<plan title> - <feature title>"
    Mock::given(method("POST"))
        .and(path("/v1/products"))
        .and(body_string_contains("id=tier__x-test-0"))
        .and(body_string_contains("name=Test+-+Convert"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "tier__x-test-0", "metadata": {},
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/prices"))
        .respond_with(ResponseTemplate::new(200).set_body_json(page(json!([]))))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/prices"))
        .and(body_string_contains("product=tier__x-test-0"))
        .and(body_string_contains("unit_amount=100"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "price_9", "metadata": {},
        })))
        .expect(1)
        .mount(&server)
        .await;

    let tier = new_tier(&server);
    let mut f = tier_billing::Feature::new(fp("feature:x@plan:test@0"));
    f.title = "Convert".into();
    f.plan_title = "Test".into();
    f.base = 100;
    let id = tier.push_feature(&f).await.unwrap();
    assert_eq!(id, "price_9");
}

#[test(tokio::test)]
async fn push_conflicts_on_changed_definition() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/products/tier__x-test-0"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "tier__x-test-0",
            "metadata": {"tier.plan": "plan:test@0", "tier.feature": "feature:x",
                         "tier.base": "999"},
        })))
        .mount(&server)
        .await;

    let tier = new_tier(&server);
    let mut f = tier_billing::Feature::new(fp("feature:x@plan:test@0"));
    f.title = "Convert".into();
    f.plan_title = "Test".into();
    let err = tier.push_feature(&f).await.unwrap_err();
    assert!(matches!(err, Error::Conflict(_)));
}

#[test(tokio::test)]
async fn pull_reconstructs_features_and_ignores_unmarked_prices() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/prices"))
        .respond_with(ResponseTemplate::new(200).set_body_json(page(json!([
            {"id": "price_t", "metadata": metered_metadata()},
            {"id": "price_plain", "metadata": {"unrelated": "yes"}},
        ]))))
        .mount(&server)
        .await;

    let features = new_tier(&server).pull().await.unwrap();
    assert_eq!(features.len(), 1);
    let f = &features[0];
    assert_eq!(f.feature_plan, fp("feature:t@plan:test@0"));
    assert_eq!(f.title, "Transcode");
    assert_eq!(f.plan_title, "Test");
    assert!(f.is_metered());
    assert_eq!(f.limit(), INF);
    assert_eq!(f.provider_id, "price_t");
}

// --- schedule ---

#[test(tokio::test)]
async fn subscribe_creates_a_schedule() {
    let server = MockServer::start().await;
    mount_catalog(&server).await;
    mount_org(&server, "org:test", "cus_1").await;
    Mock::given(method("GET"))
        .and(path("/v1/subscription_schedules"))
        .respond_with(ResponseTemplate::new(200).set_body_json(page(json!([]))))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/subscription_schedules"))
        .and(body_string_contains("customer=cus_1"))
        .and(body_string_contains("price_t"))
        .and(body_string_contains("price_x"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "ss_1"})))
        .expect(1)
        .mount(&server)
        .await;

    new_tier(&server)
        .subscribe_to(
            "org:test",
            &[fp("feature:t@plan:test@0"), fp("feature:x@plan:test@0")],
        )
        .await
        .unwrap();
}

#[test(tokio::test)]
async fn subscribe_appends_without_touching_history() {
    let server = MockServer::start().await;
    mount_catalog(&server).await;
    mount_org(&server, "org:test", "cus_1").await;
    Mock::given(method("GET"))
        .and(path("/v1/test_helpers/test_clocks/clk_1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "clk_1", "frozen_time": T1,
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/subscription_schedules"))
        .respond_with(ResponseTemplate::new(200).set_body_json(page(json!([{
            "id": "ss_1",
            "status": "active",
            "subscription": "sub_1",
            "phases": [{
                "start_date": T0,
                "items": [{"price": {"id": "price_x", "metadata": licensed_metadata()},
                           "quantity": 1}],
            }],
        }]))))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/subscription_schedules/ss_1"))
        .and(body_string_contains(format!("phases%5B0%5D%5Bstart_date%5D={T0}")))
        .and(body_string_contains(format!("phases%5B1%5D%5Bstart_date%5D={T1}")))
        .and(body_string_contains("proration_behavior=create_prorations"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "ss_1"})))
        .expect(1)
        .mount(&server)
        .await;

    new_tier_with_clock(&server, "clk_1")
        .subscribe_to("org:test", &[fp("feature:t@plan:test@0")])
        .await
        .unwrap();
}

#[test(tokio::test)]
async fn customer_created_with_org_idempotency_key() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/prices"))
        .respond_with(ResponseTemplate::new(200).set_body_json(page(json!([]))))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/customers"))
        .respond_with(ResponseTemplate::new(200).set_body_json(page(json!([]))))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/customers"))
        .and(header("Idempotency-Key", "org:hello"))
        .and(body_string_contains("metadata%5Btier.org%5D=org%3Ahello"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "cus_7", "metadata": {"tier.org": "org:hello"},
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/customers"))
        .respond_with(ResponseTemplate::new(200).set_body_json(page(json!([
            {"id": "cus_7", "metadata": {"tier.org": "org:hello"}},
        ]))))
        .mount(&server)
        .await;

    new_tier(&server)
        .schedule("org:hello", None, &[])
        .await
        .unwrap();
}

#[test(tokio::test)]
async fn duplicate_customers_resolve_to_smallest_id() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/customers"))
        .respond_with(ResponseTemplate::new(200).set_body_json(page(json!([
            {"id": "cus_b", "metadata": {"tier.org": "org:test"}},
            {"id": "cus_a", "metadata": {"tier.org": "org:test"}},
            {"id": "cus_zz", "metadata": {"tier.org": "org:other"}},
        ]))))
        .mount(&server)
        .await;
    let id = new_tier(&server).whois("org:test").await.unwrap();
    assert_eq!(id, "cus_a");
}

#[test(tokio::test)]
async fn unknown_org_is_not_found() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/customers"))
        .respond_with(ResponseTemplate::new(200).set_body_json(page(json!([]))))
        .mount(&server)
        .await;
    let err = new_tier(&server).whois("org:nope").await.unwrap_err();
    assert!(matches!(err, Error::OrgNotFound));
}

#[test(tokio::test)]
async fn partial_plan_subscription_is_a_fragment() {
    let server = MockServer::start().await;
    mount_catalog(&server).await;
    mount_org(&server, "org:test", "cus_1").await;
    Mock::given(method("GET"))
        .and(path("/v1/subscription_schedules"))
        .respond_with(ResponseTemplate::new(200).set_body_json(page(json!([{
            "id": "ss_1",
            "status": "active",
            "phases": [{
                "start_date": T0,
                "items": [{"price": {"id": "price_t", "metadata": metered_metadata()}}],
            }],
        }]))))
        .mount(&server)
        .await;

    let phases = new_tier(&server).lookup_phases("org:test").await.unwrap();
    assert_eq!(phases.len(), 1);
    let phase = &phases[0];
    assert!(phase.current);
    assert_eq!(phase.features, [fp("feature:t@plan:test@0")]);
    assert_eq!(phase.plans, []);
    assert_eq!(phase.fragments, [fp("feature:t@plan:test@0")]);
}

#[test(tokio::test)]
async fn full_plan_subscription_is_a_plan() {
    let server = MockServer::start().await;
    mount_catalog(&server).await;
    mount_org(&server, "org:test", "cus_1").await;
    Mock::given(method("GET"))
        .and(path("/v1/subscription_schedules"))
        .respond_with(ResponseTemplate::new(200).set_body_json(page(json!([{
            "id": "ss_1",
            "status": "active",
            "phases": [{
                "start_date": T0,
                "items": [
                    {"price": {"id": "price_t", "metadata": metered_metadata()}},
                    {"price": {"id": "price_x", "metadata": licensed_metadata()}, "quantity": 1},
                ],
            }],
        }]))))
        .mount(&server)
        .await;

    let phases = new_tier(&server).lookup_phases("org:test").await.unwrap();
    let phase = &phases[0];
    assert_eq!(
        phase.features,
        [fp("feature:t@plan:test@0"), fp("feature:x@plan:test@0")]
    );
    assert_eq!(phase.plans.len(), 1);
    assert_eq!(phase.plans[0].as_str(), "plan:test@0");
    assert_eq!(phase.fragments, []);
}

#[test(tokio::test)]
async fn clock_decides_the_current_phase() {
    let server = MockServer::start().await;
    mount_catalog(&server).await;
    mount_org(&server, "org:test", "cus_1").await;
    Mock::given(method("GET"))
        .and(path("/v1/test_helpers/test_clocks/clk_1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "clk_1", "frozen_time": T1,
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/subscription_schedules"))
        .respond_with(ResponseTemplate::new(200).set_body_json(page(json!([{
            "id": "ss_1",
            "status": "active",
            "phases": [
                {"start_date": T0, "end_date": T1,
                 "items": [{"price": {"id": "price_x", "metadata": licensed_metadata()},
                            "quantity": 1}]},
                {"start_date": T1,
                 "items": [{"price": {"id": "price_t", "metadata": metered_metadata()}}]},
            ],
        }]))))
        .mount(&server)
        .await;

    let phases = new_tier_with_clock(&server, "clk_1")
        .lookup_phases("org:test")
        .await
        .unwrap();
    assert_eq!(phases.len(), 2);
    assert!(!phases[0].current);
    assert_eq!(phases[0].effective.unix_timestamp(), T0);
    assert_eq!(phases[0].end.map(|t| t.unix_timestamp()), Some(T1));
    assert!(phases[1].current);
    assert_eq!(phases[1].effective.unix_timestamp(), T1);
}

#[test(tokio::test)]
async fn reserved_metadata_is_rejected_before_any_call() {
    let server = MockServer::start().await;
    // no mocks: a provider call would fail differently than InvalidMetadata
    let info = OrgInfo {
        metadata: [
            ("foo".to_string(), String::new()),
            ("tier.baz".to_string(), "qux".to_string()),
        ]
        .into_iter()
        .collect(),
        ..Default::default()
    };
    let err = new_tier(&server)
        .put_customer("org:test", &info)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidMetadata));
}

#[test(tokio::test)]
async fn empty_metadata_value_removes_the_key() {
    let server = MockServer::start().await;
    mount_org(&server, "org:test", "cus_1").await;
    Mock::given(method("POST"))
        .and(path("/v1/customers/cus_1"))
        .and(body_string_contains("metadata%5Bfoo%5D="))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "cus_1"})))
        .expect(1)
        .mount(&server)
        .await;

    let info = OrgInfo {
        metadata: [("foo".to_string(), String::new())].into_iter().collect(),
        ..Default::default()
    };
    new_tier(&server).put_customer("org:test", &info).await.unwrap();
}

#[test(tokio::test)]
async fn empty_info_update_is_a_noop() {
    let server = MockServer::start().await;
    mount_org(&server, "org:test", "cus_1").await;
    // no POST mock mounted: an update request would fail the test
    new_tier(&server)
        .put_customer("org:test", &OrgInfo::default())
        .await
        .unwrap();
}

// --- usage ---

#[test(tokio::test)]
async fn report_usage_posts_a_usage_record() {
    let server = MockServer::start().await;
    mount_org(&server, "org:test", "cus_1").await;
    Mock::given(method("GET"))
        .and(path("/v1/subscriptions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(page(json!([{
            "id": "sub_1",
            "status": "active",
            "items": {"data": [
                {"id": "si_t", "price": {"id": "price_t", "metadata": metered_metadata()}},
                {"id": "si_x", "price": {"id": "price_x", "metadata": licensed_metadata()}},
            ]},
        }]))))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/subscription_items/si_t/usage_records"))
        .and(body_string_contains("quantity=9"))
        .and(body_string_contains("action=increment"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "mbur_1"})))
        .expect(1)
        .mount(&server)
        .await;

    new_tier(&server)
        .report_usage(
            "org:test",
            &feature_name("feature:t"),
            tier_billing::Report {
                n: 9,
                ..Default::default()
            },
        )
        .await
        .unwrap();
}

#[test(tokio::test)]
async fn clobber_reports_use_set() {
    let server = MockServer::start().await;
    mount_org(&server, "org:test", "cus_1").await;
    Mock::given(method("GET"))
        .and(path("/v1/subscriptions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(page(json!([{
            "id": "sub_1",
            "status": "active",
            "items": {"data": [
                {"id": "si_t", "price": {"id": "price_t", "metadata": metered_metadata()}},
            ]},
        }]))))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/subscription_items/si_t/usage_records"))
        .and(body_string_contains("action=set"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "mbur_1"})))
        .expect(1)
        .mount(&server)
        .await;

    new_tier(&server)
        .report_usage(
            "org:test",
            &feature_name("feature:t"),
            tier_billing::Report {
                n: 3,
                clobber: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
}

#[test(tokio::test)]
async fn licensed_features_are_not_reportable() {
    let server = MockServer::start().await;
    mount_org(&server, "org:test", "cus_1").await;
    Mock::given(method("GET"))
        .and(path("/v1/subscriptions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(page(json!([{
            "id": "sub_1",
            "status": "active",
            "items": {"data": [
                {"id": "si_x", "price": {"id": "price_x", "metadata": licensed_metadata()}},
            ]},
        }]))))
        .mount(&server)
        .await;

    let err = new_tier(&server)
        .report_usage(
            "org:test",
            &feature_name("feature:x"),
            tier_billing::Report::default(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::FeatureNotMetered));
}

#[test(tokio::test)]
async fn unsubscribed_features_are_not_found() {
    let server = MockServer::start().await;
    mount_org(&server, "org:test", "cus_1").await;
    Mock::given(method("GET"))
        .and(path("/v1/subscriptions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(page(json!([{
            "id": "sub_1",
            "status": "active",
            "items": {"data": []},
        }]))))
        .mount(&server)
        .await;

    let err = new_tier(&server)
        .report_usage(
            "org:test",
            &feature_name("feature:ghost"),
            tier_billing::Report::default(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::FeatureNotFound));
}

#[test(tokio::test)]
async fn limits_project_the_upcoming_invoice() {
    let server = MockServer::start().await;
    mount_org(&server, "org:test", "cus_1").await;
    Mock::given(method("GET"))
        .and(path("/v1/invoices/upcoming/lines"))
        .and(query_param("customer", "cus_1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(page(json!([
            // proration split: the smaller line must lose
            {"id": "il_1", "quantity": 9, "period": {"start": T0, "end": T1},
             "price": {"id": "price_t", "metadata": metered_metadata()}},
            {"id": "il_2", "quantity": 10, "period": {"start": T0, "end": T1},
             "price": {"id": "price_t", "metadata": metered_metadata()}},
            {"id": "il_3", "quantity": 1, "period": {"start": T0, "end": T1},
             "price": {"id": "price_x", "metadata": licensed_metadata()}},
            {"id": "il_4", "quantity": 5, "period": {"start": T0, "end": T1},
             "price": {"id": "price_plain", "metadata": {}}},
        ]))))
        .mount(&server)
        .await;

    let usage = new_tier(&server).lookup_limits("org:test").await.unwrap();
    assert_eq!(usage.len(), 2);
    assert_eq!(usage[0].feature_plan, fp("feature:t@plan:test@0"));
    assert_eq!(usage[0].used, 10);
    assert_eq!(usage[0].limit, INF);
    assert_eq!(usage[1].feature_plan, fp("feature:x@plan:test@0"));
    assert_eq!(usage[1].used, 1);
    assert_eq!(usage[1].limit, INF);
}

#[test(tokio::test)]
async fn missing_upcoming_invoice_means_no_usage() {
    let server = MockServer::start().await;
    mount_org(&server, "org:test", "cus_1").await;
    Mock::given(method("GET"))
        .and(path("/v1/invoices/upcoming/lines"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({
            "error": {"type": "invalid_request_error", "code": "invoice_upcoming_none",
                      "message": "No upcoming invoices for customer"},
        })))
        .mount(&server)
        .await;

    let usage = new_tier(&server).lookup_limits("org:test").await.unwrap();
    assert!(usage.is_empty());
}

// --- entitlement ---

#[test(tokio::test)]
async fn entitlement_fails_open_on_lookup_errors() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/customers"))
        .respond_with(ResponseTemplate::new(500).set_body_json(json!({
            "error": {"type": "api_error", "message": "boom"},
        })))
        .mount(&server)
        .await;

    let tier = new_tier(&server);
    let answer = tier.can("org:test", &feature_name("feature:t")).await;
    assert!(answer.ok());
    assert!(answer.err().is_some());
    // the reporter is disarmed, so this must not touch the provider
    answer.report().await.unwrap();
}

#[test(tokio::test)]
async fn entitlement_denies_at_the_limit() {
    let server = MockServer::start().await;
    mount_org(&server, "org:test", "cus_1").await;
    let capped = json!({
        "tier.plan": "plan:test@0",
        "tier.feature": "feature:t",
        "tier.version": "0",
        "tier.tiers": "[{\"upto\":10,\"price\":100,\"base\":0}]",
    });
    Mock::given(method("GET"))
        .and(path("/v1/invoices/upcoming/lines"))
        .respond_with(ResponseTemplate::new(200).set_body_json(page(json!([
            {"id": "il_1", "quantity": 10, "period": {"start": T0, "end": T1},
             "price": {"id": "price_t", "metadata": capped}},
        ]))))
        .mount(&server)
        .await;

    let tier = new_tier(&server);
    let answer = tier.can("org:test", &feature_name("feature:t")).await;
    assert!(!answer.ok());
    assert!(answer.err().is_none());
}

// --- sidecar ---

async fn sidecar_get(server: &MockServer, uri: &str) -> (u16, serde_json::Value) {
    let app = sidecar::router(Arc::new(new_tier(server)));
    let res = app
        .oneshot(
            HttpRequest::builder()
                .uri(uri)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let status = res.status().as_u16();
    let body = hyper::body::to_bytes(res.into_body()).await.unwrap();
    (status, serde_json::from_slice(&body).unwrap())
}

#[test(tokio::test)]
async fn phase_without_org_is_not_found() {
    let server = MockServer::start().await;
    let (status, body) = sidecar_get(&server, "/v1/phase").await;
    assert_eq!(status, 404);
    let err: ApiError = serde_json::from_value(body).unwrap();
    assert_eq!(err.code, "not_found");
}

#[test(tokio::test)]
async fn unprefixed_org_is_invalid() {
    let server = MockServer::start().await;
    for uri in ["/v1/phase?org=test", "/v1/limits?org=test", "/v1/whois?org=test"] {
        let (status, body) = sidecar_get(&server, uri).await;
        assert_eq!(status, 400, "{uri}");
        let err: ApiError = serde_json::from_value(body).unwrap();
        assert_eq!(err.code, "invalid_request");
        assert_eq!(err.message, "org must be prefixed with \"org:\"");
    }
}

#[test(tokio::test)]
async fn whois_for_unknown_org_maps_to_org_not_found() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/customers"))
        .respond_with(ResponseTemplate::new(200).set_body_json(page(json!([]))))
        .mount(&server)
        .await;
    let (status, body) = sidecar_get(&server, "/v1/whois?org=org:nope").await;
    assert_eq!(status, 400);
    let err: ApiError = serde_json::from_value(body).unwrap();
    assert_eq!(err.code, "org_not_found");
    assert_eq!(err.message, "org not found");
}

#[test(tokio::test)]
async fn whoami_describes_the_account_and_key() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/account"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "acct_1", "email": "dev@example.com",
        })))
        .mount(&server)
        .await;
    let (status, body) = sidecar_get(&server, "/v1/whoami").await;
    assert_eq!(status, 200);
    let who: WhoAmIResponse = serde_json::from_value(body).unwrap();
    assert_eq!(who.provider_id, "acct_1");
    assert_eq!(who.email.as_deref(), Some("dev@example.com"));
    assert_eq!(who.key_prefix, "sk_test");
    assert!(!who.is_live);
}

#[test(tokio::test)]
async fn report_endpoint_maps_not_metered() {
    let server = MockServer::start().await;
    mount_org(&server, "org:test", "cus_1").await;
    Mock::given(method("GET"))
        .and(path("/v1/subscriptions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(page(json!([{
            "id": "sub_1",
            "status": "active",
            "items": {"data": [
                {"id": "si_x", "price": {"id": "price_x", "metadata": licensed_metadata()}},
            ]},
        }]))))
        .mount(&server)
        .await;

    let app = sidecar::router(Arc::new(new_tier(&server)));
    let res = app
        .oneshot(
            HttpRequest::builder()
                .method("POST")
                .uri("/v1/report")
                .header("content-type", "application/json")
                .body(Body::from(
                    json!({"org": "org:test", "feature": "feature:x", "n": 1}).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status().as_u16(), 400);
    let body = hyper::body::to_bytes(res.into_body()).await.unwrap();
    let err: ApiError = serde_json::from_slice(&body).unwrap();
    assert_eq!(err.code, "feature_not_metered");
    assert_eq!(err.message, "feature not reportable");
}

#[test(tokio::test)]
async fn phase_endpoint_reports_fragments() {
    let server = MockServer::start().await;
    mount_catalog(&server).await;
    mount_org(&server, "org:test", "cus_1").await;
    Mock::given(method("GET"))
        .and(path("/v1/subscription_schedules"))
        .respond_with(ResponseTemplate::new(200).set_body_json(page(json!([{
            "id": "ss_1",
            "status": "active",
            "phases": [{
                "start_date": T0,
                "items": [{"price": {"id": "price_t", "metadata": metered_metadata()}}],
            }],
        }]))))
        .mount(&server)
        .await;

    let (status, body) = sidecar_get(&server, "/v1/phase?org=org:test").await;
    assert_eq!(status, 200);
    assert_eq!(body["features"], json!(["feature:t@plan:test@0"]));
    assert_eq!(body["plans"], json!([]));
    assert_eq!(body["fragments"], json!(["feature:t@plan:test@0"]));
}
