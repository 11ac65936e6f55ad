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

use time::OffsetDateTime;

/// An ordered multimap of request parameters.
///
/// Stripe's form shape is naturally dynamic (`a[b][c]=`, `expand[]=`), so a
/// form is a flat ordered list of `(key, value)` pairs rather than a nested
/// tree. Slices are spelled with an explicit `[]` suffix on the key and
/// nested maps with explicit `parent[child]` keys. Encoding is a single pass
/// over the pairs.
///
/// A form optionally carries an idempotency key, which travels as an HTTP
/// header rather than a form field.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Form {
    values: Vec<(String, String)>,
    idempotency_key: Option<String>,
}

/// A value encodable into a form field.
///
/// Integers encode in decimal, booleans as `true`/`false`, and times as Unix
/// seconds.
pub trait FormValue {
    fn encode(&self) -> String;
}

impl FormValue for &str {
    fn encode(&self) -> String {
        (*self).into()
    }
}

impl FormValue for String {
    fn encode(&self) -> String {
        self.clone()
    }
}

impl FormValue for i64 {
    fn encode(&self) -> String {
        self.to_string()
    }
}

impl FormValue for u64 {
    fn encode(&self) -> String {
        self.to_string()
    }
}

impl FormValue for bool {
    fn encode(&self) -> String {
        if *self { "true" } else { "false" }.into()
    }
}

impl FormValue for OffsetDateTime {
    fn encode(&self) -> String {
        self.unix_timestamp().to_string()
    }
}

impl Form {
    /// Creates an empty form.
    pub fn new() -> Form {
        Form::default()
    }

    /// Appends a `(key, value)` pair.
    ///
    /// Keys repeat freely; pairs are encoded in insertion order.
    pub fn set(&mut self, key: impl Into<String>, value: impl FormValue) {
        self.values.push((key.into(), value.encode()));
    }

    /// Reports whether any pair with `key` is present.
    pub fn contains(&self, key: &str) -> bool {
        self.values.iter().any(|(k, _)| k == key)
    }

    /// Reports whether the form has no pairs.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Sets the idempotency key carried in the `Idempotency-Key` header.
    pub fn set_idempotency_key(&mut self, key: impl Into<String>) {
        self.idempotency_key = Some(key.into());
    }

    /// The idempotency key, if set.
    pub fn idempotency_key(&self) -> Option<&str> {
        self.idempotency_key.as_deref()
    }

    /// The ordered pairs, for encoding.
    pub fn pairs(&self) -> &[(String, String)] {
        &self.values
    }
}
