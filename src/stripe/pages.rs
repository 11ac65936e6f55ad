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

use async_stream::try_stream;
use futures_core::Stream;
use futures_util::TryStreamExt;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::Error;
use crate::stripe::{Client, Form};

/// The maximum (and default) page size for list requests.
pub const MAX_PAGE_SIZE: u64 = 100;

/// An item of a paginated list response.
///
/// Stripe paginates on object ids: the next page is requested with
/// `starting_after` set to the id of the last item of the previous page.
pub trait PageItem: DeserializeOwned {
    /// The id to resume pagination after this item.
    fn page_cursor(&self) -> &str;
}

#[derive(Deserialize)]
struct Page<T> {
    data: Vec<T>,
    #[serde(default)]
    has_more: bool,
}

impl Client {
    /// Lazily walks a cursor-paginated list endpoint.
    ///
    /// Pages are fetched as the stream is consumed, preserving provider
    /// order. Caller-supplied form values are carried across every page; a
    /// `limit` of [`MAX_PAGE_SIZE`] is used unless the caller set one.
    pub fn stream_list<'a, T>(
        &'a self,
        method: Method,
        path: &'a str,
        form: &Form,
    ) -> impl Stream<Item = Result<T, Error>> + 'a
    where
        T: PageItem + 'a,
    {
        let mut form = form.clone();
        if !form.contains("limit") {
            form.set("limit", MAX_PAGE_SIZE);
        }
        try_stream! {
            let mut cursor: Option<String> = None;
            loop {
                let mut page_form = form.clone();
                if let Some(cursor) = &cursor {
                    page_form.set("starting_after", cursor.as_str());
                }
                let page: Page<T> = self.do_req(method.clone(), path, &page_form).await?;
                let mut last = None;
                for item in page.data {
                    last = Some(item.page_cursor().to_string());
                    yield item;
                }
                match (page.has_more, last) {
                    (true, Some(id)) => cursor = Some(id),
                    _ => break,
                }
            }
        }
    }

    /// Collects an entire paginated list.
    pub async fn slurp<T>(&self, method: Method, path: &str, form: &Form) -> Result<Vec<T>, Error>
    where
        T: PageItem,
    {
        self.stream_list(method, path, form).try_collect().await
    }
}
