// Copyright 2024 The Tempstash Authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tempstash_error::Error;
use tokio::task::JoinHandle;

/// Spawns a task wrapped in a [`JoinHandleDropGuard`], instrumented with a
/// named tracing span.
#[macro_export]
macro_rules! spawn {
    ($name:expr, $fut:expr $(,)?) => {{
        use tracing::Instrument;
        $crate::task::JoinHandleDropGuard::new(tokio::spawn(
            $fut.instrument(tracing::info_span!($name)),
        ))
    }};
}

/// Wrapper around a [`JoinHandle`] that aborts the task when dropped, so
/// background work never outlives its owner.
pub struct JoinHandleDropGuard<T> {
    inner: JoinHandle<T>,
}

impl<T> JoinHandleDropGuard<T> {
    pub fn new(inner: JoinHandle<T>) -> Self {
        JoinHandleDropGuard { inner }
    }
}

impl<T> Future for JoinHandleDropGuard<T> {
    type Output = Result<T, Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.inner)
            .poll(cx)
            .map(|res| res.map_err(Error::from))
    }
}

impl<T> Drop for JoinHandleDropGuard<T> {
    fn drop(&mut self) {
        self.inner.abort();
    }
}
