//! Mock extraction backend for testing.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use super::{BackendError, BackendFuture, BackendKind, ExtractedValues, ExtractionBackend, InferredSchema};
use crate::models::{FieldValue, RenderedPage, SchemaSpec};
use crate::pricing::PricingCall;

/// One recorded `extract_values` invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockCall {
    pub pages: Vec<u32>,
    pub keys: Vec<String>,
}

type Responder = dyn Fn(&MockCall) -> Vec<FieldValue> + Send + Sync;
type DelayFn = dyn Fn(usize) -> Duration + Send + Sync;

/// A hand-rolled mock implementing [`ExtractionBackend`] for tests.
///
/// Supports:
/// - A responder closure deciding the values of each call, or a fixed table.
/// - A fixed schema returned by inference.
/// - Per-call pricing and per-call latency (indexed by issuance order).
/// - Call recording and an in-flight high-water mark.
pub struct MockBackend {
    kind: BackendKind,
    responder: Box<Responder>,
    schema: Option<SchemaSpec>,
    pricing: Option<PricingCall>,
    failure: Option<String>,
    delay: Option<Box<DelayFn>>,
    calls: Mutex<Vec<MockCall>>,
    infer_calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockBackend {
    /// Create a mock whose values are computed by `responder`.
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&MockCall) -> Vec<FieldValue> + Send + Sync + 'static,
    {
        Self {
            kind: BackendKind::Multimodal,
            responder: Box::new(responder),
            schema: None,
            pricing: None,
            failure: None,
            delay: None,
            calls: Mutex::new(Vec::new()),
            infer_calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Create a mock answering from a fixed table.
    ///
    /// A row is returned when its key was requested and its page is unset or part of
    /// the call's pages. Rows without a page are tagged with the call's first page.
    pub fn with_table(rows: Vec<FieldValue>) -> Self {
        Self::new(move |call| {
            rows.iter()
                .filter(|row| call.keys.contains(&row.key))
                .filter(|row| row.page.is_none_or(|p| call.pages.contains(&p)))
                .map(|row| FieldValue {
                    page: row.page.or_else(|| call.pages.first().copied()),
                    ..row.clone()
                })
                .collect()
        })
    }

    pub fn with_kind(mut self, kind: BackendKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_schema(mut self, schema: SchemaSpec) -> Self {
        self.schema = Some(schema);
        self
    }

    /// Attach the same pricing record to every call.
    pub fn with_pricing(mut self, pricing: PricingCall) -> Self {
        self.pricing = Some(pricing);
        self
    }

    /// Make every extraction call fail.
    pub fn with_failure(mut self, message: impl Into<String>) -> Self {
        self.failure = Some(message.into());
        self
    }

    /// Simulate latency; the closure receives the call's issuance index.
    pub fn with_delay<F>(mut self, delay: F) -> Self
    where
        F: Fn(usize) -> Duration + Send + Sync + 'static,
    {
        self.delay = Some(Box::new(delay));
        self
    }

    /// Recorded extraction calls, in issuance order.
    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn infer_count(&self) -> usize {
        self.infer_calls.load(Ordering::SeqCst)
    }

    /// Highest number of extraction calls observed running at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

impl ExtractionBackend for MockBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn infer_schema<'a>(&'a self, pages: &'a [RenderedPage]) -> BackendFuture<'a, InferredSchema> {
        self.infer_calls.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move {
            if pages.is_empty() {
                return Err(BackendError::EmptyPages("mock schema inference"));
            }
            let schema = self
                .schema
                .clone()
                .ok_or_else(|| BackendError::Config("mock has no schema".into()))?;
            Ok((schema, self.pricing.clone()))
        })
    }

    fn extract_values<'a>(
        &'a self,
        pages: &'a [RenderedPage],
        keys: &'a [String],
        _extra_instructions: Option<&'a str>,
    ) -> BackendFuture<'a, ExtractedValues> {
        let call = MockCall {
            pages: pages.iter().map(|p| p.page_number).collect(),
            keys: keys.to_vec(),
        };
        let index = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(call.clone());
            calls.len() - 1
        };

        Box::pin(async move {
            if pages.is_empty() {
                return Err(BackendError::EmptyPages("mock value extraction"));
            }
            let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(running, Ordering::SeqCst);

            if let Some(delay) = &self.delay {
                tokio::time::sleep(delay(index)).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if let Some(message) = &self.failure {
                return Err(BackendError::Status {
                    status: 500,
                    body: message.clone(),
                });
            }
            Ok(((self.responder)(&call), self.pricing.clone()))
        })
    }
}
