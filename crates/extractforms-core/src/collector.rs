//! Issues backend extraction calls for a schema and gathers the raw observations.
//!
//! Calls run concurrently under one semaphore per collection. Results are gathered
//! in issuance order, so reconciliation ties resolve the same way regardless of
//! which call finishes first.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures_util::future::{try_join, try_join_all};
use tokio::sync::Semaphore;

use crate::CoreError;
use crate::backend::{ExtractedValues, ExtractionBackend};
use crate::models::{FieldValue, RenderedPage, SchemaSpec};
use crate::pricing::PricingCall;
use crate::reconcile::reconcile_by_key;
use crate::routing::{PageMap, PageRouting, route_schema_fields};

/// Literal placeholder some models return even when told to use another sentinel.
const LITERAL_NULL: &str = "NULL";

/// Settings for one collection, taken from the resolved extraction config.
#[derive(Debug, Clone)]
pub struct CollectOptions<'a> {
    pub chunk_pages: usize,
    pub concurrency: usize,
    pub null_sentinel: &'a str,
    pub extra_instructions: Option<&'a str>,
    /// Route page-anchored keys to single-page calls.
    pub use_page_groups: bool,
    pub page_map: Option<&'a PageMap>,
}

/// Everything the backend reported during one collection.
#[derive(Debug, Clone, Default)]
pub struct CollectedValues {
    pub values: Vec<FieldValue>,
    pub pricing_calls: Vec<PricingCall>,
    pub model_calls: usize,
}

#[derive(Default)]
struct Batch {
    values: Vec<FieldValue>,
    pricing_calls: Vec<PricingCall>,
}

impl Batch {
    fn absorb(&mut self, (values, pricing): ExtractedValues) {
        self.values.extend(values);
        self.pricing_calls.extend(pricing);
    }

    fn extend(&mut self, other: Batch) {
        self.values.extend(other.values);
        self.pricing_calls.extend(other.pricing_calls);
    }
}

struct Collector<'a> {
    backend: &'a dyn ExtractionBackend,
    pages: &'a [RenderedPage],
    options: &'a CollectOptions<'a>,
    semaphore: Semaphore,
    calls: AtomicUsize,
}

/// Collect values for every field of `schema` from `pages`.
///
/// Any failing backend call aborts the whole collection.
pub async fn collect_values(
    schema: &SchemaSpec,
    pages: &[RenderedPage],
    backend: &dyn ExtractionBackend,
    options: &CollectOptions<'_>,
) -> Result<CollectedValues, CoreError> {
    let collector = Collector {
        backend,
        pages,
        options,
        semaphore: Semaphore::new(options.concurrency.max(1)),
        calls: AtomicUsize::new(0),
    };

    let routing = route_schema_fields(schema, options.page_map);
    let batch = if options.use_page_groups && routing.has_page_keys() {
        collector.collect_routed(&routing).await?
    } else {
        let keys = schema_keys(schema);
        collector.collect_chunked(&keys).await?
    };

    Ok(CollectedValues {
        values: batch.values,
        pricing_calls: batch.pricing_calls,
        model_calls: collector.calls.load(Ordering::SeqCst),
    })
}

impl Collector<'_> {
    async fn call(&self, pages: &[RenderedPage], keys: &[String]) -> Result<ExtractedValues, CoreError> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|e| CoreError::AsyncExecution(e.to_string()))?;
        self.calls.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(
            pages = ?pages.iter().map(|p| p.page_number).collect::<Vec<_>>(),
            keys = keys.len(),
            "requesting field values"
        );
        let result = self
            .backend
            .extract_values(pages, keys, self.options.extra_instructions)
            .await?;
        Ok(result)
    }

    /// Request `keys` across every page, `chunk_pages` pages per call, reconciled per key.
    async fn collect_chunked(&self, keys: &[String]) -> Result<Batch, CoreError> {
        if keys.is_empty() {
            return Ok(Batch::default());
        }
        let chunk = self.options.chunk_pages.max(1);
        let chunks: Vec<&[RenderedPage]> = if chunk >= self.pages.len() {
            vec![self.pages]
        } else {
            self.pages.chunks(chunk).collect()
        };

        let results = try_join_all(chunks.into_iter().map(|pages| self.call(pages, keys))).await?;
        let mut batch = Batch::default();
        for result in results {
            batch.absorb(result);
        }
        batch.values = reconcile_by_key(batch.values).into_values().collect();
        Ok(batch)
    }

    /// One call per routed page, plus a chunked pass for keys without any page.
    async fn collect_pages(&self, routing: &PageRouting) -> Result<Batch, CoreError> {
        let calls = routing
            .keys_by_page
            .iter()
            .filter(|(_, keys)| !keys.is_empty())
            .map(|(&page_number, keys)| async move {
                match self.pages.iter().position(|p| p.page_number == page_number) {
                    Some(index) => self.call(&self.pages[index..=index], keys).await,
                    None => {
                        tracing::debug!(page = page_number, "routed page was not rendered");
                        Ok((Vec::new(), None))
                    }
                }
            });

        let mut batch = Batch::default();
        for result in try_join_all(calls).await? {
            batch.absorb(result);
        }
        Ok(batch)
    }

    async fn collect_routed(&self, routing: &PageRouting) -> Result<Batch, CoreError> {
        let (mut batch, unresolved) = try_join(
            self.collect_pages(routing),
            self.collect_chunked(&routing.unresolved_keys),
        )
        .await?;
        batch.extend(unresolved);

        let missing: Vec<String> = routing
            .routed_keys()
            .filter(|key| !self.has_usable_value(&batch.values, key))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .map(str::to_string)
            .collect();
        if missing.is_empty() {
            return Ok(batch);
        }

        tracing::debug!(keys = ?missing, "retrying page-routed keys across all pages");
        let fallback = self.collect_chunked(&missing).await?;
        self.merge_fallback(&mut batch, fallback);
        Ok(batch)
    }

    /// Fallback answers replace the placeholders of their key. Unusable answers are
    /// only kept for keys that have no observation yet.
    fn merge_fallback(&self, batch: &mut Batch, fallback: Batch) {
        for value in fallback.values {
            if self.is_usable(&value) {
                batch.values.retain(|v| v.key != value.key);
                batch.values.push(value);
            } else if !batch.values.iter().any(|v| v.key == value.key) {
                batch.values.push(value);
            }
        }
        batch.pricing_calls.extend(fallback.pricing_calls);
    }

    fn is_usable(&self, value: &FieldValue) -> bool {
        value
            .trimmed_value()
            .is_some_and(|v| v != self.options.null_sentinel && v != LITERAL_NULL)
    }

    fn has_usable_value(&self, values: &[FieldValue], key: &str) -> bool {
        values.iter().any(|v| v.key == key && self.is_usable(v))
    }
}

/// Schema keys in field order, without duplicates.
fn schema_keys(schema: &SchemaSpec) -> Vec<String> {
    let mut keys: Vec<String> = Vec::with_capacity(schema.fields.len());
    for field in &schema.fields {
        if !keys.contains(&field.key) {
            keys.push(field.key.clone());
        }
    }
    keys
}
