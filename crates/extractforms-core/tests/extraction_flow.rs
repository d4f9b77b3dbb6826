//! End-to-end extraction runs against a fake page source and the mock backend.
//!
//! No PDF is rasterized and no HTTP request is made: pages are synthesized from
//! their numbers and every model answer comes from [`MockBackend`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use extractforms_core::backend::BackendError;
use extractforms_core::backend::mock::{MockBackend, MockCall};
use extractforms_core::pages::selected_page_numbers;
use extractforms_core::schema_store::fingerprint_pdf;
use extractforms_core::{
    ConfidenceLevel, CoreError, ExtractRequest, Extractor, FieldSemanticType, FieldValue,
    PageSelectionAnalysis, PageSelectionRequest, PageSource, PassMode, PricingCall, RenderOptions,
    RenderedPage, SchemaField, SchemaSpec, SchemaStore, Settings,
};
use tempfile::TempDir;

/// Page source that synthesizes `total` pages and reports `nonblank` as inked.
struct FakePages {
    total: u32,
    nonblank: Option<Vec<u32>>,
}

impl FakePages {
    fn new(total: u32) -> Self {
        Self {
            total,
            nonblank: None,
        }
    }

    fn with_nonblank(mut self, pages: &[u32]) -> Self {
        self.nonblank = Some(pages.to_vec());
        self
    }
}

impl PageSource for FakePages {
    fn render(&self, _path: &Path, options: &RenderOptions) -> Result<Vec<RenderedPage>, BackendError> {
        let numbers = selected_page_numbers(
            self.total,
            options.page_start,
            options.page_end,
            options.max_pages,
        );
        Ok(numbers
            .into_iter()
            .map(|n| RenderedPage {
                page_number: n,
                mime_type: options.image_format.mime_type().to_string(),
                data_base64: format!("page-{n}"),
            })
            .collect())
    }

    fn analyze_selection(
        &self,
        request: &PageSelectionRequest,
    ) -> Result<PageSelectionAnalysis, BackendError> {
        let nonblank = self
            .nonblank
            .clone()
            .ok_or_else(|| BackendError::RenderError("analysis unavailable".into()))?;
        Ok(PageSelectionAnalysis {
            selected_page_numbers: selected_page_numbers(
                self.total,
                request.page_start,
                request.page_end,
                request.max_pages,
            ),
            nonblank_page_numbers: nonblank,
        })
    }
}

struct Fixture {
    dir: TempDir,
    pdf: PathBuf,
    settings: Settings,
}

impl Fixture {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let pdf = dir.path().join("tax_form.pdf");
        std::fs::write(&pdf, b"%PDF-1.7 fake document body").unwrap();
        let settings = Settings {
            schema_cache_dir: dir.path().join("schemas"),
            drop_blank_pages: false,
            ..Settings::default()
        };
        Self { dir, pdf, settings }
    }

    fn extractor(&self, pages: FakePages, backend: Arc<MockBackend>) -> Extractor {
        Extractor::new(self.settings.clone(), Arc::new(pages)).with_backend(backend)
    }

    fn request(&self, mode: PassMode) -> ExtractRequest {
        ExtractRequest {
            mode,
            ..ExtractRequest::new(&self.pdf)
        }
    }

    fn write_schema(&self, schema: &SchemaSpec) -> PathBuf {
        let path = self.dir.path().join(format!("{}.schema.json", schema.id));
        std::fs::write(&path, serde_json::to_string(schema).unwrap()).unwrap();
        path
    }
}

fn schema(fields: Vec<SchemaField>) -> SchemaSpec {
    SchemaSpec {
        id: "schema-1".into(),
        name: "Tax form".into(),
        fingerprint: "fp".into(),
        version: 1,
        schema_family_id: None,
        fields,
    }
}

fn value(key: &str, v: &str, page: Option<u32>) -> FieldValue {
    FieldValue::new(key, Some(v), page, ConfidenceLevel::High)
}

fn call(pages: &[u32], keys: &[&str]) -> MockCall {
    MockCall {
        pages: pages.to_vec(),
        keys: keys.iter().map(|k| k.to_string()).collect(),
    }
}

fn pricing(input: u64, output: u64) -> PricingCall {
    PricingCall {
        input_tokens: Some(input),
        output_tokens: Some(output),
        total_cost_usd: Some(0.5),
        ..PricingCall::new("openai-compatible", "gpt-4o-mini")
    }
}

#[tokio::test]
async fn missing_key_becomes_sentinel() {
    let fx = Fixture::new();
    let schema_path = fx.write_schema(&schema(vec![
        SchemaField::new("a", "A", Some(1)),
        SchemaField::new("b", "B", Some(1)),
    ]));
    let backend = Arc::new(MockBackend::with_table(vec![value("a", "x", Some(1))]));
    let extractor = fx.extractor(FakePages::new(1), backend.clone());

    let request = ExtractRequest {
        schema_path: Some(schema_path),
        ..fx.request(PassMode::TwoPass)
    };
    let result = extractor.run_extract(&request).await.unwrap();

    assert_eq!(result.flat["a"], "x");
    assert_eq!(result.flat["b"], "NULL");
    assert_eq!(result.fields[1].confidence, ConfidenceLevel::Unknown);
    assert_eq!(result.fields[1].page, Some(1));
    assert_eq!(result.metadata["cache_hit"], false);
    assert_eq!(backend.infer_count(), 0);
    // Page call, then the all-pages retry for `b`.
    assert_eq!(backend.calls(), vec![call(&[1], &["a", "b"]), call(&[1], &["b"])]);
}

#[tokio::test]
async fn typed_values_are_normalized() {
    let fx = Fixture::new();
    let schema_path = fx.write_schema(&schema(vec![
        SchemaField::new("phone", "Phone", None).with_semantic_type(FieldSemanticType::Phone),
        SchemaField::new("amount", "Amount", None).with_semantic_type(FieldSemanticType::Amount),
        SchemaField::new("amount_missing", "Other amount", None)
            .with_semantic_type(FieldSemanticType::Amount),
    ]));
    let backend = Arc::new(MockBackend::with_table(vec![
        value("phone", "06 12 34 56 78", None),
        value("amount", "1 234,50", None),
    ]));
    let extractor = fx.extractor(FakePages::new(1), backend.clone());

    let request = ExtractRequest {
        schema_path: Some(schema_path),
        ..fx.request(PassMode::TwoPass)
    };
    let result = extractor.run_extract(&request).await.unwrap();

    assert_eq!(result.flat["phone"], "0612345678");
    assert_eq!(result.flat["amount"], "1234.5");
    assert_eq!(result.flat["amount_missing"], "NULL");
    assert_eq!(result.schema_fields_count, 3);
    assert_eq!(backend.call_count(), 1);
}

#[tokio::test]
async fn blank_pages_shift_routing_to_physical_pages() {
    let mut fx = Fixture::new();
    fx.settings.drop_blank_pages = true;
    let schema_path = fx.write_schema(&schema(vec![
        SchemaField::new("a", "A", Some(1)),
        SchemaField::new("sparse_x", "Sparse", None),
        SchemaField::new("b", "B", Some(2)),
    ]));
    let backend = Arc::new(MockBackend::with_table(vec![
        value("a", "alpha", Some(1)),
        value("sparse_x", "sparse", Some(1)),
        value("b", "beta", Some(3)),
    ]));
    let extractor = fx.extractor(FakePages::new(4).with_nonblank(&[1, 3]), backend.clone());

    let request = ExtractRequest {
        schema_path: Some(schema_path),
        chunk_pages: 2,
        ..fx.request(PassMode::TwoPass)
    };
    let result = extractor.run_extract(&request).await.unwrap();

    assert_eq!(
        backend.calls(),
        vec![call(&[1], &["a", "sparse_x"]), call(&[3], &["b"])]
    );
    assert_eq!(result.flat["b"], "beta");
    assert_eq!(result.fields[2].page, Some(3));
    assert_eq!(result.metadata["pages_processed"], 2);
    assert_eq!(result.metadata["model_calls"], 2);
}

#[tokio::test]
async fn failed_blank_analysis_keeps_every_page() {
    let mut fx = Fixture::new();
    fx.settings.drop_blank_pages = true;
    let schema_path = fx.write_schema(&schema(vec![SchemaField::new("a", "A", None)]));
    let backend = Arc::new(MockBackend::with_table(vec![value("a", "x", None)]));
    let extractor = fx.extractor(FakePages::new(3), backend.clone());

    let request = ExtractRequest {
        schema_path: Some(schema_path),
        ..fx.request(PassMode::TwoPass)
    };
    let result = extractor.run_extract(&request).await.unwrap();

    assert_eq!(result.metadata["pages_processed"], 3);
    assert_eq!(backend.call_count(), 3);
}

#[tokio::test]
async fn fallback_value_replaces_page_placeholder() {
    let fx = Fixture::new();
    let schema_path = fx.write_schema(&schema(vec![SchemaField::new("a", "A", Some(1))]));
    let backend = Arc::new(MockBackend::new(|call: &MockCall| {
        if call.pages.len() > 1 {
            vec![FieldValue::new("a", Some("found"), Some(2), ConfidenceLevel::Low)]
        } else {
            vec![FieldValue::new("a", Some("NULL"), Some(1), ConfidenceLevel::High)]
        }
    }));
    let extractor = fx.extractor(FakePages::new(2), backend.clone());

    let request = ExtractRequest {
        schema_path: Some(schema_path),
        chunk_pages: 2,
        ..fx.request(PassMode::TwoPass)
    };
    let result = extractor.run_extract(&request).await.unwrap();

    assert_eq!(result.flat["a"], "found");
    assert_eq!(result.fields[0].page, Some(2));
    assert_eq!(result.fields[0].confidence, ConfidenceLevel::Low);
    assert_eq!(backend.calls(), vec![call(&[1], &["a"]), call(&[1, 2], &["a"])]);
}

#[tokio::test]
async fn two_pass_caches_inferred_schema() {
    let fx = Fixture::new();
    let inferred = SchemaSpec {
        name: String::new(),
        ..schema(vec![SchemaField::new("a", "A", Some(1))])
    };
    let backend = Arc::new(
        MockBackend::with_table(vec![value("a", "x", Some(1))]).with_schema(inferred),
    );
    let extractor = fx.extractor(FakePages::new(1), backend.clone());
    let request = fx.request(PassMode::TwoPass);

    let first = extractor.run_extract(&request).await.unwrap();
    assert_eq!(first.metadata["cache_hit"], false);
    assert_eq!(first.metadata["mode"], "two_pass");
    assert_eq!(first.schema_name, "tax_form");
    assert_ne!(first.schema_id, "schema-1");
    assert_eq!(first.metadata["schema_family_id"], first.schema_id.as_str());
    // One inference call plus one value call.
    assert_eq!(first.metadata["model_calls"], 2);

    let store = SchemaStore::open(&fx.settings.schema_cache_dir).unwrap();
    assert_eq!(store.list_schemas().unwrap().len(), 1);
    let stored = store.find_by_id(&first.schema_id).unwrap().unwrap();
    assert_eq!(stored.fingerprint, fingerprint_pdf(&fx.pdf).unwrap());

    let second = extractor.run_extract(&request).await.unwrap();
    assert_eq!(second.metadata["cache_hit"], true);
    assert_eq!(second.schema_id, first.schema_id);
    assert_eq!(second.metadata["model_calls"], 1);
    assert_eq!(backend.infer_count(), 1);
}

#[tokio::test]
async fn two_pass_without_cache_infers_every_time() {
    let fx = Fixture::new();
    let backend = Arc::new(
        MockBackend::with_table(vec![value("a", "x", Some(1))])
            .with_schema(schema(vec![SchemaField::new("a", "A", Some(1))])),
    );
    let extractor = fx.extractor(FakePages::new(1), backend.clone());
    let request = ExtractRequest {
        use_cache: false,
        ..fx.request(PassMode::TwoPass)
    };

    extractor.run_extract(&request).await.unwrap();
    let result = extractor.run_extract(&request).await.unwrap();

    assert_eq!(result.metadata["cache_hit"], false);
    assert_eq!(result.schema_name, "Tax form");
    assert_eq!(backend.infer_count(), 2);
    let store = SchemaStore::open(&fx.settings.schema_cache_dir).unwrap();
    assert!(store.list_schemas().unwrap().is_empty());
}

#[tokio::test]
async fn one_pass_requests_all_keys_and_merges_pricing() {
    let fx = Fixture::new();
    let backend = Arc::new(
        MockBackend::with_table(vec![value("a", "x", Some(1)), value("b", "y", Some(2))])
            .with_schema(schema(vec![
                SchemaField::new("a", "A", Some(1)),
                SchemaField::new("b", "B", Some(2)),
            ]))
            .with_pricing(pricing(100, 10)),
    );
    let extractor = fx.extractor(FakePages::new(2), backend.clone());
    let request = ExtractRequest {
        chunk_pages: 2,
        ..fx.request(PassMode::OnePass)
    };

    let result = extractor.run_extract(&request).await.unwrap();

    assert_eq!(backend.calls(), vec![call(&[1, 2], &["a", "b"])]);
    assert_eq!(result.flat["a"], "x");
    assert_eq!(result.flat["b"], "y");
    let total = result.pricing.unwrap();
    assert_eq!(total.input_tokens, Some(200));
    assert_eq!(total.output_tokens, Some(20));
    assert_eq!(total.total_cost_usd, Some(1.0));
    assert_eq!(result.metadata["pricing"]["input_tokens"], 200);
    assert_eq!(result.metadata["mode"], "one_pass");
    // One pass never touches the schema cache.
    let store = SchemaStore::open(&fx.settings.schema_cache_dir).unwrap();
    assert!(store.list_schemas().unwrap().is_empty());
}

#[tokio::test]
async fn one_schema_pass_requires_schema_source() {
    let fx = Fixture::new();
    let backend = Arc::new(MockBackend::with_table(vec![]));
    let extractor = fx.extractor(FakePages::new(1), backend.clone());

    let err = extractor
        .run_extract(&fx.request(PassMode::OneSchemaPass))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Extraction(ref m) if m.contains("requires --schema-id")));

    let request = ExtractRequest {
        schema_id: Some("nope".into()),
        ..fx.request(PassMode::OneSchemaPass)
    };
    let err = extractor.run_extract(&request).await.unwrap_err();
    assert!(matches!(err, CoreError::Extraction(ref m) if m == "Schema id not found: nope"));
    assert_eq!(backend.call_count(), 0);
}

#[tokio::test]
async fn one_schema_pass_uses_stored_schema() {
    let fx = Fixture::new();
    let store = SchemaStore::open(&fx.settings.schema_cache_dir).unwrap();
    store
        .save(&schema(vec![SchemaField::new("a", "A", Some(1))]))
        .unwrap();
    let backend = Arc::new(MockBackend::with_table(vec![value("a", "x", Some(1))]));
    let extractor = fx.extractor(FakePages::new(1), backend.clone());

    let request = ExtractRequest {
        schema_id: Some("schema-1".into()),
        ..fx.request(PassMode::OneSchemaPass)
    };
    let result = extractor.run_extract(&request).await.unwrap();

    assert_eq!(result.schema_id, "schema-1");
    assert_eq!(result.flat["a"], "x");
    assert_eq!(result.metadata["mode"], "one_schema_pass");
    assert_eq!(backend.infer_count(), 0);
}

#[tokio::test]
async fn backend_failure_aborts_run() {
    let fx = Fixture::new();
    let schema_path = fx.write_schema(&schema(vec![SchemaField::new("a", "A", None)]));
    let backend = Arc::new(MockBackend::with_table(vec![]).with_failure("overloaded"));
    let extractor = fx.extractor(FakePages::new(2), backend);

    let request = ExtractRequest {
        schema_path: Some(schema_path),
        ..fx.request(PassMode::TwoPass)
    };
    let err = extractor.run_extract(&request).await.unwrap_err();
    assert!(matches!(err, CoreError::Backend(BackendError::Status { status: 500, .. })));
}

#[tokio::test]
async fn missing_input_is_rejected() {
    let fx = Fixture::new();
    let extractor = fx.extractor(FakePages::new(1), Arc::new(MockBackend::with_table(vec![])));
    let request = ExtractRequest::new(fx.dir.path().join("absent.pdf"));
    let err = extractor.run_extract(&request).await.unwrap_err();
    assert!(matches!(err, CoreError::Extraction(_)));
}

#[tokio::test]
async fn output_path_is_written() {
    let fx = Fixture::new();
    let schema_path = fx.write_schema(&schema(vec![SchemaField::new("a", "A", Some(1))]));
    let backend = Arc::new(MockBackend::with_table(vec![value("a", "x", Some(1))]));
    let extractor = fx.extractor(FakePages::new(1), backend);
    let output = fx.dir.path().join("out").join("nested").join("result.json");

    let request = ExtractRequest {
        schema_path: Some(schema_path),
        output_path: Some(output.clone()),
        ..fx.request(PassMode::TwoPass)
    };
    let result = extractor.run_extract(&request).await.unwrap();

    let written: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&output).unwrap()).unwrap();
    assert_eq!(written["flat"]["a"], "x");
    assert_eq!(written["schema_id"], result.schema_id.as_str());
}

#[test]
fn blocking_run_outside_runtime() {
    let fx = Fixture::new();
    let schema_path = fx.write_schema(&schema(vec![SchemaField::new("a", "A", Some(1))]));
    let backend = Arc::new(MockBackend::with_table(vec![value("a", "x", Some(1))]));
    let extractor = fx.extractor(FakePages::new(1), backend);

    let request = ExtractRequest {
        schema_path: Some(schema_path),
        ..fx.request(PassMode::TwoPass)
    };
    let result = extractor.run_extract_blocking(&request).unwrap();
    assert_eq!(result.flat["a"], "x");
}

#[tokio::test(flavor = "current_thread")]
async fn blocking_run_inside_current_thread_runtime() {
    let fx = Fixture::new();
    let schema_path = fx.write_schema(&schema(vec![SchemaField::new("a", "A", Some(1))]));
    let backend = Arc::new(MockBackend::with_table(vec![value("a", "x", Some(1))]));
    let extractor = fx.extractor(FakePages::new(1), backend);

    let request = ExtractRequest {
        schema_path: Some(schema_path),
        ..fx.request(PassMode::TwoPass)
    };
    let result = extractor.run_extract_blocking(&request).unwrap();
    assert_eq!(result.flat["a"], "x");
}
