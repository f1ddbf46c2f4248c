//! End-to-end resolution tests against a mock classification service

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use taxolink::{
    CacheConfig, DurableCache, RemoteConfig, ResolverConfig, StaticCredentials, TaxonomyClient,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Mock classification service plus a scratch database.
struct TestScheme {
    server: MockServer,
    _dir: TempDir,
    db_path: PathBuf,
}

impl TestScheme {
    async fn start() -> Self {
        init_tracing();
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"access_token": "tok_1"})),
            )
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("cache.db");
        Self {
            server,
            _dir: dir,
            db_path,
        }
    }

    fn client(&self) -> TaxonomyClient {
        let mut remote = RemoteConfig::new(
            format!("{}/api/url?ddc={{code}}", self.server.uri()),
            format!("{}/token", self.server.uri()),
            "deweyLinkedData",
        );
        remote.retry_base_delay = Duration::from_millis(10);
        remote.request_timeout = Duration::from_secs(5);

        let cache = CacheConfig::builder()
            .flush_quiescence(Duration::from_millis(100))
            .build();

        TaxonomyClient::with_config(
            &self.db_path,
            Arc::new(StaticCredentials::new("id", "secret")),
            remote,
            cache,
            ResolverConfig::default(),
        )
        .unwrap()
    }

    fn resource_iri(&self, name: &str) -> String {
        format!("{}/c/{}", self.server.uri(), name)
    }

    fn concept(&self, name: &str, notation: &str) -> Value {
        json!({
            "id": self.resource_iri(name),
            "notation": notation,
            "prefLabel": {"en": format!("Concept {notation}")}
        })
    }

    async fn mount_lookup(&self, code: &str, resource: &str, expected_hits: u64) {
        let mut body = serde_json::Map::new();
        body.insert(code.to_string(), Value::String(self.resource_iri(resource)));
        Mock::given(method("GET"))
            .and(path("/api/url"))
            .and(query_param("ddc", code))
            .respond_with(ResponseTemplate::new(200).set_body_json(Value::Object(body)))
            .expect(expected_hits)
            .mount(&self.server)
            .await;
    }

    async fn mount_lookup_missing(&self, code: &str, expected_hits: u64) {
        Mock::given(method("GET"))
            .and(path("/api/url"))
            .and(query_param("ddc", code))
            .respond_with(ResponseTemplate::new(404))
            .expect(expected_hits)
            .mount(&self.server)
            .await;
    }

    async fn mount_concept(&self, name: &str, body: Value) {
        Mock::given(method("GET"))
            .and(path(format!("/c/{name}")))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(&self.server)
            .await;
    }

    async fn mount_concept_counted(&self, name: &str, body: Value, expected_hits: u64) {
        Mock::given(method("GET"))
            .and(path(format!("/c/{name}")))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .expect(expected_hits)
            .mount(&self.server)
            .await;
    }

    async fn mount_concept_failing(&self, name: &str) {
        Mock::given(method("GET"))
            .and(path(format!("/c/{name}")))
            .respond_with(ResponseTemplate::new(500))
            .mount(&self.server)
            .await;
    }
}

async fn wait_for_entries(store: &DurableCache, expected: u64) {
    for _ in 0..150 {
        if store.entry_count().await.unwrap() == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("durable cache never reached {expected} entries");
}

#[tokio::test]
async fn test_second_resolve_is_served_from_cache() {
    let scheme = TestScheme::start().await;
    scheme.mount_lookup("025.04", "R1", 1).await;
    scheme
        .mount_concept_counted("R1", scheme.concept("R1", "025.04"), 1)
        .await;

    let client = scheme.client();
    let first = client.resolve("025.04").await.unwrap();
    let second = client.resolve("025.04").await.unwrap();

    // same shared concept, no second round-trip (the mocks allow one hit)
    assert!(Arc::ptr_eq(&first, &second));
    assert!(client.recency_stats().await.hits >= 1);

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unknown_code_is_answered_locally_after_first_miss() {
    let scheme = TestScheme::start().await;
    scheme.mount_lookup_missing("999.99", 1).await;

    let client = scheme.client();
    let store = client.durable_cache().clone();

    assert!(client.resolve("999.99").await.unwrap_err().is_not_found());
    wait_for_entries(&store, 1).await;

    // second miss is served from the negative entry, the mock allows one hit
    assert!(client.resolve("999.99").await.unwrap_err().is_not_found());

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_stale_negative_revalidates_and_row_survives() {
    let scheme = TestScheme::start().await;
    scheme.mount_lookup_missing("999.99", 2).await;

    let client = scheme.client();
    let store = client.durable_cache().clone();
    let ttl = Duration::from_secs(90 * 24 * 3600);

    assert!(client.resolve("999.99").await.unwrap_err().is_not_found());
    wait_for_entries(&store, 1).await;

    // age the negative entry past its trust window
    let conn = rusqlite::Connection::open(&scheme.db_path).unwrap();
    let aged = (chrono::Utc::now() - chrono::Duration::days(120)).to_rfc3339();
    conn.execute("UPDATE cache_entries SET last_updated = ?1", [aged])
        .unwrap();

    // still answered as absent, but now through a re-validation round-trip
    assert!(client.resolve("999.99").await.unwrap_err().is_not_found());

    // the entry was refreshed in place, never deleted
    for _ in 0..150 {
        let entry = store.lookup_by_code("999.99").await.unwrap().unwrap();
        if entry.negative_still_valid(ttl) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(store.entry_count().await.unwrap(), 1);
    let entry = store.lookup_by_code("999.99").await.unwrap().unwrap();
    assert!(entry.negative_still_valid(ttl));

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_resolvers_all_persist() {
    let scheme = TestScheme::start().await;
    let codes: Vec<String> = (0..50).map(|i| format!("{}", 100 + i)).collect();
    for (i, code) in codes.iter().enumerate() {
        let name = format!("R{i}");
        scheme.mount_lookup(code, &name, 1).await;
        scheme.mount_concept(&name, scheme.concept(&name, code)).await;
    }

    let client = Arc::new(scheme.client());
    let store = client.durable_cache().clone();

    let mut handles = Vec::new();
    for code in codes {
        let client = Arc::clone(&client);
        handles.push(tokio::spawn(async move { client.resolve(&code).await }));
    }
    for handle in handles {
        assert!(handle.await.unwrap().is_ok());
    }

    let client = Arc::into_inner(client).expect("resolver tasks all joined");
    client.shutdown().await.unwrap();

    assert_eq!(store.entry_count().await.unwrap(), 50);
}

#[tokio::test]
async fn test_broader_cycle_terminates_with_finite_chain() {
    let scheme = TestScheme::start().await;
    scheme.mount_lookup("005", "RA", 1).await;

    let mut concept_a = scheme.concept("RA", "005");
    concept_a["broader"] = json!(scheme.resource_iri("RB"));
    let mut concept_b = scheme.concept("RB", "004");
    concept_b["broader"] = json!(scheme.resource_iri("RA"));
    scheme.mount_concept("RA", concept_a).await;
    scheme.mount_concept("RB", concept_b).await;

    let client = scheme.client();
    let context = client.resolve_context("005").await.unwrap();

    assert_eq!(context.main.notation, "005");
    assert_eq!(context.ancestors.len(), 1);
    assert_eq!(context.ancestors[0].notation, "004");

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_fanout_partial_failure_keeps_the_rest() {
    let scheme = TestScheme::start().await;
    scheme.mount_lookup("005", "R1", 1).await;

    let mut main = scheme.concept("R1", "005");
    main["narrower"] = json!([
        scheme.resource_iri("R2"),
        scheme.resource_iri("R3"),
        scheme.resource_iri("R4"),
        scheme.resource_iri("R5"),
        scheme.resource_iri("R6"),
    ]);
    scheme.mount_concept("R1", main).await;
    scheme.mount_concept("R2", scheme.concept("R2", "005.1")).await;
    scheme.mount_concept_failing("R3").await;
    scheme.mount_concept("R4", scheme.concept("R4", "005.4")).await;
    scheme.mount_concept_failing("R5").await;
    scheme.mount_concept("R6", scheme.concept("R6", "005.6")).await;

    let client = scheme.client();
    let context = client.resolve_context("005").await.unwrap();

    assert_eq!(context.main.notation, "005");
    let notations: Vec<&str> = context
        .children
        .iter()
        .map(|c| c.notation.as_str())
        .collect();
    assert_eq!(notations, vec!["005.1", "005.4", "005.6"]);

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_context_resolves_ancestors_and_children() {
    let scheme = TestScheme::start().await;
    scheme.mount_lookup("005", "R1", 1).await;

    let mut main = scheme.concept("R1", "005");
    main["broader"] = json!(scheme.resource_iri("R0"));
    main["narrower"] = json!([scheme.resource_iri("R2"), scheme.resource_iri("R3")]);
    scheme.mount_concept("R1", main).await;
    scheme.mount_concept("R0", scheme.concept("R0", "00")).await;
    scheme.mount_concept("R2", scheme.concept("R2", "005.1")).await;
    scheme.mount_concept("R3", scheme.concept("R3", "005.3")).await;

    let client = scheme.client();
    let context = client.resolve_context("005").await.unwrap();

    assert_eq!(context.main.notation, "005");
    assert_eq!(context.ancestors.len(), 1);
    assert_eq!(context.ancestors[0].notation, "00");
    let children: Vec<&str> = context
        .children
        .iter()
        .map(|c| c.notation.as_str())
        .collect();
    assert_eq!(children, vec!["005.1", "005.3"]);
    assert!(context.related.is_empty());

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_cancelled_context_keeps_main_only() {
    let scheme = TestScheme::start().await;
    scheme.mount_lookup("005", "R1", 1).await;

    let mut main = scheme.concept("R1", "005");
    main["broader"] = json!(scheme.resource_iri("R0"));
    main["narrower"] = json!([scheme.resource_iri("R2")]);
    scheme.mount_concept("R1", main).await;
    scheme.mount_concept("R0", scheme.concept("R0", "00")).await;
    scheme.mount_concept("R2", scheme.concept("R2", "005.1")).await;

    let client = scheme.client();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let context = client
        .resolve_context_with_cancel("005", &cancel)
        .await
        .unwrap();

    assert_eq!(context.main.notation, "005");
    assert!(context.ancestors.is_empty());
    assert!(context.children.is_empty());
    assert!(context.related.is_empty());

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_resolve_with_ancestors_warms_the_chain() {
    let scheme = TestScheme::start().await;
    // lexical chain of 025.04 is 025, 020, 000
    scheme.mount_lookup("025.04", "R1", 1).await;
    scheme.mount_lookup("025", "R2", 1).await;
    scheme.mount_lookup("020", "R3", 1).await;
    scheme.mount_lookup("000", "R4", 1).await;
    scheme.mount_concept("R1", scheme.concept("R1", "025.04")).await;
    scheme.mount_concept("R2", scheme.concept("R2", "025")).await;
    scheme.mount_concept("R3", scheme.concept("R3", "020")).await;
    scheme.mount_concept("R4", scheme.concept("R4", "000")).await;

    let client = scheme.client();
    let store = client.durable_cache().clone();

    let concept = client.resolve_with_ancestors("025.04").await.unwrap();
    assert_eq!(concept.notation, "025.04");

    // the whole chain went through the write queue
    wait_for_entries(&store, 4).await;

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_restart_reads_durable_tier_and_counts_access() {
    let scheme = TestScheme::start().await;
    scheme.mount_lookup("025.04", "R1", 1).await;
    scheme
        .mount_concept_counted("R1", scheme.concept("R1", "025.04"), 1)
        .await;

    let first = scheme.client();
    let store = first.durable_cache().clone();
    first.resolve("025.04").await.unwrap();
    first.shutdown().await.unwrap();

    // a fresh process finds the entry on disk, no network needed
    let second = scheme.client();
    let concept = second.resolve("025.04").await.unwrap();
    assert_eq!(concept.notation, "025.04");

    // the durable hit is counted once the batch flushes
    second.flush().await;
    for _ in 0..150 {
        let entry = store.lookup_by_code("025.04").await.unwrap().unwrap();
        if entry.access_count >= 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let entry = store.lookup_by_code("025.04").await.unwrap().unwrap();
    assert_eq!(entry.access_count, 2);

    second.shutdown().await.unwrap();
}
