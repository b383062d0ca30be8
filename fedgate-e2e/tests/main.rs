//! End-to-end suites: queries travel the whole path from uri reference to
//! engine rows, with in-process providers playing the remote side.

use fedgate_core::{data::DataValue, err::GatewayError};
use fedgate_e2e::{provider_conf, serve_resources, serve_text, stack};
use pretty_assertions::assert_eq;

/// A query preprocessed by the vfs runs for real on the engine: the text
/// payload lands in the cache as a JSON file and the rewritten reader
/// scans it.
#[tokio::test]
async fn test_vfs_rewrite_executes_on_engine() {
    let stack = stack(vec![provider_conf("api")]);
    serve_text(
        &stack,
        "api",
        "users.json",
        r#"[{"id":1,"name":"alice"},{"id":2,"name":"bob"}]"#,
    );

    let rewritten = stack
        .vfs
        .process_query("SELECT COUNT(*) AS c FROM 'mcp://api/users.json'")
        .await
        .unwrap();

    let rows = stack.engine.execute(&rewritten).unwrap();
    assert_eq!(rows.rows, vec![vec![DataValue::Int64(2)]]);
}

/// CSV text payloads cache as `.csv` files and rewrite to the CSV reader
#[tokio::test]
async fn test_csv_resource_end_to_end() {
    let stack = stack(vec![provider_conf("files")]);
    serve_text(&stack, "files", "people.csv", "id,name\n1,alice\n2,bob\n3,carol\n");

    let rewritten = stack
        .vfs
        .process_query("SELECT COUNT(*) AS c FROM 'mcp://files/people.csv'")
        .await
        .unwrap();
    assert!(rewritten.contains("read_csv_auto("));

    let rows = stack.engine.execute(&rewritten).unwrap();
    assert_eq!(rows.rows, vec![vec![DataValue::Int64(3)]]);
}

/// A glob over two resources becomes a UNION ALL that the engine scans.
/// Another server holds an identically named file that must not be swept
/// in.
#[tokio::test]
async fn test_glob_union_executes_on_engine() {
    let stack = stack(vec![provider_conf("s1"), provider_conf("s2")]);
    serve_resources(
        &stack,
        "s1",
        &[
            ("logs/2024-01.json", r#"[{"n":1},{"n":2}]"#),
            ("logs/2024-02.json", r#"[{"n":3}]"#),
        ],
    );
    serve_text(&stack, "s2", "logs/2024-01.json", r#"[{"n":9}]"#);

    let rewritten = stack
        .vfs
        .process_query("SELECT COUNT(*) AS c FROM 'mcp://s1/logs/*.json'")
        .await
        .unwrap();

    assert!(rewritten.contains(" UNION ALL "));

    let rows = stack.engine.execute(&rewritten).unwrap();
    assert_eq!(rows.rows, vec![vec![DataValue::Int64(3)]]);
}

/// Federated rows join against a local engine table in one query
#[tokio::test]
async fn test_federated_join_with_local_table() {
    let stack = stack(vec![provider_conf("api")]);
    serve_text(
        &stack,
        "api",
        "users.json",
        r#"[{"id":"1","name":"alice"},{"id":"2","name":"bob"}]"#,
    );

    stack
        .engine
        .execute_batch(
            "CREATE TABLE orders (user_id VARCHAR, total INTEGER); \
             INSERT INTO orders VALUES ('1', 10), ('1', 5), ('2', 7)",
        )
        .unwrap();

    let result = stack
        .router
        .execute_query(
            "SELECT u.name, SUM(o.total) AS spent \
             FROM 'mcp://api/users.json' u \
             JOIN orders o ON u.id = o.user_id \
             GROUP BY u.name",
        )
        .await
        .unwrap();

    let mut rows = result.rows.rows.clone();
    rows.sort_by(|a, b| a.partial_cmp(b).unwrap());
    assert_eq!(
        rows,
        vec![
            vec![
                DataValue::Utf8String("alice".into()),
                DataValue::Int64(15)
            ],
            vec![DataValue::Utf8String("bob".into()), DataValue::Int64(7)],
        ]
    );

    assert!(result.metadata.sources_queried.contains(&"api".to_string()));
}

/// Resolving through the vfs twice hits the cache; the provider sees one
/// read and both queries produce identical engine results
#[tokio::test]
async fn test_cache_serves_repeat_queries() {
    let stack = stack(vec![provider_conf("api")]);
    let provider = serve_text(&stack, "api", "data.json", r#"[{"x":1}]"#);

    let sql = "SELECT * FROM 'mcp://api/data.json'";

    let first = stack.vfs.process_query(sql).await.unwrap();
    let second = stack.vfs.process_query(sql).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(provider.read_count("data.json"), 1);

    let stats = stack.vfs.stats();
    assert_eq!(stats.cache_hits, 1);
    assert_eq!(stats.cache_misses, 1);
}

/// A registry snapshot moves to a fresh stack and queries keep working
#[tokio::test]
async fn test_registry_snapshot_restores_federation() {
    let stack_a = stack(vec![provider_conf("api")]);
    serve_text(&stack_a, "api", "users.json", r#"[{"id":1}]"#);

    let snapshot = stack_a.registry.export();

    let stack_b = stack(vec![]);
    // the new stack reaches the same provider endpoint
    let provider = fedgate_transport::memory::MemoryProvider::new();
    provider.add_text_resource("users.json", "users", r#"[{"id":1}]"#);
    stack_b
        .factory
        .register(&fedgate_e2e::provider_url("api"), provider);

    stack_b.registry.import(&snapshot).unwrap();

    let result = stack_b
        .router
        .execute_query("SELECT COUNT(*) AS c FROM 'mcp://api/users.json'")
        .await
        .unwrap();

    assert_eq!(result.rows.rows, vec![vec![DataValue::Int64(1)]]);
}

/// Every error the caller sees carries exactly one taxonomy kind
#[tokio::test]
async fn test_error_taxonomy_is_observable() {
    let stack = stack(vec![]);

    let err = stack
        .router
        .execute_query("SELECT * FROM 'mcp://nowhere/x.json'")
        .await
        .unwrap_err();
    assert!(matches!(
        GatewayError::of(&err),
        Some(GatewayError::CannotResolveServer(_))
    ));

    let err = stack.vfs.resolve_uri("not-a-uri").await.unwrap_err();
    assert!(matches!(
        GatewayError::of(&err),
        Some(GatewayError::InvalidUri(_))
    ));
}

/// Stats surfaces across the stack move together over one federated query
#[tokio::test]
async fn test_stats_surfaces() {
    let stack = stack(vec![provider_conf("api")]);
    serve_text(&stack, "api", "u.json", r#"[{"id":1}]"#);

    stack
        .router
        .execute_query("SELECT * FROM 'mcp://api/u.json'")
        .await
        .unwrap();

    let router_stats = stack.router.stats();
    assert_eq!(router_stats.queries_routed, 1);
    assert_eq!(router_stats.temp_tables_created, 1);

    let pool_stats = stack.pool.stats().await;
    assert_eq!(pool_stats.total_connections, 1);
    assert_eq!(pool_stats.healthy_connections, 1);

    let registry_stats = stack.registry.stats();
    assert_eq!(registry_stats.server_count, 1);
}
