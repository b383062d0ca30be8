use std::io::Write;

use fedgate_main::{
    args::{Args, Command},
    Gateway,
};

#[test]
fn test_gateway_boots_executes_and_terminates() {
    fedgate_logging::init_for_tests();

    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("fedgate.yaml");
    let cache_dir = dir.path().join("cache");

    let mut file = std::fs::File::create(&config_path).unwrap();
    writeln!(
        file,
        "cache:\n  cache_dir: {}\npool:\n  retry_delay_ms: 10",
        cache_dir.display()
    )
    .unwrap();

    let gateway = Gateway::start(Command::Run(Args {
        config: Some(config_path),
    }))
    .unwrap();

    let result = gateway.execute("SELECT 1 AS x").unwrap();
    assert_eq!(result.metadata.row_count, 1);
    assert_eq!(
        result.metadata.sources_queried,
        vec!["local".to_string()]
    );

    // a query with no remote references passes through unchanged
    let processed = gateway.process_query("SELECT 2 AS y").unwrap();
    assert_eq!(processed, "SELECT 2 AS y");

    let health = gateway.health().check().unwrap();
    assert!(health["Engine"].healthy);

    gateway.terminate().unwrap();
}

#[test]
fn test_dump_config_prints_effective_defaults() {
    let mut cmd = assert_cmd::Command::cargo_bin("fedgate").unwrap();
    cmd.arg("dump-config")
        .arg("--config")
        .arg("/definitely/not/here.yaml");

    cmd.assert()
        .success()
        .stdout(predicates::str::contains("max_connections: 50"))
        .stdout(predicates::str::contains("retry_attempts: 3"));
}

#[test]
fn test_dump_config_honors_config_file() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("fedgate.yaml");
    std::fs::write(&config_path, "pool:\n  max_connections: 7\n").unwrap();

    let mut cmd = assert_cmd::Command::cargo_bin("fedgate").unwrap();
    cmd.arg("dump-config").arg("--config").arg(&config_path);

    cmd.assert()
        .success()
        .stdout(predicates::str::contains("max_connections: 7"));
}
