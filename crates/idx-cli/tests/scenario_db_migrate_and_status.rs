use predicates::prelude::*;

/// DB-backed test, skipped if INDEXER_DATABASE_URL is not set.
#[test]
fn db_migrate_then_status_report_ok() {
    let url = match std::env::var(idx_db::ENV_DB_URL) {
        Ok(v) => v,
        Err(_) => {
            eprintln!("SKIP: INDEXER_DATABASE_URL not set");
            return;
        }
    };

    let mut migrate = assert_cmd::Command::cargo_bin("idx-cli").unwrap();
    migrate
        .env(idx_db::ENV_DB_URL, &url)
        .args(["db", "migrate"]);
    migrate
        .assert()
        .success()
        .stdout(predicate::str::contains("migrations_applied=true"));

    let mut status = assert_cmd::Command::cargo_bin("idx-cli").unwrap();
    status.env(idx_db::ENV_DB_URL, &url).args(["db", "status"]);
    status
        .assert()
        .success()
        .stdout(predicate::str::contains("db_ok=true"));
}
