//! Retrieval ordering over a built index.

use super::{fs_source, open_kb, write_repo, TestProvider};
use crate::config::{KnowledgeBaseConfig, PathFilters};
use std::sync::Arc;
use tempfile::TempDir;

const FILES: &[(&str, &str)] = &[
    ("auth/login.py", "def login(user, password):\n    token = issue_token(user)\n    return token\n"),
    ("auth/logout.py", "def logout(session):\n    session.revoke()\n"),
    ("db/connection.py", "def open_connection(url):\n    return Pool(url, size=8)\n"),
    ("db/migrations.py", "def run_migrations(pool):\n    for step in MIGRATIONS:\n        step.apply(pool)\n"),
    ("http/router.py", "def route(request):\n    handler = ROUTES[request.path]\n    return handler(request)\n"),
    ("README.md", "# Service\n\nLogin issues a token; the router dispatches requests.\n"),
];

const QUERIES: &[&str] = &[
    "how is a login token issued?",
    "where are database migrations applied",
    "router request handler lookup",
    "session revoke on logout",
    "completely unrelated words like banana",
];

#[tokio::test]
async fn test_results_never_exceed_top_k_and_are_sorted() {
    let repo = write_repo(FILES);
    let workspace = TempDir::new().unwrap();
    let kb = open_kb(
        workspace.path(),
        KnowledgeBaseConfig::default(),
        Arc::new(TestProvider::new(256)),
    );
    kb.build(fs_source(repo.path()), PathFilters::new())
        .await
        .unwrap();

    for query in QUERIES {
        let results = kb.retrieve(query, 3).await.unwrap();
        assert!(results.len() <= 3, "{} returned {}", query, results.len());
        for pair in results.windows(2) {
            assert!(
                pair[0].score >= pair[1].score,
                "{}: {} ranked above {}",
                query,
                pair[0].score,
                pair[1].score
            );
        }
    }

    let everything = kb.retrieve("token", 50).await.unwrap();
    assert_eq!(everything.len(), FILES.len());
}

#[tokio::test]
async fn test_relevant_file_ranks_first() {
    let repo = write_repo(FILES);
    let workspace = TempDir::new().unwrap();
    let kb = open_kb(
        workspace.path(),
        KnowledgeBaseConfig::default(),
        Arc::new(TestProvider::new(256)),
    );
    kb.build(fs_source(repo.path()), PathFilters::new())
        .await
        .unwrap();

    let results = kb.retrieve("run_migrations MIGRATIONS step apply", 3).await.unwrap();
    assert_eq!(results[0].unit.path, "db/migrations.py");

    let results = kb.retrieve("open_connection pool url", 3).await.unwrap();
    assert_eq!(results[0].unit.path, "db/connection.py");
}
