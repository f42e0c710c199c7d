//! Integration tests for the host extension points.
//!
//! A host embeds crawldex by handing [`SearchService::builder`] its own
//! container directory, access policy and document providers. These tests
//! drive those seams end to end through the pipeline and the in-memory
//! index.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use crawldex::config::Config;
use crawldex::documents::DocumentProvider;
use crawldex::pipeline::{IndexTask, Work};
use crawldex::resource::{Resource, ResourceKind, ResourceProperties};
use crawldex::search::SearchRequest;
use crawldex::service::SearchService;
use crawldex_core::models::Priority;
use crawldex_core::path::ResourcePath;
use crawldex_core::security::{Container, Identity, StaticDirectory};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

// ─── Test documents ─────────────────────────────────────────────────

/// A notebook entry held in memory. `body: None` makes reading fail.
struct Entry {
    path: ResourcePath,
    kind: ResourceKind,
    container: String,
    title: String,
    body: Option<String>,
}

#[async_trait]
impl Resource for Entry {
    fn path(&self) -> &ResourcePath {
        &self.path
    }

    fn kind(&self) -> &ResourceKind {
        &self.kind
    }

    fn exists(&self) -> bool {
        true
    }

    fn should_index(&self) -> bool {
        true
    }

    fn document_id(&self) -> String {
        format!("notebook:{}", self.path)
    }

    fn container_id(&self) -> Option<String> {
        Some(self.container.clone())
    }

    fn url(&self) -> String {
        format!("https://lims.example/notebook{}", self.path)
    }

    fn last_modified(&self) -> Option<DateTime<Utc>> {
        None
    }

    fn size(&self) -> Option<u64> {
        self.body.as_ref().map(|b| b.len() as u64)
    }

    fn properties(&self) -> ResourceProperties {
        ResourceProperties {
            display_title: Some(self.title.clone()),
            search_title: Some(self.title.clone()),
            categories: vec!["notebook".to_string()],
            ..Default::default()
        }
    }

    async fn list(&self) -> Result<Vec<Arc<dyn Resource>>> {
        Ok(Vec::new())
    }

    async fn read_content(&self, _max_bytes: u64) -> Result<Vec<u8>> {
        match &self.body {
            Some(b) => Ok(b.clone().into_bytes()),
            None => anyhow::bail!("entry is locked"),
        }
    }

    async fn set_last_indexed(
        &self,
        _indexed: DateTime<Utc>,
        _modified: Option<DateTime<Utc>>,
    ) -> Result<()> {
        Ok(())
    }
}

/// Serves notebook entries per container and counts index resets.
#[derive(Default)]
struct Notebook {
    entries: HashMap<String, Vec<(String, Option<String>)>>,
    resets: AtomicUsize,
}

impl Notebook {
    fn with(mut self, container: &str, title: &str, body: Option<&str>) -> Self {
        self.entries
            .entry(container.to_string())
            .or_default()
            .push((title.to_string(), body.map(str::to_string)));
        self
    }
}

#[async_trait]
impl DocumentProvider for Notebook {
    fn name(&self) -> &str {
        "notebook"
    }

    async fn enumerate_documents(
        &self,
        task: Arc<IndexTask>,
        container: &str,
        _since: Option<DateTime<Utc>>,
    ) -> Result<()> {
        for (i, (title, body)) in self.entries.get(container).into_iter().flatten().enumerate() {
            let entry = Entry {
                path: ResourcePath::root()
                    .child(container)
                    .child(&format!("entry-{i}.txt")),
                kind: ResourceKind::File,
                container: container.to_string(),
                title: title.clone(),
                body: body.clone(),
            };
            task.add_work(Work::add(Arc::new(entry)), Priority::Background);
        }
        Ok(())
    }

    async fn index_deleted(&self) -> Result<()> {
        self.resets.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ─── Fixtures ───────────────────────────────────────────────────────

fn container(id: &str, parent: Option<&str>) -> Container {
    Container {
        id: id.to_string(),
        name: id.to_uppercase(),
        parent: parent.map(str::to_string),
        searchable: true,
        workbook: false,
    }
}

/// `home` with two children: `open` readable by alice, `closed` readable
/// by nobody yet.
fn directory() -> Arc<StaticDirectory> {
    let dir = StaticDirectory::new();
    dir.add_container(container("home", None), &["alice".to_string()]);
    dir.add_container(container("open", Some("home")), &["alice".to_string()]);
    dir.add_container(container("closed", Some("home")), &[]);
    Arc::new(dir)
}

fn config(tmp: &TempDir, commit_max_docs: usize) -> Config {
    Config::from_toml_str(&format!(
        r#"
        [db]
        path = "{}"

        [index]
        kind = "memory"
        commit_max_docs = {}
        commit_idle_ms = 500

        [crawler]
        enabled = false
        "#,
        tmp.path().join("state.sqlite").display(),
        commit_max_docs,
    ))
    .unwrap()
}

async fn service(
    tmp: &TempDir,
    dir: Arc<StaticDirectory>,
    notebook: Arc<Notebook>,
) -> Arc<SearchService> {
    service_with(tmp, dir, notebook, 10_000).await
}

async fn service_with(
    tmp: &TempDir,
    dir: Arc<StaticDirectory>,
    notebook: Arc<Notebook>,
    commit_max_docs: usize,
) -> Arc<SearchService> {
    let service = SearchService::builder(config(tmp, commit_max_docs))
        .security(dir.clone(), dir)
        .document_provider(notebook)
        .build()
        .await
        .unwrap();
    service.start().await.unwrap();
    service
}

fn request(q: &str, user: &str) -> SearchRequest {
    SearchRequest::new(q, Identity::new(user), "home")
}

// ─── Tests ──────────────────────────────────────────────────────────

#[tokio::test]
async fn granting_read_widens_results() {
    let tmp = TempDir::new().unwrap();
    let dir = directory();
    let notebook = Arc::new(
        Notebook::default()
            .with("open", "Spheroid imaging", Some("confocal stack of spheroids"))
            .with("closed", "Spheroid budget", Some("spheroid reagents cost")),
    );
    let service = service(&tmp, dir.clone(), notebook).await;
    let task = service.index_project(None, "home");
    assert!(task.wait_timeout(Duration::from_secs(5)).await);
    service.wait_for_idle().await;

    let result = service.search(&request("spheroid", "alice")).await.unwrap();
    let ids: Vec<_> = result.hits.iter().map(|h| h.container.as_str()).collect();
    assert_eq!(ids, vec!["open"]);

    dir.grant("closed", "alice");
    let result = service.search(&request("spheroid", "alice")).await.unwrap();
    assert_eq!(result.total_hits, 2);

    let result = service.search(&request("spheroid", "mallory")).await.unwrap();
    assert_eq!(result.total_hits, 0);
    service.shutdown().await;
}

#[tokio::test]
async fn task_accounts_for_every_item() {
    let tmp = TempDir::new().unwrap();
    let notebook = Arc::new(
        Notebook::default()
            .with("open", "Passage log", Some("passage numbers"))
            .with("open", "Locked entry", None)
            .with("open", "Media prep", Some("media recipes")),
    );
    let service = service(&tmp, directory(), notebook).await;

    let task = service.create_task("notebook import");
    service.index_container(Some(task.clone()), "open", None);
    // A caller-supplied task stays open until the caller says otherwise.
    assert!(!task.wait_timeout(Duration::from_millis(200)).await);
    task.set_ready();
    assert!(task.wait_timeout(Duration::from_secs(5)).await);

    // one enumerate runnable per provider, plus what they added
    let providers = service.documents().len();
    assert_eq!(task.estimated_count(), providers + 4);
    assert_eq!(
        task.indexed_count() + task.failed_count(),
        task.estimated_count()
    );
    assert_eq!(task.failed_count(), 1);
    service.shutdown().await;
}

#[tokio::test]
async fn clear_notifies_providers_and_empties_the_index() {
    let tmp = TempDir::new().unwrap();
    let notebook = Arc::new(Notebook::default().with("open", "Freezer map", Some("rack B")));
    let service = service(&tmp, directory(), notebook.clone()).await;
    let task = service.index_container(None, "open", None);
    assert!(task.wait_timeout(Duration::from_secs(5)).await);
    service.wait_for_idle().await;
    assert_eq!(
        service.search(&request("freezer", "alice")).await.unwrap().total_hits,
        1
    );

    service.clear().await.unwrap();
    assert_eq!(notebook.resets.load(Ordering::SeqCst), 1);
    assert_eq!(
        service.search(&request("freezer", "alice")).await.unwrap().total_hits,
        0
    );
    service.shutdown().await;
}

#[tokio::test]
async fn container_pages_use_host_directory() {
    let tmp = TempDir::new().unwrap();
    let service = service(&tmp, directory(), Arc::new(Notebook::default())).await;
    let task = service.index_project(None, "home");
    assert!(task.wait_timeout(Duration::from_secs(5)).await);
    service.wait_for_idle().await;

    // home and open are readable; closed is not
    let result = service.search(&request("open", "alice")).await.unwrap();
    assert_eq!(result.total_hits, 1);
    assert_eq!(result.hits[0].doc_id, "container:open");
    assert_eq!(result.hits[0].navtrail.as_deref(), Some("HOME"));
    service.shutdown().await;
}

fn entry(container: &str, i: usize, body: &str) -> Arc<dyn Resource> {
    Arc::new(Entry {
        path: ResourcePath::root()
            .child(container)
            .child(&format!("bulk-{i}.txt")),
        kind: ResourceKind::File,
        container: container.to_string(),
        title: format!("Bulk {i}"),
        body: Some(body.to_string()),
    })
}

#[tokio::test]
async fn volume_commits_before_the_drain() {
    let tmp = TempDir::new().unwrap();
    let service = service_with(&tmp, directory(), Arc::new(Notebook::default()), 50).await;

    for i in 0..201 {
        service
            .pipeline()
            .submit(Work::add(entry("open", i, "aliquot")), Priority::Bulk);
    }
    service.wait_for_idle().await;

    let stats = service.indexer_stats().await;
    assert_eq!(stats.documents_indexed, 201);
    assert!(stats.commits >= 2, "commits: {}", stats.commits);
    assert_eq!(stats.uncommitted, 0);
    let mut req = request("aliquot", "alice");
    req.limit = 5;
    assert_eq!(service.search(&req).await.unwrap().total_hits, 201);
    service.shutdown().await;
}

#[tokio::test]
async fn single_document_commits_exactly_once() {
    let tmp = TempDir::new().unwrap();
    let service = service(&tmp, directory(), Arc::new(Notebook::default())).await;

    service
        .pipeline()
        .submit(Work::add(entry("open", 0, "cryovial")), Priority::Background);
    service.wait_for_idle().await;
    // well past the idle interval
    tokio::time::sleep(Duration::from_millis(1_500)).await;

    let stats = service.indexer_stats().await;
    assert_eq!(stats.commits, 1);
    assert!(stats.last_commit.is_some());
    assert_eq!(
        service.search(&request("cryovial", "alice")).await.unwrap().total_hits,
        1
    );
    service.shutdown().await;
}
