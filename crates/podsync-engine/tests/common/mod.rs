//! Shared fixtures for walker integration tests
//!
//! Provides a scripted in-process Podio, a progress sink that records every
//! update, and a harness wiring them to the in-memory store and sink.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;

use podsync_core::domain::{BatchId, ExportFile, ExportStatus, RemoteId};
use podsync_core::ports::{
    ApiError, ApiReply, App, ExportPoll, ExportSubmission, IProgressSink, IRemoteApi,
    Organization, PageRequest, ProgressUpdate, RemoteFile, Workspace,
};
use podsync_engine::{
    HierarchyWalker, ManualClock, MemoryCheckpointStore, MemoryWriteSink, PollerOptions,
    RetryPolicy, WalkerDeps, WalkerOptions,
};

// ============================================================================
// Fake remote
// ============================================================================

/// Items reported for every app
pub const ITEMS_PER_APP: u64 = 5;

/// Podio stand-in serving a fixed hierarchy
///
/// ```text
/// Acme (1)   ── Sales (10) ── Deals (100, 2 files), Leads (101)
///            └─ Ops (11)   ── Tasks (110)
/// Beta (2)   ── Hr (20)    ── People (200)
/// Gamma (3)  ── Eng (30)   ── Bugs (300, 1 file), Specs (301), Roadmap (302), Ideas (303)
///            └─ Design (31) ── Assets (310)
/// ```
pub struct FakePodio {
    orgs: Vec<Organization>,
    workspaces: HashMap<RemoteId, Vec<Workspace>>,
    apps: HashMap<RemoteId, Vec<App>>,
    files: HashMap<RemoteId, Vec<RemoteFile>>,
    /// Remaining rate-limit answers to `list_workspaces` per organization
    rate_limited_orgs: Mutex<HashMap<RemoteId, u32>>,
    unauthorized_orgs: Mutex<HashSet<RemoteId>>,
    failing_exports: Mutex<HashSet<RemoteId>>,
    calls: Mutex<Vec<String>>,
}

fn id(n: u64) -> RemoteId {
    RemoteId::new(n)
}

fn org(n: u64, name: &str) -> Organization {
    Organization {
        id: id(n),
        name: name.to_string(),
    }
}

fn workspace(n: u64, name: &str) -> Workspace {
    Workspace {
        id: id(n),
        name: name.to_string(),
    }
}

fn app(n: u64, name: &str) -> App {
    App {
        id: id(n),
        name: name.to_string(),
    }
}

fn file(n: u64, name: &str, size: u64) -> RemoteFile {
    RemoteFile {
        id: id(n),
        name: name.to_string(),
        size_bytes: size,
        mime_type: Some("application/pdf".to_string()),
        download_url: Some(format!("https://files.podio.test/{n}")),
    }
}

impl FakePodio {
    pub fn new() -> Self {
        let workspaces = HashMap::from([
            (id(1), vec![workspace(10, "Sales"), workspace(11, "Ops")]),
            (id(2), vec![workspace(20, "Hr")]),
            (id(3), vec![workspace(30, "Eng"), workspace(31, "Design")]),
        ]);
        let apps = HashMap::from([
            (id(10), vec![app(100, "Deals"), app(101, "Leads")]),
            (id(11), vec![app(110, "Tasks")]),
            (id(20), vec![app(200, "People")]),
            (
                id(30),
                vec![
                    app(300, "Bugs"),
                    app(301, "Specs"),
                    app(302, "Roadmap"),
                    app(303, "Ideas"),
                ],
            ),
            (id(31), vec![app(310, "Assets")]),
        ]);
        let files = HashMap::from([
            (
                id(100),
                vec![file(1000, "contract.pdf", 10), file(1001, "quote.pdf", 20)],
            ),
            (id(300), vec![file(3000, "trace.log", 100)]),
        ]);
        Self {
            orgs: vec![org(1, "Acme"), org(2, "Beta"), org(3, "Gamma")],
            workspaces,
            apps,
            files,
            rate_limited_orgs: Mutex::new(HashMap::new()),
            unauthorized_orgs: Mutex::new(HashSet::new()),
            failing_exports: Mutex::new(HashSet::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Answers the next `times` workspace listings of `org` with HTTP 429
    pub fn rate_limit_org(&self, org: u64, times: u32) {
        self.rate_limited_orgs.lock().unwrap().insert(id(org), times);
    }

    pub fn set_unauthorized(&self, org: u64, unauthorized: bool) {
        let mut orgs = self.unauthorized_orgs.lock().unwrap();
        if unauthorized {
            orgs.insert(id(org));
        } else {
            orgs.remove(&id(org));
        }
    }

    pub fn set_export_failing(&self, app: u64, failing: bool) {
        let mut apps = self.failing_exports.lock().unwrap();
        if failing {
            apps.insert(id(app));
        } else {
            apps.remove(&id(app));
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Number of recorded calls equal to `call`
    pub fn count(&self, call: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| *c == call).count()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait::async_trait]
impl IRemoteApi for FakePodio {
    async fn list_organizations(&self) -> Result<ApiReply<Vec<Organization>>, ApiError> {
        self.record("orgs".to_string());
        Ok(ApiReply::new(self.orgs.clone()))
    }

    async fn list_workspaces(&self, org: RemoteId) -> Result<ApiReply<Vec<Workspace>>, ApiError> {
        self.record(format!("workspaces:{org}"));
        if self.unauthorized_orgs.lock().unwrap().contains(&org) {
            return Err(ApiError::Unauthorized("token expired".to_string()));
        }
        if let Some(remaining) = self.rate_limited_orgs.lock().unwrap().get_mut(&org) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(ApiError::RateLimited {
                    retry_after: Some(Duration::from_secs(30)),
                    quota: None,
                });
            }
        }
        Ok(ApiReply::new(
            self.workspaces.get(&org).cloned().unwrap_or_default(),
        ))
    }

    async fn list_apps(&self, workspace: RemoteId) -> Result<ApiReply<Vec<App>>, ApiError> {
        self.record(format!("apps:{workspace}"));
        Ok(ApiReply::new(
            self.apps.get(&workspace).cloned().unwrap_or_default(),
        ))
    }

    async fn count_items(&self, app: RemoteId) -> Result<ApiReply<u64>, ApiError> {
        self.record(format!("count:{app}"));
        Ok(ApiReply::new(ITEMS_PER_APP))
    }

    async fn list_files(
        &self,
        app: RemoteId,
        page: PageRequest,
    ) -> Result<ApiReply<Vec<RemoteFile>>, ApiError> {
        self.record(format!("files:{app}@{}", page.offset));
        let files = self.files.get(&app).cloned().unwrap_or_default();
        Ok(ApiReply::new(
            files
                .into_iter()
                .skip(page.offset as usize)
                .take(page.limit as usize)
                .collect(),
        ))
    }

    async fn submit_export(&self, app: RemoteId) -> Result<ApiReply<ExportSubmission>, ApiError> {
        self.record(format!("export:{app}"));
        if self.failing_exports.lock().unwrap().contains(&app) {
            return Ok(ApiReply::new(ExportSubmission::Batch(BatchId::new(
                app.as_u64() * 10,
            ))));
        }
        Ok(ApiReply::new(ExportSubmission::Immediate(ExportFile {
            file_id: id(app.as_u64() + 5000),
            name: format!("{app}.xlsx"),
            download_url: format!("https://files.podio.test/export/{app}"),
            size_bytes: None,
        })))
    }

    async fn poll_export(&self, batch: BatchId) -> Result<ApiReply<ExportPoll>, ApiError> {
        self.record(format!("poll:{batch}"));
        Ok(ApiReply::new(ExportPoll {
            status: ExportStatus::Failed,
            file: None,
            failure: Some("export worker crashed".to_string()),
        }))
    }

    async fn download_blob(&self, url: &str) -> Result<ApiReply<Vec<u8>>, ApiError> {
        self.record(format!("download:{url}"));
        Ok(ApiReply::new(url.as_bytes().to_vec()))
    }
}

// ============================================================================
// Progress recording
// ============================================================================

type Trigger = (String, Box<dyn Fn() + Send + Sync>);

/// Records every update and optionally fires an action on a matching message
#[derive(Default)]
pub struct RecordingProgressSink {
    updates: Mutex<Vec<ProgressUpdate>>,
    trigger: Mutex<Option<Trigger>>,
}

impl RecordingProgressSink {
    /// Runs `action` once, on the first update whose message contains `needle`
    pub fn on_message(&self, needle: &str, action: impl Fn() + Send + Sync + 'static) {
        *self.trigger.lock().unwrap() = Some((needle.to_string(), Box::new(action)));
    }

    pub fn updates(&self) -> Vec<ProgressUpdate> {
        self.updates.lock().unwrap().clone()
    }

    pub fn percents(&self) -> Vec<f64> {
        self.updates().iter().map(|u| u.percent).collect()
    }

    pub fn last(&self) -> Option<ProgressUpdate> {
        self.updates.lock().unwrap().last().cloned()
    }
}

impl IProgressSink for RecordingProgressSink {
    fn on_progress(&self, update: &ProgressUpdate) {
        self.updates.lock().unwrap().push(update.clone());
        let fired = {
            let mut trigger = self.trigger.lock().unwrap();
            match trigger.as_ref() {
                Some((needle, _)) if update.message.contains(needle.as_str()) => trigger.take(),
                _ => None,
            }
        };
        if let Some((_, action)) = fired {
            action();
        }
    }
}

// ============================================================================
// Harness
// ============================================================================

pub struct Harness {
    pub remote: Arc<FakePodio>,
    pub store: Arc<MemoryCheckpointStore>,
    pub sink: Arc<MemoryWriteSink>,
    pub progress: Arc<RecordingProgressSink>,
    pub clock: Arc<ManualClock>,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            remote: Arc::new(FakePodio::new()),
            store: Arc::new(MemoryCheckpointStore::new()),
            sink: Arc::new(MemoryWriteSink::new()),
            progress: Arc::new(RecordingProgressSink::default()),
            clock: Arc::new(ManualClock::new(Utc::now())),
        }
    }

    pub fn walker(&self, options: WalkerOptions) -> HierarchyWalker {
        HierarchyWalker::new(
            WalkerDeps {
                remote: self.remote.clone(),
                store: self.store.clone(),
                sink: self.sink.clone(),
                progress: self.progress.clone(),
                clock: self.clock.clone(),
            },
            options,
        )
    }
}

/// Options with every pause shortened for tests
pub fn fast_options() -> WalkerOptions {
    WalkerOptions {
        unit_delay: Duration::ZERO,
        dispatch_delay: Duration::ZERO,
        retry: RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(40),
            max_jitter: Duration::ZERO,
        },
        poller: PollerOptions {
            poll_interval: Duration::from_secs(1),
            timeout: Duration::from_secs(60),
            auto_wait: true,
        },
        ..WalkerOptions::default()
    }
}
