//! Whole-run tests against in-memory platform, media and fleet fakes

use async_trait::async_trait;
use fanstorm_client::{
    BroadcastOwner, ClientError, ClientResult, FanAccount, InfluencerAccount, InfluencerProfile,
    JoinedStream, ServerStatus, StreamPlatform,
};
use fanstorm_core::{Metric, NodeCredentials, NodeFailurePolicy, ProgressSample, RemoteNode, RunConfig};
use fanstorm_loadtest::{
    CsvSink, FanoutCoordinator, RemoteResult, RemoteShell, RunError, SampleSink, TestRun, WorkflowStep,
};
use fanstorm_media::{pump_progress, MediaResult, PlaybackObserver, SampleSender, StreamIngest};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;

// ============================================================================
// FAKES
// ============================================================================

/// Fan side of the platform; `join` is rejected for one username
struct FakePlatform {
    reject_join_for: Option<String>,
    next_id: AtomicU32,
    accounts: Mutex<Vec<FanAccount>>,
}

impl FakePlatform {
    fn new(reject_join_for: Option<&str>) -> Self {
        Self {
            reject_join_for: reject_join_for.map(str::to_string),
            next_id: AtomicU32::new(100),
            accounts: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl StreamPlatform for FakePlatform {
    async fn sign_in(&self, email: &str, _password: &str) -> ClientResult<Option<FanAccount>> {
        Ok(self.accounts.lock().iter().find(|a| a.email == email).cloned())
    }

    async fn sign_up(&self, email: &str, username: &str, _password: &str) -> ClientResult<FanAccount> {
        let account = FanAccount {
            id: self.next_id.fetch_add(1, Ordering::SeqCst) as u64,
            email: email.to_string(),
            username: username.to_string(),
            token: format!("token-{}", username),
        };
        self.accounts.lock().push(account.clone());
        Ok(account)
    }

    async fn follow_influencer(&self, _fan: &FanAccount, _influencer_id: u64) -> ClientResult<()> {
        sleep(Duration::from_millis(20)).await;
        Ok(())
    }

    async fn join_stream(&self, influencer_id: u64, fan_id: u64) -> ClientResult<JoinedStream> {
        let username = self
            .accounts
            .lock()
            .iter()
            .find(|a| a.id == fan_id)
            .map(|a| a.username.clone())
            .unwrap_or_default();
        if self.reject_join_for.as_deref() == Some(username.as_str()) {
            return Err(ClientError::Status {
                method: "POST".to_string(),
                url: format!("/api/v1/streams/{}/watchers", influencer_id),
                status: 503,
                body: "stream full".to_string(),
            });
        }
        Ok(JoinedStream {
            origin_ip: "10.0.0.5".to_string(),
        })
    }

    async fn leave_stream(&self, _influencer_id: u64, _fan_id: u64) -> ClientResult<()> {
        Ok(())
    }

    async fn edge_url(&self, host: &str, stream_name: &str) -> ClientResult<String> {
        Ok(format!("rtmp://edge-of-{}/live/{}", host, stream_name))
    }

    async fn influencer_profile(&self, influencer_id: u64) -> ClientResult<InfluencerProfile> {
        Ok(InfluencerProfile {
            id: influencer_id,
            username: "hrant".to_string(),
        })
    }
}

/// Broadcast owner whose stream turns ready on the second status poll
struct FakeOwner {
    polls: AtomicU32,
}

#[async_trait]
impl BroadcastOwner for FakeOwner {
    async fn sign_in_or_up(&self, email: &str, _oauth_token: &str) -> ClientResult<InfluencerAccount> {
        Ok(InfluencerAccount {
            id: 7,
            email: email.to_string(),
            username: "hrant".to_string(),
            token: "owner".to_string(),
            server_status: ServerStatus::default(),
        })
    }

    async fn create_stream(&self, _account: &InfluencerAccount) -> ClientResult<()> {
        Ok(())
    }

    async fn create_stream_alerts(&self, _account: &InfluencerAccount) -> ClientResult<()> {
        Ok(())
    }

    async fn status(&self, account: &InfluencerAccount) -> ClientResult<InfluencerAccount> {
        let poll = self.polls.fetch_add(1, Ordering::SeqCst) + 1;
        let mut fresh = account.clone();
        fresh.server_status = ServerStatus {
            origin_ip: "10.0.0.5".to_string(),
            ready: poll >= 2,
        };
        Ok(fresh)
    }

    fn origin_url(&self, origin_host: &str, stream_name: &str) -> String {
        format!("rtmp://{}:1935/live/{}", origin_host, stream_name)
    }
}

/// Records the origin it was pointed at and runs until stopped
#[derive(Default)]
struct FakeIngest {
    origin: Mutex<Option<String>>,
    stopped: AtomicBool,
}

#[async_trait]
impl StreamIngest for FakeIngest {
    async fn push(&self, origin_url: &str, cancel: CancellationToken) -> MediaResult<()> {
        *self.origin.lock() = Some(origin_url.to_string());
        cancel.cancelled().await;
        self.stopped.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Stands in for rtmpdump: a banner, then `updates` progress bar redraws
/// one second apart, written to a pipe that goes through the real progress
/// parser. With `updates == 0` it plays until cancelled.
struct FakeObserver {
    updates: u32,
}

#[async_trait]
impl PlaybackObserver for FakeObserver {
    async fn observe(
        &self,
        subject: String,
        _edge_url: String,
        started: Instant,
        samples: SampleSender,
        cancel: CancellationToken,
    ) -> MediaResult<()> {
        let (mut decoder, stderr) = tokio::io::duplex(4096);
        let updates = self.updates;
        let redraws = tokio::spawn(async move {
            decoder
                .write_all(b"RTMPDump v2.4\nConnecting ...\nINFO: Connected...\n")
                .await?;
            let mut update = 0u32;
            loop {
                sleep(Duration::from_secs(1)).await;
                update += 1;
                let redraw = format!(
                    "{:.3} kB / {:.2} sec ({:.1}%)\r",
                    100.0 * update as f64,
                    update as f64,
                    update as f64
                );
                decoder.write_all(redraw.as_bytes()).await?;
                if updates != 0 && update >= updates {
                    break;
                }
            }
            decoder.write_all(b"\nDownload may be incomplete\n").await
        });

        pump_progress(stderr, subject, started, &samples, &cancel).await;
        redraws.abort();
        Ok(())
    }
}

/// Pretends every node ran one viewer
#[derive(Default)]
struct FakeShell {
    commands: Mutex<Vec<String>>,
}

#[async_trait]
impl RemoteShell for FakeShell {
    async fn probe(&self, _node: &RemoteNode) -> RemoteResult<()> {
        Ok(())
    }

    async fn execute(
        &self,
        node: &RemoteNode,
        command: &str,
        samples: SampleSender,
        _cancel: CancellationToken,
    ) -> RemoteResult<()> {
        self.commands.lock().push(command.to_string());
        let _ = samples.send(ProgressSample {
            subject_id: format!("viewer-on-{}", node.address),
            elapsed_seconds: 2.0,
            metric: Metric::KiloBytes,
            value: 64.0,
        });
        Ok(())
    }
}

/// Stdout after the reader went away
struct ClosedStdout;

impl SampleSink for ClosedStdout {
    fn write_sample(&mut self, _sample: &ProgressSample) -> Result<(), csv::Error> {
        Err(io::Error::new(io::ErrorKind::BrokenPipe, "Broken pipe").into())
    }
}

/// Write end of a buffer the test can read back
#[derive(Clone, Default)]
struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl SharedBuffer {
    fn records(&self) -> Vec<Vec<String>> {
        let data = self.0.lock().clone();
        String::from_utf8(data)
            .unwrap()
            .lines()
            .map(|line| line.split(',').map(str::to_string).collect())
            .collect()
    }

    fn subjects(&self) -> BTreeSet<String> {
        self.records().into_iter().map(|r| r[0].clone()).collect()
    }
}

fn config(users: usize, max_users: Option<u64>) -> RunConfig {
    let mut config = RunConfig::default();
    config.owner.email = "owner@e.com".to_string();
    config.owner.oauth_token = "oauth".to_string();
    config.ramp.concurrency = users;
    config.ramp.ramp_interval = Duration::from_millis(500);
    config.ramp.max_users = max_users;
    config.broadcast.poll_interval = Duration::from_secs(5);
    config.broadcast.push_warmup = Duration::from_secs(3);
    config
}

// ============================================================================
// TESTS
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_full_run_with_one_failed_join() {
    let platform = Arc::new(FakePlatform::new(Some("testfan2")));
    let owner = Arc::new(FakeOwner {
        polls: AtomicU32::new(0),
    });
    let ingest = Arc::new(FakeIngest::default());
    let output = SharedBuffer::default();

    let run = TestRun::new(config(5, Some(5)), platform, Arc::new(FakeObserver { updates: 3 }))
        .with_broadcast(owner.clone(), ingest.clone());
    let report = run.run_test(CsvSink::new(output.clone())).await.unwrap();

    assert_eq!(owner.polls.load(Ordering::SeqCst), 2);
    assert_eq!(ingest.origin.lock().as_deref(), Some("rtmp://10.0.0.5:1935/live/hrant"));
    assert!(ingest.stopped.load(Ordering::SeqCst));

    let session = report.broadcast.as_ref().unwrap();
    assert!(session.ready);
    assert_eq!(session.session_id, 7);

    assert_eq!(report.ramp.admitted, 5);
    assert_eq!(report.steps.completed_workflows(), 4);
    assert_eq!(report.steps.failed_workflows(), 1);
    assert_eq!(report.steps.step(WorkflowStep::Join).unwrap().failed, 1);

    let subjects = output.subjects();
    assert_eq!(subjects.len(), 4);
    assert!(!subjects.contains("testfan2"));
    assert!(subjects.contains("testfan0"));

    // 3 redraws x 3 metrics per viewer
    assert_eq!(report.results.written, 36);
    assert_eq!(report.results.playback.subject_count(), 4);

    for record in output.records() {
        assert_eq!(record.len(), 4);
        assert!(record[2].starts_with("StreamProgress"));
        assert_eq!(record[1].split('.').nth(1).map(str::len), Some(2));
    }

    // Last redraw of one viewer, as parsed from the decoder text
    let last: Vec<(String, String)> = output
        .records()
        .into_iter()
        .filter(|r| r[0] == "testfan0")
        .map(|r| (r[2].clone(), r[3].clone()))
        .skip(6)
        .collect();
    assert_eq!(
        last,
        vec![
            ("StreamProgressKiloBytes".to_string(), "300.00".to_string()),
            ("StreamProgressSeconds".to_string(), "3.00".to_string()),
            ("StreamProgressPercent".to_string(), "3.00".to_string()),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_fan_mode_watches_existing_broadcast() {
    let mut config = config(3, Some(3));
    config.owner.influencer_id = Some(7);
    config.identity.existing_offset = 40;
    let output = SharedBuffer::default();

    let run = TestRun::new(
        config,
        Arc::new(FakePlatform::new(None)),
        Arc::new(FakeObserver { updates: 1 }),
    );
    let report = run.run_fans(CsvSink::new(output.clone())).await.unwrap();

    assert!(report.broadcast.is_none());
    assert_eq!(report.ramp.admitted, 3);
    assert_eq!(
        output.subjects().into_iter().collect::<Vec<_>>(),
        vec!["testfan40", "testfan41", "testfan42"]
    );
}

#[tokio::test(start_paused = true)]
async fn test_fan_mode_requires_influencer() {
    let run = TestRun::new(
        config(3, Some(3)),
        Arc::new(FakePlatform::new(None)),
        Arc::new(FakeObserver { updates: 1 }),
    );
    let err = run.run_fans(CsvSink::new(SharedBuffer::default())).await.unwrap_err();
    assert!(matches!(err, RunError::Config(_)));
}

#[tokio::test(start_paused = true)]
async fn test_cancel_stops_unbounded_run() {
    let mut config = config(2, None);
    config.owner.influencer_id = Some(7);
    let output = SharedBuffer::default();

    let run = TestRun::new(
        config,
        Arc::new(FakePlatform::new(None)),
        Arc::new(FakeObserver { updates: 0 }),
    );
    let cancel = run.cancel_token();
    tokio::spawn(async move {
        sleep(Duration::from_secs(10)).await;
        cancel.cancel();
    });

    let report = run.run_fans(CsvSink::new(output.clone())).await.unwrap();
    assert!(report.ramp.cancelled);
    assert_eq!(report.ramp.admitted, 2);
    assert_eq!(output.subjects().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_distributed_run_merges_node_output() {
    let mut config = config(10, Some(20));
    config.fleet.hosts = vec!["ubuntu@w1".to_string(), "ubuntu@w2".to_string()];
    let nodes: Vec<RemoteNode> = config
        .fleet
        .hosts
        .iter()
        .map(|address| RemoteNode {
            address: address.clone(),
            credentials: NodeCredentials::default(),
        })
        .collect();
    let shell = Arc::new(FakeShell::default());
    let output = SharedBuffer::default();

    let run = TestRun::new(
        config,
        Arc::new(FakePlatform::new(None)),
        Arc::new(FakeObserver { updates: 1 }),
    )
    .with_broadcast(
        Arc::new(FakeOwner {
            polls: AtomicU32::new(0),
        }),
        Arc::new(FakeIngest::default()),
    )
    .with_fleet(FanoutCoordinator::new(shell.clone(), nodes, NodeFailurePolicy::Abort));

    let report = run.run_test(CsvSink::new(output.clone())).await.unwrap();

    let fanout = report.fanout.unwrap();
    assert_eq!(fanout.assignments.len(), 2);
    assert_eq!(report.ramp.admitted, 0);

    let mut commands = shell.commands.lock().clone();
    commands.sort();
    assert_eq!(
        commands,
        vec![
            "fanstorm fan --users 5 --ramp 1s --existingoffset 0 --percentnew 0 --influencerid 7 --maxusers 10",
            "fanstorm fan --users 5 --ramp 1s --existingoffset 20 --percentnew 0 --influencerid 7 --maxusers 10",
        ]
    );
    assert_eq!(
        output.subjects().into_iter().collect::<Vec<_>>(),
        vec!["viewer-on-ubuntu@w1", "viewer-on-ubuntu@w2"]
    );
}

#[tokio::test(start_paused = true)]
async fn test_fan_mode_stops_when_stdout_is_gone() {
    let mut config = config(2, None);
    config.owner.influencer_id = Some(7);

    let run = TestRun::new(
        config,
        Arc::new(FakePlatform::new(None)),
        Arc::new(FakeObserver { updates: 0 }),
    );
    let report = timeout(Duration::from_secs(3600), run.run_fans(ClosedStdout))
        .await
        .expect("fan run kept going without a reader")
        .unwrap();

    assert!(report.ramp.cancelled);
    assert!(report.results.output_closed);
    assert_eq!(report.results.written, 0);
    assert!(run.cancel_token().is_cancelled());
}
