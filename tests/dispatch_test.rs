//! Dispatcher behavior against scripted roles.
//!
//! The mock engine records every capability call so tests can check ordering
//! (no transfer after a failed bind, items forwarded verbatim, watchdog
//! installed only with a timeout).

use async_trait::async_trait;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use wdt::abort::AbortChecker;
use wdt::error::{ErrorCode, LaunchError, NO_PORTS_EXIT_STATUS};
use wdt::role::{
    ReceiveRole, ReceiverSpec, RoleFactory, SendRole, SenderSpec, TransferLog, TransferReport,
    TransferRole, TransferSummary,
};
use wdt::{Dispatcher, RunConfig, RunOutcome, TransferItem};

#[derive(Clone, Default)]
struct Recorder {
    calls: Arc<Mutex<Vec<String>>>,
    items: Arc<Mutex<Vec<TransferItem>>>,
    checker: Arc<Mutex<Option<Arc<dyn AbortChecker>>>>,
}

impl Recorder {
    fn push(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn called(&self, name: &str) -> bool {
        self.calls().iter().any(|c| c == name)
    }

    fn checker(&self) -> Option<Arc<dyn AbortChecker>> {
        self.checker.lock().unwrap().clone()
    }
}

#[derive(Clone)]
struct Script {
    ports: usize,
    code: ErrorCode,
    work: Duration,
    honor_abort: bool,
    log_ok: bool,
    forever_fails: bool,
    transfer_fails: bool,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            ports: 8,
            code: ErrorCode::Ok,
            work: Duration::from_millis(10),
            honor_abort: false,
            log_ok: true,
            forever_fails: false,
            transfer_fails: false,
        }
    }
}

struct MockEngine {
    script: Script,
    rec: Recorder,
}

struct MockRole {
    script: Script,
    rec: Recorder,
}

impl MockRole {
    /// Pretend to transfer for `work`, stopping early if told to abort.
    async fn work(&self) -> anyhow::Result<TransferReport> {
        let start = Instant::now();
        while start.elapsed() < self.script.work {
            if self.script.honor_abort {
                if let Some(checker) = self.rec.checker() {
                    if checker.should_abort() {
                        return Ok(TransferReport::from_code(ErrorCode::Abort));
                    }
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        if self.script.transfer_fails {
            anyhow::bail!("engine failure");
        }
        Ok(TransferReport::new(TransferSummary::new(self.script.code, 1, 10)))
    }
}

impl TransferRole for MockRole {
    fn set_abort_checker(&mut self, checker: Arc<dyn AbortChecker>) {
        self.rec.push("set_abort_checker");
        *self.rec.checker.lock().unwrap() = Some(checker);
    }

    fn set_transfer_id(&mut self, id: &str) {
        self.rec.push(format!("set_transfer_id:{}", id));
    }

    fn set_protocol_version(&mut self, version: u32) {
        self.rec.push(format!("set_protocol_version:{}", version));
    }
}

#[async_trait]
impl SendRole for MockRole {
    fn set_include_regex(&mut self, pattern: &str) {
        self.rec.push(format!("include:{}", pattern));
    }

    fn set_exclude_regex(&mut self, pattern: &str) {
        self.rec.push(format!("exclude:{}", pattern));
    }

    fn set_prune_dir_regex(&mut self, pattern: &str) {
        self.rec.push(format!("prune:{}", pattern));
    }

    async fn transfer(&mut self) -> anyhow::Result<TransferReport> {
        self.rec.push("transfer");
        self.work().await
    }
}

#[async_trait]
impl ReceiveRole for MockRole {
    async fn register_ports(&mut self) -> usize {
        self.rec.push("register_ports");
        self.script.ports
    }

    async fn transfer_async(&mut self) -> anyhow::Result<()> {
        self.rec.push("transfer_async");
        Ok(())
    }

    async fn finish(&mut self) -> anyhow::Result<TransferReport> {
        self.rec.push("finish");
        self.work().await
    }

    async fn run_forever(&mut self) -> anyhow::Result<()> {
        self.rec.push("run_forever");
        if self.script.forever_fails {
            anyhow::bail!("listener died");
        }
        Ok(())
    }
}

impl TransferLog for MockRole {
    fn set_root_dir(&mut self, root: &Path) {
        self.rec.push(format!("set_root_dir:{}", root.display()));
    }

    fn parse_and_print(&mut self) -> bool {
        self.rec.push("parse_and_print");
        self.script.log_ok
    }
}

impl RoleFactory for MockEngine {
    type Sender = MockRole;
    type Receiver = MockRole;
    type Log = MockRole;

    fn sender(&self, spec: SenderSpec) -> MockRole {
        self.rec.push("new_sender");
        *self.rec.items.lock().unwrap() = spec.items;
        MockRole {
            script: self.script.clone(),
            rec: self.rec.clone(),
        }
    }

    fn receiver(&self, _spec: ReceiverSpec) -> MockRole {
        self.rec.push("new_receiver");
        MockRole {
            script: self.script.clone(),
            rec: self.rec.clone(),
        }
    }

    fn transfer_log(&self) -> MockRole {
        MockRole {
            script: self.script.clone(),
            rec: self.rec.clone(),
        }
    }
}

fn dispatcher(config: RunConfig, script: Script) -> (Dispatcher<MockEngine>, Recorder) {
    let rec = Recorder::default();
    let engine = MockEngine {
        script,
        rec: rec.clone(),
    };
    (Dispatcher::new(config, engine), rec)
}

fn receive_once() -> RunConfig {
    RunConfig {
        daemon: false,
        ..Default::default()
    }
}

fn send_to(host: &str) -> RunConfig {
    RunConfig {
        destination: host.to_string(),
        ..Default::default()
    }
}

// =============================================================================
// Receiver
// =============================================================================

#[tokio::test]
async fn test_no_ports_stops_before_transfer() {
    let (d, rec) = dispatcher(
        receive_once(),
        Script {
            ports: 0,
            ..Default::default()
        },
    );
    let outcome = d.run(&b""[..]).await.unwrap();
    assert_eq!(outcome, RunOutcome::NoPorts);
    assert_eq!(outcome.exit_status(), NO_PORTS_EXIT_STATUS);
    assert!(rec.called("register_ports"));
    assert!(!rec.called("transfer_async"));
    assert!(!rec.called("finish"));
    assert!(!rec.called("set_abort_checker"));
}

#[tokio::test]
async fn test_receive_once_forwards_error_code() {
    let (d, rec) = dispatcher(
        receive_once(),
        Script {
            code: ErrorCode::SocketReadError,
            ..Default::default()
        },
    );
    let outcome = d.run(&b""[..]).await.unwrap();
    assert_eq!(outcome, RunOutcome::Finished(ErrorCode::SocketReadError));
    assert_eq!(outcome.exit_status(), ErrorCode::SocketReadError as u8);

    let calls = rec.calls();
    let pos = |name: &str| calls.iter().position(|c| c == name).unwrap();
    assert!(pos("register_ports") < pos("transfer_async"));
    assert!(pos("transfer_async") < pos("finish"));
}

#[tokio::test]
async fn test_receive_forever_outcome_is_ok() {
    let (d, rec) = dispatcher(
        RunConfig::default(),
        Script {
            code: ErrorCode::ConnError,
            forever_fails: true,
            ..Default::default()
        },
    );
    let outcome = d.run(&b""[..]).await.unwrap();
    assert_eq!(outcome, RunOutcome::Finished(ErrorCode::Ok));
    assert!(rec.called("run_forever"));
    assert!(!rec.called("finish"));
}

#[tokio::test]
async fn test_protocol_version_and_id_applied() {
    let (d, rec) = dispatcher(
        RunConfig {
            transfer_id: "t-42".into(),
            protocol_version: 2,
            ..receive_once()
        },
        Script::default(),
    );
    d.run(&b""[..]).await.unwrap();
    assert!(rec.called("set_transfer_id:t-42"));
    assert!(rec.called("set_protocol_version:2"));

    let (d, rec) = dispatcher(receive_once(), Script::default());
    d.run(&b""[..]).await.unwrap();
    assert!(!rec.calls().iter().any(|c| c.starts_with("set_protocol_version")));
}

// =============================================================================
// Sender
// =============================================================================

#[tokio::test]
async fn test_send_forwards_error_code_and_patterns() {
    let (d, rec) = dispatcher(
        RunConfig {
            include_regex: ".*\\.dat".into(),
            exclude_regex: "tmp/.*".into(),
            prune_dir_regex: "cache".into(),
            ..send_to("peer")
        },
        Script {
            code: ErrorCode::ConnError,
            ..Default::default()
        },
    );
    let outcome = d.run(&b"ignored\n"[..]).await.unwrap();
    assert_eq!(outcome, RunOutcome::Finished(ErrorCode::ConnError));
    assert!(rec.called("include:.*\\.dat"));
    assert!(rec.called("exclude:tmp/.*"));
    assert!(rec.called("prune:cache"));
    // Without --files stdin is not consulted and the seed set is empty.
    assert!(rec.items.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_explicit_items_reach_sender_in_order() {
    let (d, rec) = dispatcher(
        RunConfig {
            explicit_files: true,
            ..send_to("peer")
        },
        Script::default(),
    );
    let outcome = d.run(&b"a.txt\t100\nb.txt\n"[..]).await.unwrap();
    assert_eq!(outcome, RunOutcome::Finished(ErrorCode::Ok));
    assert_eq!(
        *rec.items.lock().unwrap(),
        vec![
            TransferItem::new("a.txt", Some(100)),
            TransferItem::new("b.txt", None)
        ]
    );
}

#[tokio::test]
async fn test_malformed_items_abort_before_sender_exists() {
    let (d, rec) = dispatcher(
        RunConfig {
            explicit_files: true,
            ..send_to("peer")
        },
        Script::default(),
    );
    let err = d.run(&b"good\t1\nx\ty\tz\n"[..]).await.unwrap_err();
    assert!(matches!(err, LaunchError::ItemList(_)));
    assert!(!rec.called("new_sender"));
    assert!(!rec.called("transfer"));
}

// =============================================================================
// Watchdog wiring
// =============================================================================

#[tokio::test]
async fn test_fast_transfer_is_not_aborted() {
    let (d, rec) = dispatcher(
        RunConfig {
            abort_after_seconds: 1,
            ..send_to("peer")
        },
        Script {
            code: ErrorCode::Ok,
            work: Duration::from_millis(10),
            honor_abort: true,
            ..Default::default()
        },
    );
    let start = Instant::now();
    let outcome = d.run(&b""[..]).await.unwrap();
    assert_eq!(outcome, RunOutcome::Finished(ErrorCode::Ok));
    assert!(start.elapsed() < Duration::from_millis(900));

    let checker = rec.checker().expect("checker installed");
    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert!(!checker.should_abort());
}

#[tokio::test]
async fn test_slow_transfer_is_aborted() {
    let (d, rec) = dispatcher(
        RunConfig {
            abort_after_seconds: 1,
            ..receive_once()
        },
        Script {
            work: Duration::from_secs(10),
            honor_abort: true,
            ..Default::default()
        },
    );
    let start = Instant::now();
    let outcome = d.run(&b""[..]).await.unwrap();
    assert_eq!(outcome, RunOutcome::Finished(ErrorCode::Abort));
    assert!(start.elapsed() < Duration::from_secs(5));
    assert!(rec.checker().unwrap().should_abort());
}

#[tokio::test]
async fn test_engine_error_still_cancels_watchdog() {
    for config in [send_to("peer"), receive_once()] {
        let (d, rec) = dispatcher(
            RunConfig {
                abort_after_seconds: 1,
                ..config
            },
            Script {
                transfer_fails: true,
                ..Default::default()
            },
        );
        let outcome = d.run(&b""[..]).await.unwrap();
        assert_eq!(outcome, RunOutcome::Finished(ErrorCode::Error));

        let checker = rec.checker().expect("checker installed");
        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert!(!checker.should_abort());
    }
}

#[tokio::test]
async fn test_no_timeout_installs_no_checker() {
    for timeout in [0, -5] {
        let (d, rec) = dispatcher(
            RunConfig {
                abort_after_seconds: timeout,
                ..send_to("peer")
            },
            Script::default(),
        );
        d.run(&b""[..]).await.unwrap();
        assert!(rec.checker().is_none());
        assert!(rec.called("transfer"));
    }
}

// =============================================================================
// Log repair
// =============================================================================

#[tokio::test]
async fn test_log_repair_wins_over_other_flags() {
    let (d, rec) = dispatcher(
        RunConfig {
            parse_transfer_log: true,
            root: "/srv/data".into(),
            ..send_to("peer")
        },
        Script::default(),
    );
    let outcome = d.run(&b""[..]).await.unwrap();
    assert_eq!(outcome, RunOutcome::Finished(ErrorCode::Ok));
    assert!(rec.called("set_root_dir:/srv/data"));
    assert!(rec.called("parse_and_print"));
    assert!(!rec.called("new_sender"));
    assert!(!rec.called("new_receiver"));
}

#[tokio::test]
async fn test_log_repair_failure_is_generic_error() {
    let (d, _rec) = dispatcher(
        RunConfig {
            parse_transfer_log: true,
            ..Default::default()
        },
        Script {
            log_ok: false,
            ..Default::default()
        },
    );
    let outcome = d.run(&b""[..]).await.unwrap();
    assert_eq!(outcome, RunOutcome::Finished(ErrorCode::Error));
    assert_eq!(outcome.exit_status(), 1);
}
