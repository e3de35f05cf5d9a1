//! Concurrent supervision of a batch of sibling child processes.
//!
//! A batch is checked up front (non-empty, unique names, remote state
//! matching the [`SpawnMode`]), then every child runs at once under a
//! [`SupervisionScope`]. The batch always settles completely: one child's
//! failure never cancels its siblings.

use futures::future::join_all;
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

use crate::errors::OrchestratorError;
use crate::event::EventSink;
use crate::inbox::InboundMessage;
use crate::persistence::Persistence;
use crate::supervisor::{ActiveWriters, ChildInvocation, ChildOutcome, ChildProgram, LiveProcesses, supervise};

/// Exit status after a termination signal.
pub const SIGNAL_EXIT_CODE: i32 = 130;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnMode {
    /// Fresh children; their repositories must not exist yet.
    New,
    /// Existing children; their repositories must exist.
    Amend,
    /// Children whose earlier attempt never published; local state is wiped.
    Respawn,
}

/// Owns the live child processes of one batch.
///
/// While the scope lives, SIGINT, SIGTERM and SIGHUP terminate every live
/// child process group, kill the process-wide groups in `process`, and exit
/// the process. Dropping the scope terminates whatever of its own is still
/// running.
pub struct SupervisionScope {
    live: LiveProcesses,
    watcher: JoinHandle<()>,
}

impl SupervisionScope {
    pub fn new(process: LiveProcesses) -> Self {
        let live = LiveProcesses::new();
        let watcher = tokio::spawn(watch_signals(live.clone(), process));
        Self { live, watcher }
    }

    pub fn live(&self) -> LiveProcesses {
        self.live.clone()
    }
}

impl Drop for SupervisionScope {
    fn drop(&mut self) {
        self.watcher.abort();
        self.live.terminate_all();
    }
}

async fn watch_signals(live: LiveProcesses, process: LiveProcesses) {
    let received = shutdown_signal().await;
    warn!(signal = received, "terminating child processes");
    process.kill_all();
    live.terminate_all();
    std::process::exit(SIGNAL_EXIT_CODE);
}

/// Resolve on the first SIGINT, SIGTERM or SIGHUP, naming it. Never
/// resolves if the handlers cannot be installed.
#[cfg(unix)]
pub async fn shutdown_signal() -> &'static str {
    use tokio::signal::unix::{SignalKind, signal};

    let (Ok(mut interrupt), Ok(mut terminate), Ok(mut hangup)) = (
        signal(SignalKind::interrupt()),
        signal(SignalKind::terminate()),
        signal(SignalKind::hangup()),
    ) else {
        warn!("could not install signal handlers");
        return std::future::pending().await;
    };
    tokio::select! {
        _ = interrupt.recv() => "SIGINT",
        _ = terminate.recv() => "SIGTERM",
        _ = hangup.recv() => "SIGHUP",
    }
}

#[cfg(not(unix))]
pub async fn shutdown_signal() -> &'static str {
    match tokio::signal::ctrl_c().await {
        Ok(()) => "ctrl-c",
        Err(_) => std::future::pending().await,
    }
}

/// Reject empty batches and duplicate names.
pub fn check_batch(invocations: &[ChildInvocation]) -> Result<(), OrchestratorError> {
    if invocations.is_empty() {
        return Err(OrchestratorError::InvalidBatch(
            "batch is empty: nothing to spawn".to_string(),
        ));
    }
    let mut seen = std::collections::HashSet::new();
    for invocation in invocations {
        if !seen.insert(invocation.name.as_str()) {
            return Err(OrchestratorError::InvalidBatch(format!(
                "duplicate child name '{}'",
                invocation.name
            )));
        }
    }
    Ok(())
}

pub struct Spawner {
    program: ChildProgram,
    persistence: Persistence,
    events: EventSink,
    writers: ActiveWriters,
    process: LiveProcesses,
}

impl Spawner {
    pub fn new(program: ChildProgram, persistence: Persistence, events: EventSink) -> Self {
        Self {
            program,
            persistence,
            events,
            writers: ActiveWriters::default(),
            process: LiveProcesses::new(),
        }
    }

    /// Register running children in `writers`, where [`spawn_relay`]
    /// finds them.
    pub fn with_writers(mut self, writers: ActiveWriters) -> Self {
        self.writers = writers;
        self
    }

    /// Process groups outside any batch (the agent's) that a termination
    /// signal during the batch must also kill.
    pub fn with_process_groups(mut self, process: LiveProcesses) -> Self {
        self.process = process;
        self
    }

    /// Run every invocation concurrently and return the outcomes in
    /// declaration order. Nothing is wiped or spawned unless every
    /// invocation passes its checks.
    #[instrument(skip_all, fields(mode = ?mode, children = invocations.len()))]
    pub async fn spawn_batch(
        &self,
        mode: SpawnMode,
        invocations: Vec<ChildInvocation>,
    ) -> Result<Vec<ChildOutcome>, OrchestratorError> {
        check_batch(&invocations)?;
        for invocation in &invocations {
            self.check_mode(mode, &invocation.name, &invocation.dir).await?;
        }
        if mode == SpawnMode::Respawn {
            for invocation in &invocations {
                wipe_stale(&invocation.name, &invocation.dir)?;
            }
        }

        let names: Vec<&str> = invocations.iter().map(|i| i.name.as_str()).collect();
        info!(children = ?names, "spawning batch");
        self.events.log(format!("spawning {}", names.join(", ")));

        let scope = SupervisionScope::new(self.process.clone());
        let outcomes = join_all(invocations.into_iter().map(|invocation| {
            supervise(
                &self.program,
                invocation,
                self.writers.clone(),
                self.events.clone(),
                scope.live(),
            )
        }))
        .await;
        drop(scope);

        let failed = outcomes.iter().filter(|o| !o.is_success()).count();
        info!(total = outcomes.len(), failed, "batch settled");
        Ok(outcomes)
    }

    async fn check_mode(&self, mode: SpawnMode, name: &str, dir: &Path) -> Result<(), OrchestratorError> {
        let remote = self.persistence.remote();
        match mode {
            SpawnMode::New => {
                if remote.repository_exists(name).await? {
                    return Err(OrchestratorError::InvalidBatch(format!(
                        "repository '{}' already exists",
                        name
                    )));
                }
            }
            SpawnMode::Amend => {
                if !remote.repository_exists(name).await? {
                    return Err(OrchestratorError::InvalidBatch(format!(
                        "repository '{}' does not exist",
                        name
                    )));
                }
            }
            SpawnMode::Respawn => {
                if self.persistence.published(dir).await?.is_some() {
                    return Err(OrchestratorError::InvalidBatch(format!(
                        "'{}' is already published",
                        name
                    )));
                }
            }
        }
        Ok(())
    }
}

fn wipe_stale(name: &str, dir: &Path) -> Result<(), OrchestratorError> {
    if dir.exists() {
        warn!(child = %name, dir = %dir.display(), "wiping stale child directory");
        std::fs::remove_dir_all(dir)
            .map_err(|e| anyhow::anyhow!("Failed to remove {}: {}", dir.display(), e))?;
    }
    Ok(())
}

/// Forward operator messages to running children until `inbound` closes.
/// Each message goes to the deepest running child whose path is a prefix of
/// the message's path, re-addressed relative to that child.
pub fn spawn_relay(
    mut inbound: mpsc::UnboundedReceiver<InboundMessage>,
    writers: ActiveWriters,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(message) = inbound.recv().await {
            relay_message(&writers, message).await;
        }
    })
}

async fn relay_message(writers: &ActiveWriters, message: InboundMessage) {
    let mut writers = writers.lock().await;
    let target = writers
        .keys()
        .filter_map(|key| message.below(key).map(|forwarded| (key.clone(), forwarded)))
        .max_by_key(|(key, _)| key.len());
    let Some((child, forwarded)) = target else {
        warn!(path = %message.path, "no running child for operator message");
        return;
    };
    let Some(stdin) = writers.get_mut(&child) else {
        return;
    };
    let line = format!("{}\n", forwarded.to_line());
    if let Err(err) = stdin.write_all(line.as_bytes()).await {
        warn!(%child, %err, "failed to forward operator message");
        return;
    }
    let _ = stdin.flush().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::FunctionType;
    use crate::event::AgentEvent;
    use crate::params::GenerationParameters;
    use crate::remote::{LocalRemote, RemoteHost};
    use crate::supervisor::ChildCommand;
    use crate::tracker::CommitAuthor;
    use serde_json::json;
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::{TempDir, tempdir};

    struct Fixture {
        work: TempDir,
        _remote_root: TempDir,
        remote: Arc<LocalRemote>,
        persistence: Persistence,
    }

    fn fixture() -> Fixture {
        let work = tempdir().unwrap();
        let remote_root = tempdir().unwrap();
        let remote = Arc::new(LocalRemote::new(remote_root.path(), "local"));
        let persistence = Persistence::new(remote.clone(), CommitAuthor::default());
        Fixture {
            work,
            _remote_root: remote_root,
            remote,
            persistence,
        }
    }

    impl Fixture {
        fn dir(&self, name: &str) -> PathBuf {
            self.work.path().join(name)
        }

        fn invocation(&self, name: &str) -> ChildInvocation {
            ChildInvocation {
                name: name.to_string(),
                dir: self.dir(name),
                command: ChildCommand::Create {
                    parameters: GenerationParameters::new(0, 1, 1, 1, 1),
                    function_type: FunctionType::Scalar,
                    spec: "spec".to_string(),
                    input_schema: json!({"type": "object"}),
                },
            }
        }

        fn spawner(&self, script: &str, events: EventSink) -> Spawner {
            let program = ChildProgram::new("sh").with_base_args(["-c", script, "child"]);
            Spawner::new(program, self.persistence.clone(), events)
        }
    }

    #[tokio::test]
    async fn test_empty_batch_is_rejected() {
        let f = fixture();
        let err = f
            .spawner("exit 0", EventSink::detached())
            .spawn_batch(SpawnMode::New, Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidBatch(ref m) if m.contains("empty")));
    }

    #[tokio::test]
    async fn test_duplicate_names_spawn_nothing() {
        let f = fixture();
        let (events, mut rx) = EventSink::channel();
        let spawner = f.spawner("touch spawned", events);
        let err = spawner
            .spawn_batch(SpawnMode::New, vec![f.invocation("a"), f.invocation("a")])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("duplicate child name 'a'"));
        drop(spawner);
        assert!(rx.recv().await.is_none());
        assert!(!f.dir("a").exists());
    }

    #[tokio::test]
    async fn test_new_and_amend_check_the_remote() {
        let f = fixture();
        f.remote.create_repository("existing", None).await.unwrap();
        let spawner = f.spawner("exit 1", EventSink::detached());

        let err = spawner
            .spawn_batch(SpawnMode::New, vec![f.invocation("existing")])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("already exists"));

        let err = spawner
            .spawn_batch(SpawnMode::Amend, vec![f.invocation("missing")])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("does not exist"));

        let outcomes = spawner
            .spawn_batch(SpawnMode::Amend, vec![f.invocation("existing")])
            .await
            .unwrap();
        assert_eq!(outcomes.len(), 1);
    }

    #[tokio::test]
    async fn test_respawn_wipes_stale_directory() {
        let f = fixture();
        std::fs::create_dir_all(f.dir("stale")).unwrap();
        std::fs::write(f.dir("stale").join("leftover"), "x").unwrap();

        f.spawner("exit 1", EventSink::detached())
            .spawn_batch(SpawnMode::Respawn, vec![f.invocation("stale")])
            .await
            .unwrap();

        assert!(f.dir("stale").exists());
        assert!(!f.dir("stale").join("leftover").exists());
    }

    #[tokio::test]
    async fn test_respawn_refuses_published_children() {
        let f = fixture();
        std::fs::create_dir_all(f.dir("done")).unwrap();
        std::fs::write(f.dir("done").join("artifact.json"), "{}").unwrap();
        f.persistence
            .commit_and_push(&f.dir("done"), "done", "init")
            .await
            .unwrap();
        // Uncommitted edits do not make a pushed child stale.
        std::fs::write(f.dir("done").join("NOTES.md"), "draft").unwrap();

        let err = f
            .spawner("exit 1", EventSink::detached())
            .spawn_batch(SpawnMode::Respawn, vec![f.invocation("done")])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("already published"));
        assert!(f.dir("done").join("artifact.json").exists());
        assert!(f.dir("done").join("NOTES.md").exists());
    }

    #[tokio::test]
    async fn test_rejected_respawn_batch_wipes_nothing() {
        let f = fixture();
        std::fs::create_dir_all(f.dir("stale")).unwrap();
        std::fs::write(f.dir("stale").join("leftover"), "x").unwrap();
        std::fs::create_dir_all(f.dir("done")).unwrap();
        std::fs::write(f.dir("done").join("artifact.json"), "{}").unwrap();
        f.persistence
            .commit_and_push(&f.dir("done"), "done", "init")
            .await
            .unwrap();

        let err = f
            .spawner("exit 1", EventSink::detached())
            .spawn_batch(
                SpawnMode::Respawn,
                vec![f.invocation("stale"), f.invocation("done")],
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("'done'"));
        assert!(f.dir("stale").join("leftover").exists());
    }

    #[tokio::test]
    async fn test_outcomes_keep_declaration_order() {
        let f = fixture();
        let (events, mut rx) = EventSink::channel();
        let script = "if [ \"$(basename \"$PWD\")\" = slow ]; then sleep 0.3; fi; \
                      echo \"failed in $(basename \"$PWD\")\" >&2; exit 2";
        let spawner = f.spawner(script, events);
        let outcomes = spawner
            .spawn_batch(SpawnMode::New, vec![f.invocation("slow"), f.invocation("fast")])
            .await
            .unwrap();
        drop(spawner);

        let names: Vec<&str> = outcomes.iter().map(ChildOutcome::name).collect();
        assert_eq!(names, vec!["slow", "fast"]);
        match &outcomes[0] {
            ChildOutcome::Failure { error, .. } => assert!(error.contains("failed in slow")),
            other => panic!("unexpected outcome: {:?}", other),
        }

        let mut done_order = Vec::new();
        while let Some(event) = rx.recv().await {
            if let AgentEvent::Done { path } = event {
                done_order.push(path);
            }
        }
        assert_eq!(done_order, vec!["fast".to_string(), "slow".to_string()]);
    }

    #[tokio::test]
    async fn test_relay_routes_to_deepest_running_child() {
        let writers = ActiveWriters::default();
        let (tx, rx) = mpsc::unbounded_channel();
        let relay = spawn_relay(rx, writers.clone());
        let f = fixture();

        // "kid/gk" runs below an in-process subtree, next to "kid" itself.
        let kid = f
            .spawner("read line; echo \"$line\" >&2; exit 1", EventSink::detached())
            .with_writers(writers.clone());
        let gk = f
            .spawner("read line; echo \"$line\" >&2; exit 1", EventSink::detached().scoped("kid"))
            .with_writers(writers.clone());
        let mut gk_invocation = f.invocation("gk");
        gk_invocation.dir = f.dir("gk-dir");

        let send = async {
            for _ in 0..100 {
                if writers.lock().await.len() == 2 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            for (path, message) in [("kid/gk/leaf", "deep"), ("kid/other", "shallow")] {
                tx.send(InboundMessage {
                    path: path.to_string(),
                    message: message.to_string(),
                })
                .unwrap();
            }
        };
        let (kid_outcomes, gk_outcomes, ()) = tokio::join!(
            kid.spawn_batch(SpawnMode::New, vec![f.invocation("kid")]),
            gk.spawn_batch(SpawnMode::New, vec![gk_invocation]),
            send,
        );

        let error = |outcomes: Vec<ChildOutcome>| match outcomes.into_iter().next() {
            Some(ChildOutcome::Failure { error, .. }) => error,
            other => panic!("unexpected outcome: {:?}", other),
        };
        let gk_error = error(gk_outcomes.unwrap());
        assert!(gk_error.contains("\"path\":\"leaf\""), "{}", gk_error);
        assert!(gk_error.contains("deep"));
        let kid_error = error(kid_outcomes.unwrap());
        assert!(kid_error.contains("\"path\":\"other\""), "{}", kid_error);
        assert!(kid_error.contains("shallow"));

        drop(tx);
        relay.await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_batches_do_not_wait_for_each_other() {
        let f = fixture();
        let (_tx, rx) = mpsc::unbounded_channel();
        let writers = ActiveWriters::default();
        let _relay = spawn_relay(rx, writers.clone());
        let one = f.spawner("sleep 1; exit 1", EventSink::detached()).with_writers(writers.clone());
        let two = f.spawner("sleep 1; exit 1", EventSink::detached()).with_writers(writers);

        let started = std::time::Instant::now();
        let (a, b) = tokio::join!(
            one.spawn_batch(SpawnMode::New, vec![f.invocation("one")]),
            two.spawn_batch(SpawnMode::New, vec![f.invocation("two")]),
        );
        assert!(a.is_ok() && b.is_ok());
        assert!(started.elapsed() < Duration::from_millis(1800), "{:?}", started.elapsed());
    }

    #[cfg(target_os = "linux")]
    fn is_alive(pid: u32) -> bool {
        match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            Err(_) => false,
            Ok(stat) => {
                let state = stat
                    .rsplit_once(')')
                    .and_then(|(_, rest)| rest.trim_start().chars().next());
                !matches!(state, Some('Z') | Some('X'))
            }
        }
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_cancelling_batch_kills_process_groups() {
        let f = fixture();
        let script = "sleep 30 & echo $! > grandchild.pid; echo $$ > child.pid; wait";
        let spawner = f.spawner(script, EventSink::detached());
        let invocations = vec![f.invocation("one"), f.invocation("two")];
        let handle = tokio::spawn(async move { spawner.spawn_batch(SpawnMode::New, invocations).await });

        let mut pids = Vec::new();
        for _ in 0..200 {
            pids = ["one", "two"]
                .iter()
                .flat_map(|name| ["child.pid", "grandchild.pid"].map(|file| f.dir(name).join(file)))
                .filter_map(|path| std::fs::read_to_string(path).ok())
                .filter_map(|pid| pid.trim().parse::<u32>().ok())
                .collect();
            if pids.len() == 4 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        assert_eq!(pids.len(), 4, "children did not start");
        assert!(pids.iter().all(|pid| is_alive(*pid)));

        handle.abort();
        let _ = handle.await;

        for _ in 0..100 {
            if pids.iter().all(|pid| !is_alive(*pid)) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        for pid in pids {
            assert!(!is_alive(pid), "process {} survived cancellation", pid);
        }
    }
}
