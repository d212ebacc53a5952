//! In-memory test doubles for the deployment engine's collaborators.
//!
//! Available to this crate's unit tests and, through the `test-support` feature,
//! to downstream integration tests.

use crate::{
    command::{CommandError, CommandOutput, CommandRunner, CommandSpec},
    config::RepositoryConfig,
    docker::{ContainerDeployer, ContainerError},
    git::{SourceSync, SyncError},
    ssh::{Transport, TransportError},
};
use async_trait::async_trait;
use std::{
    collections::VecDeque,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc, Mutex,
    },
};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tokio::sync::{Notify, Semaphore};

/// `sha256=<hex>` signature of `body`, as GitHub sends it.
pub fn sign_sha256(secret: &str, body: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

// ============================================================================
// Scripted Command Runner
// ============================================================================

#[derive(Debug, Clone)]
enum Scripted {
    Output(CommandOutput),
    SpawnFailure,
}

#[derive(Debug)]
struct Rule {
    needle: String,
    responses: VecDeque<Scripted>,
}

/// [`CommandRunner`] that answers from a script instead of running processes.
///
/// Rules match when their needle is a substring of the command line; the most
/// recently added matching rule wins. Unmatched commands succeed with empty
/// output. Every invocation is recorded.
#[derive(Debug, Default)]
pub struct ScriptedCommandRunner {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<CommandSpec>>,
}

impl ScriptedCommandRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Always answer `output` for commands containing `needle`.
    pub fn on(&self, needle: &str, output: CommandOutput) -> &Self {
        self.on_sequence(needle, vec![output])
    }

    /// Answer each output in turn; the last one repeats.
    pub fn on_sequence(&self, needle: &str, outputs: Vec<CommandOutput>) -> &Self {
        self.push_rule(needle, outputs.into_iter().map(Scripted::Output).collect())
    }

    /// Commands containing `needle` fail to start.
    pub fn fail_to_spawn(&self, needle: &str) -> &Self {
        self.push_rule(needle, VecDeque::from([Scripted::SpawnFailure]))
    }

    fn push_rule(&self, needle: &str, responses: VecDeque<Scripted>) -> &Self {
        self.rules.lock().unwrap().push(Rule {
            needle: needle.to_string(),
            responses,
        });
        self
    }

    /// Command lines in invocation order.
    pub fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(CommandSpec::command_line)
            .collect()
    }

    pub fn specs(&self) -> Vec<CommandSpec> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, needle: &str) -> usize {
        self.calls().iter().filter(|c| c.contains(needle)).count()
    }

    pub fn position(&self, needle: &str) -> Option<usize> {
        self.calls().iter().position(|c| c.contains(needle))
    }
}

#[async_trait]
impl CommandRunner for ScriptedCommandRunner {
    async fn run(&self, command: &CommandSpec) -> Result<CommandOutput, CommandError> {
        self.calls.lock().unwrap().push(command.clone());
        let line = command.command_line();

        let scripted = {
            let mut rules = self.rules.lock().unwrap();
            rules
                .iter_mut()
                .rev()
                .find(|rule| line.contains(&rule.needle))
                .and_then(|rule| {
                    if rule.responses.len() > 1 {
                        rule.responses.pop_front()
                    } else {
                        rule.responses.front().cloned()
                    }
                })
        };

        match scripted {
            Some(Scripted::Output(output)) => Ok(output),
            Some(Scripted::SpawnFailure) => Err(CommandError::Spawn {
                program: command.program.clone(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "scripted spawn failure"),
            }),
            None => Ok(CommandOutput::success("")),
        }
    }
}

// ============================================================================
// Fake Transport
// ============================================================================

/// [`Transport`] with scripted readiness and connectivity results.
#[derive(Debug)]
pub struct FakeTransport {
    ready: AtomicBool,
    failures_remaining: AtomicU32,
    test_calls: AtomicU32,
}

impl FakeTransport {
    pub fn ready() -> Self {
        Self {
            ready: AtomicBool::new(true),
            failures_remaining: AtomicU32::new(0),
            test_calls: AtomicU32::new(0),
        }
    }

    pub fn not_ready() -> Self {
        let transport = Self::ready();
        transport.ready.store(false, Ordering::SeqCst);
        transport
    }

    /// The next `count` connectivity tests fail.
    pub fn failing_tests(self, count: u32) -> Self {
        self.failures_remaining.store(count, Ordering::SeqCst);
        self
    }

    pub fn test_calls(&self) -> u32 {
        self.test_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for FakeTransport {
    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    fn git_environment(&self) -> Vec<(String, String)> {
        vec![(
            "GIT_SSH_COMMAND".to_string(),
            "ssh -i /fake/id_rsa".to_string(),
        )]
    }

    async fn test_connection(&self) -> Result<(), TransportError> {
        self.test_calls.fetch_add(1, Ordering::SeqCst);
        if !self.is_ready() {
            return Err(TransportError::NotReady);
        }
        let remaining = self.failures_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_remaining.store(remaining - 1, Ordering::SeqCst);
            return Err(TransportError::ConnectionFailed {
                output: "ssh: connect to host github.com port 22: Connection timed out".to_string(),
            });
        }
        Ok(())
    }
}

// ============================================================================
// Fake Source Sync
// ============================================================================

/// [`SourceSync`] that materializes a working copy on disk without `git`.
#[derive(Debug)]
pub struct FakeSourceSync {
    compose_contents: Mutex<String>,
    fail_with: Mutex<Option<String>>,
    setups: Mutex<Vec<PathBuf>>,
    existing: Mutex<Vec<bool>>,
    cleanups: Mutex<Vec<PathBuf>>,
}

impl Default for FakeSourceSync {
    fn default() -> Self {
        Self {
            compose_contents: Mutex::new("services:\n  web:\n    image: nginx\n".to_string()),
            fail_with: Mutex::new(None),
            setups: Mutex::new(Vec::new()),
            existing: Mutex::new(Vec::new()),
            cleanups: Mutex::new(Vec::new()),
        }
    }
}

impl FakeSourceSync {
    pub fn new() -> Self {
        Self::default()
    }

    /// Written to the compose file on every setup; empty means "empty file".
    pub fn with_compose_contents(self, contents: &str) -> Self {
        *self.compose_contents.lock().unwrap() = contents.to_string();
        self
    }

    pub fn fail_with(&self, output: &str) {
        *self.fail_with.lock().unwrap() = Some(output.to_string());
    }

    pub fn setups(&self) -> Vec<PathBuf> {
        self.setups.lock().unwrap().clone()
    }

    /// For each setup, whether a working copy was already checked out.
    pub fn setup_found_existing(&self) -> Vec<bool> {
        self.existing.lock().unwrap().clone()
    }

    pub fn cleanups(&self) -> Vec<PathBuf> {
        self.cleanups.lock().unwrap().clone()
    }
}

#[async_trait]
impl SourceSync for FakeSourceSync {
    async fn setup_repository(
        &self,
        repo: &RepositoryConfig,
        _branch: &str,
        path: &Path,
    ) -> Result<(), SyncError> {
        self.setups.lock().unwrap().push(path.to_path_buf());
        self.existing.lock().unwrap().push(path.join(".git").is_dir());

        if let Some(output) = self.fail_with.lock().unwrap().clone() {
            return Err(SyncError::CloneFailed { output });
        }

        let io = |source| SyncError::Io {
            path: path.to_path_buf(),
            source,
        };
        std::fs::create_dir_all(path.join(".git")).map_err(io)?;
        let contents = self.compose_contents.lock().unwrap().clone();
        std::fs::write(path.join(&repo.compose_file), contents).map_err(io)?;
        Ok(())
    }

    async fn cleanup(&self, path: &Path) -> Result<(), SyncError> {
        self.cleanups.lock().unwrap().push(path.to_path_buf());
        if path.exists() {
            std::fs::remove_dir_all(path).map_err(|source| SyncError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        }
        Ok(())
    }

    async fn head_commit(&self, _path: &Path) -> Result<String, SyncError> {
        Ok("0123456789abcdef0123456789abcdef01234567".to_string())
    }
}

// ============================================================================
// Fake Container Deployer
// ============================================================================

/// [`ContainerDeployer`] recording calls, optionally held until released.
#[derive(Debug)]
pub struct FakeContainerDeployer {
    services: Vec<String>,
    fail_with: Mutex<Option<String>>,
    deployments: Mutex<Vec<(String, String, PathBuf)>>,
    cleanups: AtomicU32,
    gate: Option<Arc<Semaphore>>,
    entered: Arc<Notify>,
    panic_on_deploy: AtomicBool,
}

impl Default for FakeContainerDeployer {
    fn default() -> Self {
        Self {
            services: vec!["web".to_string()],
            fail_with: Mutex::new(None),
            deployments: Mutex::new(Vec::new()),
            cleanups: AtomicU32::new(0),
            gate: None,
            entered: Arc::new(Notify::new()),
            panic_on_deploy: AtomicBool::new(false),
        }
    }
}

impl FakeContainerDeployer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deployments block until [`FakeContainerDeployer::release`] is called.
    pub fn gated() -> Self {
        Self {
            gate: Some(Arc::new(Semaphore::new(0))),
            ..Self::default()
        }
    }

    pub fn release(&self, deployments: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(deployments);
        }
    }

    /// Resolves once a deployment has started.
    pub async fn wait_until_entered(&self) {
        self.entered.notified().await;
    }

    pub fn fail_with(&self, output: &str) {
        *self.fail_with.lock().unwrap() = Some(output.to_string());
    }

    pub fn panic_on_deploy(&self) {
        self.panic_on_deploy.store(true, Ordering::SeqCst);
    }

    pub fn deployments(&self) -> Vec<(String, String, PathBuf)> {
        self.deployments.lock().unwrap().clone()
    }

    pub fn cleanup_count(&self) -> u32 {
        self.cleanups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ContainerDeployer for FakeContainerDeployer {
    async fn deploy(
        &self,
        repo: &RepositoryConfig,
        branch: &str,
        working_copy: &Path,
    ) -> Result<Vec<String>, ContainerError> {
        self.deployments.lock().unwrap().push((
            repo.name.clone(),
            branch.to_string(),
            working_copy.to_path_buf(),
        ));
        self.entered.notify_one();

        if let Some(gate) = &self.gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }

        if self.panic_on_deploy.load(Ordering::SeqCst) {
            panic!("container runtime exploded");
        }

        if let Some(output) = self.fail_with.lock().unwrap().clone() {
            return Err(ContainerError::ComposeUpFailed { output });
        }
        Ok(self.services.clone())
    }

    async fn cleanup(&self) {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
    }
}
