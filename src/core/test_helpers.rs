//! Shared test utilities for core module tests
//!
//! Provides a recording [`MockRunner`] standing in for the native tools and
//! [`FragmentDir`] for building fragment directories on disk.
//! This module is only compiled in test mode.

use crate::command::{CommandOutput, CommandRunner, Executor, Invocation};
use crate::core::error::{Error, Result};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::{Arc, Mutex};

/// Mutex for tests that need exclusive access to environment variables.
pub static ENV_VAR_MUTEX: Mutex<()> = Mutex::new(());

#[derive(Debug, Clone)]
enum Reply {
    Ok(String),
    Fail(String),
}

#[derive(Debug, Default)]
struct MockState {
    calls: Vec<Invocation>,
    // (command line prefix, queued replies); the last reply repeats
    replies: Vec<(String, VecDeque<Reply>)>,
}

/// Recording [`CommandRunner`] with scripted replies.
///
/// Replies are matched by command-line prefix (`Invocation` display form).
/// Unmatched commands succeed with empty output. Clones share state, so a
/// test keeps one handle and boxes another into the [`Executor`].
#[derive(Debug, Clone, Default)]
pub struct MockRunner {
    state: Rc<RefCell<MockState>>,
}

impl MockRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a successful reply for commands starting with `prefix`.
    pub fn respond(&self, prefix: &str, stdout: &str) -> &Self {
        self.push(prefix, Reply::Ok(stdout.to_string()));
        self
    }

    /// Queues a failing reply for commands starting with `prefix`.
    pub fn fail(&self, prefix: &str, output: &str) -> &Self {
        self.push(prefix, Reply::Fail(output.to_string()));
        self
    }

    fn push(&self, prefix: &str, reply: Reply) {
        let mut state = self.state.borrow_mut();
        if let Some((_, queue)) = state.replies.iter_mut().find(|(p, _)| p == prefix) {
            queue.push_back(reply);
        } else {
            state
                .replies
                .push((prefix.to_string(), VecDeque::from([reply])));
        }
    }

    pub fn executor(&self) -> Executor {
        Executor::new(Box::new(self.clone()))
    }

    /// Every invocation seen so far
    pub fn calls(&self) -> Vec<Invocation> {
        self.state.borrow().calls.clone()
    }

    /// Command lines of every invocation seen so far
    pub fn command_lines(&self) -> Vec<String> {
        self.calls().iter().map(ToString::to_string).collect()
    }

    /// Invocations that change kernel state (anything that is not a dump)
    pub fn mutating_calls(&self) -> Vec<Invocation> {
        self.calls().into_iter().filter(|c| !is_query(c)).collect()
    }

    /// Command lines of the state-changing invocations
    pub fn mutation_lines(&self) -> Vec<String> {
        let calls = self.mutating_calls();
        calls.iter().map(ToString::to_string).collect()
    }
}

/// Returns true for read-only state dumps
pub fn is_query(inv: &Invocation) -> bool {
    inv.program.ends_with("-save")
        || inv.args.first().is_some_and(|a| a == "save")
        || inv.args.iter().any(|a| a == "show")
}

impl CommandRunner for MockRunner {
    fn run(&self, invocation: &Invocation) -> Result<CommandOutput> {
        let mut state = self.state.borrow_mut();
        state.calls.push(invocation.clone());

        let line = invocation.to_string();
        let reply = state
            .replies
            .iter_mut()
            .filter(|(prefix, _)| line.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, queue)| {
                if queue.len() > 1 {
                    queue.pop_front().unwrap()
                } else {
                    queue.front().cloned().unwrap()
                }
            });

        match reply {
            None => Ok(CommandOutput::default()),
            Some(Reply::Ok(stdout)) => Ok(CommandOutput::stdout(stdout)),
            Some(Reply::Fail(output)) => Err(Error::ExternalTool {
                command: line,
                exit_code: Some(2),
                output,
            }),
        }
    }
}

/// Temporary fragment directory tree
pub struct FragmentDir {
    root: tempfile::TempDir,
}

impl FragmentDir {
    pub fn new() -> Self {
        Self {
            root: tempfile::tempdir().unwrap(),
        }
    }

    /// Writes `contents` to `<root>/<sub>/<name>`, creating `sub`.
    pub fn file(&self, sub: &str, name: &str, contents: &str) -> &Self {
        let dir = self.root.path().join(sub);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(name), contents).unwrap();
        self
    }

    /// Creates an empty `<root>/<sub>`.
    pub fn empty_dir(&self, sub: &str) -> &Self {
        std::fs::create_dir_all(self.root.path().join(sub)).unwrap();
        self
    }

    pub fn root(&self) -> &Path {
        self.root.path()
    }

    pub fn sub(&self, sub: &str) -> PathBuf {
        self.root.path().join(sub)
    }
}

/// Log sink shared between the subscriber and the test
#[derive(Clone, Default)]
struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl std::io::Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Runs `f` under a thread-local subscriber and returns what it logged.
pub fn capture_logs(f: impl FnOnce()) -> String {
    let buffer = LogBuffer::default();
    let writer = buffer.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_ansi(false)
        .finish();
    tracing::subscriber::with_default(subscriber, f);

    let bytes = buffer.0.lock().unwrap().clone();
    String::from_utf8_lossy(&bytes).into_owned()
}
