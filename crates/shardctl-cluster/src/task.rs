//! Small composable jobs with explicit outcomes.
//!
//! A [`Task`] wraps one async action, or a sequence or parallel group of
//! child tasks. Running it never fails: the result is a [`TaskReport`]
//! carrying either the value or the error, and, on failure, the report of
//! the task's guard if one was attached.
//!
//! ```text
//! create(3 primaries) ✓
//!   addslots(0-5460) ✓
//!   meet(10.0.0.2:7000) ✗ => reset(10.0.0.2:7000) ✓
//!   wait(previous task failed) ✗
//! ```

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use tokio::task::JoinSet;

pub type PinFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

type Action = Box<dyn FnOnce() -> PinFuture<Result<String, String>> + Send>;

enum Kind {
    Action(Action),
    Sequence(Vec<Task>),
    Parallel(Vec<Task>),
}

pub struct Task {
    name: String,
    kind: Kind,
    guard: Option<Box<Task>>,
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.kind {
            Kind::Action(_) => "action",
            Kind::Sequence(_) => "sequence",
            Kind::Parallel(_) => "parallel",
        };
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("kind", &kind)
            .field("guarded", &self.guard.is_some())
            .finish()
    }
}

impl Task {
    /// A task running `action` once. The value and error are kept as their
    /// display strings.
    pub fn new<F, Fut, T, E>(name: impl Into<String>, action: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: fmt::Display,
        E: fmt::Display,
    {
        let action: Action = Box::new(move || {
            let fut: PinFuture<Result<String, String>> = Box::pin(async move {
                action()
                    .await
                    .map(|v| v.to_string())
                    .map_err(|e| e.to_string())
            });
            fut
        });
        Self {
            name: name.into(),
            kind: Kind::Action(action),
            guard: None,
        }
    }

    /// Runs `tasks` in order, stopping at the first failure. Tasks after
    /// the failure are reported as not run.
    pub fn sequence(name: impl Into<String>, tasks: Vec<Task>) -> Self {
        Self {
            name: name.into(),
            kind: Kind::Sequence(tasks),
            guard: None,
        }
    }

    /// Runs `tasks` concurrently. Reports keep the input order.
    pub fn parallel(name: impl Into<String>, tasks: Vec<Task>) -> Self {
        Self {
            name: name.into(),
            kind: Kind::Parallel(tasks),
            guard: None,
        }
    }

    /// Attaches a compensating task run only if this one fails.
    pub fn with_guard(mut self, guard: Task) -> Self {
        self.guard = Some(Box::new(guard));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn run(self) -> PinFuture<TaskReport> {
        Box::pin(async move {
            let (outcome, children) = match self.kind {
                Kind::Action(action) => (action().await, Vec::new()),
                Kind::Sequence(tasks) => run_sequence(tasks).await,
                Kind::Parallel(tasks) => run_parallel(tasks).await,
            };
            let guard = match (&outcome, self.guard) {
                (Err(_), Some(guard)) => Some(Box::new(guard.run().await)),
                _ => None,
            };
            TaskReport {
                name: self.name,
                outcome,
                guard,
                children,
            }
        })
    }

    fn skipped(self) -> TaskReport {
        TaskReport {
            name: self.name,
            outcome: Err(PREVIOUS_FAILED.to_owned()),
            guard: None,
            children: Vec::new(),
        }
    }
}

const PREVIOUS_FAILED: &str = "previous task failed";

async fn run_sequence(tasks: Vec<Task>) -> (Result<String, String>, Vec<TaskReport>) {
    let total = tasks.len();
    let mut reports = Vec::with_capacity(total);
    let mut failure: Option<String> = None;
    for task in tasks {
        if failure.is_some() {
            reports.push(task.skipped());
            continue;
        }
        let report = task.run().await;
        if let Err(e) = &report.outcome {
            failure = Some(format!("{}: {e}", report.name));
        }
        reports.push(report);
    }
    let outcome = match failure {
        Some(e) => Err(e),
        None => Ok(format!("{total} done")),
    };
    (outcome, reports)
}

async fn run_parallel(tasks: Vec<Task>) -> (Result<String, String>, Vec<TaskReport>) {
    let names: Vec<String> = tasks.iter().map(|t| t.name.clone()).collect();
    let mut set = JoinSet::new();
    for (i, task) in tasks.into_iter().enumerate() {
        set.spawn(async move { (i, task.run().await) });
    }

    let mut slots: Vec<Option<TaskReport>> = names.iter().map(|_| None).collect();
    while let Some(joined) = set.join_next().await {
        if let Ok((i, report)) = joined {
            slots[i] = Some(report);
        }
    }

    let reports: Vec<TaskReport> = slots
        .into_iter()
        .zip(names)
        .map(|(report, name)| {
            report.unwrap_or(TaskReport {
                name,
                outcome: Err("task panicked".to_owned()),
                guard: None,
                children: Vec::new(),
            })
        })
        .collect();

    let failed = reports.iter().filter(|r| !r.is_ok()).count();
    let outcome = if failed == 0 {
        Ok(format!("{} done", reports.len()))
    } else {
        Err(format!("{failed} of {} failed", reports.len()))
    };
    (outcome, reports)
}

/// Outcome of running a [`Task`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskReport {
    pub name: String,
    pub outcome: Result<String, String>,
    /// Report of the guard, run because this task failed.
    pub guard: Option<Box<TaskReport>>,
    pub children: Vec<TaskReport>,
}

impl TaskReport {
    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }

    /// The first failed leaf, depth first.
    pub fn first_failure(&self) -> Option<&TaskReport> {
        if self.is_ok() {
            return None;
        }
        self.children
            .iter()
            .find_map(TaskReport::first_failure)
            .or(Some(self))
    }

    /// The report and its children, indented two spaces per level.
    pub fn tree(&self) -> String {
        let mut out = String::new();
        self.write_tree(&mut out, 0);
        out
    }

    fn write_tree(&self, out: &mut String, depth: usize) {
        out.push_str(&"  ".repeat(depth));
        out.push_str(&self.to_string());
        out.push('\n');
        for child in &self.children {
            child.write_tree(out, depth + 1);
        }
    }
}

impl fmt::Display for TaskReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.outcome, &self.guard) {
            (Ok(value), _) => write!(f, "{}({value}) ✓", self.name),
            (Err(error), Some(guard)) => write!(f, "{}({error}) ✗ => {guard}", self.name),
            (Err(error), None) => write!(f, "{}({error}) ✗", self.name),
        }
    }
}
