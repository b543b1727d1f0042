//! Periodic upload of the CSV logs: `git add`, `git commit`, `git push`.
//!
//! `add` and `commit` run under the same file lock the row writer takes, so a
//! commit never captures a partial line. The push runs after the lock is
//! released. A failed sync is logged and retried at the next interval.

use std::path::{Path, PathBuf};
use std::process::Output;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Committed,
    /// Nothing changed since the last commit; the push still ran.
    NothingToCommit,
}

pub struct Uploader {
    repo_dir: PathBuf,
    remote: String,
    branch: String,
    files: Vec<PathBuf>,
    lock: Arc<Mutex<()>>,
}

impl Uploader {
    pub fn new(
        repo_dir: impl Into<PathBuf>,
        remote: impl Into<String>,
        branch: impl Into<String>,
        files: Vec<PathBuf>,
        lock: Arc<Mutex<()>>,
    ) -> Result<Self> {
        // `git -C` resolves relative paths against the repo, not our cwd.
        let files = files
            .iter()
            .map(|f| std::path::absolute(f).with_context(|| format!("bad log path {}", f.display())))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            repo_dir: repo_dir.into(),
            remote: remote.into(),
            branch: branch.into(),
            files,
            lock,
        })
    }

    pub async fn sync_once(&self, now: OffsetDateTime) -> Result<SyncOutcome> {
        let stamp = now.format(&Rfc3339).context("failed to format sync timestamp")?;
        let message = format!("data: sync {stamp}");

        let outcome = {
            let _guard = self.lock.lock().await;

            let mut add = vec!["add".to_string(), "--".to_string()];
            add.extend(self.files.iter().map(|f| f.display().to_string()));
            let out = self.git(add.as_slice()).await?;
            check(&out, "git add")?;

            let out = self.git(&["commit", "-m", message.as_str()]).await?;
            if out.status.success() {
                SyncOutcome::Committed
            } else if nothing_to_commit(&out) {
                SyncOutcome::NothingToCommit
            } else {
                return Err(failure(&out, "git commit"));
            }
        };

        let out = self.git(&["push", self.remote.as_str(), self.branch.as_str()]).await?;
        check(&out, "git push")?;

        Ok(outcome)
    }

    /// Sync every `every`, starting one interval after launch. Never returns.
    pub async fn run(self, every: Duration) {
        info!(
            repo = %self.repo_dir.display(),
            remote = %self.remote,
            branch = %self.branch,
            every_s = every.as_secs(),
            "log sync enabled"
        );
        let mut ticker = interval_at(Instant::now() + every, every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            match self.sync_once(OffsetDateTime::now_utc()).await {
                Ok(outcome) => info!(?outcome, "logs synced"),
                Err(e) => error!("log sync failed: {e:#}"),
            }
        }
    }

    async fn git<S: AsRef<str>>(&self, args: &[S]) -> Result<Output> {
        let mut cmd = Command::new("git");
        cmd.arg("-C").arg(&self.repo_dir);
        for a in args {
            cmd.arg(a.as_ref());
        }
        cmd.kill_on_drop(true)
            .output()
            .await
            .context("failed to spawn git")
    }
}

fn failure(out: &Output, what: &str) -> anyhow::Error {
    anyhow!(
        "{what} exited with {}: {}",
        out.status,
        String::from_utf8_lossy(&out.stderr).trim()
    )
}

fn check(out: &Output, what: &str) -> Result<()> {
    if out.status.success() {
        Ok(())
    } else {
        Err(failure(out, what))
    }
}

fn nothing_to_commit(out: &Output) -> bool {
    let text = |b: &[u8]| String::from_utf8_lossy(b).to_lowercase();
    let (stdout, stderr) = (text(&out.stdout), text(&out.stderr));
    ["nothing to commit", "nothing added to commit"]
        .iter()
        .any(|needle| stdout.contains(needle) || stderr.contains(needle))
}

pub fn is_git_repo(dir: &Path) -> bool {
    dir.join(".git").exists()
}

// ===========================================================================
// Tests
// ===========================================================================
