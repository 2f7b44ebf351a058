//! TokioProcessRunner - step をローカルの子プロセスとして起動
//!
//! # 実装詳細
//! - `tokio::process::Command` で起動し、stdout / stderr は pipe で受ける
//! - 出力は 1 行ずつ自プロセスの stdout に転送する
//!   - `{` で始まる行は子プロセスの構造化ログとみなしてそのまま出す
//!   - それ以外は `[group] out: ...` / `[group] err: ...` の接頭辞を付ける
//! - 完了は `try_wait` でポーリングする（timeout で kill はしない）
//! - 終了後、`flush_output` で転送タスクの完了を待つ（最後の行を落とさないため）

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use crate::domain::{GroupName, InfrastructureError, Result, StepDefinition};
use crate::ports::{ProcessHandle, ProcessRunner, SIGNALLED_EXIT_CODE};

/// 終了後に出力の転送を待つ上限（孫プロセスが pipe を握り続ける場合がある）
pub const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct TokioProcessRunner {
    working_dir: PathBuf,
}

impl TokioProcessRunner {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
        }
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub fn spawn(
        &self,
        group: &GroupName,
        step: &StepDefinition,
        timeout: Duration,
    ) -> Result<TokioProcessHandle> {
        let spawn_error = |source| InfrastructureError::Spawn {
            group: group.clone(),
            step: step.name().clone(),
            source,
        };

        let Some((program, args)) = step.command().split_first() else {
            return Err(spawn_error(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty command",
            ))
            .into());
        };

        let mut child = Command::new(program)
            .args(args)
            .current_dir(&self.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(spawn_error)?;

        tracing::debug!(
            group = %group,
            step = %step.name(),
            pid = child.id(),
            timeout_secs = timeout.as_secs(),
            "spawned step process"
        );

        let mut forwarders = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            forwarders.push(tokio::spawn(forward_lines(stdout, format!("[{group}] out: "))));
        }
        if let Some(stderr) = child.stderr.take() {
            forwarders.push(tokio::spawn(forward_lines(stderr, format!("[{group}] err: "))));
        }

        Ok(TokioProcessHandle {
            group: group.clone(),
            child,
            exit_code: None,
            forwarders,
            forwarded_lines: 0,
        })
    }
}

#[async_trait::async_trait]
impl ProcessRunner for TokioProcessRunner {
    async fn run(
        &self,
        group: &GroupName,
        step: &StepDefinition,
        timeout: Duration,
    ) -> Result<Box<dyn ProcessHandle>> {
        Ok(Box::new(self.spawn(group, step, timeout)?))
    }
}

/// 転送した行数を返す
async fn forward_lines<R>(stream: R, prefix: String) -> usize
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    let mut forwarded = 0;
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.starts_with('{') => println!("{line}"),
            Ok(Some(line)) => println!("{prefix}{line}"),
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(error = %e, "failed to read step output");
                break;
            }
        }
        forwarded += 1;
    }
    forwarded
}

pub struct TokioProcessHandle {
    group: GroupName,
    child: Child,
    exit_code: Option<i32>,
    forwarders: Vec<JoinHandle<usize>>,
    forwarded_lines: usize,
}

impl TokioProcessHandle {
    /// `flush_output` までに転送済みの stdout + stderr の行数
    pub fn forwarded_lines(&self) -> usize {
        self.forwarded_lines
    }
}

#[async_trait::async_trait]
impl ProcessHandle for TokioProcessHandle {
    fn is_terminated(&mut self) -> bool {
        if self.exit_code.is_some() {
            return true;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.exit_code = Some(status.code().unwrap_or(SIGNALLED_EXIT_CODE));
                true
            }
            Ok(None) => false,
            Err(e) => {
                // 状態が取れないプロセスは失敗として終了扱い
                tracing::warn!(error = %e, "failed to poll step process");
                self.exit_code = Some(SIGNALLED_EXIT_CODE);
                true
            }
        }
    }

    fn exit_code(&self) -> i32 {
        self.exit_code.unwrap_or(SIGNALLED_EXIT_CODE)
    }

    async fn flush_output(&mut self) {
        for forwarder in self.forwarders.drain(..) {
            match tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, forwarder).await {
                Ok(Ok(lines)) => self.forwarded_lines += lines,
                Ok(Err(e)) => tracing::warn!(group = %self.group, error = %e, "output forwarder failed"),
                Err(_) => tracing::warn!(
                    group = %self.group,
                    "step output still open after exit; leaving it to forward in the background"
                ),
            }
        }
    }
}
