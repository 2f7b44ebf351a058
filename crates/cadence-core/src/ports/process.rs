//! ProcessRunner port - step の子プロセス起動
//!
//! 起動は非同期に行い、完了は `ProcessHandle::is_terminated` で
//! ポーリングします（await で待たない）。

use std::time::Duration;

use crate::domain::{GroupName, Result, StepDefinition};

/// 終了コードがない（シグナルで終了した）場合の値
pub const SIGNALLED_EXIT_CODE: i32 = -1;

#[async_trait::async_trait]
pub trait ProcessRunner: Send + Sync {
    /// `timeout` は情報としてのみ渡される。runner はプロセスを kill しない
    async fn run(
        &self,
        group: &GroupName,
        step: &StepDefinition,
        timeout: Duration,
    ) -> Result<Box<dyn ProcessHandle>>;
}

/// 起動済みプロセスのハンドル
#[async_trait::async_trait]
pub trait ProcessHandle: Send {
    /// ブロックせずに終了を確認する
    fn is_terminated(&mut self) -> bool;

    /// 終了後のみ意味を持つ。未終了またはシグナル終了なら `SIGNALLED_EXIT_CODE`
    fn exit_code(&self) -> i32;

    /// 終了後に呼ばれる。子プロセスの出力の転送が終わるのを待つ
    async fn flush_output(&mut self) {}
}
