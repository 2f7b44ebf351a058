//! StateStore port - ExecutionState の正本
//!
//! # 設計原則
//! - group ごとに 1 レコード。初めて参照されたときに baseline を作る
//! - 取得したコピーには store がインスタンスタグを付ける
//! - save は store が追跡しているコピーからのみ受け付ける
//!   （古いコピーの書き戻しは `CoordinationError::StateOutOfSync`）

use crate::domain::{ExecutionState, GroupName, Result};

#[async_trait::async_trait]
pub trait StateStore: Send + Sync {
    async fn get_state(&self, group: &GroupName) -> Result<ExecutionState>;

    async fn save(&self, state: &ExecutionState) -> Result<()>;
}
