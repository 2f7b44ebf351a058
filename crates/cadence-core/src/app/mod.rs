//! App - アプリケーション層
//!
//! ports を組み合わせて scheduler のロジックを実装します。
//!
//! # 主要コンポーネント
//! - **SchedulerBuilder**: 構築とワイヤリング（fail-fast 検証）
//! - **Controller**: lease 取得 → primary ループ → drain
//! - **Dispatcher**: poll ごとの起動判定と子プロセスの回収
//! - **StatusReporter**: 開始・完了・timeout のログと履歴記録
//! - **HealthReporter**: 履歴から「欠けている step」を評価

pub mod builder;
pub mod controller;
pub mod dispatcher;
pub mod health;
pub mod status;

// 主要な型を再エクスポート
pub use self::builder::{BuildError, Scheduler, SchedulerBuilder};
pub use self::controller::{
    Controller, ControllerOptions, Phase, RunExit, RunReport, TerminationSignal,
    DEFAULT_LEASE_NAME, DEFAULT_LEASE_TTL, POLL_INTERVAL,
};
pub use self::dispatcher::{Dispatch, Dispatcher};
pub use self::health::{HealthReport, HealthReporter};
pub use self::status::StatusReporter;
