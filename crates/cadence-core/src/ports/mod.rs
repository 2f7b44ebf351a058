//! Ports - 抽象化レイヤー
//!
//! Hexagonal Architecture の「ポート」です。scheduler のエンジン
//! （dispatcher / controller）はここで定義した trait だけに依存します。
//!
//! # 設計原則
//! - すべて `Send + Sync`、`&self` で呼べる（内部可変性は実装側）
//! - 1 つの backend を複数インスタンスで共有できる（テストで多重起動を再現）
//! - 時刻は Clock からのみ取得する

pub mod clock;
pub mod lease;
pub mod state_store;
pub mod process;
pub mod history;
pub mod pause_list;

// 主要な trait を再エクスポート
pub use self::clock::{Clock, ManualClock, SystemClock};
pub use self::lease::Lease;
pub use self::state_store::StateStore;
pub use self::process::{ProcessHandle, ProcessRunner, SIGNALLED_EXIT_CODE};
pub use self::history::{HistoryEntry, HistoryRecorder};
pub use self::pause_list::{PauseList, PauseSource};
