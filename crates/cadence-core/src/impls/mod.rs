//! Impls - ports の実装（単一ホスト用・テスト用）
//!
//! # 含まれる実装
//! - **MemoryLeaseStore / MemoryLease**: プロセス内 lease（ULID token + 期限）
//! - **CachedStateStore**: 行ストレージの前に置くインスタンスごとのキャッシュ
//! - **MemoryStateBackend / MemoryStateStore**: プロセス内の state 行
//! - **MemoryHistory**: 実行履歴
//! - **RefreshingPauseList**: StaticPauseSource / JsonFilePauseSource を読む pause list
//! - **SqliteBackend / SqliteLease**: 同一ホストの複数プロセスで共有する SQLite ファイル
//! - **TokioProcessRunner**: ローカル子プロセス
//!
//! Memory 系はプロセス内でしか共有できません（テスト・単一インスタンス用）。
//! 複数ホストで動かす場合は lease と state store をネットワーク越しの
//! 共有ストレージ上に実装する必要があります。

pub mod cached_state;
pub mod memory_lease;
pub mod memory_state;
pub mod memory_history;
pub mod pause_list;
pub mod process;
pub mod sqlite;

pub use self::memory_lease::{MemoryLease, MemoryLeaseStore};
pub use self::cached_state::{CachedStateStore, StateRows, RUNNING_REFRESH};
pub use self::memory_state::{MemoryStateBackend, MemoryStateStore};
pub use self::memory_history::MemoryHistory;
pub use self::pause_list::{
    JsonFilePauseSource, RefreshingPauseList, StaticPauseSource, DEFAULT_PAUSE_REFRESH,
};
pub use self::process::{TokioProcessHandle, TokioProcessRunner};
pub use self::sqlite::{SqliteBackend, SqliteLease, SqliteStateStore};
