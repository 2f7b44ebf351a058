//! Lease port - 分散ロック（リーダー選出）
//!
//! 同時に primary になれるのは lease を保持している 1 インスタンスだけです。
//! lease は TTL 付きで、保持者が refresh しなければ期限切れになり、
//! 他のインスタンスが取得できるようになります。

use std::time::Duration;

use crate::domain::Result;

/// Lease は 1 つの名前付きロックに対する、このインスタンスのハンドル
#[async_trait::async_trait]
pub trait Lease: Send + Sync {
    /// 取得を 1 回だけ試みる（待たない）
    ///
    /// 他の保持者がいれば `Ok(false)`。自分が既に保持していれば `Ok(true)`。
    async fn acquire(&self) -> Result<bool>;

    /// 保持していなければ何もしない
    async fn release(&self) -> Result<()>;

    /// 期限を now + ttl に延長する
    async fn refresh(&self, ttl: Duration) -> Result<()>;

    /// 保持していない、または期限切れなら `Duration::ZERO`
    async fn remaining_lifetime(&self) -> Result<Duration>;
}
