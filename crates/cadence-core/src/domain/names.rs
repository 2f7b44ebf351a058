//! Domain names (strongly-typed identifiers for groups and steps).
//!
//! ## Phantom Type パターン
//! `Name<T>` は共通実装を一つにまとめつつ、`T`（PhantomData のマーカー型）で
//! GroupName と StepName をコンパイル時に区別します。
//! group 名を step 名の位置に渡すような取り違えはコンパイルエラーになります。

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;
use std::marker::PhantomData;

/// NameMarker は各 name 型のマーカー trait
pub trait NameMarker: Send + Sync + 'static {
    /// エラーメッセージなどで使う種別名（例: "group", "step"）
    fn kind() -> &'static str;
}

/// ジェネリック name 型
///
/// 文字列は構築時に trim されず、そのまま保持されます。
/// 空かどうかの検証は config 層で行います。
#[repr(transparent)]
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Name<T: NameMarker> {
    value: String,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: NameMarker> Name<T> {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            _marker: PhantomData,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.value
    }

    pub fn is_blank(&self) -> bool {
        self.value.trim().is_empty()
    }
}

impl<T: NameMarker> fmt::Debug for Name<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({:?})", T::kind(), self.value)
    }
}

impl<T: NameMarker> fmt::Display for Name<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.value.fmt(f)
    }
}

impl<T: NameMarker> From<&str> for Name<T> {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl<T: NameMarker> From<String> for Name<T> {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl<T: NameMarker> Borrow<str> for Name<T> {
    fn borrow(&self) -> &str {
        &self.value
    }
}

// ========================================
// マーカー型の定義
// ========================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Group {}

impl NameMarker for Group {
    fn kind() -> &'static str {
        "group"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Step {}

impl NameMarker for Step {
    fn kind() -> &'static str {
        "step"
    }
}

/// Name of a task group (unique across the whole configuration).
pub type GroupName = Name<Group>;

/// Name of a step (unique within its group).
pub type StepName = Name<Step>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn names_serialize_as_plain_strings() {
        let group = GroupName::new("nightly-export");
        let json = serde_json::to_string(&group).unwrap();
        assert_eq!(json, "\"nightly-export\"");

        let back: GroupName = serde_json::from_str(&json).unwrap();
        assert_eq!(back, group);
    }

    #[test]
    fn debug_output_names_the_kind() {
        assert_eq!(format!("{:?}", StepName::new("first")), "step(\"first\")");
        assert_eq!(format!("{:?}", GroupName::new("g")), "group(\"g\")");
    }

    #[test]
    fn map_lookup_by_str_works() {
        let mut map = HashMap::new();
        map.insert(GroupName::new("a"), 1);
        assert_eq!(map.get("a"), Some(&1));
    }

    #[test]
    fn blank_detection() {
        assert!(StepName::new("  ").is_blank());
        assert!(!StepName::new("x").is_blank());
    }
}
