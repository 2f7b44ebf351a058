//! cadence-core
//!
//! Core building blocks for the Cadence scheduler: several redundant
//! instances run side by side, one of them holds a lease and launches
//! scheduled task groups as child processes.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（names, schedule, definition, state, errors）
//! - **ports**: 抽象化レイヤー（Clock, Lease, StateStore, ProcessRunner, HistoryRecorder, PauseList）
//! - **impls**: 実装（プロセス内 lease / state store / history、pause list、tokio 子プロセス）
//! - **app**: アプリケーションロジック（builder, controller, dispatcher, status, health）
//! - **config**: JSON 設定と検証

pub mod domain;
pub mod ports;
pub mod impls;
pub mod app;
pub mod config;
