//! stem-core
//!
//! Core building blocks for the stem task runtime.
//!
//! # モジュール構成
//! - **meta**: メタデータ（Meta, MetaType, Specification, MetaVerification）
//! - **task**: Task trait と派生タスク（Function / Data / Async / Map / Filter / Reduce）
//! - **workspace**: task と sub-workspace の名前空間（WorkspaceBuilder, TaskPath）
//! - **tree**: 依存解決（TaskNode, DependencyError, TaskTree）
//! - **runner**: 実行戦略（Sequential / Thread / Process / Cooperative）
//! - **master**: 1 リクエストのオーケストレーション（TaskMaster, TaskResult）
//! - **envelope**: (meta, payload) のバイナリフレーミング
//! - **worker**: process runner と子プロセス間のプロトコル
//! - **ids** / **error**: 実行 ID とエラー型
//!
//! # 使用例
//! ```ignore
//! let ws = Workspace::builder("demo").add(double).add(combo).build()?;
//! let result = TaskMaster::new().execute_path(&Meta::from(json!({ "x": 5 })), "combo", &ws)?;
//! println!("{}", result.value()?);
//! ```

pub mod envelope;
pub mod error;
pub mod ids;
pub mod master;
pub mod meta;
pub mod runner;
pub mod task;
pub mod tree;
pub mod worker;
pub mod workspace;

pub use error::{InvocationError, SpecificationError, StemError};
pub use ids::ExecutionId;
pub use master::{TaskError, TaskMaster, TaskMetaError, TaskResult, TaskStatus};
pub use meta::{Meta, MetaRouting, MetaType, MetaVerification, Specification};
pub use runner::{RunnerConfig, RunnerKind, TaskRunner};
pub use task::{Data, Dependency, Inputs, Sequence, Task, TaskRef};
pub use tree::{DependencyError, TaskNode, TaskTree};
pub use workspace::{TaskPath, Workspace, WorkspaceError};
