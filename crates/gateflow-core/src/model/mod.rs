//! モデル定義
//!
//! gateflowで使用されるデータモデルを定義します。

mod expr;
mod kind;
mod project;
mod resource;
mod variable;

// Re-exports
pub use expr::*;
pub use kind::*;
pub use project::*;
pub use resource::*;
pub use variable::*;
