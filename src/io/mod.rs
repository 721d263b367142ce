//! Asynchronous operation protocol shared by every platform back end.

mod context;
mod operation;
mod pending;

pub use context::{ContextRef, NativeContext};
pub use operation::{AsyncOperation, CompletionHandle, OperationKind};
pub use pending::{PendingGuard, PendingOperations};
