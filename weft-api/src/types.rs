use std::sync::Arc;

use crate::errors::ErrorInfo;
use crate::value::Value;

// Type aliases for common types
pub type BoxedScript = Box<dyn FnOnce() + Send + 'static>;
pub type EventCallback = Arc<dyn Fn(Value) + Send + Sync>;
pub type TransferCallback = Arc<dyn Fn(Value) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(ErrorInfo) + Send + Sync>;
pub type CloseCallback = Arc<dyn Fn() + Send + Sync>;
