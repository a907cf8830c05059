use anyhow::Context;
use weft_api::{ElementKind, ErrorInfo, MemoryError, SyncError, ThreadError};

#[test]
fn test_error_info_from_anyhow_chain() {
    let root = std::io::Error::new(std::io::ErrorKind::Other, "disk on fire");
    let err = anyhow::Error::from(root)
        .context("reading checkpoint")
        .context("loading state");

    let info = ErrorInfo::from_anyhow(&err);
    assert_eq!(info.message, "loading state");
    assert!(info.stack.is_some());

    let first = info.cause.as_deref().expect("one cause");
    assert_eq!(first.message, "reading checkpoint");
    let second = first.cause.as_deref().expect("two causes");
    assert_eq!(second.message, "disk on fire");
    assert!(second.cause.is_none());
}

#[test]
fn test_error_info_display_includes_cause() {
    let mut info = ErrorInfo::new("Error", "outer");
    info.cause = Some(Box::new(ErrorInfo::new("Error", "inner")));
    let rendered = info.to_string();
    assert!(rendered.contains("outer"));
    assert!(rendered.contains("inner"));
}

#[test]
fn test_error_info_source_chain() {
    let mut info = ErrorInfo::new("Error", "outer");
    info.cause = Some(Box::new(ErrorInfo::new("Error", "inner")));

    let dyn_err: &dyn std::error::Error = &info;
    let source = dyn_err.source().expect("has a source");
    assert_eq!(source.to_string(), "Error: inner");
}

#[test]
fn test_worker_rejection_wraps_error_info() {
    let rejection = ThreadError::Worker(ErrorInfo::new("Error", "handler failed"));
    assert!(rejection.to_string().contains("handler failed"));
}

#[test]
fn test_memory_error_renders_kind() {
    let err = MemoryError::WaitNotSupported(ElementKind::F64);
    assert!(err.to_string().contains("f64"));

    let err = MemoryError::OutOfBounds {
        kind: ElementKind::I32,
        offset: 2,
        count: 4,
        len: 8,
    };
    let rendered = err.to_string();
    assert!(rendered.contains("int32"));
    assert!(rendered.contains("8-byte"));

    // Memory errors convert into wait errors at the sync boundary
    let sync: SyncError = MemoryError::WaitNotSupported(ElementKind::U8).into();
    assert!(matches!(sync, SyncError::Memory(_)));
}
