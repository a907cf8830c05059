use weft_api::{Handler, HandlerKind, Handlers, ShareNotice, Value};

#[test]
fn test_slots_start_empty() {
    let handlers = Handlers::new();
    for kind in [
        HandlerKind::Init,
        HandlerKind::Work,
        HandlerKind::Event,
        HandlerKind::Share,
        HandlerKind::Transfer,
        HandlerKind::Close,
    ] {
        assert!(!handlers.is_installed(kind), "{kind:?} must start empty");
    }
}

#[test]
fn test_handler_reports_its_kind() {
    assert_eq!(
        Handler::Init(Box::new(|_| Ok(()))).kind(),
        HandlerKind::Init
    );
    assert_eq!(
        Handler::Work(Box::new(|v| Ok(v))).kind(),
        HandlerKind::Work
    );
    assert_eq!(Handler::Close(Box::new(|| Ok(()))).kind(), HandlerKind::Close);
    assert_eq!(HandlerKind::Share.name(), "share");
}

#[test]
fn test_take_call_restore_discipline() {
    let mut handlers = Handlers::new();
    handlers.install(Handler::Share(Box::new(|notice: ShareNotice| {
        anyhow::ensure!(notice.message.is_some(), "expected a message");
        Ok(())
    })));

    let mut f = handlers.take_share().expect("installed");
    assert!(!handlers.is_installed(HandlerKind::Share));

    let accepted = f(ShareNotice {
        share: Value::Null,
        message: Some(Value::from("hello")),
    });
    assert!(accepted.is_ok());
    let rejected = f(ShareNotice {
        share: Value::Null,
        message: None,
    });
    assert!(rejected.is_err());

    handlers.restore_share(f);
    assert!(handlers.is_installed(HandlerKind::Share));
}

#[test]
fn test_debug_lists_installed_slots() {
    let mut handlers = Handlers::new();
    handlers.install(Handler::Work(Box::new(|v| Ok(v))));
    handlers.install(Handler::Close(Box::new(|| Ok(()))));

    let rendered = format!("{handlers:?}");
    assert!(rendered.contains("work"));
    assert!(rendered.contains("close"));
    assert!(!rendered.contains("transfer"));
}
