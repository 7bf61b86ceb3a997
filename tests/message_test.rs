use huginn::{Message, PriorityClass, ProcessingRequest, Role, SourceTag};

#[test]
fn test_message_constructors() {
    let sys = Message::system("You are helpful");
    assert_eq!(sys.role, Role::System);
    assert_eq!(sys.content, "You are helpful");

    assert_eq!(Message::user("Hello").role, Role::User);
    assert_eq!(Message::assistant("Hi!").role, Role::Assistant);
}

#[test]
fn test_message_wire_format() {
    let json = serde_json::to_value(Message::user("Hello")).unwrap();
    assert_eq!(json, serde_json::json!({"role": "user", "content": "Hello"}));

    let parsed: Message =
        serde_json::from_str(r#"{"role":"assistant","content":"Hi there"}"#).unwrap();
    assert_eq!(parsed, Message::assistant("Hi there"));
}

#[test]
fn test_priority_parsing() {
    assert_eq!("ULTRA".parse::<PriorityClass>().unwrap(), PriorityClass::Ultra);
    assert_eq!("low".parse::<PriorityClass>().unwrap(), PriorityClass::Low);
    assert!("urgent".parse::<PriorityClass>().is_err());
    assert_eq!(PriorityClass::default(), PriorityClass::Normal);
}

#[test]
fn test_request_input_is_last_user_message() {
    let request = ProcessingRequest::new(
        vec![
            Message::system("be brief"),
            Message::user("first"),
            Message::assistant("reply"),
            Message::user("second"),
            Message::assistant("trailing"),
        ],
        PriorityClass::High,
    );
    assert_eq!(request.input(), "second");

    let other = ProcessingRequest::new(vec![Message::system("only")], PriorityClass::Low);
    assert_eq!(other.input(), "");
    assert_ne!(request.id, other.id);
}

#[test]
fn test_fast_path_sources() {
    for tag in [
        SourceTag::Prediction,
        SourceTag::Cache,
        SourceTag::PreGenerated,
        SourceTag::Template,
    ] {
        assert!(tag.is_fast_path(), "{tag} should be local");
    }
    assert!(!SourceTag::Parallel.is_fast_path());
    assert!(!SourceTag::Upstream.is_fast_path());
}
