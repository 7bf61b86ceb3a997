use std::time::Duration;

use huginn::{HuginnError, ProviderFailure, Result};

fn http(status: u16) -> HuginnError {
    HuginnError::UpstreamFailure {
        provider: "p".into(),
        model: "m".into(),
        message: "status".into(),
        status: Some(status),
        retry_after: None,
    }
}

#[test]
fn test_error_display() {
    let err = HuginnError::NotConfigured {
        provider: "nobody".into(),
        model: "gpt-5".into(),
    };
    assert!(err.to_string().contains("nobody"));
    assert!(err.to_string().contains("gpt-5"));
}

#[test]
fn test_result_alias() {
    fn returns_error() -> Result<()> {
        Err(HuginnError::Cancelled)
    }
    assert!(returns_error().is_err());
}

#[test]
fn race_failure_lists_every_attempt() {
    let err = HuginnError::AllProvidersFailed {
        attempts: vec![
            ProviderFailure {
                provider: "a".into(),
                model: "m".into(),
                message: "timeout".into(),
            },
            ProviderFailure {
                provider: "b".into(),
                model: "m".into(),
                message: "HTTP 500".into(),
            },
        ],
    };
    let text = err.to_string();
    assert!(text.starts_with("all 2 providers failed"));
    assert!(text.contains("a/m: timeout"));
    assert!(text.contains("b/m: HTTP 500"));
}

// ============================================================================
// Classification
// ============================================================================

#[test]
fn transient_errors() {
    assert!(http(429).is_transient());
    assert!(http(408).is_transient());
    assert!(http(503).is_transient());
    assert!(HuginnError::upstream("p", "m", "connection reset").is_transient());
    assert!(HuginnError::PoolTimeout {
        provider: "p".into(),
        model: "m".into(),
        waited: Duration::from_secs(1),
    }
    .is_transient());
}

#[test]
fn permanent_errors() {
    assert!(!http(400).is_transient());
    assert!(!http(401).is_transient());
    assert!(!HuginnError::InvalidInput("empty".into()).is_transient());
    assert!(!HuginnError::StoreUnavailable("down".into()).is_transient());
}

#[test]
fn only_dispatch_level_errors_are_fatal() {
    assert!(HuginnError::InvalidInput("empty".into()).is_fatal());
    assert!(HuginnError::Configuration("bad".into()).is_fatal());
    assert!(!HuginnError::StoreUnavailable("down".into()).is_fatal());
    assert!(!HuginnError::Transport("closed".into()).is_fatal());
    assert!(!http(503).is_fatal());
}

#[test]
fn retry_after_hint() {
    let err = HuginnError::UpstreamFailure {
        provider: "p".into(),
        model: "m".into(),
        message: "slow down".into(),
        status: Some(429),
        retry_after: Some(Duration::from_secs(3)),
    };
    assert_eq!(err.retry_after(), Some(Duration::from_secs(3)));
    assert_eq!(http(429).retry_after(), None);
}
