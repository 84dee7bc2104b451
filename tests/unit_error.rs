/// Unit tests for DiError display and classification

use ferrous_conductor::{ComponentState, DiError, DiResult, Key, Lifetime, Phase, ValidationError};
use std::error::Error;
use std::time::Duration;

fn key(name: &str) -> Key {
    Key::named(name)
}

#[test]
fn test_error_display_not_found() {
    let error = DiError::NotFound(key("payments"));
    assert_eq!(error.to_string(), "service not found: payments");
}

#[test]
fn test_error_display_circular() {
    let error = DiError::CircularDependency {
        cycle: vec![key("a"), key("b"), key("c"), key("a")],
    };
    assert_eq!(error.to_string(), "circular dependency: a -> b -> c -> a");
}

#[test]
fn test_error_display_missing_dependency() {
    let error = DiError::MissingRequiredDependency {
        service: key("api"),
        dependency: key("db"),
    };
    assert_eq!(error.to_string(), "api requires db, which is not registered");
}

#[test]
fn test_error_display_invalid_graph_lists_every_problem() {
    let error = DiError::InvalidGraph(vec![
        ValidationError::MissingRequiredDependency {
            service: key("api"),
            dependency: key("db"),
        },
        ValidationError::CircularDependency {
            cycle: vec![key("x"), key("x")],
        },
    ]);
    assert_eq!(
        error.to_string(),
        "dependency graph is invalid: api requires missing db; cycle x -> x"
    );
}

#[test]
fn test_error_display_wrong_lifetime() {
    let error = DiError::WrongLifetime {
        key: key("request"),
        lifetime: Lifetime::Scoped,
    };
    assert_eq!(error.to_string(), "request has scoped lifetime and cannot be resolved here");
}

#[test]
fn test_error_display_illegal_transition() {
    let error = DiError::IllegalTransition {
        key: key("cache"),
        from: ComponentState::Uninitialized,
        to: ComponentState::ShuttingDown,
    };
    assert_eq!(
        error.to_string(),
        "illegal transition for cache: uninitialized -> shutting-down"
    );
}

#[test]
fn test_error_display_timeout() {
    let error = DiError::OperationTimeout {
        key: key("db"),
        phase: Phase::Initialize,
        after: Duration::from_millis(250),
    };
    assert_eq!(error.to_string(), "db initialization timed out after 250ms");

    let error = DiError::OperationTimeout {
        key: key("db"),
        phase: Phase::HealthCheck,
        after: Duration::from_secs(3),
    };
    assert_eq!(error.to_string(), "db health check timed out after 3s");
}

#[test]
fn test_transient_classification() {
    let transient = [
        DiError::OperationTimeout {
            key: key("db"),
            phase: Phase::Shutdown,
            after: Duration::from_secs(1),
        },
        DiError::TransientOperation {
            key: key("db"),
            message: "refused".into(),
        },
    ];
    for error in &transient {
        assert!(error.is_transient(), "{error}");
        assert!(!error.is_fatal(), "{error}");
    }
}

#[test]
fn test_fatal_classification() {
    let fatal = [
        DiError::FatalOperation {
            key: key("db"),
            message: "corrupt".into(),
        },
        DiError::Factory {
            key: key("db"),
            message: "bad url".into(),
        },
        DiError::DependencyFailed {
            service: key("api"),
            dependency: key("db"),
        },
    ];
    for error in &fatal {
        assert!(error.is_fatal(), "{error}");
        assert!(!error.is_transient(), "{error}");
    }
}

#[test]
fn test_refusals_are_neither_transient_nor_fatal() {
    let refusals = [
        DiError::CircuitOpen(key("db")),
        DiError::Cancelled(key("db")),
        DiError::Quarantined(key("db")),
    ];
    for error in &refusals {
        assert!(!error.is_transient(), "{error}");
        assert!(!error.is_fatal(), "{error}");
    }
}

#[test]
fn test_error_trait_and_result_alias() {
    fn lookup(found: bool) -> DiResult<u8> {
        if found {
            Ok(1)
        } else {
            Err(DiError::NotFound(Key::named("n")))
        }
    }

    assert_eq!(lookup(true).unwrap(), 1);
    let error = lookup(false).unwrap_err();
    let dyn_error: &dyn Error = &error;
    assert!(dyn_error.source().is_none());
    assert!(format!("{:?}", error).contains("NotFound"));
}

#[test]
fn test_validation_error_converts_into_di_error() {
    let converted: DiError = ValidationError::CircularDependency {
        cycle: vec![key("a"), key("b"), key("a")],
    }
    .into();
    assert!(matches!(converted, DiError::CircularDependency { ref cycle } if cycle.len() == 3));
}
