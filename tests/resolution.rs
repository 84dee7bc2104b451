/// Resolution cache integration tests
///
/// Lifetimes, scope isolation, cache invalidation on replace and factory
/// cycle detection through the public container handle.

use ferrous_conductor::{
    Container, Dependencies, DiError, Factory, Key, Lifetime, ServiceDescriptor,
};
use proptest::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

#[derive(Debug)]
struct Database {
    id: usize,
}

#[derive(Debug)]
struct UserService {
    db: Arc<Database>,
}

#[derive(Debug)]
struct RequestContext {
    id: usize,
}

fn counting_factory(counter: Arc<AtomicUsize>) -> Factory {
    Factory::service(move |_| {
        Ok(Database {
            id: counter.fetch_add(1, Ordering::SeqCst),
        })
    })
}

#[test]
fn replace_after_resolve_yields_fresh_instance() {
    let container = Container::new();
    let built = Arc::new(AtomicUsize::new(0));
    container
        .register_singleton("db", Dependencies::none(), 0, counting_factory(built.clone()))
        .unwrap();

    let key = Key::named("db");
    let before = container.resolve_as::<Database>(&key).unwrap();
    assert!(Arc::ptr_eq(&before, &container.resolve_as::<Database>(&key).unwrap()));

    container
        .replace(ServiceDescriptor::singleton("db", counting_factory(built.clone())))
        .unwrap();
    let after = container.resolve_as::<Database>(&key).unwrap();

    assert!(!Arc::ptr_eq(&before, &after));
    assert_eq!(before.id, 0);
    assert_eq!(after.id, 1);
    assert!(Arc::ptr_eq(&after, &container.resolve_as::<Database>(&key).unwrap()));
}

#[test]
fn replace_rebuilds_transitive_dependents() {
    let container = Container::new();
    let built = Arc::new(AtomicUsize::new(0));
    container
        .register_singleton("db", Dependencies::none(), 0, counting_factory(built.clone()))
        .unwrap();
    container
        .register_singleton(
            "users",
            Dependencies::on(["db"]),
            0,
            Factory::service(|ctx| Ok(UserService { db: ctx.get::<Database>("db")? })),
        )
        .unwrap();

    let users = Key::named("users");
    let old = container.resolve_as::<UserService>(&users).unwrap();
    container
        .replace(ServiceDescriptor::singleton("db", counting_factory(built)))
        .unwrap();
    let new = container.resolve_as::<UserService>(&users).unwrap();

    assert!(!Arc::ptr_eq(&old, &new));
    assert_eq!(old.db.id, 0);
    assert_eq!(new.db.id, 1);
}

#[test]
fn scopes_isolate_scoped_but_share_singletons() {
    let container = Container::new();
    let requests = Arc::new(AtomicUsize::new(0));
    let counter = requests.clone();
    container
        .register_singleton("db", Dependencies::none(), 0, Factory::instance(Database { id: 9 }))
        .unwrap();
    container
        .register_scoped(
            "request",
            Dependencies::none(),
            0,
            Factory::service(move |_| {
                Ok(RequestContext {
                    id: counter.fetch_add(1, Ordering::SeqCst),
                })
            }),
        )
        .unwrap();

    let first = container.create_scope();
    let second = container.create_scope();
    let request = Key::named("request");
    let db = Key::named("db");

    let a1 = first.resolve_as::<RequestContext>(&request).unwrap();
    let a2 = first.resolve_as::<RequestContext>(&request).unwrap();
    let b1 = second.resolve_as::<RequestContext>(&request).unwrap();
    assert!(Arc::ptr_eq(&a1, &a2));
    assert_ne!(a1.id, b1.id);

    let shared_a = first.resolve_as::<Database>(&db).unwrap();
    let shared_b = second.resolve_as::<Database>(&db).unwrap();
    assert!(Arc::ptr_eq(&shared_a, &shared_b));
    assert!(Arc::ptr_eq(&shared_a, &container.resolve_as::<Database>(&db).unwrap()));

    assert_eq!(first.cached_count(), 1);
    assert!(matches!(
        container.resolve(&request),
        Err(DiError::WrongLifetime { lifetime: Lifetime::Scoped, .. })
    ));
}

#[test]
fn singleton_cannot_capture_scoped() {
    let container = Container::new();
    container
        .register_scoped("request", Dependencies::none(), 0, Factory::instance(RequestContext { id: 0 }))
        .unwrap();
    container
        .register_singleton(
            "cache",
            Dependencies::on(["request"]),
            0,
            Factory::service(|ctx| ctx.get::<RequestContext>("request").map(|r| r.id)),
        )
        .unwrap();

    let scope = container.create_scope();
    assert!(matches!(
        scope.resolve(&Key::named("cache")),
        Err(DiError::WrongLifetime { .. })
    ));
}

#[test]
fn transient_inside_scope_sees_scoped_dependency() {
    let container = Container::new();
    container
        .register_scoped("request", Dependencies::none(), 0, Factory::service(|_| Ok(RequestContext { id: 4 })))
        .unwrap();
    container
        .register_transient(
            "handler",
            Dependencies::on(["request"]),
            0,
            Factory::service(|ctx| ctx.get::<RequestContext>("request")),
        )
        .unwrap();

    let scope = container.create_scope();
    let handler = Key::named("handler");
    let one = scope.resolve_as::<Arc<RequestContext>>(&handler).unwrap();
    let two = scope.resolve_as::<Arc<RequestContext>>(&handler).unwrap();
    assert!(!Arc::ptr_eq(&one, &two));
    assert!(Arc::ptr_eq(&*one, &*two));
}

#[test]
fn factory_cycle_returns_error_instead_of_recursing() {
    let container = Container::new();
    container
        .register_singleton("a", Dependencies::none(), 0, Factory::raw(|ctx| ctx.resolve("b")))
        .unwrap();
    container
        .register_singleton("b", Dependencies::none(), 0, Factory::raw(|ctx| ctx.resolve("a")))
        .unwrap();

    match container.resolve(&Key::named("a")) {
        Err(DiError::CircularDependency { cycle }) => {
            assert_eq!(cycle, [Key::named("a"), Key::named("b"), Key::named("a")]);
        }
        other => panic!("expected a cycle, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn failing_factory_is_not_cached() {
    let container = Container::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    container
        .register_singleton(
            "flaky",
            Dependencies::none(),
            0,
            Factory::raw(move |_| {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(DiError::Factory {
                        key: Key::named("flaky"),
                        message: "not yet".into(),
                    })
                } else {
                    Ok(ferrous_conductor::Instance::new(1u8))
                }
            }),
        )
        .unwrap();

    let key = Key::named("flaky");
    assert!(matches!(container.resolve(&key), Err(DiError::Factory { .. })));
    assert_eq!(*container.resolve_as::<u8>(&key).unwrap(), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn concurrent_first_resolution_builds_once() {
    let container = Container::new();
    let built = Arc::new(AtomicUsize::new(0));
    container
        .register_singleton("db", Dependencies::none(), 0, counting_factory(built.clone()))
        .unwrap();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let container = container.clone();
            thread::spawn(move || container.resolve_as::<Database>(&Key::named("db")).unwrap())
        })
        .collect();
    let instances: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(built.load(Ordering::SeqCst), 1);
    assert!(instances.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
}

proptest! {
    #[test]
    fn singleton_identity_is_stable(resolutions in 1usize..32, unrelated in 0usize..8) {
        let container = Container::new();
        let built = Arc::new(AtomicUsize::new(0));
        container
            .register_singleton("db", Dependencies::none(), 0, counting_factory(built.clone()))
            .unwrap();

        let key = Key::named("db");
        let first = container.resolve(&key).unwrap();
        for i in 0..resolutions {
            // unrelated registrations must not disturb the cached singleton
            if i < unrelated {
                container
                    .register_transient(format!("other-{i}"), Dependencies::none(), 0, Factory::instance(i))
                    .unwrap();
            }
            prop_assert!(first.ptr_eq(&container.resolve(&key).unwrap()));
        }
        prop_assert_eq!(built.load(Ordering::SeqCst), 1);
    }
}
