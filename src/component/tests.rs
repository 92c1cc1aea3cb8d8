use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::component::{Component, ComponentContainer, ComponentError, DynService, InstantiationMode};

#[test]
fn lazy_component_builds_once() {
    let container = ComponentContainer::new("test");
    let builds = Arc::new(AtomicUsize::new(0));
    let counter = builds.clone();
    container
        .add_component(Component::new("counter", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(7u32) as DynService)
        }))
        .unwrap();
    assert_eq!(builds.load(Ordering::SeqCst), 0);
    assert_eq!(*container.get::<u32>("counter").unwrap(), 7);
    assert_eq!(*container.get::<u32>("counter").unwrap(), 7);
    assert_eq!(builds.load(Ordering::SeqCst), 1);
}

#[test]
fn eager_component_initializes_immediately() {
    let container = ComponentContainer::new("test");
    let builds = Arc::new(AtomicUsize::new(0));
    let counter = builds.clone();
    let component = Component::new("foo", move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(42u32) as DynService)
    })
    .with_instantiation_mode(InstantiationMode::Eager);
    container.add_component(component).unwrap();
    assert_eq!(builds.load(Ordering::SeqCst), 1);
}

#[test]
fn duplicate_registration_is_rejected() {
    let container = ComponentContainer::new("test");
    container.provide_instance("name", Arc::new(1u8)).unwrap();
    let err = container
        .add_component(Component::new("name", |_| Ok(Arc::new(2u8) as DynService)))
        .unwrap_err();
    assert!(matches!(err, ComponentError::ComponentAlreadyProvided { .. }));
}

#[test]
fn factories_resolve_dependencies() {
    let container = ComponentContainer::new("test");
    container.provide_instance("base", Arc::new(String::from("db"))).unwrap();
    container
        .add_component(Component::new("derived", |c| {
            let base = c.get::<String>("base")?;
            Ok(Arc::new(format!("{base}-client")) as DynService)
        }))
        .unwrap();
    assert_eq!(container.get::<String>("derived").unwrap().as_str(), "db-client");
    assert!(container.get_optional::<String>("missing").unwrap().is_none());
    assert!(matches!(
        container.get::<u64>("base"),
        Err(ComponentError::InstanceUnavailable { .. })
    ));
}

#[test]
fn detects_cycles() {
    let container = ComponentContainer::new("test");
    container
        .add_component(Component::new("loop", |c| {
            c.get::<u8>("loop")?;
            Ok(Arc::new(0u8) as DynService)
        }))
        .unwrap();
    let err = container.get::<u8>("loop").unwrap_err();
    assert!(matches!(err, ComponentError::InitializationFailed { .. }));
    assert!(err.to_string().contains("depends on itself"));
}

#[test]
fn containers_are_isolated_and_teardown_runs_hooks() {
    let torn_down = Arc::new(AtomicUsize::new(0));
    let a = ComponentContainer::new("a");
    let b = ComponentContainer::new("b");
    let hook = torn_down.clone();
    a.add_component(
        Component::new("svc", |_| Ok(Arc::new(1u8) as DynService)).with_teardown(move |_| {
            hook.fetch_add(1, Ordering::SeqCst);
        }),
    )
    .unwrap();
    assert!(a.get::<u8>("svc").is_ok());
    assert!(matches!(
        b.get::<u8>("svc"),
        Err(ComponentError::ComponentNotRegistered { .. })
    ));
    a.teardown();
    assert_eq!(torn_down.load(Ordering::SeqCst), 1);
}
