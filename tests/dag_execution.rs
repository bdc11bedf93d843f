use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use lockstep_ecs::{
    Adapter, Adapters, ConfigError, Engine, EngineDeclaration, EngineError, EntityId,
    InnerParallelism, StorageKind, SystemDeclaration,
};

#[derive(Clone, Copy, Default)]
struct Payload(#[allow(dead_code)] pub f32);

fn no_op() -> Adapters<'static> {
    Adapters::new()
}

#[test]
fn dependencies_order_execution() {
    let mut decl = EngineDeclaration::new();
    let a = decl.system(SystemDeclaration::new("a"));
    let b = decl.system(SystemDeclaration::new("b").depends_on(&[a]));
    let c = decl.system(SystemDeclaration::new("c").depends_on(&[a]));
    decl.workers(4);
    let mut engine = Engine::new(decl).unwrap();

    let counter = AtomicU32::new(0);
    let flags = AtomicU32::new(0);

    let adapters = Adapters::new()
        .with(Adapter::for_subtasks::<(), _>(&[a], |_state, _data| {
            counter.store(1, Ordering::SeqCst);
            Ok(())
        }))
        .with(Adapter::for_subtasks::<(), _>(&[b], |_state, _data| {
            assert_eq!(counter.load(Ordering::SeqCst), 1);
            flags.fetch_or(0b01, Ordering::SeqCst);
            Ok(())
        }))
        .with(Adapter::for_subtasks::<(), _>(&[c], |_state, _data| {
            assert_eq!(counter.load(Ordering::SeqCst), 1);
            flags.fetch_or(0b10, Ordering::SeqCst);
            Ok(())
        }));

    engine
        .step(|proxy| proxy.execute_systems_from(&[a]).run(&adapters))
        .unwrap();

    assert_eq!(flags.load(Ordering::SeqCst), 0b11);
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[test]
fn empty_roots_return_immediately() {
    let mut decl = EngineDeclaration::new();
    let a = decl.system(SystemDeclaration::new("a"));
    let mut engine = Engine::new(decl).unwrap();

    let ran = AtomicU32::new(0);
    let adapters = Adapters::new().with(Adapter::for_subtasks::<(), _>(&[a], |_state, _data| {
        ran.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }));

    engine
        .step(|proxy| {
            // No adapters are even consulted for an empty root set.
            proxy.execute_systems_from(&[]).run(&no_op())?;
            proxy.execute_systems_from(&[]).run(&adapters)
        })
        .unwrap();

    assert_eq!(ran.load(Ordering::SeqCst), 0);
}

#[test]
fn subgraph_execution_skips_unreachable_systems() {
    let mut decl = EngineDeclaration::new();
    let a = decl.system(SystemDeclaration::new("a"));
    let b = decl.system(SystemDeclaration::new("b").depends_on(&[a]));
    let mut engine = Engine::new(decl).unwrap();

    let ran_a = AtomicU32::new(0);
    let ran_b = AtomicU32::new(0);
    let adapters = Adapters::new()
        .with(Adapter::for_subtasks::<(), _>(&[a], |_state, _data| {
            ran_a.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }))
        .with(Adapter::for_subtasks::<(), _>(&[b], |_state, _data| {
            ran_b.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));

    // Starting from `b` must not run `a`; `b` does not wait for a
    // dependency that is outside the executed subgraph.
    engine
        .step(|proxy| proxy.execute_systems_from(&[b]).run(&adapters))
        .unwrap();

    assert_eq!(ran_a.load(Ordering::SeqCst), 0);
    assert_eq!(ran_b.load(Ordering::SeqCst), 1);
}

#[test]
fn producer_outputs_visible_to_consumer() {
    let mut decl = EngineDeclaration::new();
    let payload = decl.component::<Payload>(StorageKind::Dense);
    let producer = decl.system(
        SystemDeclaration::new("producer")
            .reads(&[payload])
            .parallelism(InnerParallelism::SplitN(3))
            .output::<Vec<(EntityId, EntityId)>>(),
    );
    let consumer = decl.system(SystemDeclaration::new("consumer").depends_on(&[producer]));
    decl.workers(4);
    let mut engine = Engine::new(decl).unwrap();

    engine
        .step(|proxy| {
            for _ in 0..10 {
                let id = proxy.create_entity()?;
                proxy.add_component::<Payload>(id)?;
            }
            Ok(())
        })
        .unwrap();

    let producer_subtasks_done = AtomicUsize::new(0);
    let consumed = AtomicUsize::new(0);

    let adapters = Adapters::new()
        .with(Adapter::for_subtasks::<(), _>(&[producer], |_state, data| {
            let mut pairs = Vec::new();
            data.for_entities(|_data, id| pairs.push((id, id)));
            data.output::<Vec<(EntityId, EntityId)>>().extend(pairs);
            producer_subtasks_done.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }))
        .with(Adapter::for_subtasks::<(), _>(&[consumer], |_state, data| {
            // Every producer subtask has decremented before we start.
            assert_eq!(producer_subtasks_done.load(Ordering::SeqCst), 3);
            let mut total = 0;
            data.for_previous_outputs::<Vec<(EntityId, EntityId)>, _>(producer, |pairs| {
                total += pairs.len();
            });
            consumed.fetch_add(total, Ordering::SeqCst);
            Ok(())
        }));

    engine
        .step(|proxy| proxy.execute_systems().run(&adapters))
        .unwrap();

    assert_eq!(consumed.load(Ordering::SeqCst), 10);
}

#[test]
fn failing_system_aborts_dependents() {
    let mut decl = EngineDeclaration::new();
    let a = decl.system(SystemDeclaration::new("a"));
    let b = decl.system(SystemDeclaration::new("b").depends_on(&[a]));
    let mut engine = Engine::new(decl).unwrap();

    let ran_b = AtomicU32::new(0);
    let adapters = Adapters::new()
        .with(Adapter::for_subtasks::<(), _>(&[a], |_state, _data| {
            Err(EngineError::Message("boom".to_string()))
        }))
        .with(Adapter::for_subtasks::<(), _>(&[b], |_state, _data| {
            ran_b.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));

    let result = engine.step(|proxy| proxy.execute_systems().run(&adapters));

    assert!(matches!(result, Err(EngineError::Message(ref m)) if m == "boom"));
    assert_eq!(ran_b.load(Ordering::SeqCst), 0);
}

#[test]
fn panicking_system_surfaces_and_engine_stays_usable() {
    let mut decl = EngineDeclaration::new();
    let a = decl.system(SystemDeclaration::new("a"));
    let b = decl.system(SystemDeclaration::new("b").depends_on(&[a]));
    let mut engine = Engine::new(decl).unwrap();

    let panicking = Adapters::new()
        .with(Adapter::for_subtasks::<(), _>(&[a], |_state, _data| {
            panic!("subtask exploded")
        }))
        .with(Adapter::for_subtasks::<(), _>(&[b], |_state, _data| Ok(())));

    let result = engine.step(|proxy| proxy.execute_systems().run(&panicking));
    match result {
        Err(EngineError::Execution(error)) => {
            assert!(error.to_string().contains("subtask exploded"));
        }
        other => panic!("expected a panic report, got {other:?}"),
    }

    // The pool survived the panic and the next step runs normally.
    let ran = AtomicU32::new(0);
    let healthy = Adapters::new().with(Adapter::for_subtasks::<(), _>(&[a, b], |_state, _data| {
        ran.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }));
    engine
        .step(|proxy| proxy.execute_systems().run(&healthy))
        .unwrap();
    assert_eq!(ran.load(Ordering::SeqCst), 2);
}

#[test]
fn panicking_instance_adapter_surfaces_and_step_terminates() {
    let mut decl = EngineDeclaration::new();
    let a = decl.system(SystemDeclaration::new("a"));
    let b = decl.system(SystemDeclaration::new("b").depends_on(&[a]));
    let mut engine = Engine::new(decl).unwrap();

    // The panic happens in the adapter body itself, outside any subtask.
    let panicking = Adapters::new()
        .with(Adapter::for_instance::<(), _>(a, |_state, _executor| {
            panic!("instance exploded")
        }))
        .with(Adapter::for_subtasks::<(), _>(&[b], |_state, _data| Ok(())));

    let result = engine.step(|proxy| proxy.execute_systems().run(&panicking));
    match result {
        Err(EngineError::Execution(error)) => {
            assert!(error.to_string().contains("instance exploded"));
        }
        other => panic!("expected a panic report, got {other:?}"),
    }

    let ran = AtomicU32::new(0);
    let healthy = Adapters::new().with(Adapter::for_subtasks::<(), _>(&[a, b], |_state, _data| {
        ran.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }));
    engine
        .step(|proxy| proxy.execute_systems().run(&healthy))
        .unwrap();
    assert_eq!(ran.load(Ordering::SeqCst), 2);
}

#[test]
fn missing_adapter_is_rejected_before_running() {
    let mut decl = EngineDeclaration::new();
    let a = decl.system(SystemDeclaration::new("a"));
    let b = decl.system(SystemDeclaration::new("b").depends_on(&[a]));
    let mut engine = Engine::new(decl).unwrap();

    let ran_a = AtomicU32::new(0);
    let only_a = Adapters::new().with(Adapter::for_subtasks::<(), _>(&[a], |_state, _data| {
        ran_a.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }));

    let result = engine.step(|proxy| proxy.execute_systems().run(&only_a));

    assert!(matches!(
        result,
        Err(EngineError::Config(ConfigError::MissingAdapter { system: "b" }))
    ));
    // Binding failed up front, so nothing ran at all.
    assert_eq!(ran_a.load(Ordering::SeqCst), 0);
}
