use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use lockstep_ecs::{
    Adapter, Adapters, Engine, EngineDeclaration, EngineError, EntityId, Handle,
    RefreshHandlers, StorageKind, SystemDeclaration,
};

#[derive(Clone, Copy, Default)]
struct Life(pub f32);

#[derive(Clone, Copy, Default)]
struct Armor(pub u32);

#[test]
fn deferred_creation_lands_after_refresh() {
    let mut decl = EngineDeclaration::new();
    let life = decl.component::<Life>(StorageKind::Dense);
    let spawner = decl.system(SystemDeclaration::new("spawner").reads(&[life]));
    let mut engine = Engine::new(decl).unwrap();

    engine
        .step(|proxy| {
            for _ in 0..5 {
                let id = proxy.create_entity()?;
                proxy.add_component::<Life>(id)?.0 = 1.0;
            }
            Ok(())
        })
        .unwrap();
    assert_eq!(engine.subscription_count(spawner), 5);

    let adapters = Adapters::new().with(Adapter::for_subtasks::<(), _>(
        &[spawner],
        |_state, data| {
            data.for_entities(|data, _id| {
                data.defer(|proxy| {
                    let spawned = proxy.create_entity()?;
                    proxy.add_component::<Life>(spawned)?.0 = 2.0;
                    Ok(())
                });
            });
            Ok(())
        },
    ));
    engine
        .step(|proxy| proxy.execute_systems().run(&adapters))
        .unwrap();

    // Five new alive entities, each holding the component and subscribed.
    assert_eq!(engine.alive_count(), 10);
    assert_eq!(engine.subscription_count(spawner), 10);
    engine
        .step(|proxy| {
            let mut with_component = 0;
            for id in 0..10u32 {
                if proxy.get_component::<Life>(id).is_ok() {
                    with_component += 1;
                }
            }
            assert_eq!(with_component, 10);
            Ok(())
        })
        .unwrap();
}

#[test]
fn kill_invalidates_handles_and_recycles_with_new_generation() {
    let mut decl = EngineDeclaration::new();
    let life = decl.component::<Life>(StorageKind::Dense);
    let killer = decl.system(SystemDeclaration::new("killer").reads(&[life]));
    let mut engine = Engine::new(decl).unwrap();

    let mut handle = Handle::INVALID;
    let mut victim = 0;
    engine
        .step(|proxy| {
            victim = proxy.create_entity()?;
            proxy.add_component::<Life>(victim)?;
            handle = proxy.create_handle(victim)?;
            assert!(proxy.valid_handle(handle));
            assert_eq!(proxy.access(handle)?, victim);
            Ok(())
        })
        .unwrap();

    let adapters = Adapters::new().with(Adapter::for_subtasks::<(), _>(
        &[killer],
        |_state, data| {
            data.for_entities(|data, id| data.kill_entity(id));
            Ok(())
        },
    ));
    engine
        .step(|proxy| proxy.execute_systems().run(&adapters))
        .unwrap();

    assert!(!engine.valid_handle(handle));
    assert_eq!(engine.alive_count(), 0);
    assert_eq!(engine.subscription_count(killer), 0);

    // Recycling the id must not resurrect the old handle.
    engine
        .step(|proxy| {
            let recycled = proxy.create_entity()?;
            assert_eq!(recycled, victim, "fresh table recycles the lowest id");
            assert!(!proxy.valid_handle(handle));
            let fresh = proxy.create_handle(recycled)?;
            assert_ne!(fresh, handle);
            Ok(())
        })
        .unwrap();
    assert!(!engine.valid_handle(handle));
}

#[test]
fn rematch_after_deferred_component_add() {
    let mut decl = EngineDeclaration::new();
    let life = decl.component::<Life>(StorageKind::Dense);
    let armor = decl.component::<Armor>(StorageKind::Map);
    let watcher = decl.system(SystemDeclaration::new("watcher").reads(&[life, armor]));
    let toucher = decl.system(SystemDeclaration::new("toucher").reads(&[life]));
    let mut engine = Engine::new(decl).unwrap();

    let mut target = 0;
    engine
        .step(|proxy| {
            target = proxy.create_entity()?;
            proxy.add_component::<Life>(target)?;
            Ok(())
        })
        .unwrap();
    assert!(!engine.is_subscribed(watcher, target));
    assert!(engine.is_subscribed(toucher, target));

    let subscribe_events: Mutex<Vec<(u16, EntityId)>> = Mutex::new(Vec::new());
    let handlers = RefreshHandlers::new()
        .on_subscribe(|system, id| subscribe_events.lock().unwrap().push((system, id)));

    let adapters = Adapters::new().with(Adapter::for_subtasks::<(), _>(
        &[toucher],
        |_state, data| {
            data.for_entities(|data, id| {
                data.defer(move |proxy| {
                    proxy.add_component::<Armor>(id)?.0 = 7;
                    Ok(())
                });
            });
            Ok(())
        },
    ));
    engine
        .step_with(&handlers, |proxy| {
            proxy.execute_systems_from(&[toucher]).run(&adapters)
        })
        .unwrap();

    assert!(engine.is_subscribed(watcher, target));
    let events = subscribe_events.lock().unwrap();
    assert_eq!(
        events
            .iter()
            .filter(|&&(system, id)| system == watcher && id == target)
            .count(),
        1,
        "on_subscribe must fire exactly once"
    );
}

#[test]
fn add_then_remove_restores_the_original_shape() {
    let mut decl = EngineDeclaration::new();
    let life = decl.component::<Life>(StorageKind::Dense);
    let armor = decl.component::<Armor>(StorageKind::Map);
    let armored = decl.system(SystemDeclaration::new("armored").reads(&[life, armor]));
    let mut engine = Engine::new(decl).unwrap();

    let mut id = 0;
    engine
        .step(|proxy| {
            id = proxy.create_entity()?;
            proxy.add_component::<Life>(id)?;
            Ok(())
        })
        .unwrap();

    engine
        .step(|proxy| {
            proxy.add_component::<Armor>(id)?.0 = 3;
            Ok(())
        })
        .unwrap();
    assert!(engine.is_subscribed(armored, id));

    engine
        .step(|proxy| proxy.remove_component::<Armor>(id))
        .unwrap();
    assert!(!engine.is_subscribed(armored, id));
    engine
        .step(|proxy| {
            assert!(matches!(
                proxy.get_component::<Armor>(id),
                Err(EngineError::Store(_))
            ));
            assert!(proxy.get_component::<Life>(id).is_ok());
            Ok(())
        })
        .unwrap();
}

#[test]
fn empty_step_changes_nothing() {
    let mut decl = EngineDeclaration::new();
    let life = decl.component::<Life>(StorageKind::Dense);
    let system = decl.system(SystemDeclaration::new("system").reads(&[life]));
    let mut engine = Engine::new(decl).unwrap();

    engine
        .step(|proxy| {
            for _ in 0..4 {
                let id = proxy.create_entity()?;
                proxy.add_component::<Life>(id)?;
            }
            Ok(())
        })
        .unwrap();

    let before: Vec<bool> = (0..4).map(|id| engine.is_subscribed(system, id)).collect();
    let alive_before = engine.alive_count();

    let events = AtomicUsize::new(0);
    let handlers = RefreshHandlers::new()
        .on_subscribe(|_, _| {
            events.fetch_add(1, Ordering::SeqCst);
        })
        .on_unsubscribe(|_, _| {
            events.fetch_add(1, Ordering::SeqCst);
        })
        .on_reclaim(|_| {
            events.fetch_add(1, Ordering::SeqCst);
        });
    engine.step_with(&handlers, |_proxy| Ok(())).unwrap();
    engine.step_with(&handlers, |_proxy| Ok(())).unwrap();

    let after: Vec<bool> = (0..4).map(|id| engine.is_subscribed(system, id)).collect();
    assert_eq!(before, after);
    assert_eq!(alive_before, engine.alive_count());
    assert_eq!(events.load(Ordering::SeqCst), 0, "idempotent refresh fired hooks");
}

#[test]
fn fixed_capacity_fails_cleanly_at_the_limit() {
    let mut decl = EngineDeclaration::new();
    decl.entity_storage(lockstep_ecs::EntityStorage::Fixed(3));
    let mut engine = Engine::new(decl).unwrap();

    engine
        .step(|proxy| {
            for _ in 0..3 {
                proxy.create_entity()?;
            }
            match proxy.create_entity() {
                Err(EngineError::Capacity(error)) => {
                    assert_eq!(error.capacity, 3);
                }
                other => panic!("expected capacity exhaustion, got {other:?}"),
            }
            Ok(())
        })
        .unwrap();

    // Existing entities are untouched by the failed creation.
    assert_eq!(engine.alive_count(), 3);
    for id in 0..3 {
        assert!(engine.alive(id));
    }
}

#[test]
fn reclaim_hook_fires_once_per_killed_entity() {
    let mut decl = EngineDeclaration::new();
    let life = decl.component::<Life>(StorageKind::Dense);
    let killer = decl.system(SystemDeclaration::new("killer").writes(&[life]));
    let mut engine = Engine::new(decl).unwrap();

    engine
        .step(|proxy| {
            for _ in 0..6 {
                let id = proxy.create_entity()?;
                proxy.add_component::<Life>(id)?;
            }
            Ok(())
        })
        .unwrap();

    let reclaimed = AtomicUsize::new(0);
    let handlers =
        RefreshHandlers::new().on_reclaim(|_| {
            reclaimed.fetch_add(1, Ordering::SeqCst);
        });

    // Kill every entity twice over: once from the system, once from the
    // step body. Reclamation still happens exactly once per id.
    let adapters = Adapters::new().with(Adapter::for_subtasks::<(), _>(
        &[killer],
        |_state, data| {
            data.for_entities(|data, id| data.kill_entity(id));
            Ok(())
        },
    ));
    engine
        .step_with(&handlers, |proxy| {
            proxy.execute_systems().run(&adapters)?;
            for id in 0..6 {
                proxy.kill_entity(id)?;
            }
            Ok(())
        })
        .unwrap();

    assert_eq!(reclaimed.load(Ordering::SeqCst), 6);
    assert_eq!(engine.alive_count(), 0);
}
