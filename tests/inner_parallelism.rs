use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use lockstep_ecs::{
    Adapter, Adapters, Engine, EngineDeclaration, EngineResult, EntityId, InnerParallelism,
    InnerParallelismMode, StorageKind, SystemDeclaration, SystemId,
};

#[derive(Clone, Copy, Default)]
struct Tag;

struct Fixture {
    engine: Engine,
    system: SystemId,
}

fn fixture(policy: InnerParallelism, entities: usize, workers: usize) -> Fixture {
    fixture_with(policy, entities, workers, InnerParallelismMode::Allow)
}

fn fixture_with(
    policy: InnerParallelism,
    entities: usize,
    workers: usize,
    mode: InnerParallelismMode,
) -> Fixture {
    let mut decl = EngineDeclaration::new();
    let tag = decl.component::<Tag>(StorageKind::Dense);
    let system = decl.system(
        SystemDeclaration::new("sliced")
            .reads(&[tag])
            .parallelism(policy),
    );
    decl.workers(workers);
    decl.inner_parallelism(mode);
    let mut engine = Engine::new(decl).unwrap();

    engine
        .step(|proxy| {
            for _ in 0..entities {
                let id = proxy.create_entity()?;
                proxy.add_component::<Tag>(id)?;
            }
            Ok(())
        })
        .unwrap();

    Fixture { engine, system }
}

/// Runs the sliced system once and returns each subtask's entity ids.
fn collect_slices(fixture: &mut Fixture) -> Vec<Vec<EntityId>> {
    let slices: Mutex<Vec<Vec<EntityId>>> = Mutex::new(Vec::new());
    let system = fixture.system;
    {
        let adapters = Adapters::new().with(Adapter::for_subtasks::<(), _>(
            &[system],
            |_state, data| -> EngineResult<()> {
                let mut ids = Vec::with_capacity(data.entity_count());
                data.for_entities(|_data, id| ids.push(id));
                slices.lock().unwrap().push(ids);
                Ok(())
            },
        ));
        fixture
            .engine
            .step(|proxy| proxy.execute_systems().run(&adapters))
            .unwrap();
    }
    slices.into_inner().unwrap()
}

fn sizes_of(slices: &[Vec<EntityId>]) -> Vec<usize> {
    let mut sizes: Vec<usize> = slices.iter().map(|s| s.len()).collect();
    sizes.sort_unstable();
    sizes
}

#[test]
fn split_n_slices_are_disjoint_and_cover_everything() {
    let mut fixture = fixture(InnerParallelism::SplitN(4), 10, 4);
    let slices = collect_slices(&mut fixture);

    // 10 entities over 4 slices: the first slices absorb the remainder.
    assert_eq!(sizes_of(&slices), vec![2, 2, 3, 3]);

    let union: HashSet<EntityId> = slices.iter().flatten().copied().collect();
    assert_eq!(union.len(), 10, "slices overlap or drop entities");
    assert_eq!(slices.iter().map(|s| s.len()).sum::<usize>(), 10);
}

#[test]
fn split_n_with_fewer_entities_than_slices() {
    let mut fixture = fixture(InnerParallelism::SplitN(4), 2, 4);
    let slices = collect_slices(&mut fixture);
    assert_eq!(sizes_of(&slices), vec![1, 1]);
}

#[test]
fn empty_subscription_still_invokes_once() {
    let mut fixture = fixture(InnerParallelism::SplitN(4), 0, 4);
    let slices = collect_slices(&mut fixture);
    // Exactly one zero-range proxy.
    assert_eq!(slices, vec![Vec::<EntityId>::new()]);
}

#[test]
fn split_evenly_cores_uses_the_worker_count() {
    let mut fixture = fixture(InnerParallelism::SplitEvenlyCores, 10, 2);
    let slices = collect_slices(&mut fixture);
    assert_eq!(sizes_of(&slices), vec![5, 5]);
}

#[test]
fn threshold_policy_switches_at_the_threshold() {
    let mut small = fixture(
        InnerParallelism::NoneBelowThreshold {
            threshold: 5,
            inner: Box::new(InnerParallelism::SplitN(2)),
        },
        3,
        4,
    );
    assert_eq!(sizes_of(&collect_slices(&mut small)), vec![3]);

    let mut large = fixture(
        InnerParallelism::NoneBelowThreshold {
            threshold: 5,
            inner: Box::new(InnerParallelism::SplitN(2)),
        },
        8,
        4,
    );
    assert_eq!(sizes_of(&collect_slices(&mut large)), vec![4, 4]);
}

#[test]
fn global_disallow_forces_a_single_subtask() {
    let mut fixture = fixture_with(
        InnerParallelism::SplitN(4),
        10,
        4,
        InnerParallelismMode::Disallow,
    );
    let slices = collect_slices(&mut fixture);
    assert_eq!(sizes_of(&slices), vec![10]);
}

#[test]
fn subtasks_make_progress_with_a_single_worker() {
    // One worker and a 4-way split: the thread that owns the system task
    // must drain its own subtasks while it waits.
    let mut fixture = fixture(InnerParallelism::SplitN(4), 10, 1);
    let slices = collect_slices(&mut fixture);
    assert_eq!(slices.iter().map(|s| s.len()).sum::<usize>(), 10);
    assert_eq!(slices.len(), 4);
}

#[test]
fn instance_adapter_folds_subtask_outputs() {
    #[derive(Default)]
    struct Collector {
        seen: Vec<EntityId>,
    }

    let mut decl = EngineDeclaration::new();
    let tag = decl.component::<Tag>(StorageKind::Dense);
    let system = decl.system(
        SystemDeclaration::new("collector")
            .reads(&[tag])
            .parallelism(InnerParallelism::SplitN(3))
            .output::<Vec<EntityId>>()
            .state(Collector::default()),
    );
    decl.workers(4);
    let mut engine = Engine::new(decl).unwrap();

    engine
        .step(|proxy| {
            for _ in 0..9 {
                let id = proxy.create_entity()?;
                proxy.add_component::<Tag>(id)?;
            }
            Ok(())
        })
        .unwrap();

    let subtask_runs = AtomicUsize::new(0);
    let adapters = Adapters::new().with(Adapter::for_instance::<Collector, _>(
        system,
        |collector, executor| {
            collector.seen.clear();
            executor.for_subtasks(|data| {
                subtask_runs.fetch_add(1, Ordering::SeqCst);
                let mut ids = Vec::new();
                data.for_entities(|_data, id| ids.push(id));
                data.output::<Vec<EntityId>>().extend(ids);
                Ok(())
            })?;
            executor.for_outputs::<Vec<EntityId>, _>(|ids| collector.seen.append(ids));
            Ok(())
        },
    ));

    engine
        .step(|proxy| proxy.execute_systems().run(&adapters))
        .unwrap();

    assert_eq!(subtask_runs.load(Ordering::SeqCst), 3);

    // The folded state is visible from the next step.
    engine
        .step(|proxy| {
            let collector = proxy.system::<Collector>(system);
            assert_eq!(collector.seen.len(), 9);
            Ok(())
        })
        .unwrap();
}
