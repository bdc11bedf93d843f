use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion};

use lockstep_ecs::{
    Adapter, Adapters, Engine, EngineDeclaration, EntityStorage, InnerParallelism, StorageKind,
    SystemDeclaration, SystemId,
};

const PARTICLES: usize = 10_000;
const DT: f32 = 1.0 / 60.0;

#[derive(Clone, Copy, Default)]
struct Position(f32, f32);

#[derive(Clone, Copy, Default)]
struct Velocity(f32, f32);

#[derive(Clone, Copy, Default)]
struct Acceleration(f32, f32);

#[derive(Clone, Copy, Default)]
struct Life(f32);

struct Pipeline {
    engine: Engine,
    accelerate: SystemId,
    integrate: SystemId,
    decay: SystemId,
}

fn build(workers: usize) -> Pipeline {
    let mut decl = EngineDeclaration::new();
    let position = decl.component::<Position>(StorageKind::Dense);
    let velocity = decl.component::<Velocity>(StorageKind::Dense);
    let acceleration = decl.component::<Acceleration>(StorageKind::Dense);
    let life = decl.component::<Life>(StorageKind::Dense);

    let accelerate = decl.system(
        SystemDeclaration::new("accelerate")
            .reads(&[acceleration])
            .writes(&[velocity])
            .parallelism(InnerParallelism::SplitEvenlyCores),
    );
    let integrate = decl.system(
        SystemDeclaration::new("integrate")
            .reads(&[velocity])
            .writes(&[position])
            .depends_on(&[accelerate])
            .parallelism(InnerParallelism::SplitEvenlyCores),
    );
    let decay = decl.system(
        SystemDeclaration::new("decay")
            .writes(&[life])
            .parallelism(InnerParallelism::NoneBelowThreshold {
                threshold: 1024,
                inner: Box::new(InnerParallelism::SplitEvenlyCores),
            }),
    );

    decl.entity_storage(EntityStorage::Fixed(PARTICLES));
    decl.workers(workers);
    let mut engine = Engine::new(decl).expect("declaration is valid");

    engine
        .step(|proxy| {
            for index in 0..PARTICLES {
                let id = proxy.create_entity()?;
                let spread = (index % 100) as f32;
                proxy.add_component::<Position>(id)?.0 = spread;
                *proxy.add_component::<Velocity>(id)? = Velocity(spread * 0.1, -spread * 0.1);
                proxy.add_component::<Acceleration>(id)?.1 = 9.8;
                proxy.add_component::<Life>(id)?.0 = 25.0;
            }
            Ok(())
        })
        .expect("population succeeds");

    Pipeline { engine, accelerate, integrate, decay }
}

fn run_step(pipeline: &mut Pipeline) {
    let accelerate = pipeline.accelerate;
    let integrate = pipeline.integrate;
    let decay = pipeline.decay;

    let adapters = Adapters::new()
        .with(Adapter::for_subtasks::<(), _>(&[accelerate], |_state, data| {
            data.for_entities(|data, id| {
                let acceleration = *data.get::<Acceleration>(id);
                let velocity = data.get_mut::<Velocity>(id);
                velocity.0 += acceleration.0 * DT;
                velocity.1 += acceleration.1 * DT;
            });
            Ok(())
        }))
        .with(Adapter::for_subtasks::<(), _>(&[integrate], |_state, data| {
            data.for_entities(|data, id| {
                let velocity = *data.get::<Velocity>(id);
                let position = data.get_mut::<Position>(id);
                position.0 += velocity.0 * DT;
                position.1 += velocity.1 * DT;
            });
            Ok(())
        }))
        .with(Adapter::for_subtasks::<(), _>(&[decay], |_state, data| {
            data.for_entities(|data, id| {
                data.get_mut::<Life>(id).0 -= DT;
            });
            Ok(())
        }));

    pipeline
        .engine
        .step(|proxy| proxy.execute_systems().run(&adapters))
        .expect("step succeeds");
}

fn step_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("step");

    group.bench_function("particles_10k_1_worker", |b| {
        let mut pipeline = build(1);
        b.iter(|| run_step(black_box(&mut pipeline)));
    });

    group.bench_function("particles_10k_4_workers", |b| {
        let mut pipeline = build(4);
        b.iter(|| run_step(black_box(&mut pipeline)));
    });

    group.finish();
}

criterion_group!(benches, step_benchmark);
criterion_main!(benches);
