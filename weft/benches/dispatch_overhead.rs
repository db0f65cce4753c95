use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use weft::prelude::*;

// =============================================================================
// Activities
// =============================================================================

struct Noop;

impl Activity for Noop {
    fn metadata(&self) -> ActivityMetadata {
        ActivityMetadata::new("Noop")
    }

    fn execute(&self, _ctx: &mut ActivityContext<'_>) -> Result<(), WorkflowFault> {
        Ok(())
    }
}

struct Sequence {
    children: Vec<ActivityId>,
}

impl Sequence {
    fn schedule_next(&self, ctx: &mut ActivityContext<'_>) -> Result<(), WorkflowFault> {
        let index: usize = ctx.get_as("index")?;
        if let Some(child) = self.children.get(index) {
            ctx.set("index", json!(index + 1))?;
            ctx.schedule_activity(*child, Some("next"), None)?;
        }
        Ok(())
    }
}

impl Activity for Sequence {
    fn metadata(&self) -> ActivityMetadata {
        ActivityMetadata::new("Sequence")
            .with_children(self.children.iter().copied())
            .with_variable("index", json!(0))
            .with_callback("next")
    }

    fn execute(&self, ctx: &mut ActivityContext<'_>) -> Result<(), WorkflowFault> {
        self.schedule_next(ctx)
    }

    fn on_callback(
        &self,
        ctx: &mut ActivityContext<'_>,
        _handler: &str,
        _args: CallbackArgs,
    ) -> Result<(), WorkflowFault> {
        self.schedule_next(ctx)
    }
}

struct Wait;

impl Activity for Wait {
    fn metadata(&self) -> ActivityMetadata {
        ActivityMetadata::new("Wait").with_callback("resumed")
    }

    fn execute(&self, ctx: &mut ActivityContext<'_>) -> Result<(), WorkflowFault> {
        ctx.create_bookmark("go", Some("resumed"), BookmarkOptions::NONE)?;
        Ok(())
    }

    fn on_callback(
        &self,
        _ctx: &mut ActivityContext<'_>,
        _handler: &str,
        _args: CallbackArgs,
    ) -> Result<(), WorkflowFault> {
        Ok(())
    }
}

struct Host(Uuid);

impl WorkflowHost for Host {
    fn instance_id(&self) -> Uuid {
        self.0
    }
}

fn sequence_of(len: usize) -> Arc<WorkflowDefinition> {
    let mut builder = DefinitionBuilder::new(WorkflowIdentity::new("bench", "1"));
    let children: Vec<ActivityId> = (0..len).map(|_| builder.add(Noop)).collect();
    let root = builder.add(Sequence { children });
    Arc::new(builder.build(root).unwrap())
}

fn waiting() -> Arc<WorkflowDefinition> {
    let mut builder = DefinitionBuilder::new(WorkflowIdentity::new("bench-wait", "1"));
    let root = builder.add(Wait);
    Arc::new(builder.build(root).unwrap())
}

// =============================================================================
// Benchmarks
// =============================================================================

fn bench_sequence_dispatch(c: &mut Criterion) {
    let mut group = c.benchmark_group("sequence_dispatch");

    for len in [1usize, 10, 100] {
        let definition = sequence_of(len);
        group.bench_with_input(BenchmarkId::from_parameter(len), &definition, |b, definition| {
            b.iter(|| {
                let executor =
                    ActivityExecutor::new(definition.clone(), Arc::new(Host(Uuid::new_v4())));
                executor
                    .schedule_root_activity(BTreeMap::new(), BTreeMap::new())
                    .unwrap();
                executor.run().unwrap();
                black_box(executor.state())
            })
        });
    }

    group.finish();
}

fn bench_bookmark_round_trip(c: &mut Criterion) {
    let definition = waiting();

    c.bench_function("bookmark_wait_and_resume", |b| {
        b.iter(|| {
            let executor = ActivityExecutor::new(definition.clone(), Arc::new(Host(Uuid::new_v4())));
            executor
                .schedule_root_activity(BTreeMap::new(), BTreeMap::new())
                .unwrap();
            executor.run().unwrap();
            executor.try_resume_host_bookmark(&Bookmark::new("go"), Value::Null);
            executor.run().unwrap();
            black_box(executor.state())
        })
    });
}

fn bench_snapshot(c: &mut Criterion) {
    let mut group = c.benchmark_group("snapshot");
    let definition = waiting();
    let executor = ActivityExecutor::new(definition.clone(), Arc::new(Host(Uuid::new_v4())));
    executor
        .schedule_root_activity(BTreeMap::new(), BTreeMap::new())
        .unwrap();
    executor.run().unwrap();

    group.bench_function("prepare_and_encode", |b| {
        b.iter(|| {
            let snapshot = executor.prepare_for_serialization().unwrap();
            black_box(snapshot.to_bytes().unwrap())
        })
    });

    let bytes = executor.prepare_for_serialization().unwrap().to_bytes().unwrap();
    let id = executor.instance_id();
    group.bench_function("decode_and_restore", |b| {
        b.iter(|| {
            let snapshot = ExecutorSnapshot::from_bytes(&bytes).unwrap();
            let restored =
                ActivityExecutor::on_deserialized(definition.clone(), Arc::new(Host(id)), snapshot)
                    .unwrap();
            black_box(restored.state())
        })
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_sequence_dispatch,
    bench_bookmark_round_trip,
    bench_snapshot
);
criterion_main!(benches);
