//! Benchmarks for step chains and the task queue
//!
//! Run with: cargo bench

use chrono::{TimeZone, Utc};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use preproc_rs::preprocessor::{
    execute, ExecutionContext, History, Item, PreprocCache, RuleSet, Step, StepType, Task,
    TaskQueue, ValueTask,
};
use preproc_rs::{Timestamp, Value, ValueOpt, ValueType};

fn ts(secs: i64) -> Timestamp {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_default()
}

fn metrics_payload(series: usize) -> String {
    let mut out = String::from("# TYPE requests_total counter\n");
    for i in 0..series {
        out.push_str(&format!("requests_total{{path=\"/p{}\",code=\"200\"}} {}\n", i, i * 3));
    }
    out
}

fn json_payload(fields: usize) -> String {
    let body: Vec<String> = (0..fields).map(|i| format!("\"f{}\":{}", i, i)).collect();
    format!("{{{}}}", body.join(","))
}

fn bench_numeric_chain(c: &mut Criterion) {
    let mut group = c.benchmark_group("numeric_chain");
    let rules = RuleSet::new(ValueType::Uint64).with_steps(vec![
        Step::new(StepType::Trim, ""),
        Step::new(StepType::Hex2dec, ""),
        Step::new(StepType::Multiplier, "8"),
        Step::new(StepType::ValidateRange, "0\n100000"),
    ]);
    let mut ctx = ExecutionContext::new();

    group.throughput(Throughput::Elements(1));
    group.bench_function("hex_multiply_validate", |b| {
        b.iter(|| {
            let mut history = History::new();
            execute(
                &mut ctx,
                &rules,
                None,
                black_box(Value::from(" 1f4 ")),
                ts(0),
                &mut history,
            )
        });
    });

    let delta = RuleSet::new(ValueType::Float).with_steps(vec![Step::new(StepType::DeltaSpeed, "")]);
    group.bench_function("delta_speed", |b| {
        let mut history = History::new();
        let mut n = 0i64;
        b.iter(|| {
            n += 1;
            execute(&mut ctx, &delta, None, Value::Double(n as f64 * 2.5), ts(n), &mut history)
        });
    });

    group.finish();
}

fn bench_cached_payload(c: &mut Criterion) {
    let mut group = c.benchmark_group("cached_payload");

    for size in [10, 100, 1000].iter() {
        let payload = metrics_payload(*size);
        let rules = RuleSet::new(ValueType::Float).with_steps(vec![Step::new(
            StepType::PrometheusPattern,
            "requests_total\nfunction\nsum",
        )]);

        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::new("uncached", size), &payload, |b, payload| {
            let mut ctx = ExecutionContext::new();
            b.iter(|| {
                execute(
                    &mut ctx,
                    &rules,
                    None,
                    Value::from(payload.as_str()),
                    ts(0),
                    &mut History::new(),
                )
            });
        });

        let mut value = Value::from(payload.as_str());
        let cache = PreprocCache::create(&rules, &mut value);
        cache.prepare();
        group.bench_with_input(BenchmarkId::new("cached", size), &cache, |b, cache| {
            let mut ctx = ExecutionContext::new();
            b.iter(|| {
                execute(
                    &mut ctx,
                    &rules,
                    Some(cache.as_ref()),
                    Value::None,
                    ts(0),
                    &mut History::new(),
                )
            });
        });
    }

    group.finish();
}

fn bench_jsonpath(c: &mut Criterion) {
    let mut group = c.benchmark_group("jsonpath");

    for fields in [8, 64, 512].iter() {
        let payload = json_payload(*fields);
        let path = format!("$.f{}", fields - 1);
        let rules = RuleSet::new(ValueType::Uint64).with_steps(vec![Step::new(StepType::Jsonpath, path)]);

        group.bench_with_input(BenchmarkId::new("last_field", fields), &payload, |b, payload| {
            let mut ctx = ExecutionContext::new();
            b.iter(|| {
                execute(
                    &mut ctx,
                    &rules,
                    None,
                    Value::from(black_box(payload.as_str())),
                    ts(0),
                    &mut History::new(),
                )
            });
        });
    }

    group.finish();
}

fn bench_queue(c: &mut Criterion) {
    let mut group = c.benchmark_group("task_queue");
    let parallel = Item::new(1, 1, RuleSet::new(ValueType::Str));
    let serial = Item::new(
        2,
        1,
        RuleSet::new(ValueType::Uint64).with_steps(vec![Step::new(StepType::DeltaValue, "")]),
    );

    for (name, item) in [("parallel", &parallel), ("serial", &serial)] {
        group.throughput(Throughput::Elements(1000));
        group.bench_function(name, |b| {
            b.iter(|| {
                let queue = TaskQueue::new();
                let mut state = queue.lock();
                for i in 0..1000 {
                    let task = ValueTask::new(item, Value::Uint64(i), ts(0), ValueOpt::default());
                    state.push_new(Task::value(task));
                }
                let mut popped = 0;
                while state.pop_new().is_some() {
                    popped += 1;
                }
                black_box(popped)
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_numeric_chain,
    bench_cached_payload,
    bench_jsonpath,
    bench_queue
);
criterion_main!(benches);
