use divan::{black_box, AllocProfiler, Bencher};
use pivot_engine::{AggSpec, DataSignal, PivotConfig, PivotContext, Pool, RowUpdate, SortSpec};
use serde_json::json;

#[global_allocator]
static ALLOC: AllocProfiler = AllocProfiler::system();

fn main() {
    divan::main();
}

fn config() -> PivotConfig {
    PivotConfig::new(
        ["region", "country", "city"],
        vec![AggSpec::sum("sales", "amount"), AggSpec::count("orders")],
    )
}

fn order(i: usize, amount: usize) -> RowUpdate {
    RowUpdate::create_json(
        format!("o{i}"),
        json!({
            "region": format!("r{}", i % 8),
            "country": format!("c{}", i % 64),
            "city": format!("t{}", i % 512),
            "amount": amount,
        }),
    )
}

fn loaded(rows: usize, config: PivotConfig) -> PivotContext {
    let mut ctx = PivotContext::new("bench", config, DataSignal::new()).expect("valid config");
    ctx.step((0..rows).map(|i| order(i, i % 100)).collect())
        .expect("initial load");
    ctx
}

// --------------------------------------------------------------------------
// Initial load (root-only fast path)
// --------------------------------------------------------------------------

#[divan::bench(args = [1_000, 10_000])]
fn initial_load(bencher: Bencher, rows: usize) {
    bencher
        .with_inputs(|| (0..rows).map(|i| order(i, i % 100)).collect::<Vec<_>>())
        .bench_values(|batch| {
            let mut ctx = PivotContext::new("bench", config(), DataSignal::new()).expect("valid config");
            black_box(ctx.step(batch).expect("cycle"))
        });
}

// --------------------------------------------------------------------------
// Small batches against a loaded tree (diff path)
// --------------------------------------------------------------------------

#[divan::bench(args = [10, 100, 1_000])]
fn incremental_batch(bencher: Bencher, batch: usize) {
    bencher
        .with_inputs(|| {
            let ctx = loaded(10_000, config());
            // half updates, half new rows that open new cities
            let updates: Vec<RowUpdate> = (0..batch)
                .map(|i| if i % 2 == 0 { order(i * 7, 1) } else { order(20_000 + i * 13, 3) })
                .collect();
            (ctx, updates)
        })
        .bench_values(|(mut ctx, updates)| black_box(ctx.step(updates).expect("cycle")));
}

#[divan::bench(args = [10, 100])]
fn incremental_batch_sorted(bencher: Bencher, batch: usize) {
    bencher
        .with_inputs(|| {
            let ctx = loaded(10_000, config().with_sort(vec![SortSpec::desc("sales")]));
            let updates: Vec<RowUpdate> = (0..batch).map(|i| order(i * 11, 250)).collect();
            (ctx, updates)
        })
        .bench_values(|(mut ctx, updates)| black_box(ctx.step(updates).expect("cycle")));
}

#[divan::bench]
fn prune_city(bencher: Bencher) {
    bencher
        .with_inputs(|| loaded(10_000, config()))
        .bench_values(|mut ctx| {
            // every order of city t0
            let deletes: Vec<RowUpdate> = (0..10_000)
                .step_by(512)
                .map(|i| RowUpdate::delete(format!("o{i}")))
                .collect();
            black_box(ctx.step(deletes).expect("cycle"))
        });
}

// --------------------------------------------------------------------------
// Scheduler overhead
// --------------------------------------------------------------------------

#[divan::bench]
fn noop_cycle(bencher: Bencher) {
    let pool = Pool::new();
    let ctx = PivotContext::new("bench", config(), pool.signal()).expect("valid config");
    pool.register(ctx).expect("register");
    bencher.bench(|| black_box(pool.update_task().run().expect("cycle")));
}
