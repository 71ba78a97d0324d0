use std::sync::Arc;

use anyhow::{Context, Result};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, SamplingMode, Throughput};
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde_json::json;

use permsql::{Actor, Catalog, EngineBuilder, EngineConfig, PageRequest, PermissionEngine, PermissionsConfig, Resource};

struct BenchCtx {
    engine: PermissionEngine,
    rt: tokio::runtime::Runtime,
}

impl BenchCtx {
    /// `dbs` databases with `tables` tables each; every tenth database is locked to team "ops".
    fn new(dbs: usize, tables: usize) -> Result<Self> {
        let cat = Catalog::in_memory().context("catalog")?;
        let mut locked = serde_json::Map::new();
        for d in 0..dbs {
            let db = format!("db{:04}", d);
            for t in 0..tables {
                cat.add_table(&db, &format!("t{:04}", t))?;
            }
            if d % 10 == 0 {
                locked.insert(db, json!({"allow": {"team": "ops"}}));
            }
        }
        let permissions = PermissionsConfig(json!({"databases": locked}));
        let engine = EngineBuilder::new(Arc::new(cat), EngineConfig::default())
            .with_core_models()
            .with_core_actions()
            .with_default_sources(permissions)
            .build()
            .context("engine")?;
        let rt = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .worker_threads(2)
            .build()
            .context("tokio runtime")?;
        Ok(BenchCtx { engine, rt })
    }

    fn list_all(&self, actor: &Actor, limit: u32) -> Result<usize> {
        let mut seen = 0usize;
        let mut cursor: Option<String> = None;
        loop {
            let mut req = PageRequest::new().limit(limit);
            if let Some(c) = cursor.take() {
                req = req.cursor(c);
            }
            let page = self.rt.block_on(self.engine.allowed_resources(Some(actor), "view-table", req))?;
            seen += page.resources.len();
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => return Ok(seen),
            }
        }
    }
}

fn bench_resolution(c: &mut Criterion) {
    let sizes = [(10usize, 10usize), (50, 40)];
    let mut group = c.benchmark_group("resolution");
    group.sampling_mode(SamplingMode::Flat);
    group.sample_size(20);

    for &(dbs, tables) in &sizes {
        let ctx = match BenchCtx::new(dbs, tables) {
            Ok(ctx) => ctx,
            Err(e) => {
                eprintln!("skipping {}x{}: {:#}", dbs, tables, e);
                continue;
            }
        };
        let label = format!("{}x{}", dbs, tables);
        let actor = Actor::with_id("bench").attr("team", "dev");

        // Point checks on random tables
        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::new("point_check", &label), &(dbs, tables), |b, &(dbs, tables)| {
            let mut rng = StdRng::seed_from_u64(0xBEEF_CAFE);
            b.iter(|| {
                let r = Resource::child(
                    &format!("db{:04}", rng.gen_range(0..dbs)),
                    &format!("t{:04}", rng.gen_range(0..tables)),
                );
                let d = ctx.rt.block_on(ctx.engine.allowed(Some(&actor), "view-table", Some(&r)));
                criterion::black_box(d.ok());
            });
        });

        // Full listing, paged
        group.throughput(Throughput::Elements((dbs * tables) as u64));
        for &limit in &[50u32, 500] {
            group.bench_with_input(BenchmarkId::new(format!("list_paged_{}", limit), &label), &limit, |b, &limit| {
                b.iter(|| criterion::black_box(ctx.list_all(&actor, limit).ok()));
            });
        }
    }
    group.finish();
}

criterion_group!(benches, bench_resolution);
criterion_main!(benches);
