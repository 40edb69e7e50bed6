use std::time::Duration;

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use tokio::runtime::Runtime;

use courier_core::{JobPayload, PayloadMap, SendEmail, Token};
use courier_infra::jobs::{InMemoryJobStore, JobStore, SqliteJobStore};
use courier_infra::{Database, DatabaseConfig};

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("tokio runtime")
}

fn payload() -> PayloadMap {
    SendEmail::signup(Token::generate()).to_map()
}

fn bench_in_memory(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("in_memory_store");
    group.throughput(Throughput::Elements(1));

    group.bench_function("enqueue_claim_delete", |b| {
        let store = InMemoryJobStore::new();
        let payload = payload();
        b.iter(|| {
            rt.block_on(async {
                store
                    .enqueue("send-email", &payload, Duration::from_secs(10))
                    .await
                    .unwrap();
                let job = store.claim().await.unwrap().unwrap();
                store.delete(black_box(job.id)).await.unwrap();
            })
        });
    });

    group.finish();
}

fn bench_sqlite_claim(c: &mut Criterion) {
    let rt = runtime();
    let dir = tempfile::tempdir().expect("tempdir");
    let config = DatabaseConfig::default().with_url(
        dir.path()
            .join("bench.db")
            .to_string_lossy()
            .into_owned(),
    );
    let db = rt.block_on(async {
        let db = Database::connect(&config).await.unwrap();
        db.migrate().await.unwrap();
        db
    });
    let store = SqliteJobStore::new(&db);
    let payload = payload();

    let mut group = c.benchmark_group("sqlite_store");
    // Claim cost with a backlog of already-leased rows ahead of the ready one.
    for backlog in [0usize, 100, 1000] {
        rt.block_on(async {
            sqlx::query("DELETE FROM jobs").execute(db.pool()).await.unwrap();
            for _ in 0..backlog {
                store
                    .enqueue("send-email", &payload, Duration::from_secs(3600))
                    .await
                    .unwrap();
                store.claim().await.unwrap();
            }
        });

        group.throughput(Throughput::Elements(1));
        group.bench_with_input(
            BenchmarkId::new("enqueue_claim_delete", backlog),
            &backlog,
            |b, _| {
                b.iter(|| {
                    rt.block_on(async {
                        store
                            .enqueue("send-email", &payload, Duration::from_secs(10))
                            .await
                            .unwrap();
                        let job = store.claim().await.unwrap().unwrap();
                        store.delete(black_box(job.id)).await.unwrap();
                    })
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_in_memory, bench_sqlite_claim);
criterion_main!(benches);
