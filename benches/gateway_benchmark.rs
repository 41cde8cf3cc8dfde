//! Benchmarks for the gateway hot paths.

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use rust_apigateway::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use rust_apigateway::dispatch::{BoxError, EventListener, ParallelQueue, WaitStrategy};
use rust_apigateway::load_balance::{LoadBalance, RandomLoadBalance, RoundRobinLoadBalance};
use rust_apigateway::ratelimit::{RateLimit, TokenBucketLimiter};
use rust_apigateway::rule::{Rule, ServiceInstance};
use rust_apigateway::store::RuleSnapshot;
use std::sync::Arc;
use std::time::Duration;

struct Discard;

impl EventListener<u64> for Discard {
    fn on_event(&self, event: &u64) -> Result<(), BoxError> {
        black_box(event);
        Ok(())
    }

    fn on_exception(&self, _error: BoxError, _sequence: i64, _event: u64) {}
}

fn bench_dispatch(c: &mut Criterion) {
    let mut group = c.benchmark_group("dispatch");
    group.throughput(Throughput::Elements(1));

    for strategy in [WaitStrategy::Blocking, WaitStrategy::Yielding, WaitStrategy::BusySpin] {
        let queue = ParallelQueue::builder()
            .capacity(16 * 1024)
            .threads(2)
            .wait_strategy(strategy)
            .listener(Arc::new(Discard))
            .build()
            .expect("valid queue");
        queue.start().expect("queue starts");

        group.bench_function(format!("add_{:?}", strategy).to_lowercase(), |b| {
            b.iter(|| queue.add(black_box(7)).expect("queue accepts"));
        });
        queue.shut_down();
    }

    group.finish();
}

fn bench_rate_limiter(c: &mut Criterion) {
    let mut group = c.benchmark_group("rate_limiter");
    group.throughput(Throughput::Elements(1));

    let limiter = TokenBucketLimiter::new(u64::MAX / 2, Duration::from_secs(1));
    group.bench_function("token_bucket_admit", |b| {
        b.iter(|| black_box(limiter.try_acquire()));
    });

    let exhausted = TokenBucketLimiter::new(1, Duration::from_secs(3600));
    exhausted.try_acquire();
    group.bench_function("token_bucket_reject", |b| {
        b.iter(|| black_box(exhausted.try_acquire()));
    });

    group.finish();
}

fn bench_circuit_breaker(c: &mut Criterion) {
    let config = CircuitBreakerConfig::default();

    c.bench_function("circuit_breaker_allow_request", |b| {
        let cb = CircuitBreaker::new(config.clone());
        b.iter(|| black_box(cb.allow_request()));
    });

    c.bench_function("circuit_breaker_record_failure", |b| {
        b.iter_batched(
            || CircuitBreaker::new(config.clone()),
            |cb| {
                cb.record_failure();
                black_box(cb)
            },
            BatchSize::SmallInput,
        );
    });
}

fn bench_rule_resolution(c: &mut Criterion) {
    let mut group = c.benchmark_group("rule_resolution");

    let mut rules = Vec::new();
    for i in 0..50 {
        rules.push(
            Rule::new(format!("exact-{}", i), "user-service")
                .with_path(format!("/api/users/{}", i)),
        );
    }
    rules.push(Rule::new("api", "user-service").with_prefix("/api/"));
    rules.push(Rule::new("orders", "user-service").with_prefix("/api/orders/"));
    let snapshot = RuleSnapshot::build(rules);

    group.bench_function("exact_path", |b| {
        b.iter(|| black_box(snapshot.resolve("user-service", "/api/users/42")));
    });

    group.bench_function("longest_prefix", |b| {
        b.iter(|| black_box(snapshot.resolve("user-service", "/api/orders/1234")));
    });

    group.bench_function("no_match", |b| {
        b.iter(|| black_box(snapshot.resolve("user-service", "/static/logo.png")));
    });

    group.bench_function("unknown_service", |b| {
        b.iter(|| black_box(snapshot.resolve("billing", "/api/users/42")));
    });

    group.finish();
}

fn bench_load_balance(c: &mut Criterion) {
    let mut group = c.benchmark_group("load_balance");
    let instances: Vec<ServiceInstance> = (0..16)
        .map(|i| ServiceInstance::new("svc", format!("10.0.0.{}", i), 8080))
        .collect();

    group.bench_function("random", |b| {
        b.iter(|| black_box(RandomLoadBalance.choose(&instances)));
    });

    let round_robin = RoundRobinLoadBalance::new();
    group.bench_function("round_robin", |b| {
        b.iter(|| black_box(round_robin.choose(&instances)));
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_dispatch,
    bench_rate_limiter,
    bench_circuit_breaker,
    bench_rule_resolution,
    bench_load_balance,
);

criterion_main!(benches);
