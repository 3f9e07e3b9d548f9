use criterion::{black_box, criterion_group, criterion_main, Criterion};
use tokio::runtime::Runtime;

use spectrum_monitor::adapters::MockAdapter;
use spectrum_monitor::core::display_lock;
use spectrum_monitor::parameter::{standard_parameters, ApplyRequest};
use spectrum_monitor::sequencer::{execution_order, plot_bounds, Registry, Sequencer};
use spectrum_monitor::session::{mock_connector, Session, SessionOptions};
use std::time::Duration;

fn bench_planning(c: &mut Criterion) {
    let mut group = c.benchmark_group("sequencer_plan");

    group.bench_function("execution_order", |b| {
        let parameters = standard_parameters();
        b.iter(|| black_box(execution_order(black_box(&parameters))));
    });

    group.bench_function("plot_bounds_swept", |b| {
        b.iter(|| {
            black_box(plot_bounds(
                black_box(Some(1e9)),
                Some(0.01),
                Some(0.0),
                Some(1e9),
                Some(0.0),
                Some(10.0),
                Some(10.0),
            ))
        });
    });

    group.bench_function("plot_bounds_zero_span", |b| {
        b.iter(|| {
            black_box(plot_bounds(
                black_box(Some(0.0)),
                Some(0.0123456),
                None,
                None,
                Some(-10.0),
                Some(8.0),
                Some(5.0),
            ))
        });
    });

    group.finish();
}

fn bench_apply(c: &mut Criterion) {
    let mut group = c.benchmark_group("sequencer_apply");

    let rt = Runtime::new().expect("tokio runtime");
    let mock = MockAdapter::new("ADDR1");
    let session = Session::new(
        "instrument",
        SessionOptions {
            terminator: "\n".to_string(),
            settle: Duration::ZERO,
            query_timeout: Duration::from_millis(200),
        },
        mock_connector(mock.clone()),
    );
    rt.block_on(async {
        mock.respond_with(|command| command.ends_with('?').then(|| "0".to_string()))
            .await;
        session.open("ADDR1").await.expect("open mock");
    });
    let sequencer = Sequencer::new(Registry::standard(), display_lock());

    group.sample_size(20);
    group.bench_function("refresh_all", |b| {
        b.to_async(&rt).iter(|| async {
            sequencer
                .apply(&session, black_box(&ApplyRequest::new()))
                .await
                .expect("apply");
        });
    });

    group.bench_function("write_two_then_refresh", |b| {
        let request = ApplyRequest::new().set("startfreq", 0).set("stopfreq", 1e9);
        b.to_async(&rt).iter(|| async {
            sequencer
                .apply(&session, black_box(&request))
                .await
                .expect("apply");
            mock.clear_writes().await;
        });
    });

    group.finish();
}

criterion_group!(benches, bench_planning, bench_apply);
criterion_main!(benches);
