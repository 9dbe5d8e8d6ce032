use std::hint::black_box;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use artifact_client::prelude::{
    ClientConfiguration, Credentials, ExecuteRequest, HttpClient, ServiceClient, ServiceConfig,
    ServiceDetails,
};
use artifact_client::{HttpTransport, TransportFuture};
use bytes::Bytes;
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use http::{Request, Response};
use tokio::runtime::Runtime;

/// Answers 503 for the first `failures_per_cycle` calls of every cycle, then 200.
struct CyclingTransport {
    failures_per_cycle: usize,
    calls: AtomicUsize,
}

impl CyclingTransport {
    fn new(failures_per_cycle: usize) -> Arc<Self> {
        Arc::new(Self {
            failures_per_cycle,
            calls: AtomicUsize::new(0),
        })
    }
}

impl HttpTransport for CyclingTransport {
    fn send(&self, request: Request<Bytes>) -> TransportFuture<'_> {
        let call = self.calls.fetch_add(1, Ordering::Relaxed);
        let status = if call % (self.failures_per_cycle + 1) < self.failures_per_cycle {
            503
        } else {
            200
        };
        black_box(request);
        Box::pin(async move {
            Ok(Response::builder()
                .status(status)
                .body(Bytes::from_static(b"{\"status\":\"ok\"}"))
                .expect("response"))
        })
    }
}

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .expect("build benchmark runtime")
}

fn bench_execute(c: &mut Criterion) {
    let runtime = runtime();
    let mut group = c.benchmark_group("execute");
    group.throughput(Throughput::Elements(1));

    for failures in [0_usize, 1, 3] {
        let client = runtime.block_on(async {
            let config = ClientConfiguration::builder()
                .custom_transport(CyclingTransport::new(failures))
                .retries(3)
                .default_header("X-Team", "release")
                .build()
                .expect("config");
            HttpClient::build(&config).await.expect("client")
        });

        group.bench_with_input(
            BenchmarkId::new("failures_before_success", failures),
            &client,
            |b, client| {
                b.to_async(&runtime).iter(|| async {
                    let response = client
                        .execute(ExecuteRequest::get(
                            "https://artifacts.example.com/artifactory/api/system/ping?x=1",
                        ))
                        .await
                        .expect("response");
                    black_box(response);
                });
            },
        );
    }
    group.finish();
}

fn bench_send_all(c: &mut Criterion) {
    let runtime = runtime();
    let mut group = c.benchmark_group("send_all");

    for threads in [1_usize, 3, 8] {
        let client = runtime.block_on(async {
            let details = ServiceDetails::new("https://artifacts.example.com/artifactory/")
                .expect("details")
                .with_credentials(Credentials::access_token("token"));
            let config = ServiceConfig::builder(details)
                .threads(threads)
                .custom_transport(CyclingTransport::new(0))
                .build()
                .expect("service config");
            ServiceClient::build(&config).await.expect("service client")
        });

        group.throughput(Throughput::Elements(64));
        group.bench_with_input(BenchmarkId::new("threads", threads), &client, |b, client| {
            b.to_async(&runtime).iter(|| async {
                let requests = (0..64)
                    .map(|index| ExecuteRequest::get(format!("api/storage/libs-release/{index}")));
                black_box(client.send_all(requests).await);
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_execute, bench_send_all);
criterion_main!(benches);
