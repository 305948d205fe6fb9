use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use seqloop_common::config::{SamplingConfig, WorkerConfig};
use seqloop_proto::{SessionId, WorkerId};
use seqloop_worker::{
    stream_channel, ByteLevelModel, InferenceWorker, ModelBackend, StreamHandle, WorkerCommand,
};
use std::sync::Arc;
use tokio::sync::oneshot;

/// Worker with `sessions` sessions that are all mid-generation
fn generating_worker(sessions: u64) -> (InferenceWorker<ByteLevelModel>, Vec<StreamHandle>) {
    let model = Arc::new(ByteLevelModel::new());
    let config = WorkerConfig::default();
    let context = model.new_context(config.max_sessions).unwrap();
    let mut worker = InferenceWorker::new(WorkerId(0), model, context, config);

    let mut handles = Vec::new();
    for id in 0..sessions {
        let (ack, _) = oneshot::channel();
        worker.handle_command(WorkerCommand::CreateSession {
            session_id: SessionId(id),
            sampling: SamplingConfig::greedy(),
            ack,
        });
        let (ack, _) = oneshot::channel();
        worker.handle_command(WorkerCommand::AppendInput {
            session_id: SessionId(id),
            text_delta: "the quick brown fox".to_string(),
            ack,
        });
        let (sink, handle) = stream_channel(SessionId(id), 1 << 16);
        worker.handle_command(WorkerCommand::Generate {
            session_id: SessionId(id),
            max_new_tokens: u32::MAX,
            sink,
        });
        handles.push(handle);
    }
    // Consume the prefill so the benchmark measures decode ticks.
    worker.tick();
    (worker, handles)
}

fn bench_decode_tick(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode_tick");
    for sessions in [1u64, 8, 32] {
        group.bench_with_input(BenchmarkId::from_parameter(sessions), &sessions, |b, &n| {
            let (mut worker, mut handles) = generating_worker(n);
            b.iter(|| {
                black_box(worker.tick());
                for handle in handles.iter_mut() {
                    while handle.try_recv().is_some() {}
                }
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_decode_tick);
criterion_main!(benches);
