//! Performance benchmarks for hmq
//!
//! Run with: cargo bench

use criterion::{criterion_group, criterion_main, Criterion};
use hmq::{Broker, BrokerOptions, Message};

fn sample_message() -> Message {
    let mut message = Message::queue("orders", 1001);
    message.set_id("m-bench");
    message.set_source("producer-1");
    message.set_string_content("{\"order\": 42, \"qty\": 7}");
    message.with_header("Trace", "bench")
}

fn bench_message_creation(c: &mut Criterion) {
    c.bench_function("Message::queue", |b| {
        b.iter(|| Message::queue("orders", 1001));
    });

    c.bench_function("Message::create_acknowledge", |b| {
        let message = sample_message();
        b.iter(|| message.create_acknowledge(Some("busy")));
    });
}

fn bench_codec(c: &mut Criterion) {
    let message = sample_message();

    c.bench_function("codec encode", |b| {
        b.iter(|| hmq::codec::encode(&message).unwrap());
    });

    let bytes = hmq::codec::encode(&message).unwrap();
    c.bench_function("codec decode", |b| {
        b.iter(|| hmq::codec::decode(&bytes).unwrap().unwrap());
    });
}

fn bench_store(c: &mut Criterion) {
    use hmq::queue::store::MessageStore;

    c.bench_function("store push/pop", |b| {
        let mut store = MessageStore::new(0);
        b.iter(|| {
            store.push(Message::queue("orders", 1)).unwrap();
            store.pop().unwrap()
        });
    });
}

fn bench_broker_push(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    let broker = rt.block_on(async {
        let broker = Broker::new(BrokerOptions::default());
        broker
            .create_queue("bench", hmq::QueueOptions::default())
            .await
            .unwrap();
        broker
    });

    c.bench_function("broker push (no consumers)", |b| {
        b.to_async(&rt).iter(|| async {
            let mut message = Message::queue("bench", 1001);
            message.set_string_content("payload");
            broker.push("bench", message).await.unwrap()
        });
    });
}

criterion_group!(
    benches,
    bench_message_creation,
    bench_codec,
    bench_store,
    bench_broker_push,
);
criterion_main!(benches);
