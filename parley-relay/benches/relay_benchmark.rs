use criterion::{criterion_group, criterion_main, Criterion};
use parley_relay::notifications::{BufferConfig, NotificationBuffer, OverflowPolicy};
use parley_relay::presence::{ConnectionHandle, PresenceRegistry};
use parley_relay::protocol::{ClientEvent, MessageSend, PendingNotification, UserId};
use parley_relay::router::{Signal, SignalingRouter};
use std::hint::black_box;
use std::sync::Arc;

fn bench_event_decode(c: &mut Criterion) {
    let text = ClientEvent::MessageSend(MessageSend {
        to: "bob".into(),
        from: "alice".into(),
        message: "hello there, are you free for a call later today?".into(),
    })
    .encode()
    .unwrap();

    c.bench_function("message_send_decode", |b| {
        b.iter(|| {
            black_box(ClientEvent::decode(black_box(&text)).unwrap());
        })
    });
}

fn bench_register_lookup(c: &mut Criterion) {
    let registry = PresenceRegistry::new();
    let mut receivers = Vec::new();
    for i in 0..1000 {
        let (handle, rx) = ConnectionHandle::channel(1);
        registry.register(format!("user-{i}").into(), handle);
        receivers.push(rx);
    }
    let target: UserId = "user-500".into();

    c.bench_function("presence_lookup_1000_users", |b| {
        b.iter(|| {
            black_box(registry.lookup(black_box(&target)));
        })
    });

    c.bench_function("presence_register_unregister", |b| {
        let user: UserId = "churn".into();
        b.iter(|| {
            let (handle, _rx) = ConnectionHandle::channel(1);
            registry.register(user.clone(), handle.clone());
            black_box(registry.unregister(&handle));
        })
    });
}

fn bench_enqueue_drain(c: &mut Criterion) {
    let buffer = NotificationBuffer::new();
    let bob: UserId = "bob".into();
    let alice: UserId = "alice".into();

    c.bench_function("buffer_enqueue_drain_16", |b| {
        b.iter(|| {
            for _ in 0..16 {
                buffer.enqueue(&bob, PendingNotification::new(alice.clone(), "hi"));
            }
            black_box(buffer.drain_all(&bob));
        })
    });

    let capped =
        NotificationBuffer::with_config(BufferConfig::capped(64, OverflowPolicy::DropOldest));
    for _ in 0..64 {
        capped.enqueue(&bob, PendingNotification::new(alice.clone(), "hi"));
    }
    c.bench_function("buffer_enqueue_at_cap", |b| {
        b.iter(|| {
            black_box(capped.enqueue(&bob, PendingNotification::new(alice.clone(), "hi")));
        })
    });
}

fn bench_route(c: &mut Criterion) {
    let registry = Arc::new(PresenceRegistry::new());
    let buffer = Arc::new(NotificationBuffer::new());
    let router = SignalingRouter::new(registry.clone(), buffer.clone());

    let (handle, mut rx) = ConnectionHandle::channel(1024);
    registry.register("bob".into(), handle);

    c.bench_function("route_message_online", |b| {
        b.iter(|| {
            let signal = Signal::MessageSend(MessageSend {
                to: "bob".into(),
                from: "alice".into(),
                message: "hello".into(),
            });
            black_box(router.route(signal));
            while rx.try_recv().is_ok() {}
        })
    });

    c.bench_function("route_message_offline", |b| {
        b.iter(|| {
            let signal = Signal::MessageSend(MessageSend {
                to: "carol".into(),
                from: "alice".into(),
                message: "hello".into(),
            });
            black_box(router.route(signal));
            buffer.drain_all(&"carol".into());
        })
    });
}

criterion_group!(
    benches,
    bench_event_decode,
    bench_register_lookup,
    bench_enqueue_drain,
    bench_route,
);
criterion_main!(benches);
