//! Queue throughput benchmark.
//!
//! Run with: cargo test --release throughput_bench -- --ignored --nocapture

use std::thread;
use std::time::Instant;

const ITERATIONS: u64 = 1 << 24;

fn report(label: &str, count: u64, elapsed: std::time::Duration) {
    let per_sec = count as f64 / elapsed.as_secs_f64();
    println!("{label:>24}: {:>8.2} M msg/s", per_sec / 1_000_000.0);
}

fn bench_spsc_bounded() {
    let (mut tx, mut rx) = weft::spsc::bounded::channel::<u64>(1 << 16).unwrap();

    let producer = thread::spawn(move || {
        for i in 0..ITERATIONS {
            while tx.push(i).is_err() {
                std::hint::spin_loop();
            }
        }
    });

    let start = Instant::now();
    let mut received = 0u64;
    while received < ITERATIONS {
        if rx.pop().is_some() {
            received += 1;
        } else {
            std::hint::spin_loop();
        }
    }
    let elapsed = start.elapsed();
    producer.join().unwrap();
    report("spsc bounded", ITERATIONS, elapsed);
}

fn bench_spsc_unbounded() {
    let (mut tx, mut rx) = weft::spsc::unbounded::channel::<u64>(1 << 12).unwrap();

    let producer = thread::spawn(move || {
        for i in 0..ITERATIONS {
            tx.push(i);
        }
    });

    let start = Instant::now();
    let mut received = 0u64;
    while received < ITERATIONS {
        if rx.pop().is_some() {
            received += 1;
        } else {
            std::hint::spin_loop();
        }
    }
    let elapsed = start.elapsed();
    producer.join().unwrap();
    report("spsc unbounded", ITERATIONS, elapsed);
}

fn bench_mpsc(producers: u64) {
    let per_producer = ITERATIONS / producers;
    let (tx, mut rx) = weft::mpsc::growable::<u64>(1 << 10, 1 << 16).unwrap();

    let handles: Vec<_> = (0..producers)
        .map(|_| {
            let mut tx = tx.clone();
            thread::spawn(move || {
                for i in 0..per_producer {
                    while tx.push(i).is_err() {
                        std::hint::spin_loop();
                    }
                }
            })
        })
        .collect();
    drop(tx);

    let total = per_producer * producers;
    let start = Instant::now();
    let mut received = 0u64;
    while received < total {
        if rx.pop().is_some() {
            received += 1;
        } else {
            std::hint::spin_loop();
        }
    }
    let elapsed = start.elapsed();
    for h in handles {
        h.join().unwrap();
    }
    report(&format!("mpsc x{producers}"), total, elapsed);
}

#[test]
#[ignore]
fn throughput_bench() {
    println!();
    bench_spsc_bounded();
    bench_spsc_unbounded();
    bench_mpsc(1);
    bench_mpsc(4);
}
