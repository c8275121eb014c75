//! Cross-thread stress tests for every queue variant.
//!
//! Each test pushes uniquely tagged elements from the variant's full
//! producer cardinality while consumers drain concurrently, then checks the
//! two properties the queues promise: nothing is lost or duplicated, and
//! each producer's own elements come out in its push order.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

/// Tags an element with its producer: `producer * STRIDE + sequence`.
const STRIDE: u64 = 1_000_000;

fn assert_no_loss_no_duplication(seen: &[u64], producers: u64, per_producer: u64) {
    assert_eq!(seen.len() as u64, producers * per_producer);
    let distinct: HashSet<_> = seen.iter().copied().collect();
    assert_eq!(distinct.len() as u64, producers * per_producer);
    for p in 0..producers {
        let own: Vec<_> = seen
            .iter()
            .copied()
            .filter(|v| v / STRIDE == p)
            .map(|v| v % STRIDE)
            .collect();
        assert_eq!(
            own,
            (0..per_producer).collect::<Vec<_>>(),
            "producer {p} lost its FIFO order"
        );
    }
}

#[test]
fn spsc_bounded_pipeline() {
    let (mut tx, mut rx) = weft::spsc::bounded::channel::<u64>(256).unwrap();
    let count = 500_000u64;

    let producer = thread::spawn(move || {
        for i in 0..count {
            while tx.push(i).is_err() {
                std::hint::spin_loop();
            }
        }
    });

    let consumer = thread::spawn(move || {
        let mut seen = Vec::with_capacity(count as usize);
        while seen.len() < count as usize {
            if let Some(v) = rx.pop() {
                seen.push(v);
            } else {
                std::hint::spin_loop();
            }
        }
        seen
    });

    producer.join().unwrap();
    let seen = consumer.join().unwrap();
    assert_no_loss_no_duplication(&seen, 1, count);
}

#[test]
fn spsc_unbounded_pipeline_with_growth() {
    // A small chunk keeps the producer linking new chunks throughout.
    let (mut tx, mut rx) = weft::spsc::unbounded::channel::<u64>(16).unwrap();
    let count = 200_000u64;

    let producer = thread::spawn(move || {
        for i in 0..count {
            tx.push(i);
        }
    });

    let consumer = thread::spawn(move || {
        let mut seen = Vec::with_capacity(count as usize);
        while seen.len() < count as usize {
            if let Some(v) = rx.pop() {
                seen.push(v);
            } else {
                std::hint::spin_loop();
            }
        }
        seen
    });

    producer.join().unwrap();
    let seen = consumer.join().unwrap();
    assert_no_loss_no_duplication(&seen, 1, count);
}

#[test]
fn spmc_fan_out() {
    let (mut tx, rx) = weft::spmc::channel::<u64>(128).unwrap();
    let consumers = 4;
    let count = 200_000u64;
    let done = Arc::new(AtomicBool::new(false));

    let workers: Vec<_> = (0..consumers)
        .map(|_| {
            let mut rx = rx.clone();
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let mut seen = Vec::new();
                loop {
                    match rx.pop() {
                        Some(v) => seen.push(v),
                        None => {
                            if done.load(Ordering::Acquire) && rx.is_empty() {
                                break;
                            }
                            std::hint::spin_loop();
                        }
                    }
                }
                seen
            })
        })
        .collect();

    for i in 0..count {
        while tx.push(i).is_err() {
            std::thread::yield_now();
        }
    }
    done.store(true, Ordering::Release);

    let mut all = Vec::new();
    for w in workers {
        let seen = w.join().unwrap();
        // Every consumer's claims form an increasing subsequence of the
        // producer's order.
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
        all.extend(seen);
    }
    assert_no_loss_no_duplication(&all, 1, count);
}

#[test]
fn mpsc_growable_fan_in() {
    let producers = 4u64;
    let per_producer = 100_000u64;
    // The ceiling is far above the workload; growth stops after a few
    // doublings and the queue behaves like a bounded ring.
    let (tx, mut rx) = weft::mpsc::growable::<u64>(4, 4096).unwrap();

    let handles: Vec<_> = (0..producers)
        .map(|p| {
            let mut tx = tx.clone();
            thread::spawn(move || {
                for i in 0..per_producer {
                    let tag = p * STRIDE + i;
                    loop {
                        match tx.push(tag) {
                            Ok(()) => break,
                            Err(full) => {
                                let _ = full.into_inner();
                                std::thread::yield_now();
                            }
                        }
                    }
                }
            })
        })
        .collect();
    drop(tx);

    let mut seen = Vec::with_capacity((producers * per_producer) as usize);
    while seen.len() < (producers * per_producer) as usize {
        if let Some(v) = rx.pop() {
            seen.push(v);
        } else {
            std::hint::spin_loop();
        }
    }
    assert_eq!(rx.pop(), None);

    for h in handles {
        h.join().unwrap();
    }
    assert_no_loss_no_duplication(&seen, producers, per_producer);
}

#[test]
fn mpsc_unbounded_fan_in_tiny_chunks() {
    // 2-slot chunks force a resize every element or two, hammering the
    // link/jump protocol under full producer contention.
    let producers = 3u64;
    let per_producer = 20_000u64;
    let (tx, mut rx) = weft::mpsc::unbounded::<u64>(2).unwrap();

    let handles: Vec<_> = (0..producers)
        .map(|p| {
            let mut tx = tx.clone();
            thread::spawn(move || {
                for i in 0..per_producer {
                    tx.push(p * STRIDE + i).unwrap();
                }
            })
        })
        .collect();
    drop(tx);

    let mut seen = Vec::with_capacity((producers * per_producer) as usize);
    while seen.len() < (producers * per_producer) as usize {
        if let Some(v) = rx.pop() {
            seen.push(v);
        } else {
            std::hint::spin_loop();
        }
    }

    for h in handles {
        h.join().unwrap();
    }
    assert_no_loss_no_duplication(&seen, producers, per_producer);
}

#[test]
fn blocking_wrappers_move_a_fixed_workload() {
    use std::sync::atomic::AtomicU64;

    let (mut tx, mut rx) = weft::spsc::bounded::channel::<u64>(64).unwrap();
    let count = 50_000u64;
    let done = Arc::new(AtomicBool::new(false));
    let supplied = Arc::new(AtomicU64::new(0));
    let consumed = Arc::new(AtomicU64::new(0));

    let supply = Arc::clone(&supplied);
    let supply_gate = Arc::clone(&supplied);
    let producer = thread::spawn(move || {
        // Supplier-driven blocking fill: hand out the sequence until the
        // workload is out (the final batch may overshoot by a few).
        tx.fill_blocking(
            move || supply.fetch_add(1, Ordering::Relaxed),
            &weft::wait::YieldWait::default(),
            &move || supply_gate.load(Ordering::Relaxed) < count,
        )
    });

    let stop = Arc::clone(&done);
    let sink = Arc::clone(&consumed);
    let consumer = thread::spawn(move || {
        rx.drain_blocking(
            |v| assert_eq!(v, sink.fetch_add(1, Ordering::Relaxed)),
            &weft::wait::YieldWait::default(),
            &move || !stop.load(Ordering::Acquire),
        )
    });

    let produced = producer.join().unwrap();
    assert!(produced >= count, "the whole workload was handed over");

    // Stop the drain loop only after everything produced was consumed.
    while consumed.load(Ordering::Relaxed) < produced {
        thread::sleep(std::time::Duration::from_millis(1));
    }
    done.store(true, Ordering::Release);

    let drained = consumer.join().unwrap();
    assert_eq!(drained, produced);
}
