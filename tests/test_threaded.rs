use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use ticket_bucket::{Error, TokenBucket};
use tokio::time::Duration;

const THREADS: usize = 8;
const ITERATIONS: usize = 1000;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_take_and_refund() -> anyhow::Result<()> {
    helpers::init_logging();

    let bucket = Arc::new(
        TokenBucket::builder()
            .name("threaded")
            .capacity(50)
            .refund(Duration::from_secs(600))
            .build()?,
    );

    let failures = Arc::new(AtomicUsize::new(0));
    let mut threads = Vec::new();

    for n in 0..THREADS {
        let bucket = bucket.clone();
        let failures = failures.clone();

        threads.push(thread::spawn(move || {
            let mut held = Vec::new();

            for i in 0..ITERATIONS {
                match bucket.take(1 + (n + i) % 3) {
                    Ok(ticket) => held.push(ticket),
                    Err(Error::OutOfTokens(..)) => {
                        failures.fetch_add(1, Ordering::SeqCst);
                    }
                    Err(error) => panic!("unexpected error: {}", error),
                }

                assert!(bucket.tokens() <= bucket.capacity());

                if i % 2 == 1 {
                    for ticket in held.drain(..) {
                        assert_eq!(bucket.refund(&ticket), ticket.count());
                    }
                }
            }

            for ticket in held {
                bucket.refund(&ticket);
            }
        }));
    }

    for t in threads {
        t.join().expect("thread panicked");
    }

    assert_eq!(bucket.tokens(), 50);
    assert_eq!(bucket.outstanding_tickets(), 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_double_refund() -> anyhow::Result<()> {
    let bucket = Arc::new(
        TokenBucket::builder()
            .capacity(10)
            .refund(Duration::from_secs(600))
            .build()?,
    );

    let ticket = bucket.take(5)?;
    let refunded = Arc::new(AtomicUsize::new(0));
    let mut threads = Vec::new();

    for _ in 0..THREADS {
        let bucket = bucket.clone();
        let refunded = refunded.clone();
        let mut copy = ticket.try_clone()?;

        threads.push(thread::spawn(move || {
            let count = if refunded.load(Ordering::SeqCst) % 2 == 0 {
                copy.refund()
            } else {
                bucket.refund(&copy)
            };

            refunded.fetch_add(count, Ordering::SeqCst);
        }));
    }

    for t in threads {
        t.join().expect("thread panicked");
    }

    assert_eq!(refunded.load(Ordering::SeqCst), 5);
    assert_eq!(bucket.tokens(), 10);
    Ok(())
}

#[test]
fn test_take_never_overruns() -> anyhow::Result<()> {
    let bucket = Arc::new(TokenBucket::builder().capacity(1000).build()?);
    let taken = Arc::new(AtomicUsize::new(0));
    let mut threads = Vec::new();

    for _ in 0..THREADS {
        let bucket = bucket.clone();
        let taken = taken.clone();

        threads.push(thread::spawn(move || {
            while bucket.take(7).is_ok() {
                taken.fetch_add(7, Ordering::SeqCst);
            }
        }));
    }

    for t in threads {
        t.join().expect("thread panicked");
    }

    assert_eq!(taken.load(Ordering::SeqCst), 994);
    assert_eq!(bucket.tokens(), 6);
    Ok(())
}
