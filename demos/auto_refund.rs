use std::time::{Duration, Instant};

use ticket_bucket::TokenBucket;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    helpers::init_logging();

    let bucket = TokenBucket::builder()
        .name("auto-refund")
        .capacity(10)
        .refund(Duration::from_millis(500))
        .auto_refund(true)
        .sweep_floor(Duration::from_millis(100))
        .build()?;

    let start = Instant::now();

    bucket.tokens_refunded().subscribe(move |count| {
        println!("{} tokens came back after {:?}", count, start.elapsed());
    });

    // Tickets that are never refunded come back on their own once expired.
    let _forgotten = bucket.take(4)?;
    let _abandoned = bucket.take(6)?;
    println!("bucket drained: {:?}", bucket);

    while bucket.tokens() < bucket.capacity() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    println!("bucket refilled: {:?}", bucket);
    Ok(())
}
