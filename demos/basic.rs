use std::time::Duration;

use ticket_bucket::{Error, TokenBucket};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    helpers::init_logging();

    let bucket = TokenBucket::builder()
        .name("basic")
        .capacity(10)
        .start_empty(true)
        .auto_drip(Duration::from_millis(100), 1)
        .refund(Duration::from_secs(5))
        .build()?;

    bucket.dripped().subscribe(|count| println!("dripped {}", count));

    println!("Waiting for tokens...");
    tokio::time::sleep(Duration::from_millis(550)).await;

    let ticket = loop {
        match bucket.take(7) {
            Ok(ticket) => break ticket,
            Err(Error::OutOfTokens(e)) => {
                println!("{}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            Err(e) => return Err(e.into()),
        }
    };

    println!("took {} tokens, {} left", ticket.count(), bucket.tokens());

    // Pretend the work failed.
    let refunded = bucket.refund(&ticket);
    println!("refunded {} tokens, {} left", refunded, bucket.tokens());
    Ok(())
}
