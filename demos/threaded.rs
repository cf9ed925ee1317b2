use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;

use ticket_bucket::TokenBucket;

#[tokio::main]
async fn main() -> Result<()> {
    helpers::init_logging();

    for iteration in 0..5 {
        let bucket = Arc::new(
            TokenBucket::builder()
                .capacity(100)
                .auto_drip(Duration::from_millis(20), 10)
                .refund(Duration::from_secs(10))
                .build()?,
        );

        let mut tasks = Vec::new();
        let mut expected = Vec::new();

        for n in 0..10 {
            let bucket = bucket.clone();

            let task = tokio::spawn(async move {
                let mut locals = Vec::new();

                for i in 0..10 {
                    let ticket = loop {
                        match bucket.take(10) {
                            Ok(ticket) => break ticket,
                            Err(_) => tokio::time::sleep(Duration::from_millis(5)).await,
                        }
                    };

                    println!("tick: {}:{}:{}", iteration, n, i);
                    locals.push((n, i));

                    // Every other unit of work fails and hands its tokens back.
                    if i % 2 == 0 {
                        bucket.refund(&ticket);
                    }
                }

                locals
            });

            for i in 0..10 {
                expected.push((n, i));
            }

            tasks.push(task);
        }

        let mut globals = Vec::new();

        for t in tasks {
            globals.extend(t.await?);
        }

        globals.sort();

        assert_eq!(expected, globals);
    }

    Ok(())
}
