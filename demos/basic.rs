//! Basic usage of a single engine
//!
//! Run with: cargo run --example basic

use std::time::Duration;

use ifca::prelude::*;

/// Example 1: mapping with ordered delivery despite uneven latency
async fn ordered_example() -> Result<()> {
    println!("=== Ordered Delivery ===");

    let ifca = Ifca::<u64>::new(IfcaConfig::new(4).name("latency"))?.then(|x| async move {
        tokio::time::sleep(Duration::from_millis(50 - x * 10)).await;
        x * x
    });

    ifca.writev((0..5).map(Some))?;
    ifca.end()?;

    for square in ifca.read_to_end().await {
        println!("Square: {}", square);
    }

    println!();
    Ok(())
}

/// Example 2: backpressure with a concurrent reader
async fn backpressure_example() -> Result<()> {
    println!("=== Backpressure ===");

    let ifca = Ifca::<u32>::new(IfcaConfig::new(2))?.then(|x| async move {
        tokio::time::sleep(Duration::from_millis(5)).await;
        x + 100
    });

    let writer = async {
        for x in 0..6 {
            if let Some(drain) = ifca.write(x)? {
                println!("Writer waiting at chunk {} ({:?})", x, ifca.state());
                drain.await;
            }
        }
        ifca.end().map(drop)
    };

    let reader = async {
        while let Some(value) = ifca.read().await {
            println!("Read: {}", value);
        }
    };

    let (written, ()) = tokio::join!(writer, reader);
    written?;

    println!();
    Ok(())
}

/// Example 3: filtering and error recovery
async fn error_handling_example() -> Result<()> {
    println!("=== Error Handling ===");

    let ifca = Ifca::<&'static str>::new(IfcaConfig::default())?
        .add_transform(
            Transform::sync(|line: &'static str| {
                line.parse::<i64>()
                    .into_transform_error()
                    .map(Outcome::Value)
            })
            .or_else(|error, line| {
                println!("Skipping {:?}: {}", line, error);
                Ok(Outcome::Dropped)
            }),
        )
        .filter(|x| *x >= 0)
        .try_map(|x| {
            if x > 1000 {
                Err(Error::custom(format!("{} is out of range", x)))
            } else {
                Ok(Outcome::Value(x))
            }
        })
        .add_error_handler(ErrorHandler::sync(|error| {
            println!("Recovered: {}", error);
            Ok(Outcome::Value(1000))
        }));

    ifca.writev(
        ["12", "-3", "abc", "7", "5000"]
            .into_iter()
            .map(Some)
            .chain(std::iter::once(None)),
    )?;

    println!("Values: {:?}", ifca.read_to_end().await);
    println!();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    ordered_example().await?;
    backpressure_example().await?;
    error_handling_example().await?;
    Ok(())
}
