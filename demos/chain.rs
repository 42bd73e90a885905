//! Multi-stage pipelines
//!
//! Run with: cargo run --example chain

use ifca::prelude::*;

#[tokio::main]
async fn main() -> Result<()> {
    let words = Ifca::<String>::new(IfcaConfig::new(4).name("words"))?
        .map(|line| line.split_whitespace().count());

    let mut chain = IfcaChain::new(words)
        .add(
            Ifca::<usize>::new(IfcaConfig::new(2).name("filter"))?
                .filter(|count| *count > 1),
        )?
        .add(
            Ifca::<usize>::new(IfcaConfig::new(2).name("format"))?
                .then(|count| async move { format!("{} words", count) }),
        )?;

    println!("Chain with {} stages", chain.len());

    let lines = [
        "the quick brown fox",
        "jumps",
        "over the lazy dog",
        "",
        "and keeps running",
    ];

    let writer = async {
        for line in lines {
            chain.feed(line.to_string()).await?;
        }
        chain.end().map(drop)
    };

    let reader = async {
        while let Some(summary) = chain.read().await {
            println!("{}", summary);
        }
    };

    let (written, ()) = tokio::join!(writer, reader);
    written?;

    chain.join().await?;
    Ok(())
}
