//! `fnforge events`: render a tree's event stream for a terminal.
//!
//! Typical use: `fnforge create ... | fnforge events`.

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};

use fnforge::event::{parse, render};

pub async fn cmd_events() -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        match parse(&line) {
            Some(event) => println!("{}", render(&event)),
            None if line.trim().is_empty() => {}
            None => println!("{}", line),
        }
    }
    Ok(())
}
