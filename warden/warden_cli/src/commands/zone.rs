//! Client-side zone commands: enumerate, activate, invoke.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde_json::Value;

use warden_core::zone::{OperationName, ZoneName};

use crate::client::BrokerClient;

/// List published zones and their declared operations.
pub async fn list(socket: PathBuf) -> Result<()> {
    let mut client = BrokerClient::connect(&socket).await?;

    for listing in client.zones().await? {
        println!("{} v{}", listing.name, listing.version);
        for operation in &listing.operations {
            println!("  {}", operation);
        }
    }

    Ok(())
}

/// Activate a zone, invoke one operation, print the output, release.
pub async fn call(
    socket: PathBuf,
    zone: String,
    operation: String,
    input: Option<String>,
) -> Result<()> {
    let zone = ZoneName::parse(&zone)?;
    let operation = OperationName::parse(&operation)?;
    let input: Value = match input {
        Some(raw) => serde_json::from_str(&raw).context("input is not valid JSON")?,
        None => Value::Null,
    };

    let mut client = BrokerClient::connect(&socket).await?;
    let session = client.activate(&zone).await?;

    let result = client.invoke(session, &operation, input).await;

    // Release regardless of the call's outcome
    let _ = client.release(session).await;

    let output = result?;
    println!("{}", serde_json::to_string_pretty(&output)?);

    Ok(())
}
