use anyhow::Result;

/// Print the OpenAPI document, e.g. for client generation in CI.
fn main() -> Result<()> {
    let doc = zerowork::api::openapi();
    println!("{}", serde_json::to_string_pretty(&doc)?);
    Ok(())
}
