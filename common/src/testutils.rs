//! Helpers shared by the test suites.

use anyhow::Result;

/// Deterministic payload so chunked transfers can be verified byte-for-byte.
pub fn patterned_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

pub async fn write_file_with_size(path: &std::path::Path, len: usize) -> Result<()> {
    tokio::fs::write(path, patterned_bytes(len)).await?;
    Ok(())
}
