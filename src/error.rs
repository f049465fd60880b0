use thiserror::Error;

/// Errors reported while validating construction parameters.
///
/// Everything else the index reports is either a boolean policy outcome or
/// an internal retry that never reaches the caller.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("node_bytes must be non-zero")]
    ZeroNodeBytes,
    #[error("max_chain_len must be non-zero")]
    ZeroChainLen,
    #[error("mapping_tier_bits must be between 1 and 16, got {0}")]
    TierBitsOutOfRange(u32),
}
