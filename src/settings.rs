use serde::Deserialize;

/// Consensus and security parameters of the chain. Loaded from the node
/// configuration; every field has a sensible mainnet default.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConsensusSettings {
    /// Number of slots in one epoch.
    #[serde(default = "default_slots_per_epoch")]
    pub slots_per_epoch: u32,

    /// Maximum depth, in blocks, of a fork we are still willing to
    /// reconsider (the `k` security parameter).
    #[serde(default = "default_blk_security_param")]
    pub blk_security_param: u64,

    /// Bound, in slots, on how close to an epoch boundary block
    /// creation may proceed, and on how far ahead of the tip a main
    /// block may be produced.
    #[serde(default = "default_slot_security_param")]
    pub slot_security_param: u32,

    /// Maximum number of headers served in one message to a peer.
    #[serde(default = "default_recovery_headers_message")]
    pub recovery_headers_message: usize,

    /// Number of slots a transaction must have been resident in the
    /// mempool before it may be included in a produced block.
    #[serde(default = "default_tx_inclusion_delay")]
    pub tx_inclusion_delay: u32,

    /// Self-verify freshly produced blocks and log failures. Purely a
    /// diagnostic aid; production is never aborted by it.
    #[serde(default)]
    pub assert_created_blocks: bool,
}

fn default_slots_per_epoch() -> u32 {
    21600
}

fn default_blk_security_param() -> u64 {
    2160
}

fn default_slot_security_param() -> u32 {
    4320
}

fn default_recovery_headers_message() -> usize {
    2200
}

fn default_tx_inclusion_delay() -> u32 {
    4
}

impl Default for ConsensusSettings {
    fn default() -> Self {
        ConsensusSettings {
            slots_per_epoch: default_slots_per_epoch(),
            blk_security_param: default_blk_security_param(),
            slot_security_param: default_slot_security_param(),
            recovery_headers_message: default_recovery_headers_message(),
            tx_inclusion_delay: default_tx_inclusion_delay(),
            assert_created_blocks: false,
        }
    }
}
