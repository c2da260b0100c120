use serde::{Deserialize, Serialize};

/// Carried in `MiningInfo` so clients can refuse a server speaking a
/// different revision of these types.
pub const PROTOCOL_VERSION: u16 = 3;

/// Body of `POST /getblocktemplate`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TemplateRequest {
    /// "template" (default) or "proposal".
    #[serde(default)]
    pub mode: Option<String>,

    /// `<64 hex tip hash><decimal mempool version>` from a previous reply.
    #[serde(default)]
    pub longpollid: Option<String>,

    /// Hex block, required in proposal mode.
    #[serde(default)]
    pub data: Option<String>,

    /// Client side supported features. Accepted for compatibility, not interpreted.
    #[serde(default)]
    pub capabilities: Vec<String>,

    #[serde(default)]
    pub rules: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateTransaction {
    /// Hex encoded transaction.
    pub data: String,
    pub txid: String,
    /// Witness hash.
    pub hash: String,
    /// 1-based positions of earlier transactions this one spends from.
    pub depends: Vec<u64>,
    pub fee: u64,
    pub sigops: u64,
    pub weight: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockTemplateResponse {
    pub capabilities: Vec<String>,
    pub version: i32,
    pub rules: Vec<String>,
    pub previousblockhash: String,
    pub transactions: Vec<TemplateTransaction>,
    pub coinbaseaux: serde_json::Map<String, serde_json::Value>,
    pub coinbasevalue: u64,
    pub longpollid: String,
    pub target: String,
    pub mintime: u32,
    pub mutable: Vec<String>,
    pub noncerange: String,
    pub sigoplimit: u64,
    pub sizelimit: u64,
    pub curtime: u32,
    pub bits: String,
    pub height: u32,
}

/// Reply of `POST /getblocktemplate`.
///
/// Template mode yields `Template`. Proposal mode yields `Status(None)` (JSON
/// null) for a valid block, or a BIP22 status string such as `"duplicate"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TemplateReply {
    Template(Box<BlockTemplateResponse>),
    Status(Option<String>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitBlockRequest {
    pub hexdata: String,
}

/// BIP22 style reply: `status` is null when the block was accepted as new.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitBlockReply {
    pub status: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitHeaderRequest {
    pub hexdata: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateRequest {
    pub nblocks: u32,

    /// Hex encoded payout script for the coinbase output.
    pub payout_script: String,

    #[serde(default)]
    pub maxtries: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartMinerRequest {
    pub payout_script: String,

    /// Number of search workers, 1 to 256.
    pub nthreads: u32,

    #[serde(default)]
    pub maxtries: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MinerStatus {
    /// "active" or "stopped"
    pub status: String,
    pub blocks_found: u64,
    /// Running workers, 0 when stopped.
    pub nthreads: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MiningInfo {
    pub blocks: u32,
    pub bestblockhash: String,

    /// Weight of the last template built, if any.
    #[serde(default)]
    pub currentblockweight: Option<u64>,

    /// Non-coinbase transaction count of the last template built, if any.
    #[serde(default)]
    pub currentblocktx: Option<u64>,

    pub pooledtx: u64,
    pub mempool_version: u64,
    pub chain: String,

    /// Difficulty of the tip's target relative to the maximum target.
    pub difficulty: f64,

    pub protocol_version: u16,
    pub miner: MinerStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DevnetTransactionRequest {
    pub hex: String,
    pub fee: u64,
}

/// Stable machine readable error category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// malformed hex, payout script or out of range parameter
    InvalidInput,

    /// no connectivity, initial sync, or shutting down
    Unavailable,

    /// template builder could not produce a template
    BuildFailure,

    /// block or header is consensus invalid
    ValidationRejected,

    /// engine reported an error while validating
    VerifyError,

    /// unexpected internal failure
    Internal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub category: ErrorCategory,
    pub detail: String,
}
