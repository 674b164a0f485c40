use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Serialize)]
pub struct JsonRpcRequest<'a> {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'a str,
    pub params: Value,
}

impl<'a> JsonRpcRequest<'a> {
    pub fn new(id: u64, method: &'a str, params: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method,
            params,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct JsonRpcResponse {
    #[allow(dead_code)]
    pub id: Option<u64>,
    pub result: Option<Value>,
    pub error: Option<JsonRpcErrorBody>,
}

#[derive(Debug, Deserialize)]
pub struct JsonRpcErrorBody {
    pub code: i64,
    pub message: String,
}

/// A log-range filter in the adapter's own (decimal) terms. `GetLogsParams`
/// carries the same data hex-encoded, the way the wire expects it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogFilter {
    pub address: Option<String>,
    pub topic0: Option<String>,
    pub from_block: u64,
    pub to_block: u64,
}

/// A decoded log, in the adapter's own (decimal) terms. `WireLog` is what
/// actually comes off the wire; callers never see it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Log {
    pub block_hash: String,
    pub block_number: u64,
    pub tx_index: u64,
    pub log_index: u64,
    pub tx_hash: String,
    pub address: String,
    pub topics: Vec<String>,
    pub data: String,
}

/// `getLogs` params exactly as the node expects: hex-encoded block bounds,
/// an optional address, and an optional single-topic filter sent as
/// `topics[0]` of the standard `topics` array.
#[derive(Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GetLogsParams {
    pub from_block: String,
    pub to_block: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topics: Option<Vec<String>>,
}

impl From<&LogFilter> for GetLogsParams {
    fn from(filter: &LogFilter) -> Self {
        Self {
            from_block: to_hex(filter.from_block),
            to_block: to_hex(filter.to_block),
            address: filter.address.clone(),
            topics: filter.topic0.clone().map(|topic0| vec![topic0]),
        }
    }
}

/// A log exactly as the node returns it: bit-exact camelCase field names,
/// `blockNumber`/`logIndex`/`transactionIndex` hex-encoded, `transactionHash`
/// present. Converted to [`Log`] immediately after deserializing.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireLog {
    pub address: String,
    pub block_hash: String,
    pub block_number: String,
    pub data: String,
    pub log_index: String,
    pub topics: Vec<String>,
    pub transaction_hash: String,
    pub transaction_index: String,
}

impl TryFrom<WireLog> for Log {
    type Error = String;

    fn try_from(wire: WireLog) -> Result<Self, Self::Error> {
        Ok(Log {
            block_hash: wire.block_hash,
            block_number: from_hex(&wire.block_number)?,
            tx_index: from_hex(&wire.transaction_index)?,
            log_index: from_hex(&wire.log_index)?,
            tx_hash: wire.transaction_hash,
            address: wire.address,
            topics: wire.topics,
            data: wire.data,
        })
    }
}

/// Encode a block/log/tx index the way the wire encodes every number:
/// lowercase, `0x`-prefixed hex.
pub fn to_hex(n: u64) -> String {
    format!("0x{n:x}")
}

/// Decode a lowercase `0x`-prefixed (or bare) hex string back to a number.
pub fn from_hex(s: &str) -> Result<u64, String> {
    let stripped = s.strip_prefix("0x").unwrap_or(s);
    u64::from_str_radix(stripped, 16).map_err(|e| format!("invalid hex integer {s:?}: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_round_trips() {
        assert_eq!(to_hex(255), "0xff");
        assert_eq!(from_hex("0xff").unwrap(), 255);
        assert_eq!(from_hex("ff").unwrap(), 255);
    }

    #[test]
    fn malformed_hex_is_rejected() {
        assert!(from_hex("not-hex").is_err());
    }

    #[test]
    fn get_logs_params_hex_encodes_range_and_omits_unset_filters() {
        let filter = LogFilter {
            address: None,
            topic0: None,
            from_block: 1,
            to_block: 10,
        };
        let params = GetLogsParams::from(&filter);
        let value = serde_json::to_value(&params).unwrap();
        assert_eq!(value["fromBlock"], "0x1");
        assert_eq!(value["toBlock"], "0xa");
        assert!(value.get("address").is_none());
        assert!(value.get("topics").is_none());
    }

    #[test]
    fn get_logs_params_carries_address_and_single_topic() {
        let filter = LogFilter {
            address: Some("0xdead".to_string()),
            topic0: Some("0xtopic".to_string()),
            from_block: 0,
            to_block: 0,
        };
        let params = GetLogsParams::from(&filter);
        assert_eq!(params.address.as_deref(), Some("0xdead"));
        assert_eq!(params.topics, Some(vec!["0xtopic".to_string()]));
    }

    #[test]
    fn wire_log_converts_camel_case_hex_fields() {
        let wire = WireLog {
            address: "0xdead".to_string(),
            block_hash: "0xabc".to_string(),
            block_number: "0xa".to_string(),
            data: "0x".to_string(),
            log_index: "0x2".to_string(),
            topics: vec!["0xtopic".to_string()],
            transaction_hash: "0xtx".to_string(),
            transaction_index: "0x1".to_string(),
        };
        let log = Log::try_from(wire).unwrap();
        assert_eq!(log.block_number, 10);
        assert_eq!(log.tx_index, 1);
        assert_eq!(log.log_index, 2);
        assert_eq!(log.tx_hash, "0xtx");
    }

    #[test]
    fn wire_log_field_names_are_bit_exact_camel_case() {
        let json = serde_json::json!({
            "address": "0xdead",
            "blockHash": "0xabc",
            "blockNumber": "0xa",
            "data": "0x",
            "logIndex": "0x2",
            "topics": ["0xtopic"],
            "transactionHash": "0xtx",
            "transactionIndex": "0x1",
        });
        let wire: WireLog = serde_json::from_value(json).unwrap();
        assert_eq!(wire.block_number, "0xa");
        assert_eq!(wire.transaction_hash, "0xtx");
    }
}
