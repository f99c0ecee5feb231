//! Wire schema for relay requests.

use ethers::types::{Address, Bytes, U256};
use serde::{Deserialize, Serialize};

/// A signed user request asking this server to relay a call through the hub.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RelayTransactionRequest {
    pub relay_request: RelayRequest,
    pub metadata: RelayMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RelayRequest {
    pub request: ForwardRequest,
    pub relay_data: RelayData,
}

/// The inner call the user wants executed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ForwardRequest {
    pub from: Address,
    pub to: Address,
    pub value: U256,
    pub gas: U256,
    pub nonce: U256,
    pub data: Bytes,
}

/// Relay terms the user signed over.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RelayData {
    pub gas_price: U256,
    pub pct_relay_fee: U256,
    pub base_relay_fee: U256,
    pub relay_worker: Address,
    pub paymaster: Address,
    #[serde(default)]
    pub paymaster_data: Bytes,
    #[serde(default)]
    pub client_id: U256,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RelayMetadata {
    pub relay_hub_address: Address,
    pub relay_max_nonce: u64,
    pub signature: Bytes,
    #[serde(default)]
    pub approval_data: Bytes,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_json() -> serde_json::Value {
        serde_json::json!({
            "relayRequest": {
                "request": {
                    "from": "0x1111111111111111111111111111111111111111",
                    "to": "0x2222222222222222222222222222222222222222",
                    "value": "0x0",
                    "gas": "0x30d40",
                    "nonce": "0x1",
                    "data": "0xdeadbeef"
                },
                "relayData": {
                    "gasPrice": "0x3b9aca00",
                    "pctRelayFee": "0x46",
                    "baseRelayFee": "0x0",
                    "relayWorker": "0x3333333333333333333333333333333333333333",
                    "paymaster": "0x4444444444444444444444444444444444444444",
                    "paymasterData": "0x",
                    "clientId": "0x1"
                }
            },
            "metadata": {
                "relayHubAddress": "0x5555555555555555555555555555555555555555",
                "relayMaxNonce": 10,
                "signature": "0xababab",
                "approvalData": "0x"
            }
        })
    }

    #[test]
    fn parses_full_request() {
        let req: RelayTransactionRequest = serde_json::from_value(sample_json()).unwrap();
        assert_eq!(req.metadata.relay_max_nonce, 10);
        assert_eq!(req.relay_request.request.data.len(), 4);
        assert_eq!(req.relay_request.relay_data.pct_relay_fee, U256::from(70));
    }

    #[test]
    fn rejects_unknown_fields() {
        let mut value = sample_json();
        value["metadata"]["extra"] = serde_json::json!(1);
        assert!(serde_json::from_value::<RelayTransactionRequest>(value).is_err());
    }

    #[test]
    fn rejects_missing_signature() {
        let mut value = sample_json();
        value["metadata"]
            .as_object_mut()
            .unwrap()
            .remove("signature");
        assert!(serde_json::from_value::<RelayTransactionRequest>(value).is_err());
    }
}
