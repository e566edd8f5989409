//! Deployed contract manifest.
//!
//! Addresses and ABIs of the contracts this indexer knows about, per network.
//!
//! The bundled `devnet` and `sepolia` addresses are placeholders, not real deployments.
//! Point the indexer at an actual `YourContract` with `--contract-address`
//! (`greeting_filter`'s `address` override), or replace the manifest with the one
//! produced by your deployment.

use auco::etl::decoder::ContractAbi;
use auco::IndexerError;
use serde::Deserialize;
use starknet::core::types::Felt;
use std::collections::HashMap;

const DEPLOYED_CONTRACTS: &str = include_str!("../contracts/deployed_contracts.json");

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ManifestEntry {
    address: String,
    #[serde(default)]
    class_hash: Option<String>,
    abi: serde_json::Value,
}

type Manifest = HashMap<String, HashMap<String, ManifestEntry>>;

/// A contract deployed on one network.
#[derive(Debug, Clone)]
pub struct DeployedContract {
    pub network: String,
    pub name: String,
    pub address: Felt,
    pub class_hash: Option<Felt>,
    pub abi: ContractAbi,
}

fn manifest() -> Result<Manifest, IndexerError> {
    serde_json::from_str(DEPLOYED_CONTRACTS)
        .map_err(|e| IndexerError::Initialization(format!("invalid contract manifest: {e}")))
}

fn parse_felt(value: &str, what: &str) -> Result<Felt, IndexerError> {
    Felt::from_hex(value)
        .map_err(|e| IndexerError::Initialization(format!("invalid {what} {value:?}: {e}")))
}

/// Networks present in the manifest, sorted.
pub fn networks() -> Result<Vec<String>, IndexerError> {
    let mut networks: Vec<_> = manifest()?.into_keys().collect();
    networks.sort();
    Ok(networks)
}

/// Looks up the address and ABI of contract `name` on `network`.
pub fn contract_by_name(network: &str, name: &str) -> Result<DeployedContract, IndexerError> {
    let mut manifest = manifest()?;
    let contracts = manifest.get_mut(network).ok_or_else(|| {
        IndexerError::Initialization(format!("network {network} is not in the contract manifest"))
    })?;
    let entry = contracts.remove(name).ok_or_else(|| {
        IndexerError::Initialization(format!("contract {name} is not deployed on {network}"))
    })?;

    Ok(DeployedContract {
        network: network.to_string(),
        name: name.to_string(),
        address: parse_felt(&entry.address, "contract address")?,
        class_hash: entry
            .class_hash
            .as_deref()
            .map(|hash| parse_felt(hash, "class hash"))
            .transpose()?,
        abi: ContractAbi::from_value(entry.abi)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CONTRACT_NAME, GREETING_CHANGED};

    #[test]
    fn devnet_contract_exposes_greeting_event() {
        let contract = contract_by_name("devnet", CONTRACT_NAME).unwrap();
        assert_ne!(contract.address, Felt::ZERO);
        assert!(contract.abi.has_event(GREETING_CHANGED));
        assert!(contract.class_hash.is_some());
    }

    #[test]
    fn every_network_is_listed() {
        assert_eq!(networks().unwrap(), vec!["devnet", "mainnet", "sepolia"]);
    }

    #[test]
    fn unknown_network_or_contract_fails_initialization() {
        let err = contract_by_name("goerli", CONTRACT_NAME).unwrap_err();
        assert!(matches!(err, IndexerError::Initialization(_)));

        let err = contract_by_name("mainnet", CONTRACT_NAME).unwrap_err();
        assert!(err.to_string().contains("not deployed on mainnet"));
    }
}
