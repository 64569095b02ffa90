/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Building the configuration file of an IPFS backnet.
//!
//! Only the parts of the configuration that the supervisor manages are typed: the node's identity, its
//! listen addresses, and its bootstrap peers. Every other field of a loaded configuration is preserved
//! as-is when the configuration is written back out.
//!
//! A fresh identity is an Ed25519 keypair. Its private key is stored in the `Identity.PrivKey` field as
//! the base64 encoding of the key's protobuf envelope, and its peer id is the base58 encoding of the
//! SHA2-256 multihash of the public key's protobuf envelope.

use std::{
    fs::{self, OpenOptions},
    io::{self, Write},
    path::Path,
};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use ed25519_dalek::SigningKey;
use rand_core::OsRng;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{ser::PrettyFormatter, Map, Value};
use sha2::{Digest, Sha256};

use super::ports::PortBlock;

/// libp2p key type tag for Ed25519 keys.
const ED25519_KEY_TYPE: u8 = 1;
/// Multihash code of SHA2-256.
const SHA2_256: u8 = 0x12;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct IpfsConfig {
    pub identity: Identity,
    #[serde(default)]
    pub addresses: Addresses,
    #[serde(default)]
    pub bootstrap: Vec<String>,
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    #[serde(rename = "PeerID")]
    pub peer_id: String,
    /// Empty when the configuration was loaded from a node that already holds its key.
    #[serde(rename = "PrivKey", default, skip_serializing_if = "String::is_empty")]
    pub priv_key: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Addresses {
    #[serde(default, deserialize_with = "one_or_many")]
    pub swarm: Vec<String>,
    #[serde(rename = "API", default, deserialize_with = "one_or_many")]
    pub api: Vec<String>,
    #[serde(default, deserialize_with = "one_or_many")]
    pub gateway: Vec<String>,
    #[serde(default)]
    pub announce: Vec<String>,
    #[serde(default)]
    pub no_announce: Vec<String>,
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

impl IpfsConfig {
    /// Create a configuration with a freshly generated identity and no addresses.
    pub fn generate() -> IpfsConfig {
        let signing_key = SigningKey::generate(&mut OsRng);
        let public_key = signing_key.verifying_key().to_bytes();

        let mut keypair = Vec::with_capacity(64);
        keypair.extend_from_slice(&signing_key.to_bytes());
        keypair.extend_from_slice(&public_key);

        IpfsConfig {
            identity: Identity {
                peer_id: peer_id(&public_key),
                priv_key: STANDARD.encode(key_envelope(&keypair)),
            },
            addresses: Addresses::default(),
            bootstrap: Vec::new(),
            other: Map::new(),
        }
    }

    /// Load the configuration at `path` for patching. The private key is stripped: an existing node keeps
    /// its identity, and `ipfs config replace` refuses to change it.
    pub fn from_file(path: &Path) -> Result<IpfsConfig, IpfsConfigError> {
        let bytes = fs::read(path)?;
        let mut config: IpfsConfig = serde_json::from_slice(&bytes)?;
        config.identity.priv_key.clear();
        Ok(config)
    }

    /// Listen for swarm connections on `ports.swarm` over TCP and QUIC, IPv4 and IPv6, and serve the API
    /// and gateway on all IPv4 interfaces.
    pub fn set_addresses(&mut self, ports: PortBlock) {
        let other = std::mem::take(&mut self.addresses.other);
        self.addresses = Addresses {
            swarm: vec![
                format!("/ip4/0.0.0.0/tcp/{}", ports.swarm),
                format!("/ip6/::/tcp/{}", ports.swarm),
                format!("/ip4/0.0.0.0/udp/{}/quic", ports.swarm),
                format!("/ip6/::/udp/{}/quic", ports.swarm),
            ],
            api: vec![format!("/ip4/0.0.0.0/tcp/{}", ports.api)],
            gateway: vec![format!("/ip4/0.0.0.0/tcp/{}", ports.gateway)],
            announce: Vec::new(),
            no_announce: Vec::new(),
            other,
        };
    }

    pub fn set_bootstrap(&mut self, bootstrap: Vec<String>) {
        self.bootstrap = bootstrap;
    }

    /// Write the configuration as 4-space indented JSON, readable only by its owner.
    pub fn write(&self, path: &Path) -> Result<(), IpfsConfigError> {
        let mut buf = Vec::new();
        let mut serializer =
            serde_json::Serializer::with_formatter(&mut buf, PrettyFormatter::with_indent(b"    "));
        self.serialize(&mut serializer)?;

        let mut options = OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(path)?;
        file.write_all(&buf)?;
        file.sync_all()?;
        Ok(())
    }
}

fn one_or_many<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
        Null(()),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(one) => vec![one],
        OneOrMany::Many(many) => many,
        OneOrMany::Null(()) => Vec::new(),
    })
}

/// Wrap raw key bytes in the protobuf message `{ Type: Ed25519, Data: key }`.
fn key_envelope(key: &[u8]) -> Vec<u8> {
    let mut envelope = Vec::with_capacity(key.len() + 4);
    envelope.extend_from_slice(&[0x08, ED25519_KEY_TYPE, 0x12, key.len() as u8]);
    envelope.extend_from_slice(key);
    envelope
}

fn peer_id(public_key: &[u8]) -> String {
    let digest = Sha256::digest(key_envelope(public_key));
    let mut multihash = Vec::with_capacity(digest.len() + 2);
    multihash.extend_from_slice(&[SHA2_256, digest.len() as u8]);
    multihash.extend_from_slice(&digest);
    base58(&multihash)
}

fn base58(bytes: &[u8]) -> String {
    const ALPHABET: &[u8; 58] = b"123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";

    let zeros = bytes.iter().take_while(|b| **b == 0).count();
    let mut digits: Vec<u8> = Vec::with_capacity(bytes.len() * 138 / 100 + 1);
    for byte in &bytes[zeros..] {
        let mut carry = *byte as u32;
        for digit in digits.iter_mut() {
            carry += (*digit as u32) << 8;
            *digit = (carry % 58) as u8;
            carry /= 58;
        }
        while carry > 0 {
            digits.push((carry % 58) as u8);
            carry /= 58;
        }
    }

    std::iter::repeat(ALPHABET[0] as char)
        .take(zeros)
        .chain(digits.iter().rev().map(|digit| ALPHABET[*digit as usize] as char))
        .collect()
}

#[derive(Debug)]
pub enum IpfsConfigError {
    Io(io::Error),
    Json(serde_json::Error),
}

impl std::fmt::Display for IpfsConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IpfsConfigError::Io(err) => write!(f, "ipfs config i/o failed: {}", err),
            IpfsConfigError::Json(err) => write!(f, "ipfs config is not valid JSON: {}", err),
        }
    }
}

impl std::error::Error for IpfsConfigError {}

impl From<io::Error> for IpfsConfigError {
    fn from(value: io::Error) -> Self {
        IpfsConfigError::Io(value)
    }
}

impl From<serde_json::Error> for IpfsConfigError {
    fn from(value: serde_json::Error) -> Self {
        IpfsConfigError::Json(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha2_peer_ids_start_with_qm() {
        let config = IpfsConfig::generate();
        assert!(config.identity.peer_id.starts_with("Qm"));
        assert!(!config.identity.priv_key.is_empty());
    }

    #[test]
    fn base58_keeps_leading_zeros() {
        assert_eq!(base58(&[0, 0, 1]), "112");
        assert_eq!(base58(b"hello world"), "StV1DL6CwTryKyV");
    }
}
