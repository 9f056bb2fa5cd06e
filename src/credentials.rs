// SPDX-License-Identifier: AGPL-3.0-or-later
//! Router credentials: passwords, hashes and the managed SSH key pair

use std::time::{SystemTime, UNIX_EPOCH};

use rand::rngs::OsRng;
use rand::Rng;
use sha2::{Digest, Sha256};
use sha_crypt::{sha512_simple, Sha512Params};
use ssh_key::{Algorithm, LineEnding, PrivateKey};

use crate::error::{BurrowError, Result};

/// Alphabet for generated passwords, without look-alike characters
const PASSWORD_ALPHABET: &[u8] = b"abcdefghijkmnpqrstuvwxyzABCDEFGHJKLMNPQRSTUVWXYZ23456789";

const ROOT_PASSWORD_LEN: usize = 16;
const WIFI_PASSWORD_LEN: usize = 12;
const SHA512_ROUNDS: usize = 5_000;
const KEY_WRAP_COLUMNS: usize = 64;
const KEY_COMMENT: &str = "bitburrow";

/// Freshly generated credentials for a new router
#[derive(Debug, Clone)]
pub struct GeneratedCredentials {
    pub root_password: String,
    pub wifi_password: String,
    pub ssh_public_key: String,
    pub ssh_private_key: String,
}

impl GeneratedCredentials {
    pub fn generate() -> Result<Self> {
        let (public, private) = generate_keypair()?;
        Ok(Self {
            root_password: generate_password(ROOT_PASSWORD_LEN),
            wifi_password: generate_password(WIFI_PASSWORD_LEN),
            ssh_public_key: wrap_public_key(&public),
            ssh_private_key: private,
        })
    }
}

/// Random password drawn from an unambiguous alphabet
pub fn generate_password(len: usize) -> String {
    let mut rng = OsRng;
    (0..len)
        .map(|_| PASSWORD_ALPHABET[rng.gen_range(0..PASSWORD_ALPHABET.len())] as char)
        .collect()
}

/// `$6$` (SHA-512 crypt) hash of a password, salted at random
pub fn shadow_hash(password: &str) -> Result<String> {
    let params = Sha512Params::new(SHA512_ROUNDS).map_err(|e| BurrowError::Credential {
        message: format!("invalid sha512-crypt rounds: {:?}", e),
    })?;
    sha512_simple(password, &params).map_err(|e| BurrowError::Credential {
        message: format!("sha512-crypt failed: {:?}", e),
    })
}

/// Complete `/etc/shadow` line for root with the given hash
pub fn shadow_line(hash: &str) -> String {
    let days = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() / 86_400)
        .unwrap_or(0);
    format!("root:{}:{}:0:99999:7:::", hash, days)
}

/// SHA-256 hex digest used by the router's web UI login
pub fn http_password_sha256(password: &str) -> String {
    hex::encode(Sha256::digest(password.as_bytes()))
}

/// Single `authorized_keys` line: newlines stripped, whitespace runs collapsed
pub fn authorized_keys_line(public_key: &str) -> String {
    let joined: String = public_key
        .chars()
        .filter(|c| *c != '\n' && *c != '\r')
        .collect();
    joined.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Wrap a one-line OpenSSH public key at a fixed width so the store file
/// stays readable. [`authorized_keys_line`] reverses this.
pub fn wrap_public_key(public_key: &str) -> String {
    let chars: Vec<char> = public_key.trim().chars().collect();
    let mut wrapped = chars
        .chunks(KEY_WRAP_COLUMNS)
        .map(|chunk| chunk.iter().collect::<String>())
        .collect::<Vec<_>>()
        .join("\n");
    wrapped.push('\n');
    wrapped
}

/// Generate an Ed25519 key pair as (OpenSSH public line, OpenSSH private PEM)
pub fn generate_keypair() -> Result<(String, String)> {
    let private = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).map_err(|e| {
        BurrowError::Credential {
            message: format!("key generation failed: {}", e),
        }
    })?;
    let private_pem = private
        .to_openssh(LineEnding::LF)
        .map_err(|e| BurrowError::Credential {
            message: format!("private key encoding failed: {}", e),
        })?;
    let public = private
        .public_key()
        .to_openssh()
        .map_err(|e| BurrowError::Credential {
            message: format!("public key encoding failed: {}", e),
        })?;
    Ok((format!("{} {}", public, KEY_COMMENT), private_pem.to_string()))
}
