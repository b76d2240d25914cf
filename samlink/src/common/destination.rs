// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::{fmt, path::Path, str::FromStr};

use base64::{
  alphabet::Alphabet,
  engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig},
  Engine,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;

const I2P_ALPHABET: Alphabet =
  match Alphabet::new("ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-~") {
    Ok(alphabet) => alphabet,
    Err(_) => panic!("I2P base64 alphabet must be valid"),
  };

/// Base64 with the I2P alphabet (`-` and `~` replace `+` and `/`)
pub const I2P_BASE64: GeneralPurpose = GeneralPurpose::new(
  &I2P_ALPHABET,
  GeneralPurposeConfig::new()
    .with_encode_padding(true)
    .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Public encryption key plus signing key, before the certificate
const DESTINATION_KEYS_LENGTH: usize = 384;
/// Certificate type byte plus a big-endian u16 payload length
const CERTIFICATE_HEADER_LENGTH: usize = 3;
const CERTIFICATE_TYPE_NULL: u8 = 0;
const CERTIFICATE_TYPE_KEY: u8 = 5;

pub const B32_SUFFIX: &str = ".b32.i2p";
pub const NAME_SUFFIX: &str = ".i2p";

#[derive(thiserror::Error, Debug)]
pub enum DestinationError {
  #[error("Destination must not be empty")]
  Empty,
  #[error("Invalid character {found:?} at offset {offset} in base64 destination")]
  InvalidCharacter { found: char, offset: usize },
  #[error("Destination is not valid I2P base64: {0}")]
  Decode(#[from] base64::DecodeError),
  #[error("Destination of {length} bytes is shorter than its declared structure")]
  Truncated { length: usize },
  #[error("Key file is missing its {0} line")]
  MissingLine(&'static str),
  #[error("Unknown signature type {0:?}")]
  UnknownSignatureType(String),
  #[error("Key file I/O failure: {0}")]
  Io(#[from] std::io::Error),
}

/// Signature algorithms a bridge can generate destinations for
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignatureType {
  #[serde(rename = "DSA_SHA1")]
  DsaSha1,
  #[serde(rename = "ECDSA_SHA256_P256")]
  EcdsaSha256P256,
  #[serde(rename = "ECDSA_SHA384_P384")]
  EcdsaSha384P384,
  #[serde(rename = "ECDSA_SHA512_P521")]
  EcdsaSha512P521,
  #[default]
  #[serde(rename = "EdDSA_SHA512_Ed25519")]
  EdDsaSha512Ed25519,
}

impl SignatureType {
  pub const ALL: [SignatureType; 5] = [
    SignatureType::DsaSha1,
    SignatureType::EcdsaSha256P256,
    SignatureType::EcdsaSha384P384,
    SignatureType::EcdsaSha512P521,
    SignatureType::EdDsaSha512Ed25519,
  ];

  pub fn as_str(&self) -> &'static str {
    match self {
      SignatureType::DsaSha1 => "DSA_SHA1",
      SignatureType::EcdsaSha256P256 => "ECDSA_SHA256_P256",
      SignatureType::EcdsaSha384P384 => "ECDSA_SHA384_P384",
      SignatureType::EcdsaSha512P521 => "ECDSA_SHA512_P521",
      SignatureType::EdDsaSha512Ed25519 => "EdDSA_SHA512_Ed25519",
    }
  }

  /// Code carried in a key certificate
  pub fn code(&self) -> u16 {
    match self {
      SignatureType::DsaSha1 => 0,
      SignatureType::EcdsaSha256P256 => 1,
      SignatureType::EcdsaSha384P384 => 2,
      SignatureType::EcdsaSha512P521 => 3,
      SignatureType::EdDsaSha512Ed25519 => 7,
    }
  }

  pub fn from_code(code: u16) -> Option<Self> {
    Self::ALL.into_iter().find(|s| s.code() == code)
  }
}

impl fmt::Display for SignatureType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for SignatureType {
  type Err = DestinationError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let s = s.strip_prefix("SIGNATURE_TYPE=").unwrap_or(s);
    Self::ALL
      .into_iter()
      .find(|sig| sig.as_str().eq_ignore_ascii_case(s) || sig.code().to_string() == s)
      .ok_or_else(|| DestinationError::UnknownSignatureType(s.to_owned()))
  }
}

/// The public address of an overlay endpoint, kept in its I2P base64 form
///
/// Only the alphabet is checked on construction; the binary structure is
/// decoded on demand, since bridges hand back addresses that are never
/// inspected locally.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Destination(String);

impl Destination {
  pub fn new<S: Into<String>>(encoded: S) -> Result<Self, DestinationError> {
    let encoded = encoded.into();
    if encoded.is_empty() {
      return Err(DestinationError::Empty);
    }
    if let Some((offset, found)) = encoded
      .char_indices()
      .find(|(_, c)| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '~' | '=')))
    {
      return Err(DestinationError::InvalidCharacter { found, offset });
    }
    Ok(Self(encoded))
  }

  pub fn from_bytes(bytes: &[u8]) -> Self {
    Self(I2P_BASE64.encode(bytes))
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }

  pub fn to_bytes(&self) -> Result<Vec<u8>, DestinationError> {
    Ok(I2P_BASE64.decode(&self.0)?)
  }

  /// The `<hash>.b32.i2p` form of this destination
  pub fn base32(&self) -> Result<String, DestinationError> {
    let digest = Sha256::digest(self.to_bytes()?);
    let mut rendered = base32_lower(&digest);
    rendered.push_str(B32_SUFFIX);
    Ok(rendered)
  }

  /// Whether a host string names a destination rather than spelling one out
  pub fn is_name(host: &str) -> bool {
    host.ends_with(NAME_SUFFIX)
  }
}

impl TryFrom<String> for Destination {
  type Error = DestinationError;

  fn try_from(value: String) -> Result<Self, Self::Error> {
    Self::new(value)
  }
}

impl From<Destination> for String {
  fn from(d: Destination) -> Self {
    d.0
  }
}

impl FromStr for Destination {
  type Err = DestinationError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Self::new(s)
  }
}

impl fmt::Display for Destination {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl fmt::Debug for Destination {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    const SHOWN: usize = 16;
    if self.0.len() > SHOWN {
      write!(f, "Destination({}…)", &self.0[..SHOWN])
    } else {
      write!(f, "Destination({})", self.0)
    }
  }
}

/// A destination together with the private material that proves ownership of it
#[derive(Clone, PartialEq, Eq)]
pub struct DestinationKeys {
  address: Destination,
  private: String,
  signature: SignatureType,
}

impl DestinationKeys {
  pub fn new(address: Destination, private: String, signature: SignatureType) -> Self {
    Self {
      address,
      private,
      signature,
    }
  }

  /// Recovers the public destination from the front of a private key blob
  pub fn from_private(private: &str) -> Result<Self, DestinationError> {
    let bytes = I2P_BASE64.decode(private)?;
    let (public_length, signature) = inspect_destination(&bytes)?;
    Ok(Self {
      address: Destination::from_bytes(&bytes[..public_length]),
      private: private.to_owned(),
      signature,
    })
  }

  pub fn address(&self) -> &Destination {
    &self.address
  }

  /// The string a bridge expects after `DESTINATION=`
  pub fn private_key(&self) -> &str {
    &self.private
  }

  pub fn signature_type(&self) -> SignatureType {
    self.signature
  }

  /// Parses the `<public>\n<private>` key file layout
  pub fn parse_keyfile(contents: &str) -> Result<Self, DestinationError> {
    let mut lines = contents.lines().map(str::trim).filter(|l| !l.is_empty());
    let public = lines.next().ok_or(DestinationError::MissingLine("public"))?;
    let private = lines.next().ok_or(DestinationError::MissingLine("private"))?;
    let address = Destination::new(public)?;
    let signature = I2P_BASE64
      .decode(private)
      .ok()
      .and_then(|bytes| inspect_destination(&bytes).ok())
      .map(|(_, signature)| signature)
      .unwrap_or_default();
    Ok(Self {
      address,
      private: private.to_owned(),
      signature,
    })
  }

  pub fn to_keyfile(&self) -> String {
    format!("{}\n{}", self.address, self.private)
  }

  pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self, DestinationError> {
    let contents = tokio::fs::read_to_string(path).await?;
    Self::parse_keyfile(&contents)
  }

  /// Writes the key file, readable only by its owner where the platform allows
  pub async fn store<P: AsRef<Path>>(&self, path: P) -> Result<(), DestinationError> {
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);
    let mut file = options.open(path).await?;
    file.write_all(self.to_keyfile().as_bytes()).await?;
    file.flush().await?;
    Ok(())
  }
}

impl fmt::Debug for DestinationKeys {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("DestinationKeys")
      .field("address", &self.address)
      .field("signature", &self.signature)
      .finish_non_exhaustive()
  }
}

/// Returns the length of the public destination at the front of `bytes`, and its signature type
fn inspect_destination(bytes: &[u8]) -> Result<(usize, SignatureType), DestinationError> {
  let header_end = DESTINATION_KEYS_LENGTH + CERTIFICATE_HEADER_LENGTH;
  if bytes.len() < header_end {
    return Err(DestinationError::Truncated {
      length: bytes.len(),
    });
  }
  let certificate_type = bytes[DESTINATION_KEYS_LENGTH];
  let certificate_length = u16::from_be_bytes([
    bytes[DESTINATION_KEYS_LENGTH + 1],
    bytes[DESTINATION_KEYS_LENGTH + 2],
  ]) as usize;
  let public_length = header_end + certificate_length;
  if bytes.len() < public_length {
    return Err(DestinationError::Truncated {
      length: bytes.len(),
    });
  }
  let signature = match certificate_type {
    CERTIFICATE_TYPE_NULL => SignatureType::DsaSha1,
    CERTIFICATE_TYPE_KEY if certificate_length >= 2 => {
      let code = u16::from_be_bytes([bytes[header_end], bytes[header_end + 1]]);
      SignatureType::from_code(code).unwrap_or_default()
    }
    _ => SignatureType::default(),
  };
  Ok((public_length, signature))
}

/// RFC 4648 base32, lowercase and unpadded, as used by `.b32.i2p` names
fn base32_lower(bytes: &[u8]) -> String {
  const ALPHABET: &[u8; 32] = b"abcdefghijklmnopqrstuvwxyz234567";
  let mut rendered = String::with_capacity((bytes.len() * 8 + 4) / 5);
  let (mut buffer, mut bits) = (0u32, 0u32);
  for &byte in bytes {
    buffer = (buffer << 8) | byte as u32;
    bits += 8;
    while bits >= 5 {
      bits -= 5;
      rendered.push(ALPHABET[((buffer >> bits) & 0x1f) as usize] as char);
    }
    buffer &= (1 << bits) - 1;
  }
  if bits > 0 {
    rendered.push(ALPHABET[((buffer << (5 - bits)) & 0x1f) as usize] as char);
  }
  rendered
}
