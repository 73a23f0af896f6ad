//! Request builder and the signed request payload.
//!
//! # Payload layout
//!
//! ```text
//! +--------+---------+------------+-------------+------------------------+--------+
//! | "DONR" | version | node_count | field_count | field table            | bodies |
//! | 4      | 1       | u16 BE     | u8          | field_count x 9 bytes  | ...    |
//! +--------+---------+------------+-------------+------------------------+--------+
//!
//! field table entry = tag (u8) || offset (u32 BE) || len (u32 BE)
//! ```
//!
//! Offsets are absolute within the payload, so a reader never needs a
//! schema beyond the tag numbers. The whole payload is signed with the
//! requester's ed25519 key, whose public half is one of the fields.

use crate::config::{CodeLanguage, CodeLocation, RequestConfig};
use crate::error::{DonError, Result};
use crate::secrets::{self, EncryptedSecrets, EncryptedSecretsBundle, FINGERPRINT_BYTES};
use crate::value::ReturnType;
use alloy_primitives::{keccak256, Address, B256};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use tracing::debug;
use x25519_dalek::PublicKey;

/// Payload magic bytes.
pub const PAYLOAD_MAGIC: [u8; 4] = *b"DONR";

/// Current payload version.
pub const PAYLOAD_VERSION: u8 = 1;

/// Protocol maximum callback gas limit, used unless the builder is told otherwise.
pub const DEFAULT_MAX_GAS_LIMIT: u32 = 300_000;

const HEADER_BYTES: usize = 8;
const TABLE_ENTRY_BYTES: usize = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum FieldTag {
    CodeLocation = 1,
    Language = 2,
    ReturnType = 3,
    GasLimit = 4,
    Source = 5,
    Args = 6,
    DonSecrets = 7,
    NodeSecrets = 8,
    Requester = 9,
}

impl FieldTag {
    const ALL: [FieldTag; 9] = [
        FieldTag::CodeLocation,
        FieldTag::Language,
        FieldTag::ReturnType,
        FieldTag::GasLimit,
        FieldTag::Source,
        FieldTag::Args,
        FieldTag::DonSecrets,
        FieldTag::NodeSecrets,
        FieldTag::Requester,
    ];

    fn from_u8(tag: u8) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| *t as u8 == tag)
    }
}

/// Identifier the registry assigns to an accepted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub B256);

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A signed request, as submitted to the registry.
#[derive(Debug, Clone)]
pub struct Request {
    pub payload: Vec<u8>,
    pub signature: Signature,
    /// Index of the signing wallet among the harness signers
    pub requester_address_offset: u32,
}

/// A request payload after parsing and signature verification.
#[derive(Debug, Clone)]
pub struct ParsedRequest {
    pub code_location: CodeLocation,
    pub code_language: CodeLanguage,
    pub return_type: ReturnType,
    pub gas_limit: u32,
    pub source: String,
    pub args: Vec<String>,
    pub secrets: EncryptedSecretsBundle,
    pub requester: VerifyingKey,
    pub node_count: usize,
}

impl ParsedRequest {
    /// Returns the requester's address.
    pub fn requester_address(&self) -> Address {
        address_of(&self.requester)
    }
}

/// Derives an address from an ed25519 public key: the last 20 bytes of its
/// keccak-256 hash.
pub fn address_of(key: &VerifyingKey) -> Address {
    Address::from_slice(&keccak256(key.as_bytes())[12..])
}

impl Request {
    /// Parses the payload and verifies the signature.
    ///
    /// # Errors
    /// * `MalformedPayload` - Any structural defect in the payload
    /// * `InvalidSignature` - The signature does not match the embedded
    ///   requester key
    pub fn verify(&self) -> Result<ParsedRequest> {
        let parsed = decode_payload(&self.payload)?;
        parsed
            .requester
            .verify_strict(&self.payload, &self.signature)
            .map_err(|_| DonError::InvalidSignature)?;
        Ok(parsed)
    }
}

/// Builds and signs requests on behalf of the harness wallets.
pub struct RequestBuilder {
    wallets: Vec<SigningKey>,
    node_keys: Vec<PublicKey>,
    max_gas_limit: u32,
}

impl RequestBuilder {
    /// Creates a builder for a DON whose nodes hold `node_keys`, in slot order.
    pub fn new(wallets: Vec<SigningKey>, node_keys: Vec<PublicKey>) -> Self {
        Self {
            wallets,
            node_keys,
            max_gas_limit: DEFAULT_MAX_GAS_LIMIT,
        }
    }

    /// Sets the maximum callback gas limit accepted.
    pub fn with_max_gas_limit(mut self, max_gas_limit: u32) -> Self {
        self.max_gas_limit = max_gas_limit;
        self
    }

    /// Returns the number of node slots requests are built for.
    pub fn node_count(&self) -> usize {
        self.node_keys.len()
    }

    /// Returns the address of the wallet at `offset`.
    pub fn requester_address(&self, offset: u32) -> Result<Address> {
        self.wallet(offset).map(|w| address_of(&w.verifying_key()))
    }

    fn wallet(&self, offset: u32) -> Result<&SigningKey> {
        self.wallets
            .get(offset as usize)
            .ok_or(DonError::UnknownRequester(offset))
    }

    /// Encodes, encrypts and signs a request.
    ///
    /// All structural checks run before any secret is encrypted.
    pub fn build<R: RngCore + CryptoRng>(
        &self,
        rng: &mut R,
        don_public_key_no_prefix: &str,
        params: &RequestConfig,
        requester_address_offset: u32,
    ) -> Result<Request> {
        if params.code_location != CodeLocation::Inline {
            return Err(DonError::UnsupportedCodeLocation(format!(
                "{:?} (only inline source is supported)",
                params.code_location
            )));
        }
        if params.code_language != CodeLanguage::JavaScript {
            return Err(DonError::UnsupportedLanguage(format!(
                "{:?}",
                params.code_language
            )));
        }
        if params.gas_limit > self.max_gas_limit {
            return Err(DonError::GasLimitExceeded {
                requested: params.gas_limit,
                max: self.max_gas_limit,
            });
        }
        if params.per_node_secrets.len() != self.node_keys.len() {
            return Err(DonError::NodeCountMismatch {
                expected: self.node_keys.len(),
                actual: params.per_node_secrets.len(),
            });
        }
        let don_key = secrets::parse_public_key(don_public_key_no_prefix)?;
        let wallet = self.wallet(requester_address_offset)?;

        let bundle = secrets::encrypt_bundle(
            &params.secrets,
            &params.per_node_secrets,
            &don_key,
            &self.node_keys,
            rng,
        )?;

        let payload = encode_payload(params, &bundle, &wallet.verifying_key())?;
        let signature = wallet.sign(&payload);

        debug!(
            "Built request: {} bytes, {} args, {} node shares, requester {}",
            payload.len(),
            params.args.len(),
            bundle.node_count(),
            address_of(&wallet.verifying_key())
        );

        Ok(Request {
            payload,
            signature,
            requester_address_offset,
        })
    }
}

// ============================================================================
// ENCODING
// ============================================================================

fn len_u32(len: usize, what: &str) -> Result<u32> {
    u32::try_from(len).map_err(|_| DonError::malformed(format!("{} too long", what)))
}

fn len_u16(len: usize, what: &str) -> Result<u16> {
    u16::try_from(len).map_err(|_| DonError::malformed(format!("too many {}", what)))
}

fn encode_args(args: &[String]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    out.extend_from_slice(&len_u16(args.len(), "args")?.to_be_bytes());
    for arg in args {
        out.extend_from_slice(&len_u32(arg.len(), "arg")?.to_be_bytes());
        out.extend_from_slice(arg.as_bytes());
    }
    Ok(out)
}

fn encode_node_secrets(shares: &[EncryptedSecrets]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    out.extend_from_slice(&len_u16(shares.len(), "node shares")?.to_be_bytes());
    for share in shares {
        out.extend_from_slice(&share.fingerprint);
        out.extend_from_slice(&len_u32(share.ciphertext.len(), "ciphertext")?.to_be_bytes());
        out.extend_from_slice(&share.ciphertext);
    }
    Ok(out)
}

fn encode_don_secrets(don: &Option<EncryptedSecrets>) -> Vec<u8> {
    match don {
        Some(sealed) => {
            let mut out = sealed.fingerprint.to_vec();
            out.extend_from_slice(&sealed.ciphertext);
            out
        }
        None => Vec::new(),
    }
}

fn encode_payload(
    params: &RequestConfig,
    bundle: &EncryptedSecretsBundle,
    requester: &VerifyingKey,
) -> Result<Vec<u8>> {
    let fields: Vec<(FieldTag, Vec<u8>)> = vec![
        (FieldTag::CodeLocation, vec![params.code_location.tag()]),
        (FieldTag::Language, vec![params.code_language.tag()]),
        (FieldTag::ReturnType, vec![params.expected_return_type.tag()]),
        (FieldTag::GasLimit, params.gas_limit.to_be_bytes().to_vec()),
        (FieldTag::Source, params.source.as_bytes().to_vec()),
        (FieldTag::Args, encode_args(&params.args)?),
        (FieldTag::DonSecrets, encode_don_secrets(&bundle.don)),
        (FieldTag::NodeSecrets, encode_node_secrets(&bundle.per_node)?),
        (FieldTag::Requester, requester.as_bytes().to_vec()),
    ];

    let node_count = len_u16(bundle.per_node.len(), "nodes")?;
    let mut offset = HEADER_BYTES + fields.len() * TABLE_ENTRY_BYTES;

    let mut payload = Vec::with_capacity(offset + fields.iter().map(|(_, b)| b.len()).sum::<usize>());
    payload.extend_from_slice(&PAYLOAD_MAGIC);
    payload.push(PAYLOAD_VERSION);
    payload.extend_from_slice(&node_count.to_be_bytes());
    payload.push(fields.len() as u8);

    for (tag, body) in &fields {
        payload.push(*tag as u8);
        payload.extend_from_slice(&len_u32(offset, "payload")?.to_be_bytes());
        payload.extend_from_slice(&len_u32(body.len(), "field")?.to_be_bytes());
        offset += body.len();
    }
    for (_, body) in fields {
        payload.extend_from_slice(&body);
    }

    Ok(payload)
}

// ============================================================================
// DECODING
// ============================================================================

/// Bounds-checked cursor over one field body.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| DonError::malformed("field truncated"))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn rest(&mut self) -> &'a [u8] {
        let slice = &self.buf[self.pos..];
        self.pos = self.buf.len();
        slice
    }

    fn finish(&self, field: FieldTag) -> Result<()> {
        if self.pos == self.buf.len() {
            Ok(())
        } else {
            Err(DonError::malformed(format!("trailing bytes in {:?}", field)))
        }
    }
}

fn fingerprint_from(bytes: &[u8]) -> Result<[u8; FINGERPRINT_BYTES]> {
    bytes
        .try_into()
        .map_err(|_| DonError::malformed("bad fingerprint"))
}

fn field_body<'a>(bodies: &[Option<&'a [u8]>; 9], tag: FieldTag) -> Result<Reader<'a>> {
    bodies[tag as usize - 1]
        .map(Reader::new)
        .ok_or_else(|| DonError::malformed(format!("missing {:?}", tag)))
}

fn decode_payload(payload: &[u8]) -> Result<ParsedRequest> {
    let mut header = Reader::new(payload);
    if header.take(4)? != PAYLOAD_MAGIC {
        return Err(DonError::malformed("bad magic"));
    }
    let version = header.u8()?;
    if version != PAYLOAD_VERSION {
        return Err(DonError::malformed(format!("unsupported version {}", version)));
    }
    let node_count = header.u16()? as usize;
    let field_count = header.u8()? as usize;
    let bodies_start = HEADER_BYTES + field_count * TABLE_ENTRY_BYTES;

    let mut bodies: [Option<&[u8]>; 9] = [None; 9];
    for _ in 0..field_count {
        let tag = header.u8()?;
        let offset = header.u32()? as usize;
        let len = header.u32()? as usize;

        let field = FieldTag::from_u8(tag)
            .ok_or_else(|| DonError::malformed(format!("unknown field tag {}", tag)))?;
        let end = offset
            .checked_add(len)
            .filter(|end| offset >= bodies_start && *end <= payload.len())
            .ok_or_else(|| DonError::malformed(format!("{:?} out of bounds", field)))?;

        let slot = &mut bodies[tag as usize - 1];
        if slot.is_some() {
            return Err(DonError::malformed(format!("duplicate {:?}", field)));
        }
        *slot = Some(&payload[offset..end]);
    }

    let field = |tag: FieldTag| field_body(&bodies, tag);

    let mut r = field(FieldTag::CodeLocation)?;
    let code_location = CodeLocation::from_tag(r.u8()?)
        .ok_or_else(|| DonError::malformed("unknown code location"))?;
    r.finish(FieldTag::CodeLocation)?;

    let mut r = field(FieldTag::Language)?;
    let code_language = CodeLanguage::from_tag(r.u8()?)
        .ok_or_else(|| DonError::malformed("unknown language"))?;
    r.finish(FieldTag::Language)?;

    let mut r = field(FieldTag::ReturnType)?;
    let return_type =
        ReturnType::from_tag(r.u8()?).ok_or_else(|| DonError::malformed("unknown return type"))?;
    r.finish(FieldTag::ReturnType)?;

    let mut r = field(FieldTag::GasLimit)?;
    let gas_limit = r.u32()?;
    r.finish(FieldTag::GasLimit)?;

    let mut r = field(FieldTag::Source)?;
    let source = String::from_utf8(r.rest().to_vec())
        .map_err(|_| DonError::malformed("source is not UTF-8"))?;

    let mut r = field(FieldTag::Args)?;
    let arg_count = r.u16()?;
    let mut args = Vec::with_capacity(arg_count as usize);
    for _ in 0..arg_count {
        let len = r.u32()? as usize;
        let arg = String::from_utf8(r.take(len)?.to_vec())
            .map_err(|_| DonError::malformed("arg is not UTF-8"))?;
        args.push(arg);
    }
    r.finish(FieldTag::Args)?;

    let mut r = field(FieldTag::DonSecrets)?;
    let don = if r.buf.is_empty() {
        None
    } else {
        let fingerprint = fingerprint_from(r.take(FINGERPRINT_BYTES)?)?;
        Some(EncryptedSecrets {
            fingerprint,
            ciphertext: r.rest().to_vec(),
        })
    };

    let mut r = field(FieldTag::NodeSecrets)?;
    let share_count = r.u16()? as usize;
    if share_count != node_count {
        return Err(DonError::malformed(format!(
            "{} node shares for {} nodes",
            share_count, node_count
        )));
    }
    let mut per_node = Vec::with_capacity(share_count);
    for _ in 0..share_count {
        let fingerprint = fingerprint_from(r.take(FINGERPRINT_BYTES)?)?;
        let len = r.u32()? as usize;
        per_node.push(EncryptedSecrets {
            fingerprint,
            ciphertext: r.take(len)?.to_vec(),
        });
    }
    r.finish(FieldTag::NodeSecrets)?;

    let mut r = field(FieldTag::Requester)?;
    let key_bytes: [u8; 32] = r
        .take(32)?
        .try_into()
        .map_err(|_| DonError::malformed("bad requester key"))?;
    r.finish(FieldTag::Requester)?;
    let requester = VerifyingKey::from_bytes(&key_bytes)
        .map_err(|e| DonError::malformed(format!("bad requester key: {}", e)))?;

    Ok(ParsedRequest {
        code_location,
        code_language,
        return_type,
        gas_limit,
        source,
        args,
        secrets: EncryptedSecretsBundle { don, per_node },
        requester,
        node_count,
    })
}
