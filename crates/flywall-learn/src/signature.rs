//! Payload signatures
//!
//! Signatures checked against packets still inside the inspection
//! window. The kind is a tagged variant so iteration dispatches without
//! a vtable; each kind uses the matcher best suited to it.

use aho_corasick::AhoCorasick;
use flywall_common::{Error, Result};
use memchr::memmem;
use regex::bytes::Regex;

/// What a signature means when it fires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureMeta {
    pub id: u32,
    pub description: String,
}

/// Matcher variants.
pub enum SignatureKind {
    /// Compiled regular expression over raw payload bytes.
    Regex(Regex),
    /// ASCII-case-insensitive literal text.
    Literal(AhoCorasick),
    /// Exact byte sequence.
    Binary(Vec<u8>),
}

impl std::fmt::Debug for SignatureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignatureKind::Regex(re) => f.debug_tuple("Regex").field(&re.as_str()).finish(),
            SignatureKind::Literal(_) => f.debug_tuple("Literal").finish(),
            SignatureKind::Binary(b) => f.debug_tuple("Binary").field(&b.len()).finish(),
        }
    }
}

/// One compiled signature.
#[derive(Debug)]
pub struct Signature {
    pub kind: SignatureKind,
    pub meta: SignatureMeta,
}

impl Signature {
    pub fn regex(id: u32, description: &str, pattern: &str) -> Result<Self> {
        let re = Regex::new(pattern).map_err(|e| {
            Error::validation(format!("invalid signature regex: {e}"))
                .with_attr("signature_id", id)
        })?;
        Ok(Self {
            kind: SignatureKind::Regex(re),
            meta: SignatureMeta {
                id,
                description: description.to_string(),
            },
        })
    }

    pub fn literal(id: u32, description: &str, text: &str) -> Result<Self> {
        let ac = AhoCorasick::builder()
            .ascii_case_insensitive(true)
            .build([text])
            .map_err(|e| {
                Error::validation(format!("invalid signature literal: {e}"))
                    .with_attr("signature_id", id)
            })?;
        Ok(Self {
            kind: SignatureKind::Literal(ac),
            meta: SignatureMeta {
                id,
                description: description.to_string(),
            },
        })
    }

    pub fn binary(id: u32, description: &str, bytes: Vec<u8>) -> Self {
        Self {
            kind: SignatureKind::Binary(bytes),
            meta: SignatureMeta {
                id,
                description: description.to_string(),
            },
        }
    }

    /// Whether the signature fires on a payload.
    #[inline]
    pub fn matches(&self, payload: &[u8]) -> bool {
        match &self.kind {
            SignatureKind::Regex(re) => re.is_match(payload),
            SignatureKind::Literal(ac) => ac.is_match(payload),
            SignatureKind::Binary(bytes) => {
                !bytes.is_empty() && memmem::find(payload, bytes).is_some()
            }
        }
    }
}

/// Ordered signature collection scanned per packet.
#[derive(Debug, Default)]
pub struct SignatureSet {
    signatures: Vec<Signature>,
}

impl SignatureSet {
    pub fn new(signatures: Vec<Signature>) -> Self {
        Self { signatures }
    }

    /// First signature firing on the payload.
    pub fn scan(&self, payload: &[u8]) -> Option<&SignatureMeta> {
        if payload.is_empty() {
            return None;
        }
        self.signatures
            .iter()
            .find(|s| s.matches(payload))
            .map(|s| &s.meta)
    }

    pub fn len(&self) -> usize {
        self.signatures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signatures.is_empty()
    }
}
