//! Field-type catalogue and in-memory field/block representations (§3.1).

/// The 6-bit TLV type tags. Values are stable wire identifiers — never
/// renumber an existing variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldType {
    PaddingNonce,
    Payload,
    RelatesTo,
    KeyDistribution,
    SharedKey,
    Encrypted,
    Signature,
    PublicKey,
    SpecialBlock,
}

/// `SIGNATURE` carries an 8-byte key fingerprint ahead of the 64-byte
/// Ed25519 signature proper (I6), so its fixed length is 72, not 64.
pub const SIGNATURE_FIELD_LEN: usize = 72;
pub const ED25519_SIG_LEN: usize = 64;
pub const FINGERPRINT_LEN: usize = 8;

impl FieldType {
    pub const ALL: [FieldType; 9] = [
        FieldType::PaddingNonce,
        FieldType::Payload,
        FieldType::RelatesTo,
        FieldType::KeyDistribution,
        FieldType::SharedKey,
        FieldType::Encrypted,
        FieldType::Signature,
        FieldType::PublicKey,
        FieldType::SpecialBlock,
    ];

    pub fn code(self) -> u8 {
        match self {
            FieldType::PaddingNonce => 0,
            FieldType::Payload => 1,
            FieldType::RelatesTo => 2,
            FieldType::KeyDistribution => 3,
            FieldType::SharedKey => 4,
            FieldType::Encrypted => 5,
            FieldType::Signature => 6,
            FieldType::PublicKey => 7,
            FieldType::SpecialBlock => 8,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.code() == code)
    }

    /// `Some(len)` for types whose length is implicit from the type alone
    /// (1-byte header); `None` for variable-length types (2-byte header).
    pub fn fixed_len(self) -> Option<usize> {
        match self {
            FieldType::RelatesTo => Some(32),
            FieldType::KeyDistribution => Some(40),
            FieldType::SharedKey => Some(32),
            FieldType::Signature => Some(SIGNATURE_FIELD_LEN),
            FieldType::PublicKey => Some(32),
            FieldType::SpecialBlock => Some(1),
            FieldType::PaddingNonce | FieldType::Payload | FieldType::Encrypted => None,
        }
    }
}

/// A decoded or to-be-encoded TLV field, with its value owned rather than
/// borrowed from the source buffer (fields outlive the decode call, e.g.
/// when forwarded into a `BlockStore`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub field_type: FieldType,
    pub value: Vec<u8>,
}

impl Field {
    pub fn new(field_type: FieldType, value: Vec<u8>) -> Self {
        Self { field_type, value }
    }

    /// Bytes this field occupies on the wire, header included.
    pub fn encoded_len(&self) -> usize {
        match self.field_type.fixed_len() {
            Some(n) => 1 + n,
            None => 2 + self.value.len(),
        }
    }
}

/// The two low bits of a `SPECIAL_BLOCK` field select the block's variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecialVariant {
    Mutable,
    ImmutablePersistent,
    Reserved(u8),
}

impl SpecialVariant {
    pub fn from_byte(b: u8) -> Self {
        match b & 0x03 {
            0 => SpecialVariant::Mutable,
            1 => SpecialVariant::ImmutablePersistent,
            other => SpecialVariant::Reserved(other),
        }
    }

    pub fn to_byte(self) -> u8 {
        match self {
            SpecialVariant::Mutable => 0,
            SpecialVariant::ImmutablePersistent => 1,
            SpecialVariant::Reserved(other) => other & 0x03,
        }
    }
}

/// A field plus the byte offset of its header within the 1024-byte buffer,
/// produced by the codec's TLV walk. Needed to locate the mining nonce and
/// the exact prefix an embedded signature covers.
#[derive(Debug, Clone)]
pub struct LocatedField {
    pub field: Field,
    pub header_offset: usize,
    pub value_offset: usize,
}

/// A fully decoded block: header plus its TLV fields, with the raw buffer
/// retained since identity and re-encoding both need it.
#[derive(Debug, Clone)]
pub struct ParsedBlock {
    pub version: u8,
    pub reserved: u8,
    pub date: u64,
    pub fields: Vec<LocatedField>,
    pub raw: [u8; super::codec::BLOCK_SIZE],
}

impl ParsedBlock {
    pub fn field(&self, field_type: FieldType) -> Option<&Field> {
        self.fields
            .iter()
            .find(|f| f.field.field_type == field_type)
            .map(|f| &f.field)
    }

    pub fn located(&self, field_type: FieldType) -> Option<&LocatedField> {
        self.fields.iter().find(|f| f.field.field_type == field_type)
    }

    /// Identity per §3.1: the public key for mutable blocks, else the
    /// SHA3-256 digest of the whole buffer.
    pub fn identity(&self) -> Identity {
        match self.field(FieldType::PublicKey) {
            Some(pk) if self.is_mutable() => {
                let mut key = [0u8; 32];
                key.copy_from_slice(&pk.value);
                Identity::Mutable(key)
            }
            _ => Identity::Immutable(crate::crypto::hash(&self.raw)),
        }
    }

    pub fn is_mutable(&self) -> bool {
        matches!(
            self.field(FieldType::SpecialBlock).map(|f| SpecialVariant::from_byte(f.value[0])),
            Some(SpecialVariant::Mutable)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Identity {
    Immutable([u8; 32]),
    Mutable([u8; 32]),
}

impl Identity {
    pub fn bytes(&self) -> [u8; 32] {
        match self {
            Identity::Immutable(h) | Identity::Mutable(h) => *h,
        }
    }
}
