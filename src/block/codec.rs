//! Decode, validate and encode the 1024-byte packed block layout (§4.2).

use crate::config::{HEADER_SIZE, PROTOCOL_VERSION};
use crate::crypto;
use crate::error::{BlockError, CodecErrorKind, IntegrityErrorKind};

use super::types::{Field, FieldType, LocatedField, ParsedBlock, FINGERPRINT_LEN};

pub const BLOCK_SIZE: usize = crate::config::BLOCK_SIZE;

/// Walks the TLV region of `buf` starting at `HEADER_SIZE`, without
/// checking difficulty or signatures. Shared by `decode`, `encode` (for its
/// post-assembly self-check) and the miner (to locate the nonce).
fn walk_fields(buf: &[u8; BLOCK_SIZE]) -> Result<Vec<LocatedField>, BlockError> {
    let mut cursor = HEADER_SIZE;
    let mut fields = Vec::new();
    let mut special_seen = false;

    while cursor < BLOCK_SIZE {
        let header_offset = cursor;
        let type_code = buf[cursor] >> 2;
        let field_type = FieldType::from_code(type_code)
            .ok_or_else(|| BlockError::codec(CodecErrorKind::InvalidTlvType))?;

        let (len, header_len) = match field_type.fixed_len() {
            Some(fixed) => (fixed, 1),
            None => {
                if cursor + 1 >= BLOCK_SIZE {
                    return Err(BlockError::codec(CodecErrorKind::MalformedFraming));
                }
                let lo2 = (buf[cursor] & 0x03) as usize;
                let lo8 = buf[cursor + 1] as usize;
                ((lo2 << 8) | lo8, 2)
            }
        };

        let value_offset = header_offset + header_len;
        if value_offset + len > BLOCK_SIZE {
            return Err(BlockError::codec(CodecErrorKind::TruncatedField));
        }

        if field_type == FieldType::SpecialBlock {
            if header_offset != HEADER_SIZE {
                return Err(BlockError::codec(CodecErrorKind::SpecialNotFirst));
            }
            special_seen = true;
        }
        let _ = special_seen;

        let value = buf[value_offset..value_offset + len].to_vec();
        fields.push(LocatedField {
            field: Field::new(field_type, value),
            header_offset,
            value_offset,
        });
        cursor = value_offset + len;
    }

    if cursor != BLOCK_SIZE {
        return Err(BlockError::codec(CodecErrorKind::MalformedFraming));
    }

    if let Some(pos) = fields.iter().position(|f| f.field.field_type == FieldType::Signature) {
        if pos != fields.len() - 1 {
            return Err(BlockError::codec(CodecErrorKind::MalformedFraming));
        }
    }

    Ok(fields)
}

/// Decode algorithm (§4.2): size check, PoW check, header parse, TLV walk,
/// then signature verification if a `SIGNATURE` field is present.
pub fn decode(buf: &[u8], required_difficulty: u32) -> Result<ParsedBlock, BlockError> {
    let buf: [u8; BLOCK_SIZE] = buf
        .try_into()
        .map_err(|_| BlockError::codec(CodecErrorKind::InvalidSize))?;

    let digest = crypto::hash(&buf);
    if crypto::trailing_zero_bits(&digest) < required_difficulty {
        return Err(BlockError::integrity(IntegrityErrorKind::DifficultyUnmet));
    }

    let version = buf[0] >> 4;
    let reserved = buf[0] & 0x0F;
    if version != PROTOCOL_VERSION {
        return Err(BlockError::codec(CodecErrorKind::UnsupportedVersion));
    }
    let mut date_bytes = [0u8; 8];
    date_bytes[3..8].copy_from_slice(&buf[1..6]);
    let date = u64::from_be_bytes(date_bytes);

    let fields = walk_fields(&buf)?;
    let parsed = ParsedBlock {
        version,
        reserved,
        date,
        fields,
        raw: buf,
    };

    if let Some(sig) = parsed.located(FieldType::Signature) {
        verify_signature(&parsed, sig)?;
    }

    Ok(parsed)
}

fn verify_signature(
    parsed: &ParsedBlock,
    sig: &LocatedField,
) -> Result<(), BlockError> {
    let public_key = parsed
        .field(FieldType::PublicKey)
        .ok_or_else(|| BlockError::integrity(IntegrityErrorKind::BadSignature))?;
    let mut pk = [0u8; 32];
    pk.copy_from_slice(&public_key.value);

    let expected_fingerprint = crypto::hash(&pk);
    if sig.field.value[..FINGERPRINT_LEN] != expected_fingerprint[..FINGERPRINT_LEN] {
        return Err(BlockError::integrity(IntegrityErrorKind::FingerprintMismatch));
    }

    let mut signature = [0u8; 64];
    signature.copy_from_slice(&sig.field.value[FINGERPRINT_LEN..]);
    let message = &parsed.raw[..=sig.header_offset];
    crypto::verify(&pk, &signature, message)
        .map_err(|_| BlockError::integrity(IntegrityErrorKind::BadSignature))
}

/// Encode algorithm (§4.2): lays `fields` out in order after a zeroed
/// header, padding the remainder with a trailing `PADDING_NONCE` field.
/// Fields destined to carry a mined nonce or a post-mining signature are
/// written with zeroed placeholder values; the caller fills them in via
/// `block::mining`.
pub fn encode(date: u64, fields: &[Field]) -> Result<[u8; BLOCK_SIZE], BlockError> {
    let used: usize = fields.iter().map(Field::encoded_len).sum();
    let payload_area = BLOCK_SIZE - HEADER_SIZE;
    if used > payload_area {
        return Err(BlockError::codec(CodecErrorKind::Overflow));
    }
    let remainder = payload_area - used;

    let mut assembled: Vec<Field> = fields.to_vec();
    if remainder > 0 {
        if remainder < 2 {
            return Err(BlockError::codec(CodecErrorKind::Overflow));
        }
        let padding = Field::new(FieldType::PaddingNonce, vec![0u8; remainder - 2]);
        // SIGNATURE must stay the trailing field (I5), so padding is
        // inserted ahead of it rather than simply appended.
        match assembled.iter().position(|f| f.field_type == FieldType::Signature) {
            Some(pos) => assembled.insert(pos, padding),
            None => assembled.push(padding),
        }
    }

    let mut buf = [0u8; BLOCK_SIZE];
    buf[0] = PROTOCOL_VERSION << 4;
    let date_bytes = date.to_be_bytes();
    buf[1..6].copy_from_slice(&date_bytes[3..8]);

    let mut cursor = HEADER_SIZE;
    for field in &assembled {
        cursor = write_field(&mut buf, cursor, field);
    }
    if cursor != BLOCK_SIZE {
        return Err(BlockError::codec(CodecErrorKind::MalformedFraming));
    }

    // Re-walk to enforce placement invariants (special-first, signature-last)
    // the same way a peer decoding this buffer would.
    walk_fields(&buf)?;

    Ok(buf)
}

fn write_field(buf: &mut [u8; BLOCK_SIZE], cursor: usize, field: &Field) -> usize {
    match field.field_type.fixed_len() {
        Some(n) => {
            buf[cursor] = field.field_type.code() << 2;
            buf[cursor + 1..cursor + 1 + n].copy_from_slice(&field.value);
            cursor + 1 + n
        }
        None => {
            let len = field.value.len();
            buf[cursor] = (field.field_type.code() << 2) | ((len >> 8) as u8 & 0x03);
            buf[cursor + 1] = (len & 0xFF) as u8;
            buf[cursor + 2..cursor + 2 + len].copy_from_slice(&field.value);
            cursor + 2 + len
        }
    }
}

/// Locates the last 4 bytes of the first `PADDING_NONCE` field whose
/// length is at least 4 — the byte offset the miner overwrites (§4.2
/// Mining).
pub fn locate_nonce_offset(buf: &[u8; BLOCK_SIZE]) -> Option<usize> {
    walk_fields(buf).ok()?.into_iter().find_map(|f| {
        if f.field.field_type == FieldType::PaddingNonce && f.field.value.len() >= 4 {
            Some(f.value_offset + f.field.value.len() - 4)
        } else {
            None
        }
    })
}

/// Locates the `SIGNATURE` field's header offset (the byte a signature
/// covers up to and including) and its value offset, if present.
pub fn locate_signature(buf: &[u8; BLOCK_SIZE]) -> Option<(usize, usize)> {
    walk_fields(buf).ok()?.into_iter().find_map(|f| {
        if f.field.field_type == FieldType::Signature {
            Some((f.header_offset, f.value_offset))
        } else {
            None
        }
    })
}
