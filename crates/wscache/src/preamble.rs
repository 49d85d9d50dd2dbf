//! Human-readable, CRC-protected preamble at the head of the ring file.
//!
//! The preamble is line-oriented `KEY: VALUE` text, NUL-padded to
//! [`PREAMBLE_LEN`]. It survives unencrypted (it is below the
//! encryption start offset) so operators and external tooling can always
//! identify a ring file. Composition is a pure function of its inputs;
//! the ring serializes writes under its own lock.

use uuid::Uuid;

use crate::types::{Seqno, SEQNO_ILL};

/// Byte length of the on-disk preamble region.
pub const PREAMBLE_LEN: usize = 1024;

/// Current ring file format version.
pub const VERSION: u32 = 2;

/// Current encryption block version.
pub const ENC_VERSION: u32 = 1;

const KEY_VERSION: &str = "Version:";
const KEY_GID: &str = "GID:";
const KEY_SEQNO_MIN: &str = "seqno_min:";
const KEY_SEQNO_MAX: &str = "seqno_max:";
const KEY_OFFSET: &str = "offset:";
const KEY_SYNCED: &str = "synced:";
const KEY_ENC_VERSION: &str = "enc_version:";
const KEY_ENC_ENCRYPTED: &str = "enc_encrypted:";
const KEY_ENC_MK_ID: &str = "enc_mk_id:";
const KEY_ENC_MK_CONST_ID: &str = "enc_mk_const_id:";
const KEY_ENC_MK_UUID: &str = "enc_mk_uuid:";
const KEY_ENC_FILE_KEY: &str = "enc_fk_id:";
const KEY_ENC_CRC: &str = "enc_crc:";

/// Persistent encryption state of a ring file.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EncState {
    pub enabled: bool,
    /// Monotonic master-key id; 0 means no master key yet.
    pub mk_id: u32,
    /// Constant id of this cache, fixed at first encrypted open.
    pub const_uuid: Uuid,
    /// UUID component of the current master-key name.
    pub mk_uuid: Uuid,
    /// File key wrapped under the master key, base64.
    pub wrapped_file_key: String,
}

impl EncState {
    /// CRC32C over the binary concatenation of the encryption fields.
    pub fn crc(&self, enc_version: u32) -> u32 {
        let mut buf = Vec::with_capacity(64 + self.wrapped_file_key.len());
        buf.extend_from_slice(&enc_version.to_le_bytes());
        buf.push(self.enabled as u8);
        buf.extend_from_slice(&self.mk_id.to_le_bytes());
        buf.extend_from_slice(self.const_uuid.as_bytes());
        buf.extend_from_slice(self.mk_uuid.as_bytes());
        buf.extend_from_slice(self.wrapped_file_key.as_bytes());
        crc32c::crc32c(&buf)
    }

    /// Drops all key material, forcing regeneration on the next open.
    pub fn clear_keys(&mut self) {
        self.mk_id = 0;
        self.mk_uuid = Uuid::nil();
        self.wrapped_file_key.clear();
    }
}

/// Everything a preamble can carry, as parsed from disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Preamble {
    pub version: u32,
    pub gid: Uuid,
    pub seqno_min: Seqno,
    pub seqno_max: Seqno,
    /// Byte offset of the oldest buffer from the start of the file;
    /// negative when unknown.
    pub offset: i64,
    pub synced: bool,
    pub enc_version: u32,
    pub enc: EncState,
    /// CRC as stored; 0 when absent.
    pub enc_crc: u32,
}

impl Default for Preamble {
    fn default() -> Self {
        Self {
            version: 0,
            gid: Uuid::nil(),
            seqno_min: SEQNO_ILL,
            seqno_max: SEQNO_ILL,
            offset: -1,
            synced: false,
            enc_version: 0,
            enc: EncState::default(),
            enc_crc: 0,
        }
    }
}

/// Composes the preamble block for writing.
///
/// `range` carries `(seqno_min, seqno_max, first_offset)` of a synced
/// ring; it is only written when `synced` is true, matching the rule that
/// cursor hints are trustworthy solely after a clean shutdown.
pub fn compose(
    gid: &Uuid,
    synced: bool,
    range: Option<(Seqno, Seqno, u64)>,
    enc: &EncState,
) -> [u8; PREAMBLE_LEN] {
    let mut text = String::with_capacity(PREAMBLE_LEN / 2);
    text.push_str(&format!("{KEY_VERSION} {VERSION}\n"));
    text.push_str(&format!("{KEY_GID} {gid}\n"));

    if synced {
        match range {
            Some((min, max, offset)) => {
                text.push_str(&format!("{KEY_SEQNO_MIN} {min}\n"));
                text.push_str(&format!("{KEY_SEQNO_MAX} {max}\n"));
                text.push_str(&format!("{KEY_OFFSET} {offset}\n"));
            }
            None => {
                text.push_str(&format!("{KEY_SEQNO_MIN} {SEQNO_ILL}\n"));
                text.push_str(&format!("{KEY_SEQNO_MAX} {SEQNO_ILL}\n"));
            }
        }
    }

    text.push_str(&format!("{KEY_SYNCED} {}\n", synced as u8));
    text.push_str(&format!("{KEY_ENC_VERSION} {ENC_VERSION}\n"));
    text.push_str(&format!("{KEY_ENC_ENCRYPTED} {}\n", enc.enabled as u8));
    text.push_str(&format!("{KEY_ENC_MK_ID} {}\n", enc.mk_id));
    text.push_str(&format!("{KEY_ENC_MK_CONST_ID} {}\n", enc.const_uuid));
    text.push_str(&format!("{KEY_ENC_MK_UUID} {}\n", enc.mk_uuid));
    text.push_str(&format!("{KEY_ENC_FILE_KEY} {}\n", enc.wrapped_file_key));
    text.push_str(&format!("{KEY_ENC_CRC} {}\n", enc.crc(ENC_VERSION)));
    text.push('\n');

    let mut block = [0u8; PREAMBLE_LEN];
    let copy_len = text.len().min(PREAMBLE_LEN - 1);
    block[..copy_len].copy_from_slice(&text.as_bytes()[..copy_len]);
    block
}

/// Parses a preamble block. Unknown keys and comment lines are ignored;
/// malformed values leave the default in place.
pub fn parse(block: &[u8]) -> Preamble {
    let len = block.iter().position(|&b| b == 0).unwrap_or(block.len());
    let text = String::from_utf8_lossy(&block[..len]);

    let mut p = Preamble::default();
    for line in text.lines() {
        let mut it = line.split_whitespace();
        let Some(key) = it.next() else { continue };
        if key.starts_with('#') {
            continue;
        }
        let Some(value) = it.next() else { continue };

        match key {
            k if k == KEY_VERSION => set_num(&mut p.version, value),
            k if k == KEY_GID => set_uuid(&mut p.gid, value),
            k if k == KEY_SEQNO_MIN => set_num(&mut p.seqno_min, value),
            k if k == KEY_SEQNO_MAX => set_num(&mut p.seqno_max, value),
            k if k == KEY_OFFSET => set_num(&mut p.offset, value),
            k if k == KEY_SYNCED => p.synced = value == "1" || value == "true",
            k if k == KEY_ENC_VERSION => set_num(&mut p.enc_version, value),
            k if k == KEY_ENC_ENCRYPTED => p.enc.enabled = value == "1" || value == "true",
            k if k == KEY_ENC_MK_ID => set_num(&mut p.enc.mk_id, value),
            k if k == KEY_ENC_MK_CONST_ID => set_uuid(&mut p.enc.const_uuid, value),
            k if k == KEY_ENC_MK_UUID => set_uuid(&mut p.enc.mk_uuid, value),
            k if k == KEY_ENC_FILE_KEY => p.enc.wrapped_file_key = value.to_string(),
            k if k == KEY_ENC_CRC => set_num(&mut p.enc_crc, value),
            _ => {}
        }
    }
    p
}

fn set_num<T: std::str::FromStr>(target: &mut T, value: &str) {
    if let Ok(v) = value.parse() {
        *target = v;
    }
}

fn set_uuid(target: &mut Uuid, value: &str) {
    if let Ok(v) = Uuid::parse_str(value) {
        *target = v;
    }
}
