//! x86-64 jump site encoding.
//!
//! Every chainable exit in a translation is a fixed 13-byte site so it
//! can hold either form of jump:
//!
//! ```text
//! near:  E9 rel32                     CC CC CC CC CC CC CC CC
//! far:   49 BB imm64 (movabs r11)     41 FF E3 (jmp r11)
//! ```
//!
//! The near form is used whenever the displacement fits in 32 bits.

use crate::types::HostAddr;

// =============================================================================
// Constants
// =============================================================================

/// Size of a patchable jump site.
pub const JUMP_SITE_LEN: usize = 13;

/// Size of a near jump instruction (jmp rel32).
pub const JMP_REL32_SIZE: usize = 5;

/// Opcode for near jump (jmp rel32).
pub const JMP_REL32_OPCODE: u8 = 0xE9;

/// `movabs r11, imm64` prefix.
pub const MOVABS_R11: [u8; 2] = [0x49, 0xBB];

/// `jmp r11`.
pub const JMP_R11: [u8; 3] = [0x41, 0xFF, 0xE3];

/// Breakpoint used as padding after a near jump.
pub const INT3: u8 = 0xCC;

// =============================================================================
// Encoding
// =============================================================================

/// Encode a relative near jump from `from` to `to`.
///
/// Returns `None` when the displacement does not fit in 32 bits.
#[inline]
pub fn encode_jmp_rel32(from: HostAddr, to: HostAddr) -> Option<[u8; JMP_REL32_SIZE]> {
    let offset = to as i128 - (from as i128 + JMP_REL32_SIZE as i128);
    let offset = i32::try_from(offset).ok()?;

    let mut bytes = [0u8; JMP_REL32_SIZE];
    bytes[0] = JMP_REL32_OPCODE;
    bytes[1..5].copy_from_slice(&offset.to_le_bytes());
    Some(bytes)
}

/// Encode a full jump site at `site` that transfers control to `target`.
pub fn encode_jump(site: HostAddr, target: HostAddr) -> [u8; JUMP_SITE_LEN] {
    let mut bytes = [INT3; JUMP_SITE_LEN];
    match encode_jmp_rel32(site, target) {
        Some(near) => bytes[..JMP_REL32_SIZE].copy_from_slice(&near),
        None => {
            bytes[0..2].copy_from_slice(&MOVABS_R11);
            bytes[2..10].copy_from_slice(&(target as u64).to_le_bytes());
            bytes[10..13].copy_from_slice(&JMP_R11);
        }
    }
    bytes
}

/// Decode the jump site at `site`, returning its target.
///
/// Returns `None` if `bytes` holds neither jump form.
pub fn decode_jump(site: HostAddr, bytes: &[u8]) -> Option<HostAddr> {
    match bytes {
        [JMP_REL32_OPCODE, b0, b1, b2, b3, ..] => {
            let rel = i32::from_le_bytes([*b0, *b1, *b2, *b3]);
            let target = site as i128 + JMP_REL32_SIZE as i128 + rel as i128;
            usize::try_from(target).ok()
        }
        [0x49, 0xBB, rest @ ..] if rest.len() >= 11 && rest[8..11] == JMP_R11 => {
            let mut imm = [0u8; 8];
            imm.copy_from_slice(&rest[..8]);
            usize::try_from(u64::from_le_bytes(imm)).ok()
        }
        _ => None,
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_jmp_rel32() {
        let bytes = encode_jmp_rel32(0x1000, 0x1100).expect("Should encode");
        assert_eq!(bytes[0], JMP_REL32_OPCODE);

        // Offset should be 0x100 - 5 = 0xFB
        let offset = i32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
        assert_eq!(offset, 0xFB);
    }

    #[test]
    fn test_encode_jmp_rel32_backward() {
        let bytes = encode_jmp_rel32(0x1100, 0x1000).expect("Should encode");
        let offset = i32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
        assert_eq!(offset, -0x105);
    }

    #[test]
    fn test_encode_jmp_rel32_out_of_range() {
        assert!(encode_jmp_rel32(0x1000, 0x1000 + (1usize << 33)).is_none());
    }

    #[test]
    fn test_near_site_is_padded() {
        let bytes = encode_jump(0x4000, 0x5000);
        assert_eq!(bytes[0], JMP_REL32_OPCODE);
        assert!(bytes[JMP_REL32_SIZE..].iter().all(|&b| b == INT3));
        assert_eq!(decode_jump(0x4000, &bytes), Some(0x5000));
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn test_far_site_uses_r11() {
        let target = 0x7FFF_0000_0000usize;
        let bytes = encode_jump(0x1000, target);
        assert_eq!(&bytes[0..2], &MOVABS_R11);
        assert_eq!(&bytes[10..13], &JMP_R11);
        assert_eq!(decode_jump(0x1000, &bytes), Some(target));
    }

    #[test]
    fn test_decode_rejects_non_jump() {
        assert_eq!(decode_jump(0x1000, &[0x90; JUMP_SITE_LEN]), None);
        assert_eq!(decode_jump(0x1000, &[0xE9, 0x00]), None);
    }
}
