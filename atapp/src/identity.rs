// Copyright (c) Sean Lawlor
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! Node identity helpers
//!
//! A node's numeric id may be written as a plain integer (`123`, `0x7b`) or
//! in dotted form (`1.2.3.4`) interpreted against an id-mask such as
//! `8.8.8.8`, where each mask entry is the bit width of the corresponding
//! segment. The identity digest and the stable name hash computed here are
//! frozen after first assignment and survive configuration reloads.

use std::path::Path;

use once_cell::sync::OnceCell;
use sha2::{Digest, Sha256};

/// Seed for the name hash. Fixed for the whole cluster; every process
/// must use the same value or consistent-hash routing diverges.
const NAME_HASH_SEED: u32 = 0;

fn read_u64_le(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(buf)
}

fn fmix64(mut k: u64) -> u64 {
    k ^= k >> 33;
    k = k.wrapping_mul(0xff51_afd7_ed55_8ccd);
    k ^= k >> 33;
    k = k.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    k ^= k >> 33;
    k
}

/// MurmurHash3 x64-128 (Austin Appleby's public-domain reference,
/// little-endian block reads).
pub fn murmur_hash3_x64_128(data: &[u8], seed: u32) -> (u64, u64) {
    const C1: u64 = 0x87c3_7b91_1142_53d5;
    const C2: u64 = 0x4cf5_ad43_2745_937f;

    let mut h1 = seed as u64;
    let mut h2 = seed as u64;

    let mut blocks = data.chunks_exact(16);
    for block in blocks.by_ref() {
        let mut k1 = read_u64_le(&block[0..8]);
        let mut k2 = read_u64_le(&block[8..16]);

        k1 = k1.wrapping_mul(C1);
        k1 = k1.rotate_left(31);
        k1 = k1.wrapping_mul(C2);
        h1 ^= k1;
        h1 = h1.rotate_left(27);
        h1 = h1.wrapping_add(h2);
        h1 = h1.wrapping_mul(5).wrapping_add(0x52dc_e729);

        k2 = k2.wrapping_mul(C2);
        k2 = k2.rotate_left(33);
        k2 = k2.wrapping_mul(C1);
        h2 ^= k2;
        h2 = h2.rotate_left(31);
        h2 = h2.wrapping_add(h1);
        h2 = h2.wrapping_mul(5).wrapping_add(0x3849_5ab5);
    }

    let tail = blocks.remainder();
    if tail.len() > 8 {
        let mut k2: u64 = 0;
        for (offset, byte) in tail[8..].iter().enumerate() {
            k2 ^= (*byte as u64) << (offset * 8);
        }
        k2 = k2.wrapping_mul(C2);
        k2 = k2.rotate_left(33);
        k2 = k2.wrapping_mul(C1);
        h2 ^= k2;
    }
    if !tail.is_empty() {
        let mut k1: u64 = 0;
        for (offset, byte) in tail[..tail.len().min(8)].iter().enumerate() {
            k1 ^= (*byte as u64) << (offset * 8);
        }
        k1 = k1.wrapping_mul(C1);
        k1 = k1.rotate_left(31);
        k1 = k1.wrapping_mul(C2);
        h1 ^= k1;
    }

    h1 ^= data.len() as u64;
    h2 ^= data.len() as u64;
    h1 = h1.wrapping_add(h2);
    h2 = h2.wrapping_add(h1);
    h1 = fmix64(h1);
    h2 = fmix64(h2);
    h1 = h1.wrapping_add(h2);
    h2 = h2.wrapping_add(h1);
    (h1, h2)
}

/// Stable 128-bit hash, exposed as a pair of 64-bit halves.
///
/// All processes in a cluster must agree on these values for the same
/// input, since consistent-hash routing and selection tie-breaks compare
/// them across nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NameHash {
    /// High 64 bits
    pub high: u64,
    /// Low 64 bits
    pub low: u64,
}

impl NameHash {
    /// Hash arbitrary bytes down to a stable 128-bit key (MurmurHash3
    /// x64-128 with the cluster-wide seed).
    pub fn digest(data: &[u8]) -> Self {
        let (high, low) = murmur_hash3_x64_128(data, NAME_HASH_SEED);
        Self { high, low }
    }

    /// The hash as one 128-bit integer, lexicographically ordered the same
    /// way as `(high, low)`.
    pub fn as_u128(&self) -> u128 {
        ((self.high as u128) << 64) | self.low as u128
    }

    /// Uppercase hex rendering, 32 characters.
    pub fn to_hex(&self) -> String {
        format!("{:016X}{:016X}", self.high, self.low)
    }
}

/// Split a dotted mask string (`"8.8.8.8"`) into per-segment bit widths.
/// Non-numeric segments are ignored.
pub fn split_ids_by_string(mask: &str) -> Vec<u64> {
    mask.split('.')
        .filter_map(|seg| seg.trim().parse::<u64>().ok())
        .collect()
}

fn parse_plain_id(text: &str) -> u64 {
    let text = text.trim();
    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).unwrap_or(0)
    } else {
        text.parse::<u64>().unwrap_or(0)
    }
}

/// Convert an id string to its numeric form using a dotted mask.
///
/// With an empty mask, or an id without dots, the string parses as a plain
/// (decimal or `0x` hex) integer. Otherwise each dotted segment is packed
/// into its mask-width bit field, most significant segment first; mask
/// entries beyond the segment count widen the low bits.
pub fn convert_app_id_by_string(id: &str, mask: &[u64]) -> u64 {
    let id = id.trim();
    if mask.is_empty() || !id.contains('.') {
        return parse_plain_id(id);
    }

    let segments: Vec<u64> = id.split('.').map(parse_plain_id).collect();
    let mut out: u64 = 0;
    for (idx, width) in mask.iter().enumerate() {
        let width = (*width).min(64) as u32;
        out = out.checked_shl(width).unwrap_or(0);
        if let Some(seg) = segments.get(idx) {
            let keep = if width >= 64 {
                *seg
            } else {
                seg & ((1u64 << width) - 1)
            };
            out |= keep;
        }
    }
    out
}

/// Render a numeric id in dotted form using a mask, lowest segment last.
/// With an empty mask the id renders as a plain decimal (or hex) integer.
pub fn convert_app_id_to_string(id: u64, mask: &[u64], hex: bool) -> String {
    if mask.is_empty() {
        return if hex {
            format!("0x{id:x}")
        } else {
            id.to_string()
        };
    }

    let mut rest = id;
    let mut segments = vec![0u64; mask.len()];
    for (idx, width) in mask.iter().enumerate().rev() {
        let width = (*width).min(64) as u32;
        let seg = if width >= 64 {
            rest
        } else {
            rest & ((1u64 << width) - 1)
        };
        segments[idx] = seg;
        rest = rest.checked_shr(width).unwrap_or(0);
    }

    segments
        .iter()
        .map(|seg| {
            if hex {
                format!("0x{seg:x}")
            } else {
                seg.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join(".")
}

/// The default node name when the configuration supplies none.
pub fn default_node_name(type_name: &str, id: u64) -> String {
    format!("{type_name}-0x{id:x}")
}

/// Compute the immutable identity digest of this process: SHA-256 hex over
/// the absolute executable path, the absolute configuration path, and the
/// id/name/hostname triple. Assigned once; reloads keep the prior value.
pub fn identity_digest(
    execute_path: &Path,
    conf_file: &Path,
    id: u64,
    name: &str,
    hostname: &str,
) -> String {
    let exe = std::fs::canonicalize(execute_path).unwrap_or_else(|_| execute_path.to_path_buf());
    let conf = std::fs::canonicalize(conf_file).unwrap_or_else(|_| conf_file.to_path_buf());

    let mut hasher = Sha256::new();
    hasher.update(exe.to_string_lossy().as_bytes());
    hasher.update(b"\n");
    hasher.update(conf.to_string_lossy().as_bytes());
    hasher.update(b"\n");
    hasher.update(format!("id: {id}\n").as_bytes());
    hasher.update(format!("name: {name}\n").as_bytes());
    hasher.update(format!("hostname: {hostname}\n").as_bytes());

    let out = hasher.finalize();
    let mut hex = String::with_capacity(out.len() * 2);
    for byte in out {
        hex.push_str(&format!("{byte:02x}"));
    }
    hex
}

static LOCAL_HOSTNAME: OnceCell<String> = OnceCell::new();

#[cfg(unix)]
fn system_hostname() -> Option<String> {
    nix::unistd::gethostname()
        .ok()
        .map(|name| name.to_string_lossy().into_owned())
        .filter(|name| !name.is_empty())
}

#[cfg(not(unix))]
fn system_hostname() -> Option<String> {
    std::env::var("COMPUTERNAME")
        .ok()
        .filter(|name| !name.is_empty())
}

/// The cached local hostname, resolved once per process through the OS
/// (`gethostname(2)`). Falls back to the `HOSTNAME` environment variable
/// and then `localhost` only when the system reports nothing.
pub fn local_hostname() -> &'static str {
    LOCAL_HOSTNAME.get_or_init(|| {
        system_hostname()
            .or_else(|| std::env::var("HOSTNAME").ok().filter(|h| !h.is_empty()))
            .unwrap_or_else(|| "localhost".to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_splits() {
        assert_eq!(vec![8, 8, 8, 8], split_ids_by_string("8.8.8.8"));
        assert_eq!(vec![16, 16], split_ids_by_string("16.16"));
        assert_eq!(Vec::<u64>::new(), split_ids_by_string(""));
    }

    #[test]
    fn dotted_id_round_trips() {
        let mask = [8u64, 8, 8, 8];
        let id = convert_app_id_by_string("1.2.3.4", &mask);
        assert_eq!(0x0102_0304, id);
        assert_eq!("1.2.3.4", convert_app_id_to_string(id, &mask, false));
    }

    #[test]
    fn plain_ids_parse_without_mask() {
        assert_eq!(123, convert_app_id_by_string("123", &[]));
        assert_eq!(0x7b, convert_app_id_by_string("0x7b", &[]));
        assert_eq!("0x7b", convert_app_id_to_string(123, &[], true));
    }

    #[test]
    fn name_hash_is_stable_and_ordered() {
        let a = NameHash::digest(b"svc-a");
        let b = NameHash::digest(b"svc-a");
        assert_eq!(a, b);
        assert_eq!(32, a.to_hex().len());

        let c = NameHash::digest(b"svc-b");
        // ordering on the struct matches ordering on the packed integer
        assert_eq!(a.cmp(&c), a.as_u128().cmp(&c.as_u128()));
    }

    #[test]
    fn murmur_empty_input_with_zero_seed_is_zero() {
        // reference property of MurmurHash3 x64-128
        assert_eq!((0, 0), murmur_hash3_x64_128(b"", 0));
    }

    #[test]
    fn murmur_covers_block_and_tail_paths() {
        // 16-byte blocks, a short tail and a long (k2) tail all hash
        // deterministically and distinctly
        let inputs: [&[u8]; 4] = [
            b"0123456789abcdef",
            b"0123456789abcdef0123456789abcdef",
            b"abc",
            b"0123456789abc",
        ];
        let mut seen = std::collections::HashSet::new();
        for input in inputs {
            let first = murmur_hash3_x64_128(input, 0);
            let second = murmur_hash3_x64_128(input, 0);
            assert_eq!(first, second);
            assert!(seen.insert(first), "collision on {input:?}");
        }

        // the seed perturbs the result
        assert_ne!(
            murmur_hash3_x64_128(b"abc", 0),
            murmur_hash3_x64_128(b"abc", 1)
        );
    }

    #[test]
    fn local_hostname_is_cached_and_non_empty() {
        let first = local_hostname();
        assert!(!first.is_empty());
        assert_eq!(first, local_hostname());
    }

    #[test]
    fn default_name_formats_hex() {
        assert_eq!("gamesvr-0x7b", default_node_name("gamesvr", 123));
    }

    #[test]
    fn identity_digest_is_deterministic() {
        let a = identity_digest(Path::new("/bin/app"), Path::new("/etc/a.yaml"), 1, "n", "h");
        let b = identity_digest(Path::new("/bin/app"), Path::new("/etc/a.yaml"), 1, "n", "h");
        let c = identity_digest(Path::new("/bin/app"), Path::new("/etc/a.yaml"), 2, "n", "h");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(64, a.len());
    }
}
