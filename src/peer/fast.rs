use sha1::{Digest, Sha1};
use std::net::IpAddr;

use crate::metainfo::InfoHash;

/// Computes the allowed fast set we grant a peer at `ip` (BEP-6).
///
/// For IPv4 the address is masked to its /24 before hashing; for IPv6 the
/// first four bytes (the /32) are used. The result holds at most
/// `min(set_size, piece_count)` distinct indices, in generation order.
pub fn allowed_fast_set(
    info_hash: &InfoHash,
    ip: IpAddr,
    piece_count: u32,
    set_size: usize,
) -> Vec<u32> {
    let wanted = set_size.min(piece_count as usize);
    let mut set = Vec::with_capacity(wanted);
    if wanted == 0 {
        return set;
    }

    let prefix = match ip {
        IpAddr::V4(ip) => {
            let [a, b, c, _] = ip.octets();
            [a, b, c, 0]
        }
        IpAddr::V6(ip) => {
            let octets = ip.octets();
            [octets[0], octets[1], octets[2], octets[3]]
        }
    };

    let mut seed = Vec::with_capacity(24);
    seed.extend_from_slice(&prefix);
    seed.extend_from_slice(info_hash.as_bytes());

    while set.len() < wanted {
        let digest = Sha1::digest(&seed);
        for word in digest.chunks_exact(4) {
            if set.len() == wanted {
                break;
            }
            let index = u32::from_be_bytes([word[0], word[1], word[2], word[3]]) % piece_count;
            if !set.contains(&index) {
                set.push(index);
            }
        }
        seed = digest.to_vec();
    }

    set
}
